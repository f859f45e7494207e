use crate::config::TranslateConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SERVICE: &str = "translate";

#[async_trait]
pub trait TextTranslator: Send + Sync {
    async fn translate(&self, from_lang: &str, to_lang: &str, text: &str) -> Result<String, RelayError>;
}

// {"from":"zh","to":"en","trans_result":[{"src":"百度 你好","dst":"Hello, Baidu"}]}
#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(default)]
    trans_result: Vec<Segment>,
    error_code: Option<serde_json::Value>,
    error_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[allow(dead_code)]
    src: String,
    dst: String,
}

/// Baidu general translation API, requests signed with md5(appid + q + salt + secret).
pub struct BaiduTranslator {
    client: reqwest::Client,
    url: String,
    app_id: String,
    secret_key: String,
}

impl BaiduTranslator {
    pub fn new(config: &TranslateConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            app_id: config.app_id.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    fn sign(&self, text: &str, salt: &str) -> String {
        sign(&self.app_id, text, salt, &self.secret_key)
    }
}

pub fn sign(app_id: &str, text: &str, salt: &str, secret_key: &str) -> String {
    let digest = Md5::digest(format!("{}{}{}{}", app_id, text, salt, secret_key).as_bytes());
    format!("{:x}", digest)
}

fn parse_response(body: &[u8]) -> Result<String, RelayError> {
    let resp: TranslateResponse = serde_json::from_slice(body).map_err(|e| RelayError::Upstream {
        service: SERVICE,
        code: -1,
        message: format!("undecodable response: {}", e),
    })?;

    // error_code 有时是字符串 "54001"，有时是数字
    if let Some(code) = resp.error_code {
        let code = match &code {
            serde_json::Value::String(s) => s.parse().unwrap_or(-1),
            serde_json::Value::Number(n) => n.as_i64().unwrap_or(-1),
            _ => -1,
        };
        if code != 52000 {
            return Err(RelayError::Upstream {
                service: SERVICE,
                code,
                message: resp.error_msg.unwrap_or_default(),
            });
        }
    }

    resp.trans_result
        .into_iter()
        .next()
        .map(|s| s.dst)
        .ok_or(RelayError::NoResult { service: SERVICE })
}

#[async_trait]
impl TextTranslator for BaiduTranslator {
    async fn translate(&self, from_lang: &str, to_lang: &str, text: &str) -> Result<String, RelayError> {
        let salt = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
            .to_string();
        let sign = self.sign(text, &salt);

        let body = self
            .client
            .get(&self.url)
            .query(&[
                ("q", text),
                ("from", from_lang),
                ("to", to_lang),
                ("appid", self.app_id.as_str()),
                ("salt", salt.as_str()),
                ("sign", sign.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?
            .bytes()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?;

        match parse_response(&body) {
            Ok(dst) => {
                log::info!("Translated {} -> {}: {:?} => {:?}", from_lang, to_lang, text, dst);
                Ok(dst)
            }
            Err(e) => {
                log::error!("Translate failed, response: {}", String::from_utf8_lossy(&body));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_sign_is_md5_hex() {
        // md5("abc")
        assert_eq!(sign("a", "b", "c", ""), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(sign("", "", "", ""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_parse_first_segment() {
        let body = r#"{"from":"zh","to":"en","trans_result":[{"src":"百度 你好","dst":"Hello, Baidu"},{"src":"x","dst":"y"}]}"#.as_bytes();
        assert_eq!(parse_response(body).unwrap(), "Hello, Baidu");
    }

    #[test]
    fn test_parse_empty_result() {
        let body = br#"{"from":"zh","to":"en","trans_result":[]}"#;
        assert!(matches!(parse_response(body), Err(RelayError::NoResult { .. })));
    }

    #[test]
    fn test_parse_error_code() {
        let body = br#"{"error_code":"54001","error_msg":"Invalid Sign"}"#;
        match parse_response(body) {
            Err(RelayError::Upstream { code, message, .. }) => {
                assert_eq!(code, 54001);
                assert_eq!(message, "Invalid Sign");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(parse_response(b"<html>"), Err(RelayError::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_signed_request_against_stub() {
        let app = Router::new().route(
            "/api/trans/vip/translate",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let expected = sign(&q["appid"], &q["q"], &q["salt"], "secret");
                if q["sign"] != expected {
                    return axum::Json(json!({"error_code": "54001", "error_msg": "Invalid Sign"}));
                }
                let dst = if q["q"] == "你好" { "Hello" } else { "?" };
                axum::Json(json!({
                    "from": q["from"],
                    "to": q["to"],
                    "trans_result": [{"src": q["q"], "dst": dst}]
                }))
            }),
        );
        let base = test_support::serve(app).await;

        let config = TranslateConfig {
            url: format!("{}/api/trans/vip/translate", base),
            app_id: "20170714000064493".into(),
            secret_key: "secret".into(),
            timeout_ms: 5000,
        };
        let translator = BaiduTranslator::new(&config).unwrap();
        assert_eq!(translator.translate("zh", "en", "你好").await.unwrap(), "Hello");

        let wrong_secret = BaiduTranslator::new(&TranslateConfig {
            secret_key: "wrong".into(),
            ..config
        })
        .unwrap();
        let err = wrong_secret.translate("zh", "en", "你好").await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream { code: 54001, .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_upstream_error() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let base = test_support::serve(app).await;
        let translator = BaiduTranslator::new(&TranslateConfig {
            url: format!("{}/slow", base),
            timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        let err = translator.translate("zh", "en", "你好").await.unwrap_err();
        assert!(matches!(err, RelayError::Upstream { code: -1, .. }));
    }
}
