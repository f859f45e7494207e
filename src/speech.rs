//! Speech recognition and synthesis adapters.
//!
//! Both call the provider with the token currently held by the
//! [`CredentialStore`]; a stale token simply surfaces as an upstream error.

use crate::codec::AudioCodec;
use crate::config::SpeechConfig;
use crate::credential::CredentialStore;
use crate::error::RelayError;
use crate::staging::StagedFile;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribes a file already in the provider's input format.
    async fn recognize(&self, audio: &Path) -> Result<String, RelayError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speaks `text` and writes the result, in the client download format, to `output`.
    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), RelayError>;
}

fn http_client(config: &SpeechConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()?)
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    err_no: i64,
    #[serde(default)]
    err_msg: String,
    #[serde(default)]
    result: Vec<String>,
}

pub struct BaiduRecognizer {
    client: reqwest::Client,
    credentials: Arc<CredentialStore>,
    url: String,
    client_id: String,
    lang: String,
    content_type: String,
}

impl BaiduRecognizer {
    pub fn new(config: &SpeechConfig, credentials: Arc<CredentialStore>) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            credentials,
            url: config.asr_url.clone(),
            client_id: config.client_id.clone(),
            lang: config.asr_lang.clone(),
            content_type: config.asr_content_type.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for BaiduRecognizer {
    async fn recognize(&self, audio: &Path) -> Result<String, RelayError> {
        const SERVICE: &str = "speech recognition";

        log::info!("Start recognizing {}", audio.display());
        let data = tokio::fs::read(audio).await?;
        let token = self.credentials.current_token();

        let body = self
            .client
            .post(&self.url)
            .query(&[
                ("lan", self.lang.as_str()),
                ("cuid", self.client_id.as_str()),
                ("token", token.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, &self.content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?
            .bytes()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?;

        let resp: RecognizeResponse = serde_json::from_slice(&body).map_err(|e| RelayError::Upstream {
            service: SERVICE,
            code: -1,
            message: format!("undecodable response: {}", e),
        })?;

        if resp.err_no != 0 {
            log::error!(
                "Speech recognition failed for {}, response: {}",
                audio.display(),
                String::from_utf8_lossy(&body)
            );
            return Err(RelayError::Upstream {
                service: SERVICE,
                code: resp.err_no,
                message: resp.err_msg,
            });
        }

        let text = resp
            .result
            .into_iter()
            .next()
            .ok_or(RelayError::NoResult { service: SERVICE })?;
        log::info!("Speech recognition result: {}", text);
        Ok(text)
    }
}

pub struct BaiduSynthesizer {
    client: reqwest::Client,
    credentials: Arc<CredentialStore>,
    codec: Arc<dyn AudioCodec>,
    url: String,
    client_id: String,
    lang: String,
    format: String,
}

impl BaiduSynthesizer {
    pub fn new(
        config: &SpeechConfig,
        credentials: Arc<CredentialStore>,
        codec: Arc<dyn AudioCodec>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            credentials,
            codec,
            url: config.tts_url.clone(),
            client_id: config.client_id.clone(),
            lang: config.tts_lang.clone(),
            format: config.tts_format.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for BaiduSynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<(), RelayError> {
        const SERVICE: &str = "speech synthesis";

        let token = self.credentials.current_token();
        let resp = self
            .client
            .get(&self.url)
            .query(&[
                ("tex", text),
                ("lan", self.lang.as_str()),
                ("cuid", self.client_id.as_str()),
                ("ctp", "1"),
                ("aue", self.format.as_str()),
                ("tok", token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp.bytes().await.map_err(|e| RelayError::http(SERVICE, e))?;

        // 合成失败时返回的是 JSON 错误信息而不是音频
        if !content_type.starts_with("audio/") {
            log::error!("Speech synthesis failed: {}", String::from_utf8_lossy(&body));
            return Err(RelayError::UnexpectedContentType {
                service: SERVICE,
                content_type,
            });
        }

        let mp3 = StagedFile::new(output.with_extension("mp3"));
        tokio::fs::write(mp3.path(), &body).await?;
        self.codec.encode_result(mp3.path(), output).await
    }
}
