//! Synchronous translate endpoint.
//!
//! `POST /translate` takes a chat envelope as JSON, runs it through the same
//! pipeline as the relay and answers `{"Data", "Code", "Description"}`. Errors
//! are reported in the body with `Code: -1`, the HTTP status stays 200.

use crate::envelope::ChatEnvelope;
use crate::pipeline::TranslationPipeline;
use axum::{Json, Router, body::Bytes, extract::State, routing::post};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResponse {
    pub data: Option<ChatEnvelope>,
    pub code: i32,
    pub description: String,
}

impl ApiResponse {
    fn ok(envelope: ChatEnvelope) -> Self {
        Self {
            data: Some(envelope),
            code: 0,
            description: "OK".to_string(),
        }
    }

    fn error(description: impl ToString) -> Self {
        Self {
            data: None,
            code: -1,
            description: description.to_string(),
        }
    }
}

pub fn create_router(pipeline: Arc<TranslationPipeline>) -> Router {
    Router::new()
        .route("/translate", post(translate))
        .with_state(pipeline)
}

// 解析失败也按约定返回 Code -1，而不是 axum 默认的 4xx
async fn translate(State(pipeline): State<Arc<TranslationPipeline>>, body: Bytes) -> Json<ApiResponse> {
    let mut envelope: ChatEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Rejected translate request: {}", e);
            return Json(ApiResponse::error(format!("invalid request: {}", e)));
        }
    };

    match pipeline.run(&mut envelope).await {
        Ok(result) => {
            result.persist();
            Json(ApiResponse::ok(envelope))
        }
        Err(e) => {
            log::error!("Translate request failed ({}): {}", envelope.describe(), e);
            Json(ApiResponse::error(e))
        }
    }
}

pub async fn serve(listen: &str, pipeline: Arc<TranslationPipeline>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("HTTP translate endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(pipeline)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::pipeline;
    use crate::test_support;
    use serde_json::{Value, json};

    async fn post_translate(base: &str, body: String) -> Value {
        reqwest::Client::new()
            .post(format!("{}/translate", base))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_translate_text() {
        let root = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(root.path(), Some("Hello"), false);
        let base = test_support::serve(create_router(Arc::new(pipeline))).await;

        let body = json!({
            "Catalog": "text",
            "Time": "1500000000",
            "FromLang": "zh",
            "ToLang": "en",
            "FromText": "你好"
        });
        let resp = post_translate(&base, body.to_string()).await;

        assert_eq!(resp["Code"], 0);
        assert_eq!(resp["Description"], "OK");
        assert_eq!(resp["Data"]["ToText"], "Hello");
        assert_eq!(resp["Data"]["Time"], "1500000000");
        let url = resp["Data"]["ToAudioUrl"].as_str().unwrap();
        assert!(url.starts_with("download/translate/"), "{}", url);

        let name = url.rsplit('/').next().unwrap();
        assert!(root.path().join("translate").join(name).exists());
    }

    #[tokio::test]
    async fn test_errors_are_reported_in_body() {
        let root = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(root.path(), None, false);
        let base = test_support::serve(create_router(Arc::new(pipeline))).await;

        let resp = post_translate(&base, "{not json".to_string()).await;
        assert_eq!(resp["Code"], -1);
        assert!(resp["Data"].is_null());

        let body = json!({"Catalog": "text", "FromLang": "zh", "ToLang": "en", "FromText": "你好"});
        let resp = post_translate(&base, body.to_string()).await;
        assert_eq!(resp["Code"], -1);
        assert_eq!(resp["Description"], "translate returned no result");
    }
}
