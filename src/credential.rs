//! Access token for the speech provider.
//!
//! The token is refreshed on a fixed schedule by [`CredentialRefresher`] and
//! read by every speech adapter through a shared [`CredentialStore`]. The last
//! value is written to disk so a restart can serve messages before the first
//! refresh completes.

use crate::config::CredentialConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub fetched_at: SystemTime,
    /// How long until the next scheduled refresh
    pub validity: Duration,
}

pub struct CredentialStore {
    cell: watch::Sender<Option<Credential>>,
    persist_path: PathBuf,
}

impl CredentialStore {
    pub fn new(persist_path: impl Into<PathBuf>) -> Self {
        let (cell, _) = watch::channel(None);
        Self {
            cell,
            persist_path: persist_path.into(),
        }
    }

    /// Empty until the first credential is stored or restored.
    pub fn current_token(&self) -> String {
        self.cell
            .borrow()
            .as_ref()
            .map(|c| c.value.clone())
            .unwrap_or_default()
    }

    pub fn current(&self) -> Option<Credential> {
        self.cell.borrow().clone()
    }

    pub fn replace(&self, credential: Credential) {
        self.cell.send_replace(Some(credential));
    }

    /// Resolves as soon as any credential is available.
    pub async fn wait_ready(&self) {
        let mut rx = self.cell.subscribe();
        // Sender 存活期间 wait_for 不会返回错误
        let _ = rx.wait_for(|c| c.is_some()).await;
    }

    /// Seeds the store from the persisted file. Returns whether a token was found.
    pub async fn restore(&self, validity: Duration) -> bool {
        let value = match tokio::fs::read_to_string(&self.persist_path).await {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to read {}: {}", self.persist_path.display(), e);
                }
                return false;
            }
        };
        if value.is_empty() {
            return false;
        }

        let fetched_at = tokio::fs::metadata(&self.persist_path)
            .await
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        log::info!(
            "Restored access token {} from {}",
            mask(&value),
            self.persist_path.display()
        );
        self.replace(Credential {
            value,
            fetched_at,
            validity,
        });
        true
    }

    async fn persist(&self, value: &str) -> std::io::Result<()> {
        if let Some(dir) = self.persist_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.persist_path, value).await
    }
}

/// First few characters only, tokens never go to the log in full.
pub fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String, RelayError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth2 client-credentials grant against the provider's token endpoint.
pub struct OAuthTokenSource {
    client: reqwest::Client,
    url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthTokenSource {
    pub fn new(config: &CredentialConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch(&self) -> Result<String, RelayError> {
        const SERVICE: &str = "token endpoint";

        let body = self
            .client
            .get(&self.url)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?
            .bytes()
            .await
            .map_err(|e| RelayError::http(SERVICE, e))?;

        let resp: TokenResponse = serde_json::from_slice(&body).map_err(|e| RelayError::Upstream {
            service: SERVICE,
            code: -1,
            message: format!("undecodable response: {}", e),
        })?;

        match resp.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(RelayError::Upstream {
                service: SERVICE,
                code: -1,
                message: format!(
                    "{}: {}",
                    resp.error.unwrap_or_else(|| "no access_token".to_string()),
                    resp.error_description.unwrap_or_default()
                ),
            }),
        }
    }
}

/// Background task keeping the store fresh.
pub struct CredentialRefresher {
    store: Arc<CredentialStore>,
    source: Box<dyn TokenSource>,
    interval: Duration,
    retry_initial: Duration,
    retry_max: Duration,
}

impl CredentialRefresher {
    pub fn new(
        store: Arc<CredentialStore>,
        source: Box<dyn TokenSource>,
        interval: Duration,
        retry_initial: Duration,
        retry_max: Duration,
    ) -> Self {
        Self {
            store,
            source,
            interval,
            retry_initial,
            retry_max,
        }
    }

    pub fn from_config(
        store: Arc<CredentialStore>,
        source: Box<dyn TokenSource>,
        config: &CredentialConfig,
    ) -> Self {
        Self::new(
            store,
            source,
            config.refresh_interval(),
            Duration::from_secs(config.retry_initial_secs),
            Duration::from_secs(config.retry_max_secs),
        )
    }

    pub async fn refresh_once(&self) -> Result<(), RelayError> {
        let value = self.source.fetch().await?;
        log::info!("Updated access token {}", mask(&value));
        self.store.replace(Credential {
            value: value.clone(),
            fetched_at: SystemTime::now(),
            validity: self.interval,
        });
        // 持久化失败不影响内存中的新 token
        if let Err(e) = self.store.persist(&value).await {
            log::error!(
                "Failed to persist access token to {}: {}",
                self.store.persist_path.display(),
                e
            );
        }
        Ok(())
    }

    /// Never returns. Failures back off exponentially; the relay keeps running
    /// on the previous token in the meantime.
    pub async fn run(self) {
        let mut retry_delay = self.retry_initial;
        loop {
            match self.refresh_once().await {
                Ok(()) => {
                    retry_delay = self.retry_initial;
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => {
                    log::error!(
                        "Access token refresh failed: {}. Retrying in {:?}...",
                        e,
                        retry_delay
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = std::cmp::min(retry_delay * 2, self.retry_max);
                }
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
    use std::sync::Mutex;

    /// Hands out the queued results in order, then keeps failing.
    struct ScriptedSource(Mutex<Vec<Result<String, RelayError>>>);

    impl ScriptedSource {
        fn new(mut results: Vec<Result<String, RelayError>>) -> Self {
            results.reverse();
            Self(Mutex::new(results))
        }
    }

    #[async_trait]
    impl TokenSource for ScriptedSource {
        async fn fetch(&self) -> Result<String, RelayError> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(RelayError::Transport("script exhausted".into())))
        }
    }

    fn refresher(store: Arc<CredentialStore>, source: ScriptedSource) -> CredentialRefresher {
        CredentialRefresher::new(
            store,
            Box::new(source),
            Duration::from_secs(3600),
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
    }

    #[tokio::test]
    async fn test_refresh_updates_store_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translatechat/token");
        let store = Arc::new(CredentialStore::new(&path));
        assert_eq!(store.current_token(), "");

        let r = refresher(store.clone(), ScriptedSource::new(vec![Ok("24.first".into())]));
        r.refresh_once().await.unwrap();

        assert_eq!(store.current_token(), "24.first");
        assert_eq!(store.current().unwrap().validity, Duration::from_secs(3600));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "24.first");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("token")));
        let r = refresher(
            store.clone(),
            ScriptedSource::new(vec![
                Ok("24.first".into()),
                Err(RelayError::Transport("connection refused".into())),
            ]),
        );
        r.refresh_once().await.unwrap();
        assert!(r.refresh_once().await.is_err());
        assert_eq!(store.current_token(), "24.first");
    }

    #[tokio::test]
    async fn test_restore_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let store = CredentialStore::new(&path);
        assert!(!store.restore(Duration::from_secs(1)).await);

        std::fs::write(&path, "").unwrap();
        assert!(!store.restore(Duration::from_secs(1)).await);

        std::fs::write(&path, "24.persisted\n").unwrap();
        assert!(store.restore(Duration::from_secs(1)).await);
        assert_eq!(store.current_token(), "24.persisted");
    }

    #[tokio::test]
    async fn test_run_retries_until_first_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("token")));
        let r = refresher(
            store.clone(),
            ScriptedSource::new(vec![
                Err(RelayError::Transport("down".into())),
                Err(RelayError::Transport("still down".into())),
                Ok("24.eventually".into()),
            ]),
        );
        let task = tokio::spawn(r.run());

        tokio::time::timeout(Duration::from_secs(5), store.wait_ready())
            .await
            .unwrap();
        assert_eq!(store.current_token(), "24.eventually");
        task.abort();
    }

    #[tokio::test]
    async fn test_readers_never_see_partial_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("token")));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..2000 {
                    let token = store.current_token();
                    assert!(
                        token.is_empty() || (token.len() == 64 && token.chars().all(|c| c == token.as_bytes()[0] as char)),
                        "torn read: {}",
                        token
                    );
                    tokio::task::yield_now().await;
                }
            }));
        }
        for i in 0..2000u32 {
            let ch = (b'a' + (i % 26) as u8) as char;
            store.replace(Credential {
                value: std::iter::repeat_n(ch, 64).collect(),
                fetched_at: SystemTime::now(),
                validity: Duration::from_secs(1),
            });
            tokio::task::yield_now().await;
        }
        for r in readers {
            r.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_oauth_source() {
        let app = Router::new().route(
            "/oauth/2.0/token",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("grant_type").map(String::as_str) != Some("client_credentials") {
                    return axum::Json(json!({"error": "unsupported_grant_type"}));
                }
                match q.get("client_id").map(String::as_str) {
                    Some("good") => axum::Json(json!({"access_token": "24.abcdef", "expires_in": 2592000})),
                    _ => axum::Json(json!({"error": "invalid_client", "error_description": "unknown client id"})),
                }
            }),
        );
        let base = test_support::serve(app).await;

        let mut config = CredentialConfig {
            token_url: format!("{}/oauth/2.0/token", base),
            client_id: "good".into(),
            client_secret: "secret".into(),
            ..Default::default()
        };
        let token = OAuthTokenSource::new(&config).unwrap().fetch().await.unwrap();
        assert_eq!(token, "24.abcdef");

        config.client_id = "bad".into();
        let err = OAuthTokenSource::new(&config).unwrap().fetch().await.unwrap_err();
        match err {
            RelayError::Upstream { message, .. } => assert!(message.contains("invalid_client")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("24.0123456789"), "24.012...");
        assert_eq!(mask("ab"), "ab...");
    }
}
