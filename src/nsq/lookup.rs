//! nsqlookupd discovery: which nsqd instance carries the inbound topic.

use anyhow::{Context, bail};
use serde::Deserialize;
use std::time::Duration;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

// nsqlookupd 1.x 直接返回 producers，旧版本包在 {"status_code", "data"} 里
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

pub struct Lookupd {
    client: reqwest::Client,
    url: String,
}

impl Lookupd {
    /// `url` is the full `/lookup` endpoint.
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
        Ok(Self { client, url: url.into() })
    }

    /// TCP address of the first nsqd registered for `topic`.
    pub async fn producer_for(&self, topic: &str) -> anyhow::Result<String> {
        let url = url::Url::parse_with_params(&self.url, &[("topic", topic)])
            .with_context(|| format!("invalid nsqlookupd url {:?}", self.url))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("nsqlookupd {} unreachable", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("nsqlookupd answered {} for topic {}", status, topic);
        }
        let body: LookupResponse = resp.json().await.context("invalid nsqlookupd response")?;

        let producers = if body.producers.is_empty() {
            body.data.map(|d| d.producers).unwrap_or_default()
        } else {
            body.producers
        };
        match producers.first() {
            Some(p) => Ok(format!("{}:{}", p.broadcast_address, p.tcp_port)),
            None => bail!("no nsqd has registered topic {}", topic),
        }
    }
}
