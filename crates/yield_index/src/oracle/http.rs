//! HTTP yield feed with retries and exponential backoff.

use super::{parse_quotes, OracleFetchError, YieldSource};
use crate::model::YieldQuote;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8787";
const DEFAULT_QUOTES_PATH: &str = "/v1/yields";
const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub quotes_path: String,
    /// Bounds the whole fetch, retries included.
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            quotes_path: DEFAULT_QUOTES_PATH.to_string(),
            timeout_secs: TIMEOUT_SECS,
            max_retries: MAX_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
        }
    }
}

impl OracleConfig {
    pub fn quotes_url(&self) -> Result<Url, OracleFetchError> {
        let base = Url::parse(&self.base_url)?;
        Ok(base.join(&self.quotes_path)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct HttpYieldSource {
    config: OracleConfig,
    url: Url,
    client: reqwest::Client,
    request_count: AtomicU64,
}

impl HttpYieldSource {
    pub fn new(config: OracleConfig) -> Result<Self, OracleFetchError> {
        let url = config.quotes_url()?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            config,
            url,
            client,
            request_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Successful responses received so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn backoff(&self, attempt: u32) {
        if attempt < self.config.max_retries {
            let ms = self
                .config
                .retry_backoff_ms
                .saturating_mul(1u64 << attempt.min(16));
            warn!(attempt, ms, url = %self.url, "retry after error");
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn get_body(&self) -> Result<String, OracleFetchError> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match self.client.get(self.url.clone()).send().await {
                Ok(r) => {
                    let status = r.status();
                    let body = r.text().await.unwrap_or_default();
                    if !status.is_success() {
                        last_err = Some(OracleFetchError::Api(status.as_u16(), body));
                        self.backoff(attempt).await;
                        continue;
                    }
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    debug!(bytes = body.len(), "quotes response");
                    return Ok(body);
                }
                Err(e) => {
                    last_err = Some(OracleFetchError::Request(e));
                    self.backoff(attempt).await;
                }
            }
        }
        Err(last_err.unwrap_or(OracleFetchError::Api(0, "unknown".to_string())))
    }
}

impl YieldSource for HttpYieldSource {
    async fn fetch_quotes(&self) -> Result<Vec<YieldQuote>, OracleFetchError> {
        let body = self.get_body().await?;
        let quotes = parse_quotes(&body)?;
        info!(count = quotes.len(), url = %self.url, "fetched quotes");
        Ok(quotes)
    }
}
