//! HTTP fetch capability.
//!
//! The pipeline never talks to `reqwest` directly; connectors and the
//! monitor go through the [`Fetcher`] trait so tests can script responses.
//!
//! [`HttpFetcher`] retries transient failures with exponential backoff:
//! - HTTP 429 or 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network error or timeout → retry

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use town_hub_core::PipelineError;

use crate::config::HttpConfig;

/// A successfully retrieved resource.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        self.content_type.contains("html") || self.body.trim_start().starts_with('<')
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ... capped at 32s
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let final_url = response.url().to_string();
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("text/html")
                            .to_string();
                        let body = response
                            .text()
                            .await
                            .map_err(|e| PipelineError::fetch(url, e))?;
                        return Ok(FetchedPage {
                            url: final_url,
                            status: status.as_u16(),
                            content_type,
                            body,
                        });
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(PipelineError::fetch(url, format!("HTTP {}", status)));
                        continue;
                    }

                    return Err(PipelineError::fetch(url, format!("HTTP {}", status)));
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "fetch failed");
                    last_err = Some(PipelineError::fetch(url, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| PipelineError::fetch(url, "failed after retries")))
    }
}
