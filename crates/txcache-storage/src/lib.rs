//! Transaction cache store + authenticated HTTP fetch utilities.

mod cache;

use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub use cache::{CacheStore, MemoryCacheStore, PgCacheStore, StoreError, MIGRATOR};

pub const CRATE_NAME: &str = "txcache-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts fail fast; resets and refused connections are worth another attempt.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() {
        RetryDisposition::NonRetryable
    } else if err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    bearer_token: Option<String>,
    timeout: Duration,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credential rejected with http status {status} for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("request to {url} timed out after {timeout_ms}ms")]
    TimedOut { url: String, timeout_ms: u64 },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} still failing after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last_error: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

enum Attempt {
    Done(FetchedResponse),
    Retry(String),
    Fail(FetchError),
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    /// GET `url` with the configured credential, retrying transient failures
    /// with capped exponential backoff.
    pub async fn get_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let attempts = self.backoff.max_attempts();
            let mut last_error = String::new();

            for attempt in 0..attempts {
                match self.attempt_once(url, query).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Retry(reason) => {
                        last_error = reason;
                        if attempt + 1 < attempts {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %last_error,
                                "transient fetch failure; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            Err(FetchError::RetriesExhausted {
                url: url.to_string(),
                attempts,
                last_error,
            })
        }
        .instrument(span)
        .await
    }

    async fn attempt_once(&self, url: &str, query: &[(&str, String)]) -> Attempt {
        let mut request = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(err) => return self.request_failure(url, err),
        };

        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            return match resp.bytes().await {
                Ok(body) => Attempt::Done(FetchedResponse {
                    status,
                    final_url,
                    body: body.to_vec(),
                }),
                Err(err) => self.request_failure(url, err),
            };
        }

        if is_auth_failure(status) {
            return Attempt::Fail(FetchError::Unauthorized {
                status: status.as_u16(),
                url: final_url,
            });
        }

        match classify_status(status) {
            RetryDisposition::Retryable => Attempt::Retry(format!("http status {status}")),
            RetryDisposition::NonRetryable => Attempt::Fail(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }),
        }
    }

    fn request_failure(&self, url: &str, err: reqwest::Error) -> Attempt {
        if err.is_timeout() {
            return Attempt::Fail(FetchError::TimedOut {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => Attempt::Retry(err.to_string()),
            RetryDisposition::NonRetryable => Attempt::Fail(FetchError::Request(err)),
        }
    }
}
