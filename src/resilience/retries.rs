//! Retrying outbound HTTP client.
//!
//! # Responsibilities
//! - Send downloads and webhook deliveries with a per-attempt timeout
//! - Retry transport errors, 429 and 5xx (except 501) with jittered backoff
//! - Rebuild file bodies for every attempt
//!
//! # Design Decisions
//! - The caller decides what a final non-2xx status means
//! - Retries are bounded; there is no retry budget across requests

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio_util::io::ReaderStream;

use crate::resilience::backoff::retry_delay;

/// Bounded retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retry: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 4,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

/// Body of an outbound request, rebuilt on every attempt.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    File(PathBuf),
}

impl RequestBody {
    async fn build(&self) -> Result<reqwest::Body, RetryError> {
        match self {
            RequestBody::Empty => Ok(reqwest::Body::from(Bytes::new())),
            RequestBody::Bytes(bytes) => Ok(reqwest::Body::from(bytes.clone())),
            RequestBody::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|source| RetryError::Body {
                        path: path.clone(),
                        source,
                    })?;
                Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("{method} '{url}' failed after {attempts} attempt(s): {source}")]
    Transport {
        method: Method,
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("open request body '{}': {source}", path.display())]
    Body {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Determine if a response (or connection failure) warrants another attempt.
pub fn is_retryable(status: Option<StatusCode>, connection_error: bool) -> bool {
    if connection_error {
        return true;
    }

    match status {
        Some(StatusCode::TOO_MANY_REQUESTS) => true,
        Some(StatusCode::NOT_IMPLEMENTED) => false,
        Some(status) => status.is_server_error(),
        None => false,
    }
}

/// A `reqwest::Client` paired with a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RetryingClient {
    /// `timeout` bounds each attempt, from connect to the end of the body.
    pub fn new(policy: RetryPolicy, timeout: Option<Duration>) -> Result<Self, RetryError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .no_proxy();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder.build().map_err(RetryError::Client)?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send the request, retrying per policy. Returns the last response received.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: &RequestBody,
    ) -> Result<reqwest::Response, RetryError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let can_retry = attempt <= self.policy.max_retry;

            let result = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.build().await?)
                .send()
                .await;

            match result {
                Ok(response) if can_retry && is_retryable(Some(response.status()), false) => {
                    let delay = self.backoff(attempt);
                    tracing::info!(
                        method = %method,
                        url = %url,
                        attempt,
                        status = %response.status(),
                        delay = ?delay,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(e) if can_retry => {
                    let delay = self.backoff(attempt);
                    tracing::info!(
                        method = %method,
                        url = %url,
                        attempt,
                        error = %e,
                        delay = ?delay,
                        "Retrying after network error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(RetryError::Transport {
                        method,
                        url: url.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        retry_delay(attempt, self.policy.min_wait, self.policy.max_wait)
    }
}
