//! Delivery of results and errors to webhook targets.

use std::path::{Path, PathBuf};
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde::Serialize;
use url::Url;

use crate::context::RequestContext;
use crate::http::error::ApiError;
use crate::http::response::{content_disposition, sniff_file};
use crate::observability::metrics;
use crate::resilience::{RequestBody, RetryError, RetryingClient};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("{method} '{url}' answered with status {status}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
    },

    #[error("inspect output file '{}': {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid header value: {0}")]
    Header(#[from] header::InvalidHeaderValue),

    #[error("encode error body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where and how to deliver one request's outcome.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub url: Url,
    pub method: Method,
    pub error_url: Url,
    pub error_method: Method,
    pub extra_headers: HeaderMap,
    pub sync: bool,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    status: u16,
    message: &'a str,
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    http: RetryingClient,
}

impl WebhookClient {
    pub fn new(http: RetryingClient) -> Self {
        Self { http }
    }

    /// Send the output file to the success URL.
    pub async fn send_output(
        &self,
        target: &WebhookTarget,
        ctx: &RequestContext,
        path: &Path,
    ) -> Result<(), DeliveryError> {
        let (content_type, size) = sniff_file(path)
            .await
            .map_err(|source| DeliveryError::Output {
                path: path.to_path_buf(),
                source,
            })?;

        let mut headers = base_headers(target, ctx);
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&content_disposition(&ctx.output_filename(path)))?,
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));

        let result = self
            .send(
                &target.method,
                &target.url,
                &headers,
                &RequestBody::File(path.to_path_buf()),
                size,
            )
            .await;
        metrics::record_webhook_delivery("output", result.is_ok());
        result
    }

    /// Send the client-safe translation of `err` to the error URL.
    pub async fn send_error(
        &self,
        target: &WebhookTarget,
        ctx: &RequestContext,
        err: &ApiError,
    ) -> Result<(), DeliveryError> {
        let (status, message) = err.status_and_message();
        let body = serde_json::to_vec(&ErrorEnvelope {
            status: status.as_u16(),
            message: &message,
        })?;
        let size = body.len() as u64;

        let mut headers = base_headers(target, ctx);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );

        let result = self
            .send(
                &target.error_method,
                &target.error_url,
                &headers,
                &RequestBody::Bytes(Bytes::from(body)),
                size,
            )
            .await;
        metrics::record_webhook_delivery("error", result.is_ok());
        result
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &RequestBody,
        bytes_out: u64,
    ) -> Result<(), DeliveryError> {
        let started = Instant::now();
        let response = self
            .http
            .execute(method.clone(), url.as_str(), headers, body)
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(DeliveryError::Status {
                method: method.clone(),
                url: url.to_string(),
                status,
            });
        }

        let latency = started.elapsed();
        tracing::info!(
            webhook_url = %url,
            method = %method,
            status = status.as_u16(),
            latency = latency.as_nanos() as u64,
            latency_human = ?latency,
            bytes_out,
            "request to webhook handled"
        );
        Ok(())
    }
}

/// Caller-supplied headers first, then the trace header on top.
fn base_headers(target: &WebhookTarget, ctx: &RequestContext) -> HeaderMap {
    let mut headers = target.extra_headers.clone();
    if !ctx.trace().is_empty() {
        if let Ok(value) = HeaderValue::from_str(ctx.trace()) {
            headers.insert(ctx.trace_header().clone(), value);
        }
    }
    headers
}
