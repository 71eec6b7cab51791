//! Multipart ingestion into a fresh [`RequestContext`].
//!
//! # Data Flow
//! ```text
//! Content-Type precheck (415)
//!     → working directory created
//!     → fields streamed chunk by chunk, every byte charged to the BodyBudget (413)
//!         values → context values
//!         files  → <working dir>/<sanitized name>
//!     → downloadFrom entries fetched concurrently (same budget)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::download::{Downloader, DOWNLOAD_FROM_FIELD};
use super::fs::{create_working_dir, sanitize_filename};
use super::RequestContext;
use crate::http::error::ApiError;

const WANT_MULTIPART: &str = "Invalid 'Content-Type' header value: want 'multipart/form-data'";
const NO_BOUNDARY: &str = "Invalid 'Content-Type' header value: no boundary";
const MALFORMED_BODY: &str =
    "Malformed body: it does not match the 'Content-Type' header boundaries";

/// Settings for turning a request into a context.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Parent of every per-request working directory.
    pub working_dir: PathBuf,
    /// Soft timeout; the context deadline is now + timeout.
    pub timeout: Duration,
    pub body_limit: Option<u64>,
    pub trace_header: HeaderName,
    /// `None` when `downloadFrom` is disabled.
    pub downloader: Option<Arc<Downloader>>,
}

/// Running byte count shared by uploads and downloads of one request.
#[derive(Debug)]
pub struct BodyBudget {
    consumed: AtomicU64,
    limit: Option<u64>,
}

impl BodyBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            consumed: AtomicU64::new(0),
            limit,
        }
    }

    /// Account for `bytes` more bytes, failing with 413 past the limit.
    pub fn charge(&self, bytes: usize) -> Result<(), ApiError> {
        let bytes = bytes as u64;
        let total = self.consumed.fetch_add(bytes, Ordering::Relaxed) + bytes;

        match self.limit {
            Some(limit) if total > limit => Err(ApiError::sentinel(
                format!("body limit of {limit} bytes exceeded"),
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request Entity Too Large",
            )),
            _ => Ok(()),
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

fn check_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let value = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mut parts = value.split(';');
    let essence = parts.next().unwrap_or_default().trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return Err(ApiError::sentinel(
            format!("get multipart form: content type '{value}' is not multipart"),
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            WANT_MULTIPART,
        ));
    }

    let has_boundary = parts.any(|param| {
        param.split_once('=').is_some_and(|(key, value)| {
            key.trim().eq_ignore_ascii_case("boundary") && !value.trim().trim_matches('"').is_empty()
        })
    });
    if !has_boundary {
        return Err(ApiError::sentinel(
            "get multipart form: missing boundary",
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            NO_BOUNDARY,
        ));
    }

    Ok(())
}

fn multipart_error(err: MultipartError) -> ApiError {
    let status = err.status();
    let cause = format!("get multipart form: {}", err.body_text());

    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::sentinel(cause, status, "Request Entity Too Large")
    } else if status.is_client_error() {
        ApiError::sentinel(cause, StatusCode::BAD_REQUEST, MALFORMED_BODY)
    } else {
        ApiError::internal(cause)
    }
}

fn io_error(action: &'static str) -> impl Fn(std::io::Error) -> ApiError {
    move |e| ApiError::internal(format!("{action}: {e}"))
}

impl RequestContext {
    /// Parse a `multipart/form-data` request into a new context.
    ///
    /// On failure the working directory, if already created, is removed.
    pub async fn from_request(
        request: Request,
        options: &IngestOptions,
        trace: String,
    ) -> Result<Self, ApiError> {
        check_content_type(request.headers())?;
        let headers = request.headers().clone();

        let multipart = Multipart::from_request(request, &()).await.map_err(|rejection| {
            ApiError::sentinel(
                format!("get multipart form: {}", rejection.body_text()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                WANT_MULTIPART,
            )
        })?;

        let dir = create_working_dir(&options.working_dir)
            .await
            .map_err(io_error("create working directory"))?;

        let mut ctx = RequestContext::new(dir, Instant::now() + options.timeout).with_request(
            headers,
            trace,
            options.trace_header.clone(),
        );

        let budget = BodyBudget::new(options.body_limit);
        if let Err(err) = ctx.ingest(multipart, &budget, options).await {
            ctx.close().await;
            return Err(err);
        }

        tracing::debug!(
            dir = %ctx.dir.display(),
            values = ?ctx.values,
            files = ?ctx.files.keys().collect::<Vec<_>>(),
            bytes = budget.consumed(),
            "Form data ingested"
        );
        Ok(ctx)
    }

    async fn ingest(
        &mut self,
        mut multipart: Multipart,
        budget: &BodyBudget,
        options: &IngestOptions,
    ) -> Result<(), ApiError> {
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            budget.charge(name.len())?;

            let Some(raw_filename) = field.file_name().map(str::to_owned) else {
                let mut value = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    budget.charge(chunk.len())?;
                    value.extend_from_slice(&chunk);
                }
                self.values
                    .entry(name)
                    .or_default()
                    .push(String::from_utf8_lossy(&value).into_owned());
                continue;
            };

            let Some(filename) = sanitize_filename(&raw_filename) else {
                tracing::debug!(field = %name, filename = %raw_filename, "Skipping file without usable name");
                continue;
            };

            let path = self.dir.join(&filename);
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(io_error("create local file"))?;
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                budget.charge(chunk.len())?;
                file.write_all(&chunk)
                    .await
                    .map_err(io_error("copy multipart file to local file"))?;
            }
            file.flush().await.map_err(io_error("flush local file"))?;

            self.files.insert(filename, path);
        }

        let Some(downloader) = &options.downloader else {
            return Ok(());
        };

        let raw = self
            .values
            .get(DOWNLOAD_FROM_FIELD)
            .and_then(|values| values.first())
            .filter(|value| !value.trim().is_empty())
            .cloned();

        if let Some(raw) = raw {
            let downloaded = downloader.fetch_all(self, &raw, budget).await?;
            self.files.extend(downloaded);
        }

        Ok(())
    }
}
