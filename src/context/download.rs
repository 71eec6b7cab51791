//! Remote files requested through the `downloadFrom` form field.
//!
//! The field holds a JSON array such as
//! `[{"url": "https://…/doc.docx", "extraHttpHeaders": {"X-Token": "…"}}]`.
//! Every URL is filtered before anything goes on the wire, then all entries
//! are fetched concurrently until the request deadline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures_util::future::try_join_all;
use reqwest::Method;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::fs::sanitize_filename;
use super::multipart::BodyBudget;
use super::RequestContext;
use crate::config::DownloadFromConfig;
use crate::http::error::ApiError;
use crate::http::response::parse_content_disposition_filename;
use crate::observability::metrics;
use crate::resilience::{RequestBody, RetryError, RetryPolicy, RetryingClient};
use crate::security::url_filter::{FilterError, UrlFilter};

pub const DOWNLOAD_FROM_FIELD: &str = "downloadFrom";

#[derive(Debug, Deserialize)]
struct DownloadEntry {
    #[serde(default)]
    url: String,
    #[serde(default, rename = "extraHttpHeaders")]
    extra_http_headers: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloaderError {
    #[error("invalid download filter: {0}")]
    Filter(#[from] regex::Error),
    #[error(transparent)]
    Client(#[from] RetryError),
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: RetryingClient,
    filter: UrlFilter,
}

fn invalid_field(message: impl Into<String>) -> ApiError {
    ApiError::bad_request(format!(
        "Invalid '{DOWNLOAD_FROM_FIELD}' form field value: {}",
        message.into()
    ))
}

pub(crate) fn header_map(extra: &HashMap<String, String>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::with_capacity(extra.len());
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("'{name}' is not a valid header name"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("invalid value for header '{name}'"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

impl Downloader {
    pub fn new(config: &DownloadFromConfig) -> Result<Self, DownloaderError> {
        let policy = RetryPolicy {
            max_retry: config.max_retry,
            min_wait: Duration::from_millis(config.retry_min_wait_ms),
            max_wait: Duration::from_millis(config.retry_max_wait_ms),
        };

        Ok(Self {
            client: RetryingClient::new(policy, None)?,
            filter: UrlFilter::new(&config.allow_list, &config.deny_list)?,
        })
    }

    /// Validate and download every entry of `raw` into the context's directory.
    pub(crate) async fn fetch_all(
        &self,
        ctx: &RequestContext,
        raw: &str,
        budget: &BodyBudget,
    ) -> Result<Vec<(String, PathBuf)>, ApiError> {
        let entries: Vec<DownloadEntry> = serde_json::from_str(raw).map_err(|e| {
            ApiError::sentinel(
                format!("unmarshal {DOWNLOAD_FROM_FIELD}: {e}"),
                StatusCode::BAD_REQUEST,
                format!("Invalid '{DOWNLOAD_FROM_FIELD}' form field value: {e}"),
            )
        })?;

        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.url.trim().is_empty() {
                return Err(invalid_field("'url' is empty"));
            }

            let url = self.filter.check(&entry.url).map_err(|e| match e {
                FilterError::NotAllowed(_) | FilterError::Denied(_) => ApiError::sentinel(
                    &e,
                    StatusCode::FORBIDDEN,
                    format!(
                        "Invalid '{DOWNLOAD_FROM_FIELD}' URL: '{}' does not match the authorized URLs",
                        entry.url
                    ),
                ),
                _ => invalid_field(e.to_string()),
            })?;

            let headers = header_map(&entry.extra_http_headers).map_err(invalid_field)?;
            prepared.push((url, headers));
        }

        let downloads = prepared
            .into_iter()
            .map(|(url, headers)| self.fetch_one(ctx, url, headers, budget));

        tokio::time::timeout_at(ctx.deadline(), try_join_all(downloads))
            .await
            .map_err(|_| ApiError::DeadlineExceeded)?
    }

    async fn fetch_one(
        &self,
        ctx: &RequestContext,
        url: Url,
        mut headers: HeaderMap,
        budget: &BodyBudget,
    ) -> Result<(String, PathBuf), ApiError> {
        if !ctx.trace().is_empty() {
            if let Ok(trace) = HeaderValue::from_str(ctx.trace()) {
                headers.insert(ctx.trace_header().clone(), trace);
            }
        }

        let result = self
            .client
            .execute(Method::GET, url.as_str(), &headers, &RequestBody::Empty)
            .await;
        metrics::record_download(result.is_ok());
        let mut response = result.map_err(|e| ApiError::internal(format!("download file: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::sentinel(
                format!("download '{url}': unexpected status code {status}"),
                StatusCode::BAD_REQUEST,
                format!(
                    "Invalid '{DOWNLOAD_FROM_FIELD}' URL: '{url}' responded with status code {}",
                    status.as_u16()
                ),
            ));
        }

        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                invalid_field(format!("no 'Content-Disposition' header in the response from '{url}'"))
            })?;
        let filename = parse_content_disposition_filename(disposition)
            .and_then(|name| sanitize_filename(&name))
            .ok_or_else(|| {
                invalid_field(format!(
                    "no filename in the 'Content-Disposition' header of the response from '{url}'"
                ))
            })?;

        let path = ctx.dir().join(&filename);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError::internal(format!("create local file: {e}")))?;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ApiError::internal(format!("read response from '{url}': {e}")))?
        {
            budget.charge(chunk.len())?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ApiError::internal(format!("write downloaded file: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| ApiError::internal(format!("flush downloaded file: {e}")))?;

        tracing::debug!(url = %url, filename = %filename, "File downloaded");
        Ok((filename, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fs::create_working_dir;
    use axum::{routing::get, Router};
    use tokio::time::Instant;

    async fn file_server() -> String {
        let app = Router::new()
            .route(
                "/doc.txt",
                get(|| async {
                    (
                        [(header::CONTENT_DISPOSITION, "attachment; filename=\"remote doc.txt\"")],
                        "remote content",
                    )
                }),
            )
            .route("/anonymous", get(|| async { "no disposition" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn downloader(allow: &str) -> Downloader {
        Downloader::new(&DownloadFromConfig {
            allow_list: allow.to_string(),
            max_retry: 0,
            retry_min_wait_ms: 1,
            retry_max_wait_ms: 2,
            ..DownloadFromConfig::default()
        })
        .unwrap()
    }

    async fn context(root: &std::path::Path) -> RequestContext {
        let dir = create_working_dir(root).await.unwrap();
        RequestContext::new(dir, Instant::now() + Duration::from_secs(10))
    }

    #[tokio::test]
    async fn downloads_into_working_dir() {
        let base = file_server().await;
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let budget = BodyBudget::new(None);

        let raw = format!(r#"[{{"url": "{base}/doc.txt", "extraHttpHeaders": {{"X-Token": "t"}}}}]"#);
        let files = downloader("").fetch_all(&ctx, &raw, &budget).await.unwrap();

        assert_eq!(files.len(), 1);
        let (name, path) = &files[0];
        assert_eq!(name, "remote doc.txt");
        assert!(path.starts_with(ctx.dir()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "remote content");
        assert_eq!(budget.consumed(), "remote content".len() as u64);
    }

    #[tokio::test]
    async fn rejects_before_any_network_call() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let budget = BodyBudget::new(None);
        let d = downloader(r"^https://trusted\.example/");

        let err = d.fetch_all(&ctx, "not json", &budget).await.unwrap_err();
        assert_eq!(err.status_and_message().0, StatusCode::BAD_REQUEST);

        let err = d.fetch_all(&ctx, r#"[{"url": ""}]"#, &budget).await.unwrap_err();
        assert_eq!(err.status_and_message().0, StatusCode::BAD_REQUEST);

        let err = d
            .fetch_all(&ctx, r#"[{"url": "http://127.0.0.1:1/x"}]"#, &budget)
            .await
            .unwrap_err();
        assert_eq!(err.status_and_message().0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn response_problems_are_client_errors() {
        let base = file_server().await;
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let budget = BodyBudget::new(None);
        let d = downloader("");

        for path in ["/anonymous", "/missing"] {
            let raw = format!(r#"[{{"url": "{base}{path}"}}]"#);
            let err = d.fetch_all(&ctx, &raw, &budget).await.unwrap_err();
            assert_eq!(err.status_and_message().0, StatusCode::BAD_REQUEST, "{path}");
        }
    }

    #[tokio::test]
    async fn downloads_count_against_body_limit() {
        let base = file_server().await;
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path()).await;
        let budget = BodyBudget::new(Some(4));

        let raw = format!(r#"[{{"url": "{base}/doc.txt"}}]"#);
        let err = downloader("").fetch_all(&ctx, &raw, &budget).await.unwrap_err();
        assert_eq!(err.status_and_message().0, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
