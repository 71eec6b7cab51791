//! Multipart middleware that hands a request's outcome to a webhook.
//!
//! # Data Flow
//! ```text
//! Gotenberg-Webhook-Url absent → rest of the chain, response as usual
//! otherwise: parse and filter target headers (400 / 403 before any work)
//!     sync  → run chain → deliver → 204
//!     async → spawn (run chain → deliver → cancel context) → 204 right away
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode};
use tracing::Instrument;
use url::Url;

use super::client::{WebhookClient, WebhookTarget};
use crate::context::download::header_map;
use crate::context::RequestContext;
use crate::form::parse_bool;
use crate::http::error::ApiError;
use crate::lifecycle::AsyncJobs;
use crate::routing::{FormNext, Outcome};
use crate::security::url_filter::{FilterError, UrlFilter};

pub const URL_HEADER: &str = "Gotenberg-Webhook-Url";
pub const ERROR_URL_HEADER: &str = "Gotenberg-Webhook-Error-Url";
pub const METHOD_HEADER: &str = "Gotenberg-Webhook-Method";
pub const ERROR_METHOD_HEADER: &str = "Gotenberg-Webhook-Error-Method";
pub const EXTRA_HEADERS_HEADER: &str = "Gotenberg-Webhook-Extra-Http-Headers";
pub const SYNC_HEADER: &str = "Gotenberg-Webhook-Sync";

/// Everything the middleware needs, shared by every request.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub(crate) filter: UrlFilter,
    pub(crate) error_filter: UrlFilter,
    pub(crate) client: WebhookClient,
    pub(crate) jobs: AsyncJobs,
}

/// Entry point of the middleware.
pub(crate) async fn dispatch(
    dispatcher: Arc<Dispatcher>,
    ctx: Arc<RequestContext>,
    next: FormNext,
) -> Result<Outcome, ApiError> {
    let Some(target) = parse_target(ctx.headers(), &dispatcher.filter, &dispatcher.error_filter)?
    else {
        return next.run(ctx).await;
    };

    if target.sync {
        let result = next.run(ctx.clone()).await;
        deliver(&dispatcher.client, &target, &ctx, result).await;
        return Ok(Outcome::NoContent);
    }

    let job = dispatcher.jobs.track();
    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            let _job = job;
            let result = next.run(ctx.clone()).await;
            deliver(&dispatcher.client, &target, &ctx, result).await;
            ctx.close().await;
        }
        .instrument(span),
    );

    Ok(Outcome::Detached)
}

/// Rejects any request asking for a webhook.
pub(crate) async fn reject(ctx: Arc<RequestContext>, next: FormNext) -> Result<Outcome, ApiError> {
    if header(ctx.headers(), URL_HEADER).is_some() {
        return Err(ApiError::sentinel(
            "webhook feature is disabled",
            StatusCode::FORBIDDEN,
            format!("Invalid '{URL_HEADER}' header: the webhook feature is disabled"),
        ));
    }
    next.run(ctx).await
}

/// Send the outcome of the chain. Failures are logged only.
async fn deliver(
    client: &WebhookClient,
    target: &WebhookTarget,
    ctx: &RequestContext,
    result: Result<Outcome, ApiError>,
) {
    let err = match result {
        Ok(Outcome::Output) => match ctx.build_output_file().await {
            Ok(path) => match client.send_output(target, ctx, &path).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to send output file to webhook");
                    ApiError::internal(e)
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to build output file");
                ApiError::from(e)
            }
        },
        Ok(outcome) => {
            tracing::debug!(?outcome, "Nothing to deliver to webhook");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Request failed, reporting to webhook");
            e
        }
    };

    if let Err(e) = client.send_error(target, ctx, &err).await {
        tracing::error!(error = %e, "Failed to send error details to webhook");
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `None` when the request does not ask for a webhook.
pub(crate) fn parse_target(
    headers: &HeaderMap,
    filter: &UrlFilter,
    error_filter: &UrlFilter,
) -> Result<Option<WebhookTarget>, ApiError> {
    let Some(url) = header(headers, URL_HEADER) else {
        return Ok(None);
    };

    let Some(error_url) = header(headers, ERROR_URL_HEADER) else {
        return Err(ApiError::sentinel(
            "empty webhook error URL",
            StatusCode::BAD_REQUEST,
            format!("Invalid '{ERROR_URL_HEADER}' header: empty value or header not provided"),
        ));
    };

    let url = check_url(filter, url, URL_HEADER)?;
    let error_url = check_url(error_filter, error_url, ERROR_URL_HEADER)?;
    let method = parse_method(headers, METHOD_HEADER)?;
    let error_method = parse_method(headers, ERROR_METHOD_HEADER)?;

    let extra_headers = match header(headers, EXTRA_HEADERS_HEADER) {
        None => HeaderMap::new(),
        Some(raw) => serde_json::from_str::<HashMap<String, String>>(raw)
            .map_err(|e| e.to_string())
            .and_then(|map| header_map(&map))
            .map_err(|e| {
                ApiError::bad_request(format!(
                    "Invalid '{EXTRA_HEADERS_HEADER}' header value: {e}"
                ))
            })?,
    };

    let sync = match header(headers, SYNC_HEADER) {
        None => false,
        Some(raw) => parse_bool(raw).map_err(|e| {
            ApiError::bad_request(format!("Invalid '{SYNC_HEADER}' header value: {e}"))
        })?,
    };

    Ok(Some(WebhookTarget {
        url,
        method,
        error_url,
        error_method,
        extra_headers,
        sync,
    }))
}

fn check_url(filter: &UrlFilter, raw: &str, name: &str) -> Result<Url, ApiError> {
    filter.check(raw).map_err(|e| match e {
        FilterError::NotAllowed(_) | FilterError::Denied(_) => ApiError::sentinel(
            &e,
            StatusCode::FORBIDDEN,
            format!("Invalid '{name}' header value: '{raw}' does not match the authorized URLs"),
        ),
        FilterError::Invalid(_) | FilterError::Scheme(_) => ApiError::sentinel(
            &e,
            StatusCode::BAD_REQUEST,
            format!("Invalid '{name}' header value: '{raw}' is not a valid HTTP(S) URL"),
        ),
    })
}

fn parse_method(headers: &HeaderMap, name: &str) -> Result<Method, ApiError> {
    let Some(raw) = header(headers, name) else {
        return Ok(Method::POST);
    };

    match raw.to_uppercase().as_str() {
        "POST" => Ok(Method::POST),
        "PATCH" => Ok(Method::PATCH),
        "PUT" => Ok(Method::PUT),
        other => Err(ApiError::bad_request(format!(
            "Invalid '{name}' header value: expected 'POST', 'PATCH' or 'PUT', but got '{other}'"
        ))),
    }
}
