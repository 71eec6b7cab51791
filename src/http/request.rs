//! Core pre-router middlewares.
//!
//! # Responsibilities
//! - Record when the request started and under which root path it is served
//! - Read the trace id from the trace header, or generate one, and echo it back
//! - Log one line per request inside a `request{trace=..}` span
//!
//! Every later stage reads the per-request values from the [`RequestState`]
//! extension instead of from shared state.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

use crate::http::error::ErrorDetail;
use crate::observability::metrics;

/// Lower-cased default trace header (`Gotenberg-Trace` on the wire).
pub const DEFAULT_TRACE_HEADER: &str = "gotenberg-trace";

/// Label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Per-request values set by the core middlewares.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub started_at: Instant,
    pub root_path: String,
    pub trace: String,
}

impl RequestState {
    fn begin() -> Self {
        Self {
            started_at: Instant::now(),
            root_path: String::new(),
            trace: String::new(),
        }
    }
}

/// Settings shared by the core middlewares.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub root_path: String,
    pub trace_header: HeaderName,
    /// Full paths whose requests are not logged.
    pub unlogged_paths: HashSet<String>,
}

pub type SharedSettings = Arc<CoreSettings>;

/// Starts the latency clock.
pub async fn start_timer(mut request: Request, next: Next) -> Response {
    request.extensions_mut().insert(RequestState::begin());
    next.run(request).await
}

pub async fn attach_root_path(
    State(settings): State<SharedSettings>,
    mut request: Request,
    next: Next,
) -> Response {
    state_mut(&mut request).root_path = settings.root_path.clone();
    next.run(request).await
}

/// Reuses the caller's trace id when present, otherwise generates one.
pub async fn attach_trace(
    State(settings): State<SharedSettings>,
    mut request: Request,
    next: Next,
) -> Response {
    let trace = request
        .headers()
        .get(&settings.trace_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    state_mut(&mut request).trace = trace.clone();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace) {
        response
            .headers_mut()
            .insert(settings.trace_header.clone(), value);
    }
    response
}

pub async fn log_request(
    State(settings): State<SharedSettings>,
    request: Request,
    next: Next,
) -> Response {
    let state = request
        .extensions()
        .get::<RequestState>()
        .cloned()
        .unwrap_or_else(RequestState::begin);

    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();
    let route = route_label(&request);
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes_in = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let remote_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let span = tracing::info_span!("request", trace = %state.trace);
    let response = next.run(request).instrument(span.clone()).await;

    let status = response.status();
    metrics::record_request(method.as_str(), status.as_u16(), &route, state.started_at);

    if settings.unlogged_paths.contains(&path) {
        return response;
    }

    let latency = state.started_at.elapsed();
    let error = response.extensions().get::<ErrorDetail>().map(|e| e.0.as_str());

    let latency_ns = latency.as_nanos() as u64;
    let status_code = status.as_u16();
    span.in_scope(|| {
        if status.is_server_error() {
            tracing::error!(
                remote_ip = %remote_ip,
                host = %host,
                uri = %uri,
                method = %method,
                path = %path,
                status = status_code,
                latency = latency_ns,
                latency_human = ?latency,
                bytes_in,
                error = error.unwrap_or_default(),
                "request failed"
            );
        } else if status.is_client_error() {
            tracing::warn!(
                remote_ip = %remote_ip,
                host = %host,
                uri = %uri,
                method = %method,
                path = %path,
                status = status_code,
                latency = latency_ns,
                latency_human = ?latency,
                bytes_in,
                error = error.unwrap_or_default(),
                "request rejected"
            );
        } else {
            tracing::info!(
                remote_ip = %remote_ip,
                host = %host,
                uri = %uri,
                method = %method,
                path = %path,
                status = status_code,
                latency = latency_ns,
                latency_human = ?latency,
                bytes_in,
                "request handled"
            );
        }
    });

    response
}

/// The route template the request matched, such as `/forms/{engine}`.
fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

fn state_mut(request: &mut Request) -> &mut RequestState {
    request
        .extensions_mut()
        .get_or_insert_with(RequestState::begin)
}
