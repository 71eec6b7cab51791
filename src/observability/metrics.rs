//! Metrics collection and exposition.
//!
//! # Metrics
//! - `docserve_requests_total` (counter): requests by method, route, status
//! - `docserve_request_duration_seconds` (histogram): request latency
//! - `docserve_downloads_total` (counter): `downloadFrom` fetches by outcome
//! - `docserve_webhook_deliveries_total` (counter): deliveries by kind and outcome
//! - `docserve_async_jobs` (gauge): webhook jobs still running
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// `route` is the matched route template, never the raw path.
pub fn record_request(method: &str, status: u16, route: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("route", route.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("docserve_requests_total", &labels).increment(1);
    metrics::histogram!("docserve_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_download(success: bool) {
    metrics::counter!("docserve_downloads_total", "outcome" => outcome(success)).increment(1);
}

/// `kind` is `"output"` or `"error"`.
pub fn record_webhook_delivery(kind: &'static str, success: bool) {
    metrics::counter!(
        "docserve_webhook_deliveries_total",
        "kind" => kind,
        "outcome" => outcome(success)
    )
    .increment(1);
}

pub fn set_async_jobs(count: i64) {
    metrics::gauge!("docserve_async_jobs").set(count as f64);
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
