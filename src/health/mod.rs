//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Modules contribute named checks (HealthChecker capability)
//!     → GET/HEAD <root>health
//!     → every check runs concurrently, each bounded by the api timeout
//!     → {"status": "up"|"down", "details": {..}} with 200 or 503
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A named probe contributed by a module.
#[derive(Clone)]
pub struct HealthCheck {
    name: String,
    check: CheckFn,
}

impl HealthCheck {
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move || check().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: Status,
    pub details: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            Status::Up => StatusCode::OK,
            Status::Down => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Run every check concurrently. One failing or slow check marks the whole report down.
pub async fn aggregate(checks: &[HealthCheck], timeout: Duration) -> HealthReport {
    let results = join_all(checks.iter().map(|check| {
        let probe = (check.check)();
        async move {
            let result = match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(())) => CheckResult {
                    status: Status::Up,
                    error: None,
                },
                Ok(Err(e)) => CheckResult {
                    status: Status::Down,
                    error: Some(e),
                },
                Err(_) => CheckResult {
                    status: Status::Down,
                    error: Some(format!("check timed out after {timeout:?}")),
                },
            };
            (check.name.clone(), result)
        }
    }))
    .await;

    let status = if results.iter().all(|(_, r)| r.status == Status::Up) {
        Status::Up
    } else {
        Status::Down
    };

    for (name, result) in &results {
        if let Some(error) = &result.error {
            tracing::warn!(check = %name, error = %error, "Health check failed");
        }
    }

    HealthReport {
        status,
        details: results.into_iter().collect(),
    }
}
