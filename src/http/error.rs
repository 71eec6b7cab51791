//! Errors that cross the HTTP boundary.
//!
//! Every failure a client can observe is an [`ApiError`]. Only the status and
//! the safe message reach the client; the full error is attached to the
//! response as an [`ErrorDetail`] extension so the request logger can record it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;
use std::time::Duration;

use crate::context::ContextError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An error carrying a client-safe status and message next to its internal cause.
    #[error("{cause}")]
    Sentinel {
        cause: String,
        status: StatusCode,
        message: String,
    },

    /// The request's soft deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The watchdog gave up on the handler.
    #[error("hard timeout of {0:?} reached")]
    HardTimeout(Duration),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn sentinel(cause: impl Display, status: StatusCode, message: impl Into<String>) -> Self {
        Self::Sentinel {
            cause: cause.to_string(),
            status,
            message: message.into(),
        }
    }

    /// A 400 whose message doubles as its cause.
    pub fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::sentinel(&message, StatusCode::BAD_REQUEST, message.clone())
    }

    pub fn internal(cause: impl Display) -> Self {
        Self::Internal(cause.to_string())
    }

    /// Translate into what the client is allowed to see.
    pub fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::Sentinel { status, message, .. } => (*status, message.clone()),
            ApiError::DeadlineExceeded | ApiError::HardTimeout(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable".to_string(),
            ),
            ApiError::Context(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::DeadlineExceeded | ApiError::HardTimeout(_))
    }
}

/// Full error text for logging, stashed in response extensions.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        let mut response = (status, message).into_response();
        response
            .extensions_mut()
            .insert(ErrorDetail(self.to_string()));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_keeps_cause_private() {
        let err = ApiError::sentinel(
            "parse multipart: unexpected EOF",
            StatusCode::BAD_REQUEST,
            "Malformed body",
        );
        assert_eq!(
            err.status_and_message(),
            (StatusCode::BAD_REQUEST, "Malformed body".to_string())
        );
        assert_eq!(err.to_string(), "parse multipart: unexpected EOF");
    }

    #[test]
    fn timeouts_surface_uniformly() {
        let soft = ApiError::DeadlineExceeded.status_and_message();
        let hard = ApiError::HardTimeout(Duration::from_secs(35)).status_and_message();
        assert_eq!(soft, hard);
        assert_eq!(soft.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_errors_are_not_echoed() {
        let response = ApiError::internal("disk on fire at /tmp/x").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert!(detail.0.contains("disk on fire"));
    }
}
