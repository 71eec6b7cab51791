//! Hard timeout enforcement.
//!
//! # Responsibilities
//! - Run a handler as its own task and race it against a watchdog deadline
//! - Contain panics raised by the handler, even after the race was lost
//!
//! # Design Decisions
//! - The hard deadline is the soft timeout plus [`HARD_TIMEOUT_MARGIN`]
//! - A losing handler task is abandoned, not aborted. It keeps running until
//!   it observes its context's soft deadline or cancellation. Work that never
//!   yields cannot be stopped; its panics are still caught and logged.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use crate::http::error::ApiError;

/// Added to the soft timeout to obtain the hard timeout.
pub const HARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    hard: Duration,
}

impl TimeoutGuard {
    /// Guard for a route whose soft timeout is `soft`.
    pub fn new(soft: Duration) -> Self {
        Self::with_margin(soft, HARD_TIMEOUT_MARGIN)
    }

    pub fn with_margin(soft: Duration, margin: Duration) -> Self {
        Self {
            hard: soft.saturating_add(margin),
        }
    }

    pub fn hard_timeout(&self) -> Duration {
        self.hard
    }

    /// Run `fut` on a separate task, bounded by the hard timeout.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => Some(result),
                Err(payload) => {
                    tracing::error!(
                        panic = %panic_message(payload.as_ref()),
                        "Recovered from panic in guarded handler"
                    );
                    None
                }
            }
        });

        match tokio::time::timeout(self.hard, handle).await {
            Ok(Ok(Some(result))) => result,
            Ok(Ok(None)) => Err(ApiError::internal("handler panicked")),
            Ok(Err(e)) => Err(ApiError::internal(format!("handler task failed: {e}"))),
            Err(_) => {
                tracing::warn!(
                    hard_timeout = ?self.hard,
                    "Hard timeout reached, abandoning handler"
                );
                Err(ApiError::HardTimeout(self.hard))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
