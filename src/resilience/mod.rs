//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Route invocation:
//!     → timeouts.rs (hard timeout watchdog, panic containment)
//!
//! Outbound call (download, webhook):
//!     → retries.rs (per-attempt timeout, retry if retryable)
//!     → backoff.rs (exponential delay with jitter)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every handler runs under a hard deadline
//! - Retries are bounded and only for transport errors, 429 and 5xx
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{RequestBody, RetryError, RetryPolicy, RetryingClient};
pub use timeouts::{TimeoutGuard, HARD_TIMEOUT_MARGIN};
