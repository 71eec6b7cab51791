//! Tracking of detached background jobs.
//!
//! Webhook deliveries outlive the request that started them. Each one holds a
//! [`JobGuard`]; shutdown waits until the count drops to zero or the stop
//! timeout elapses.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Counter of in-flight background jobs.
#[derive(Debug, Clone, Default)]
pub struct AsyncJobs {
    active: Arc<AtomicI64>,
}

impl AsyncJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new job. The returned guard decrements the count on drop.
    pub fn track(&self) -> JobGuard {
        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_async_jobs(count);
        JobGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn count(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until every job finished. Returns `false` if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        wait_until_idle(|| self.count(), timeout).await
    }
}

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Poll `pending` until it reports zero. Returns `false` if `timeout` elapsed
/// first.
pub async fn wait_until_idle(pending: impl Fn() -> i64, timeout: Duration) -> bool {
    let wait = async {
        while pending() > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
}

/// Decrements the job count when dropped.
#[derive(Debug)]
pub struct JobGuard {
    active: Arc<AtomicI64>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_async_jobs(count);
        tracing::trace!(remaining = count, "Async job finished");
    }
}
