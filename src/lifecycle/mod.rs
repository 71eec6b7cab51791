//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Provision modules → Validate routes → Bind → Start modules → Ready → Serve
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Drain async jobs (jobs.rs) → Stop accepting → Finish in-flight → Stop modules
//! ```
//!
//! # Design Decisions
//! - Shutdown has timeout: async jobs still running after the stop timeout are abandoned

pub mod jobs;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use jobs::{AsyncJobs, JobGuard};
pub use shutdown::Shutdown;
