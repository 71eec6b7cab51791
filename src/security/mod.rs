//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → basic_auth.rs (optional credentials check, default stack)
//!
//! Outbound request (downloads, webhooks):
//!     → url_filter.rs (allow/deny regexes, checked before any network call)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - No trust in client input

pub mod basic_auth;
pub mod url_filter;
