//! Request-processing core of a document conversion server.
//!
//! Modules plug routes, middlewares and health checks into a shared HTTP
//! surface. Multipart routes get a per-request working directory populated from
//! the form (and optional remote downloads), run under soft and hard timeouts,
//! and answer with their output files or hand them to a webhook.

pub mod config;
pub mod context;
pub mod form;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod modules;
pub mod observability;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod webhook;

pub use config::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;

use modules::{ModuleError, ModuleRegistry};

/// Sent on every outbound request (downloads and webhook deliveries).
pub const USER_AGENT: &str = concat!("docserve/", env!("CARGO_PKG_VERSION"));

/// A registry holding the modules shipped with this crate.
pub fn builtin_registry() -> Result<ModuleRegistry, ModuleError> {
    let mut registry = ModuleRegistry::new();
    registry.register(webhook::descriptor()?)?;
    registry.register(security::basic_auth::descriptor()?)?;
    Ok(registry)
}
