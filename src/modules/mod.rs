//! Feature modules and their capabilities.
//!
//! # Data Flow
//! ```text
//! ModuleDescriptor {id, default flags, constructor}
//!     → ModuleRegistry::register (append-only, ids unique)
//!     → ModuleRegistry::provision: construct → provision(flags) → validate
//!     → Modules::collect: routes, middlewares, health checks
//!     → Modules::start_all → serve → Modules::stop_all
//! ```
//!
//! Capabilities are probed through the `as_*` methods of [`Module`]. A module
//! implements the capability traits it needs and overrides the matching probe
//! to return `Some(self)`.

mod registry;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::health::HealthCheck;
use crate::routing::{Middleware, Route};

pub use registry::{Contributions, ModuleDescriptor, ModuleRegistry, Modules, ProvisionContext};

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module id must not be empty")]
    EmptyId,

    #[error("module '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid flags: {0}")]
    Flags(String),

    #[error("{0}")]
    Invalid(String),

    #[error("module '{id}' failed to {phase}: {source}")]
    Phase {
        id: String,
        phase: &'static str,
        #[source]
        source: Box<ModuleError>,
    },

    #[error("module '{id}' not ready: {reason}")]
    NotReady { id: String, reason: String },
}

impl ModuleError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    fn during(self, id: &str, phase: &'static str) -> Self {
        Self::Phase {
            id: id.to_string(),
            phase,
            source: Box::new(self),
        }
    }
}

/// A unit of functionality plugged into the server.
///
/// Lifecycle: `provision` → `validate` → `start` → (serve) → `stop`.
pub trait Module: Send + Sync {
    /// Read flags and build internal state.
    fn provision(&mut self, _ctx: &ProvisionContext<'_>) -> Result<(), ModuleError> {
        Ok(())
    }

    fn validate(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn start(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    fn as_router(&self) -> Option<&dyn RouteProvider> {
        None
    }

    fn as_middleware_provider(&self) -> Option<&dyn MiddlewareProvider> {
        None
    }

    fn as_health_checker(&self) -> Option<&dyn HealthChecker> {
        None
    }

    fn as_async_counter(&self) -> Option<&dyn AsyncCounter> {
        None
    }
}

/// Contributes HTTP routes.
pub trait RouteProvider {
    fn routes(&self) -> Result<Vec<Route>, ModuleError>;
}

/// Contributes middlewares to one or more stacks.
pub trait MiddlewareProvider {
    fn middlewares(&self) -> Result<Vec<Middleware>, ModuleError>;
}

/// Contributes health checks and a readiness probe.
pub trait HealthChecker {
    fn checks(&self) -> Result<Vec<HealthCheck>, ModuleError>;

    /// Resolves once the module can take traffic.
    fn ready(&self) -> BoxFuture<'static, Result<(), ModuleError>> {
        async { Ok(()) }.boxed()
    }
}

/// Reports background work still in flight.
pub trait AsyncCounter {
    fn async_count(&self) -> i64;
}
