//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     modules contribute Route[] and Middleware[]
//!     → validate_routes (paths, namespace, uniqueness)
//!     → middleware.rs sorts each stack by priority
//!     → pipeline.rs wraps every multipart route
//!     → server.rs mounts everything on an axum Router
//!
//! Per request:
//!     pre-router → default stack → [context → multipart stack] → hard timeout → handler
//! ```
//!
//! # Design Decisions
//! - Routes are validated once at startup; a bad route aborts startup
//! - Multipart routes live under `/forms` so no plain route ever parses a body
//!   as multipart
//! - The handler kind is part of the type, so "multipart without a context
//!   handler" cannot be expressed

pub mod middleware;
pub mod pipeline;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::Method;
use axum::response::Response;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::context::RequestContext;
use crate::http::error::ApiError;

pub use middleware::{
    FormNext, Middleware, MiddlewarePriority, MiddlewareStack, MiddlewareStacks, Outcome,
};

/// Reserved prefix for routes that receive multipart forms.
pub const MULTIPART_PREFIX: &str = "/forms";

pub const HEALTH_PATH: &str = "/health";
pub const VERSION_PATH: &str = "/version";
pub const FAVICON_PATH: &str = "/favicon.ico";

/// Paths the server mounts itself.
pub const RESERVED_PATHS: [&str; 4] = ["/", HEALTH_PATH, VERSION_PATH, FAVICON_PATH];

pub type HttpHandlerFn =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, ApiError>> + Send + Sync>;

pub type FormHandlerFn =
    Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// What a route runs once the middleware chain lets the request through.
#[derive(Clone)]
pub enum Handler {
    /// Receives the raw request.
    Http(HttpHandlerFn),
    /// Receives a populated working context and registers output paths on it.
    Form(FormHandlerFn),
}

#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub path: String,
    pub disable_logging: bool,
    pub handler: Handler,
}

impl Route {
    pub fn http<F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ApiError>> + Send + 'static,
    {
        Self {
            method,
            path: path.into(),
            disable_logging: false,
            handler: Handler::Http(Arc::new(move |req| handler(req).boxed())),
        }
    }

    pub fn form<F, Fut>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        Self {
            method,
            path: path.into(),
            disable_logging: false,
            handler: Handler::Form(Arc::new(move |ctx| handler(ctx).boxed())),
        }
    }

    pub fn without_logging(mut self) -> Self {
        self.disable_logging = true;
        self
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.handler, Handler::Form(_))
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("multipart", &self.is_multipart())
            .field("disable_logging", &self.disable_logging)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route has an empty path")]
    EmptyPath,

    #[error("route '{0}' does not start with '/'")]
    MissingLeadingSlash(String),

    #[error("route '{0}' is a multipart route but does not start with '{MULTIPART_PREFIX}'")]
    MultipartOutsidePrefix(String),

    #[error("route '{0}' is reserved")]
    Reserved(String),

    #[error("route '{0}' is already registered")]
    Duplicate(String),

    #[error("route '{path}' uses unsupported method '{method}'")]
    UnsupportedMethod { path: String, method: Method },
}

/// Check a complete route set before anything is mounted.
pub fn validate_routes(routes: &[Route]) -> Result<(), RouteError> {
    let mut seen: HashSet<&str> = HashSet::new();

    for route in routes {
        if route.path.is_empty() {
            return Err(RouteError::EmptyPath);
        }

        if !route.path.starts_with('/') {
            return Err(RouteError::MissingLeadingSlash(route.path.clone()));
        }

        if route.is_multipart() && !route.path.starts_with(MULTIPART_PREFIX) {
            return Err(RouteError::MultipartOutsidePrefix(route.path.clone()));
        }

        if RESERVED_PATHS.contains(&route.path.as_str()) {
            return Err(RouteError::Reserved(route.path.clone()));
        }

        if !seen.insert(route.path.as_str()) {
            return Err(RouteError::Duplicate(route.path.clone()));
        }
    }

    Ok(())
}
