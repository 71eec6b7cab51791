//! HTTP server setup.
//!
//! # Responsibilities
//! - Provision modules and collect their routes, middlewares and health checks
//! - Validate the route set before anything is mounted
//! - Assemble the axum router with the middleware stacks in order
//! - Serve until shutdown, draining async jobs and stopping modules on the way out
//!
//! # Middleware order
//! ```text
//! start_timer → attach_root_path → attach_trace → log_request
//!     → module pre-router stack → module default stack (routed requests only)
//!     → [multipart routes] context ingestion → multipart stack → hard timeout → handler
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderName, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Html;
use axum::routing::{get, on, MethodFilter};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::context::download::DownloaderError;
use crate::context::{Downloader, IngestOptions};
use crate::health::{aggregate, HealthCheck};
use crate::http::request::{
    attach_root_path, attach_trace, log_request, start_timer, CoreSettings,
};
use crate::lifecycle::jobs::wait_until_idle;
use crate::modules::{Contributions, ModuleError, ModuleRegistry, Modules};
use crate::resilience::TimeoutGuard;
use crate::routing::middleware::FormMiddlewareFn;
use crate::routing::pipeline::{serve_http, FormPipeline};
use crate::routing::{
    validate_routes, Handler, RouteError, FAVICON_PATH, HEALTH_PATH, VERSION_PATH,
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("invalid route: {0}")]
    Route(#[from] RouteError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("download client: {0}")]
    Download(#[from] DownloaderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const ROOT_PAGE: &str = "<html><body><p>docserve has no UI, it is an API. \
     Send multipart forms to the <code>/forms</code> routes.</p></body></html>";

/// The assembled HTTP server.
pub struct HttpServer {
    config: ServerConfig,
    modules: Modules,
    router: Router,
}

impl HttpServer {
    /// Provision every registered module and build the router.
    pub fn new(config: ServerConfig, registry: &ModuleRegistry) -> Result<Self, ServerError> {
        let modules = registry.provision(&config)?;
        let contributions = modules.collect()?;
        validate_routes(&contributions.routes)?;

        let router = build_router(&config, contributions)?;
        Ok(Self {
            config,
            modules,
            router,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// A clone of the assembled router, for in-process testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Start modules, wait for readiness, then serve until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let api = self.config.api.clone();

        self.modules.start_all()?;
        if let Err(e) = self.modules.wait_ready(api.start_timeout()).await {
            self.modules.stop_all();
            return Err(e.into());
        }

        tracing::info!(
            address = %listener.local_addr()?,
            modules = ?self.modules.ids(),
            "HTTP server ready"
        );

        let draining = self.modules.clone();
        let graceful = async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutdown signal received");
            if api.wait_for_async_jobs {
                drain_async_jobs(&draining, api.stop_timeout()).await;
            }
        };

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .await;

        self.modules.stop_all();
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn drain_async_jobs(modules: &Modules, timeout: Duration) {
    let pending = modules.async_count();
    if pending == 0 {
        return;
    }

    tracing::info!(pending, timeout = ?timeout, "Waiting for async jobs");
    if !wait_until_idle(|| modules.async_count(), timeout).await {
        tracing::warn!(
            remaining = modules.async_count(),
            "Stop timeout reached, abandoning async jobs"
        );
    }
}

/// Join the root path and a route path: `/api/` + `/health` → `/api/health`.
fn prefixed(root: &str, path: &str) -> String {
    format!("{}{}", root.trim_end_matches('/'), path)
}

fn build_router(config: &ServerConfig, contributions: Contributions) -> Result<Router, ServerError> {
    let api = &config.api;
    let timeout = api.timeout();
    let guard = TimeoutGuard::new(timeout);

    let trace_header = HeaderName::from_bytes(api.trace_header.as_bytes())
        .map_err(|e| ServerError::Config(format!("trace header '{}': {e}", api.trace_header)))?;
    let body_limit = api.body_limit_bytes().map_err(ServerError::Config)?;
    let downloader = if config.download_from.disable {
        None
    } else {
        Some(Arc::new(Downloader::new(&config.download_from)?))
    };

    let ingest = Arc::new(IngestOptions {
        working_dir: api.working_dir(),
        timeout,
        body_limit,
        trace_header: trace_header.clone(),
        downloader,
    });

    let Contributions {
        routes,
        middlewares,
        health_checks,
    } = contributions;
    let multipart_chain: Arc<[FormMiddlewareFn]> = middlewares.multipart.into();

    let mut unlogged = HashSet::new();
    let mut router = Router::new();

    for route in routes {
        let path = prefixed(&api.root_path, &route.path);
        let filter = MethodFilter::try_from(route.method.clone()).map_err(|_| {
            RouteError::UnsupportedMethod {
                path: route.path.clone(),
                method: route.method.clone(),
            }
        })?;
        if route.disable_logging {
            unlogged.insert(path.clone());
        }

        let method_router = match route.handler {
            Handler::Http(handler) => on(filter, move |request: Request| {
                serve_http(handler.clone(), guard, request)
            }),
            Handler::Form(handler) => {
                let pipeline = Arc::new(FormPipeline::new(
                    ingest.clone(),
                    multipart_chain.clone(),
                    handler,
                    guard,
                ));
                on(filter, move |request: Request| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.serve(request).await }
                })
            }
        };

        tracing::debug!(method = %route.method, path = %path, "Route mounted");
        router = router.route(&path, method_router);
    }

    let health_path = prefixed(&api.root_path, HEALTH_PATH);
    if api.disable_health_check_logging {
        unlogged.insert(health_path.clone());
    }
    router = router
        .route(&api.root_path, get(|| async { Html(ROOT_PAGE) }))
        .route(
            &prefixed(&api.root_path, FAVICON_PATH),
            get(|| async { StatusCode::NO_CONTENT }),
        )
        .route(
            &prefixed(&api.root_path, VERSION_PATH),
            get(|| async { env!("CARGO_PKG_VERSION") }),
        )
        .route(&health_path, health_routes(Arc::new(health_checks), timeout));

    // Layers wrap inside-out: the first middleware of a sorted stack is added last.
    for middleware in middlewares.default.iter().rev() {
        let middleware = middleware.clone();
        router = router.route_layer(from_fn(move |req: Request, next: Next| middleware(req, next)));
    }
    for middleware in middlewares.pre_router.iter().rev() {
        let middleware = middleware.clone();
        router = router.layer(from_fn(move |req: Request, next: Next| middleware(req, next)));
    }

    let settings = Arc::new(CoreSettings {
        root_path: api.root_path.clone(),
        trace_header,
        unlogged_paths: unlogged,
    });

    Ok(router
        .layer(from_fn_with_state(settings.clone(), log_request))
        .layer(from_fn_with_state(settings.clone(), attach_trace))
        .layer(from_fn_with_state(settings, attach_root_path))
        .layer(from_fn(start_timer))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::disable()))
}

fn health_routes(checks: Arc<Vec<HealthCheck>>, timeout: Duration) -> axum::routing::MethodRouter {
    let head_checks = checks.clone();
    get(move || {
        let checks = checks.clone();
        async move { aggregate(&checks, timeout).await }
    })
    .head(move || {
        let checks = head_checks.clone();
        async move { aggregate(&checks, timeout).await.status_code() }
    })
}
