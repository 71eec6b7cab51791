//! Startup orchestration.
//!
//! # Order
//! 1. Validate configuration (done by the loader)
//! 2. Provision and validate every registered module
//! 3. Collect and validate routes and middlewares
//! 4. Bind the listener
//! 5. Start modules and wait for readiness, then serve
//!
//! Any error before serving is fatal.

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::http::server::{HttpServer, ServerError};
use crate::modules::ModuleRegistry;

/// Build the server from `registry`, bind the configured address and serve
/// until `shutdown` fires.
pub async fn run(
    config: ServerConfig,
    registry: &ModuleRegistry,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let server = HttpServer::new(config, registry)?;

    let listener = TcpListener::bind(&server.config().api.bind_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        modules = ?registry.ids(),
        "Listening for connections"
    );

    server.run(listener, shutdown).await
}
