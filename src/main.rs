//! docserve server binary.
//!
//! ```text
//! CLI flags → config file (or defaults) → validation
//!     → logging + metrics → module registry → serve until SIGINT/SIGTERM
//! ```

use std::path::PathBuf;

use clap::Parser;

use docserve::config::validation::validate_config;
use docserve::config::{load_config, ConfigError, ServerConfig};
use docserve::lifecycle::{signals, startup};
use docserve::observability::{logging::init_logging, metrics::init_metrics};
use docserve::{builtin_registry, Shutdown};

#[derive(Parser)]
#[command(name = "docserve")]
#[command(about = "Document conversion server", version, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "DOCSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(long, env = "DOCSERVE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Overrides `api.bind_address`.
    #[arg(short, long, env = "DOCSERVE_BIND_ADDRESS")]
    bind_address: Option<String>,
}

fn configure(cli: Cli) -> Result<ServerConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(address) = cli.bind_address {
        config.api.bind_address = address;
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = configure(Cli::parse())?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "docserve starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let registry = builtin_registry()?;
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();

    let signals = shutdown.clone();
    tokio::spawn(async move { signals::wait_for_signal(&signals).await });

    if let Err(e) = startup::run(config, &registry, receiver).await {
        tracing::error!(error = %e, "Server failed");
        return Err(e.into());
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
