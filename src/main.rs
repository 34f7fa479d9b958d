//! Tenant gateway binary.
//!
//! Loads config, starts logging and metrics, then serves the pipeline until
//! SIGINT/SIGTERM. Config file edits hot-reload the authorization and
//! rate-limit policies.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tenant_gateway::config::loader::load_config;
use tenant_gateway::config::watcher::ConfigWatcher;
use tenant_gateway::lifecycle::signals::spawn_signal_listener;
use tenant_gateway::observability::{logging, metrics};
use tenant_gateway::{GatewayConfig, HttpServer, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "tenant-gateway", version, about = "Multi-tenant request gateway")]
struct Cli {
    /// Path to the TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tenant-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        rate_limit_backend = ?config.rate_limit.backend,
        idempotency_backend = ?config.idempotency.backend,
        minimum_role = %config.authorization.minimum_role,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let (config_updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, config.clone());
            (updates, Some(watcher.run()?))
        }
        None => {
            let (_, updates) = mpsc::unbounded_channel();
            (updates, None)
        }
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.signal()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
