//! Main entry point for the Tessera server.
//!
//! Loads configuration, sets up logging and metrics, then serves until a
//! shutdown signal arrives. Cleanup runs through the exit hook chain.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tessera_discovery::ConsulClient;
use tessera_server::{
    AppConfig, Cli, ExitHooks, Server,
    startup::{self, ShutdownReport},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli).context("failed to load configuration")?;

    let logging_guard = startup::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    // Registered first so it runs last and flushes what the other hooks log
    let exit_hooks = Arc::new(ExitHooks::new());
    exit_hooks.add("logging", move |_| {
        drop(logging_guard);
        Ok(())
    });

    let code = match run(config, exit_hooks.clone()).await {
        Ok(report) => {
            for step in report.failures() {
                warn!(step = %step.name, "Shutdown step did not complete cleanly");
            }
            0
        }
        Err(e) => {
            error!(error = %e, "Server exited with error");
            1
        }
    };

    exit_hooks.exit(code);
    Ok(())
}

async fn run(config: AppConfig, exit_hooks: Arc<ExitHooks>) -> anyhow::Result<ShutdownReport> {
    info!(
        name = %config.server.name,
        endpoint = %config.server.endpoint,
        environment = %config.server.environment,
        consul = %config.consul.endpoint,
        "Starting Tessera server"
    );

    let metrics = match tessera_server::metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let discovery = Arc::new(ConsulClient::new(config.consul.client_config())?);

    let root = CancellationToken::new();
    let signals = startup::spawn_signal_listener(root.clone());

    let mut server = Server::new(config, discovery, root.clone()).with_exit_hooks(exit_hooks);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let result = match server.bind().await {
        Ok(bound) => bound.serve().await,
        Err(e) => Err(e),
    };

    root.cancel();
    if let Err(e) = signals.await {
        warn!(error = %e, "Signal listener task failed");
    }

    Ok(result?)
}
