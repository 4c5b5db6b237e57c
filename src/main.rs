//! Argos binary entry point.
//!
//! Loads the configuration and the connector directory, then either runs one
//! cycle for every host (`--once`) or schedules every host until shutdown.

use std::sync::Arc;
use std::time::Duration;

use argos::{
    config::{AppConfig, parse_duration},
    connector::ConnectorStore,
    engine::Engine,
    export::LogExporter,
    protocol::ProtocolClients,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Argos - connector-driven hardware telemetry
#[derive(Parser, Debug)]
#[command(name = "argos", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/config.yaml", env = "ARGOS_CONFIG")]
    config: String,

    /// Connector directory (overrides config file)
    #[arg(long, env = "ARGOS_CONNECTORS")]
    connectors: Option<String>,

    /// Worker pool size (overrides config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Polling interval such as `2m` (overrides config file)
    #[arg(long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Run a single cycle for every host and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,argos=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Argos - hardware telemetry engine");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load_with_host_include(&cli.config)?;

    // CLI > ENV > config file
    if let Some(path) = cli.connectors {
        config.connector_path = path;
    }
    if let Some(workers) = cli.workers {
        config.engine.workers = workers;
    }
    if let Some(interval) = cli.interval {
        config.engine.interval = interval;
        config.engine.cron = None;
    }
    config.validate()?;

    let store = ConnectorStore::load_from_dir(&config.connector_path)?;
    for rejected in store.rejected() {
        tracing::error!(connector = %rejected.id, error = %rejected.error, "Connector rejected");
    }
    tracing::info!(
        "Hosts: {}, connectors: {}, workers: {}",
        config.hosts.len(),
        store.len(),
        config.engine.worker_count()
    );

    let clients = ProtocolClients::with_defaults()?;
    let engine = Engine::from_config(&config, Arc::new(store), clients, Arc::new(LogExporter)).await?;

    if cli.once {
        for report in engine.run_once().await {
            tracing::info!(
                host = %report.host_id,
                connectors = ?report.matched_connectors,
                metrics = report.snapshots.len(),
                diagnostics = report.diagnostics.len(),
                timed_out = report.timed_out,
                "Host cycle finished"
            );
            for diagnostic in &report.diagnostics {
                tracing::debug!(
                    host = %report.host_id,
                    connector = ?diagnostic.connector_id,
                    kind = %diagnostic.kind,
                    severity = %diagnostic.severity,
                    "{}",
                    diagnostic.message
                );
            }
        }
        engine.shutdown().await?;
        return Ok(());
    }

    engine.start().await?;
    tracing::info!("Press Ctrl+C to shutdown");
    shutdown_signal(engine).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop the engine.
async fn shutdown_signal(engine: Engine) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down engine...");
    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to shutdown engine: {}", e);
    }
}
