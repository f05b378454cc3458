//! PgScale server
//!
//! Distributed query cache and connection pool middleware for PostgreSQL.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use pgscale_common::config::{Config, DEFAULT_CONFIG_FILE, ENV_CONFIG_FILE};
use pgscale_server::{telemetry, ProxyServer};

#[derive(Parser, Debug)]
#[command(name = "pgscale-server")]
#[command(version)]
#[command(about = "Distributed query cache and connection pool middleware for PostgreSQL")]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        env = ENV_CONFIG_FILE,
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Log level override (defaults to the configured logging.level)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let log_level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    let json_logs = config.logging.json
        || std::env::var("JSON_LOGS")
            .map(|v| v == "true")
            .unwrap_or(false);
    telemetry::init(&log_level, json_logs)?;

    info!(pid = std::process::id(), config = %args.config.display(), "Starting pgscale-server");

    let server = Arc::new(ProxyServer::new(config));

    let run_server = server.clone();
    let mut run_handle = tokio::spawn(async move { run_server.run().await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Signal caught, draining connections (send again to quit immediately)");

            // A second signal during the drain forces an immediate exit.
            tokio::spawn(async {
                shutdown_signal().await;
                error!("Second signal caught, quitting with exit code 1");
                std::process::exit(1);
            });

            server.shutdown().await;
            (&mut run_handle).await??;
        }
        result = &mut run_handle => {
            // The listener stopped on its own; surface the failure.
            result??;
        }
    }

    info!("Quit");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
