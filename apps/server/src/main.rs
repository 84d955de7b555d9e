//! Trunkline Server - standalone headless scanner ingest server.
//!
//! Binds the decoder-facing ingest sockets, the subscriber WebSocket, and
//! the persistence store, then runs until SIGINT/SIGTERM. Exit codes:
//! 0 on clean shutdown, 1 on startup failure.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use trunkline_core::{bootstrap_services, start_server};

use crate::config::ServerConfig;

/// Trunkline Server - headless scanner ingest and fan-out server.
#[derive(Parser, Debug)]
#[command(name = "trunkline-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TRUNKLINE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// HTTP/WebSocket port (overrides config file).
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Bind address (overrides config file).
    #[arg(long)]
    host: Option<String>,

    /// SQLite database path (overrides config file).
    #[arg(short = 'd', long)]
    db_path: Option<PathBuf>,

    /// Recordings intake directory (overrides config file).
    #[arg(long)]
    audio_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Trunkline Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration: YAML file, then environment, then CLI flags.
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(audio_dir) = args.audio_dir {
        config.audio_dir = audio_dir;
    }

    let core_config = config.to_core_config();
    log::info!(
        "Configuration: http={}:{}, status={}, audio_udp={}, fft_udp={}, db={}",
        core_config.host,
        core_config.http_port,
        core_config.status_port,
        core_config.audio_port,
        core_config.fft_port,
        core_config.db_path.display()
    );

    // Bootstrap binds every ingest socket; failures here are fatal.
    let services = bootstrap_services(&core_config)
        .await
        .context("Failed to bootstrap services")?;
    services.start_background_tasks();

    let addr: std::net::SocketAddr = format!("{}:{}", core_config.host, core_config.http_port)
        .parse()
        .context("Invalid HTTP bind address")?;
    let app_state = services.app_state();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state, addr).await {
            log::error!("Server error: {}", e);
            // The subscriber socket is a required surface.
            std::process::exit(1);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
