//! storage-proxy: local HTTP key-value store with pluggable backends
//!
//! Serves the storage API on localhost and forwards every record to the
//! configured backend (local directory, S3 bucket, or Dropbox folder).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storage_proxy::config::DEFAULT_CONFIG_FILE;
use storage_proxy::{http, ConfigStore, StorageFacade};

#[derive(Parser, Debug)]
#[command(name = "storage-proxy")]
#[command(about = "Key-value storage proxy with local, S3, and Dropbox backends")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 5000, env = "STORAGE_PROXY_PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1", env = "STORAGE_PROXY_BIND")]
    bind: String,

    /// Path to the storage configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, env = "STORAGE_CONFIG_PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storage_proxy=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let store = ConfigStore::open(&cli.config)
        .with_context(|| format!("Failed to load storage configuration from {}", cli.config.display()))?;
    let facade = StorageFacade::start(Arc::new(store))
        .await
        .context("Failed to initialize storage")?;
    let facade = Arc::new(facade);

    let status = facade.status().await;
    tracing::info!(
        "Storage mode: {} (requested {}) at {}",
        status.active_mode,
        status.requested_mode,
        status.location
    );

    let app = http::router(facade);

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", cli.bind, cli.port))?;
    tracing::info!("Starting storage-proxy on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Storage proxy shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
