//! Tessera server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use tessera_core::config::AppConfig;
use tessera_server::cleanup::{ChannelCleanupDispatcher, CleanupWorker, spawn_session_sweeper};
use tessera_server::{AppState, create_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tessera - a resumable chunked-upload server
#[derive(Parser, Debug)]
#[command(name = "tessera-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TESSERA_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(
            config_path = %path,
            "No config file found, using defaults and environment variables"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("TESSERA_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Tessera v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    tessera_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = tessera_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let stores = tessera_metadata::from_config(&config.metadata, config.session.backend)
        .await
        .context("failed to initialize metadata stores")?;
    tracing::info!(
        sessions = stores.sessions.backend_name(),
        "Metadata stores initialized"
    );

    let (dispatcher, cleanup_rx) = ChannelCleanupDispatcher::channel(config.cleanup.queue_capacity);
    let _cleanup_handle = CleanupWorker::new(
        storage.clone(),
        stores.sessions.clone(),
        &dispatcher,
        cleanup_rx,
        config.cleanup.clone(),
    )
    .spawn();
    let dispatcher = Arc::new(dispatcher);

    let _sweeper_handle = spawn_session_sweeper(
        stores.sessions.clone(),
        dispatcher.clone(),
        config.session.sweep_interval(),
    );

    let state = AppState::new(
        config.clone(),
        storage,
        stores.sessions,
        stores.ledger,
        dispatcher,
    );
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
