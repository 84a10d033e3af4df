//! Rallypoint server binary
//!
//! Boots the delivery and jobs engine: loads configuration, connects
//! the database, starts every dispatcher, and serves the admin/metrics
//! HTTP surface until shutdown.

use std::sync::Arc;

use anyhow::Context;

use rallypoint::config::AppConfig;
use rallypoint::service::{DbNotifier, LogMailer};
use rallypoint::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);
    rallypoint::metrics::init_metrics();

    tracing::info!(
        domain = %config.server.domain,
        database = %config.database.path.display(),
        "Starting rallypoint"
    );

    let state = AppState::new(config).await.context("failed to initialize")?;

    let notifier = Arc::new(DbNotifier::new(state.db.clone()));
    let mailer = Arc::new(LogMailer);
    let dispatchers = state.build_dispatchers(notifier, mailer);
    dispatchers.start_all();

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Listening");

    let shutdown_timeout = state.config.jobs.shutdown_timeout();
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let in-flight job batches finish before exiting.
    tracing::info!("Shutting down dispatchers");
    dispatchers.shutdown(shutdown_timeout).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
