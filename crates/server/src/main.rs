mod admin;
mod api;
mod bootstrap;
mod health;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use fleetrun_core::config::{AppConfig, LoadOptions, LogFormat};
use fleetrun_core::masking::{Masker, MaskingWriter};
use fleetrun_engine::{WorkerPool, WorkerPoolHandle};

use crate::state::AppState;

/// The masking writer sits between the subscriber and stdout, so every line
/// that leaves the process has the denylist applied regardless of what a
/// call site formatted.
fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let masker = Arc::new(Masker::new(&config.engine.log_mask_patterns));
    let make_writer = move || MaskingWriter::new(std::io::stdout(), masker.clone());

    match config.logging.format {
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(log_level)
                .with_writer(make_writer)
                .compact()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(log_level)
                .with_writer(make_writer)
                .pretty()
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(log_level)
                .with_writer(make_writer)
                .json()
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config early for logging setup
    let config = AppConfig::load(LoadOptions::default()).unwrap_or_else(|_| AppConfig::default());
    init_logging(&config);

    let app = bootstrap::bootstrap(LoadOptions::default()).await?;

    // background machinery: worker pool + reaper
    let pool_handle: WorkerPoolHandle = WorkerPool::spawn(app.engine.worker_deps());
    let (reaper_shutdown_tx, reaper_shutdown_rx) = watch::channel(false);
    let reaper_handle = app.engine.reaper().spawn(reaper_shutdown_rx);

    let state = AppState {
        engine: app.engine.clone(),
        db_pool: app.db_pool.clone(),
        workers: Some(pool_handle.status()),
    };

    let router = api::router(state.clone())
        .merge(admin::router(state.clone()))
        .merge(health::router(state));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        workers = app.config.engine.worker_count,
        "execution engine server started"
    );

    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(
                event_name = "system.server.error",
                correlation_id = "bootstrap",
                error = %error,
                "http server terminated unexpectedly"
            );
        }
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "execution engine server stopping"
    );

    // stop intake, drain workers within the grace budget, stop the reaper
    server.abort();
    pool_handle.shutdown().await;
    let _ = reaper_shutdown_tx.send(true);
    let _ = reaper_handle.await;
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
