use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use fleetrun_core::audit::{AuditSink, MaskingAuditSink, TracingAuditSink};
use fleetrun_core::config::{AppConfig, ConfigError, LoadOptions};
use fleetrun_core::masking::Masker;
use fleetrun_db::{connect_with_settings, migrations, DbPool};
use fleetrun_engine::{Engine, EngineAdapters, EngineStores};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<Engine>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("timeout policy seeding failed: {0}")]
    Seed(String),
    #[error("upstream adapter construction failed: {0}")]
    Adapters(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting execution engine bootstrap"
    );
    let config = AppConfig::load(options)?;

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let stores = EngineStores::sql(db_pool.clone());
    let seeded = stores
        .policies
        .seed_defaults()
        .await
        .map_err(|error| BootstrapError::Seed(error.to_string()))?;
    if seeded > 0 {
        info!(
            event_name = "system.bootstrap.timeout_policies_seeded",
            correlation_id = "bootstrap",
            seeded,
            "timeout policy matrix seeded"
        );
    }

    let adapters = EngineAdapters::http(&config.upstream)
        .map_err(|error| BootstrapError::Adapters(error.to_string()))?;

    let masker = Arc::new(Masker::new(&config.engine.log_mask_patterns));
    let audit: Arc<dyn AuditSink> =
        Arc::new(MaskingAuditSink::new(TracingAuditSink, masker));

    let engine = Engine::new(
        stores,
        adapters,
        Arc::new(config.engine.clone()),
        audit,
    );

    info!(
        event_name = "system.bootstrap.engine_ready",
        correlation_id = "bootstrap",
        worker_count = config.engine.worker_count,
        "execution engine wired"
    );

    Ok(Application { config, db_pool, engine: Arc::new(engine) })
}
