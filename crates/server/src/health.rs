use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub queue: HealthCheck,
    pub workers: HealthCheck,
    /// Running executions already past their execution budget.
    pub sla_violations: i64,
    pub checked_at: String,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state).await;
    let queue = queue_check(&state).await;
    let workers = worker_check(&state);

    let sla_violations = state.engine.metrics.sla_violations().await.unwrap_or(-1);

    let ready = database.status == "ready" && queue.status == "ready";
    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        queue,
        workers,
        sla_violations,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(state: &AppState) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn queue_check(state: &AppState) -> HealthCheck {
    match state.engine.stores.queue.depth(Utc::now()).await {
        Ok(depth) => HealthCheck { status: "ready", detail: format!("queue depth {depth}") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("queue query failed: {error}") }
        }
    }
}

fn worker_check(state: &AppState) -> HealthCheck {
    match &state.workers {
        Some(status) => {
            let active = status.active_workers();
            if active > 0 {
                HealthCheck { status: "ready", detail: format!("{active} workers active") }
            } else {
                HealthCheck { status: "degraded", detail: "no active workers".to_string() }
            }
        }
        None => HealthCheck {
            status: "ready",
            detail: "worker pool not managed by this process".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::Json;

    use fleetrun_core::audit::InMemoryAuditSink;
    use fleetrun_core::config::AppConfig;
    use fleetrun_db::connect_with_settings;
    use fleetrun_engine::adapters::{
        InMemoryAssetService, InMemoryAutomationService, InMemoryRbacDirectory,
        InMemorySecretStore,
    };
    use fleetrun_engine::{Engine, EngineAdapters, EngineStores};

    use super::health;
    use crate::state::AppState;

    async fn app_state() -> AppState {
        let adapters = EngineAdapters {
            assets: Arc::new(InMemoryAssetService::default()),
            automation: Arc::new(InMemoryAutomationService::default()),
            secrets: Arc::new(InMemorySecretStore::default()),
            rbac: Arc::new(InMemoryRbacDirectory::default()),
        };
        let engine = Engine::new(
            EngineStores::in_memory(),
            adapters,
            Arc::new(AppConfig::default().engine),
            Arc::new(InMemoryAuditSink::default()),
        );
        let db_pool =
            connect_with_settings("sqlite::memory:?cache=shared", 1, 5).await.expect("pool");
        AppState { engine: Arc::new(engine), db_pool, workers: None }
    }

    #[tokio::test]
    async fn health_is_ready_when_components_answer() {
        let state = app_state().await;
        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.queue.status, "ready");
        assert_eq!(payload.sla_violations, 0);
    }

    #[tokio::test]
    async fn health_degrades_when_the_database_is_gone() {
        let state = app_state().await;
        state.db_pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
    }
}
