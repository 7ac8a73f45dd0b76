use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::queue::{DlqItem, DlqItemId, QueueItem, QueueItemId};
use fleetrun_db::repositories::DlqFilter;
use fleetrun_engine::{store_error, MetricsSnapshot};

use crate::state::{request_context, ApiError, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/dlq", get(list_dlq))
        .route("/api/v1/dlq/{id}/requeue", post(requeue_dlq))
        .route("/api/v1/dlq/{id}/archive", post(archive_dlq))
        .route("/api/v1/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub include_archived: bool,
    pub limit: Option<u32>,
}

pub async fn list_dlq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Vec<DlqItem>>, ApiError> {
    let ctx = request_context(&headers)?;

    let items = state
        .engine
        .stores
        .dlq
        .query(&DlqFilter {
            tenant_id: Some(ctx.tenant_id),
            include_archived: query.include_archived,
            limit: query.limit.unwrap_or(100).clamp(1, 1_000),
        })
        .await
        .map_err(store_error)?;
    Ok(Json(items))
}

/// Put dead work back on the queue with a fresh attempt budget. The
/// execution itself is reopened only if it was parked in `failed`.
pub async fn requeue_dlq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DlqItem>, ApiError> {
    let ctx = request_context(&headers)?;
    let dlq_id = DlqItemId(id);

    let item = state
        .engine
        .stores
        .dlq
        .find(&dlq_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found("dead-letter item"))?;
    if item.tenant_id != ctx.tenant_id {
        return Err(ApiError::not_found("dead-letter item"));
    }

    let execution = state
        .engine
        .stores
        .executions
        .find_by_id(&item.execution_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found("execution"))?;

    // Only executions still in flight can be redelivered; a terminal one
    // needs a fresh submission (its idempotency key is free once failed).
    if execution.status.is_terminal() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "IllegalStateTransition",
            "the underlying execution already finished; submit the plan again instead",
        )
        .with_execution(execution.id.0));
    }

    let now = Utc::now();
    let replacement = QueueItem {
        id: QueueItemId(Uuid::new_v4().to_string()),
        execution_id: execution.id.clone(),
        tenant_id: execution.tenant_id.clone(),
        sla_class: execution.sla_class,
        priority: execution.sla_class.priority(),
        available_at: now,
        leased_by: None,
        lease_expires_at: None,
        attempts: 0,
        max_attempts: state.engine.config().max_attempts_for(execution.sla_class),
        created_at: now,
    };

    state
        .engine
        .stores
        .dlq
        .requeue(&dlq_id, replacement)
        .await
        .map_err(store_error)?;

    state
        .engine
        .recorder
        .record_best_effort(
            &execution.id,
            EventKind::Requeued,
            EventSeverity::Info,
            serde_json::json!({ "requeued_by": ctx.actor_id.0, "dlq_item": dlq_id.0 }),
        )
        .await;

    let refreshed = state
        .engine
        .stores
        .dlq
        .find(&dlq_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found("dead-letter item"))?;
    Ok(Json(refreshed))
}

pub async fn archive_dlq(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ctx = request_context(&headers)?;
    let dlq_id = DlqItemId(id);

    let item = state
        .engine
        .stores
        .dlq
        .find(&dlq_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::not_found("dead-letter item"))?;
    if item.tenant_id != ctx.tenant_id {
        return Err(ApiError::not_found("dead-letter item"));
    }

    state.engine.stores.dlq.archive(&dlq_id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    request_context(&headers)?;
    let snapshot = state.engine.metrics.snapshot().await?;
    Ok(Json(snapshot))
}
