use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetrun_core::domain::context::{ActorId, RequestContext};
use fleetrun_core::domain::event::ExecutionEvent;
use fleetrun_core::domain::execution::{Execution, ExecutionId, ExecutionStatus, SlaClass};
use fleetrun_core::domain::step::Step;
use fleetrun_db::repositories::ExecutionFilter;
use fleetrun_engine::store_error;

use crate::state::{request_context, ApiError, AppState};

const MAX_EVENT_WAIT_MS: u64 = 30_000;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/execute", post(execute))
        .route("/api/v1/executions", get(list_executions))
        .route("/api/v1/executions/{id}", get(get_execution))
        .route("/api/v1/executions/{id}/progress", get(get_progress))
        .route("/api/v1/executions/{id}/cancel", post(cancel_execution))
        .route("/api/v1/executions/{id}/approve", post(approve_execution))
        .route("/api/v1/executions/{id}/reject", post(reject_execution))
        .route("/api/v1/executions/{id}/events", get(list_events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub plan: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub status: &'static str,
    pub mode: &'static str,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

pub async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteBody>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let mut ctx = request_context(&headers)?;
    if let Some(key) = body.idempotency_key {
        ctx = ctx.with_idempotency_key(key);
    }

    let outcome = state.engine.router.execute(body.plan, ctx).await?;

    let status_code = match outcome.status {
        ExecutionStatus::Pending
        | ExecutionStatus::AwaitingApproval
        | ExecutionStatus::Approved
        | ExecutionStatus::Running => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };

    Ok((
        status_code,
        Json(ExecuteResponse {
            execution_id: outcome.execution_id.0,
            status: outcome.status.as_str(),
            mode: outcome.mode.as_str(),
            cache_hit: outcome.cache_hit,
            result: outcome.output,
            error_class: outcome.error_class,
            error_message: outcome.error_message,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub steps: Vec<Step>,
    pub events: Vec<ExecutionEvent>,
}

pub async fn get_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let ctx = request_context(&headers)?;
    let execution = load_tenant_scoped(&state, &ctx, &id).await?;

    let execution_id = ExecutionId(id);
    let steps = state
        .engine
        .stores
        .steps
        .list_for_execution(&execution_id)
        .await
        .map_err(store_error)?;
    let events = state
        .engine
        .stores
        .events
        .list_for_execution(&execution_id, 0, 500)
        .await
        .map_err(store_error)?;

    Ok(Json(ExecutionDetail { execution, steps, events }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub actor: Option<String>,
    pub sla_class: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Execution>>, ApiError> {
    let ctx = request_context(&headers)?;

    let status = query
        .status
        .as_deref()
        .map(|raw| {
            ExecutionStatus::parse(raw).ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "ValidationError",
                    format!("unknown status filter `{raw}`"),
                )
            })
        })
        .transpose()?;
    let sla_class = query
        .sla_class
        .as_deref()
        .map(|raw| {
            SlaClass::parse(raw).ok_or_else(|| {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "ValidationError",
                    format!("unknown sla_class filter `{raw}`"),
                )
            })
        })
        .transpose()?;

    let filter = ExecutionFilter {
        tenant_id: ctx.tenant_id,
        actor_id: query.actor.map(ActorId),
        status,
        sla_class,
        created_after: query.created_after,
        created_before: query.created_before,
        limit: query.limit.unwrap_or(100).clamp(1, 1_000),
    };

    let executions =
        state.engine.stores.executions.list(&filter).await.map_err(store_error)?;
    Ok(Json(executions))
}

pub async fn get_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<fleetrun_engine::ExecutionProgress>, ApiError> {
    let ctx = request_context(&headers)?;
    load_tenant_scoped(&state, &ctx, &id).await?;

    let progress = state.engine.progress.snapshot(&ExecutionId(id)).await?;
    Ok(Json(progress))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub status: &'static str,
    pub cancelled_by: String,
    pub cancelled_at: DateTime<Utc>,
    pub already_cancelled: bool,
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<CancelResponse>, ApiError> {
    let ctx = request_context(&headers)?;
    let outcome = state
        .engine
        .cancellations
        .request_cancel(&ExecutionId(id), &ctx, body.reason)
        .await?;

    Ok(Json(CancelResponse {
        execution_id: outcome.execution_id.0,
        status: outcome.status.as_str(),
        cancelled_by: outcome.cancelled_by,
        cancelled_at: outcome.cancelled_at,
        already_cancelled: outcome.already_cancelled,
    }))
}

pub async fn approve_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Execution>, ApiError> {
    let ctx = request_context(&headers)?;
    let execution = state.engine.approvals.approve(&ExecutionId(id), &ctx).await?;
    Ok(Json(execution))
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub reason: String,
}

pub async fn reject_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Execution>, ApiError> {
    let ctx = request_context(&headers)?;
    let execution =
        state.engine.approvals.reject(&ExecutionId(id), &ctx, body.reason).await?;
    Ok(Json(execution))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: i64,
    #[serde(default)]
    pub wait_ms: u64,
    pub limit: Option<u32>,
}

/// Incremental event feed with optional long-poll: when no event is newer
/// than the cursor, the request parks on the live stream up to `wait_ms`
/// before answering (possibly empty).
pub async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<ExecutionEvent>>, ApiError> {
    let ctx = request_context(&headers)?;
    load_tenant_scoped(&state, &ctx, &id).await?;

    let execution_id = ExecutionId(id);
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let events = state
        .engine
        .stores
        .events
        .list_for_execution(&execution_id, query.after, limit)
        .await
        .map_err(store_error)?;
    if !events.is_empty() || query.wait_ms == 0 {
        return Ok(Json(events));
    }

    let wait = Duration::from_millis(query.wait_ms.min(MAX_EVENT_WAIT_MS));
    let mut receiver = state.engine.stream.subscribe();
    let waited = tokio::time::timeout(wait, async {
        loop {
            match receiver.recv().await {
                Ok(event) if event.execution_id == execution_id && event.seq > query.after => {
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    let _ = waited;

    let events = state
        .engine
        .stores
        .events
        .list_for_execution(&execution_id, query.after, limit)
        .await
        .map_err(store_error)?;
    Ok(Json(events))
}

/// Fetch an execution visible to the caller's tenant; foreign executions are
/// indistinguishable from missing ones.
async fn load_tenant_scoped(
    state: &AppState,
    ctx: &RequestContext,
    id: &str,
) -> Result<Execution, ApiError> {
    let execution = state
        .engine
        .stores
        .executions
        .find_by_id(&ExecutionId(id.to_string()))
        .await
        .map_err(store_error)?;

    match execution {
        Some(execution) if execution.tenant_id == ctx.tenant_id => Ok(execution),
        _ => Err(ApiError::not_found("execution")),
    }
}
