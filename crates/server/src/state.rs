use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use fleetrun_core::domain::context::RequestContext;
use fleetrun_core::errors::EngineError;
use fleetrun_db::DbPool;
use fleetrun_engine::{Engine, WorkerPoolStatus};

pub const TENANT_HEADER: &str = "x-fleetrun-tenant";
pub const ACTOR_HEADER: &str = "x-fleetrun-actor";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub db_pool: DbPool,
    pub workers: Option<WorkerPoolStatus>,
}

/// Wire form of every failure: a stable class, a user-safe message, and the
/// execution id when one exists.
#[derive(Clone, Debug, Serialize)]
pub struct ApiErrorBody {
    pub error_class: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, error_class: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                error_class: error_class.to_string(),
                message: message.into(),
                execution_id: None,
            },
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", format!("{what} not found"))
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.body.execution_id = Some(execution_id.into());
        self
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
            EngineError::Permission { .. } | EngineError::TenantMismatch { .. } => {
                StatusCode::FORBIDDEN
            }
            EngineError::DuplicateIdempotencyKey { .. }
            | EngineError::ResourceBusy { .. }
            | EngineError::ApprovalRequired(_)
            | EngineError::ApprovalRejected { .. }
            | EngineError::Cancelled(_)
            | EngineError::IllegalStateTransition { .. } => StatusCode::CONFLICT,
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Adapter { .. } | EngineError::SecretResolution { .. } => {
                StatusCode::BAD_GATEWAY
            }
            EngineError::StoreUnavailable { .. } | EngineError::QueueFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let execution_id = match &error {
            EngineError::ApprovalRequired(id)
            | EngineError::Cancelled(id) => Some(id.0.clone()),
            EngineError::ApprovalRejected { execution_id, .. } => Some(execution_id.0.clone()),
            _ => None,
        };

        Self {
            status,
            body: ApiErrorBody {
                error_class: error.error_class().to_string(),
                message: error.user_message(),
                execution_id,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Caller identity from the gateway-authenticated headers. The engine never
/// trusts a body-supplied tenant.
pub fn request_context(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let tenant = header_value(headers, TENANT_HEADER)?;
    let actor = header_value(headers, ACTOR_HEADER)?;

    let mut ctx = RequestContext::new(tenant, actor);
    if let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    {
        ctx = ctx.with_correlation_id(request_id);
    }
    Ok(ctx)
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "ValidationError",
                format!("missing required header `{name}`"),
            )
        })
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue, StatusCode};

    use fleetrun_core::domain::execution::ExecutionId;
    use fleetrun_core::errors::EngineError;

    use super::{request_context, ApiError};

    #[test]
    fn context_requires_tenant_and_actor_headers() {
        let mut headers = HeaderMap::new();
        assert!(request_context(&headers).is_err());

        headers.insert("x-fleetrun-tenant", HeaderValue::from_static("t-1"));
        assert!(request_context(&headers).is_err());

        headers.insert("x-fleetrun-actor", HeaderValue::from_static("u-ops"));
        let ctx = request_context(&headers).expect("context");
        assert_eq!(ctx.tenant_id.0, "t-1");
        assert_eq!(ctx.actor_id.0, "u-ops");
    }

    #[test]
    fn request_id_header_becomes_the_correlation_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-fleetrun-tenant", HeaderValue::from_static("t-1"));
        headers.insert("x-fleetrun-actor", HeaderValue::from_static("u-ops"));
        headers.insert("x-request-id", HeaderValue::from_static("req-42"));

        let ctx = request_context(&headers).expect("context");
        assert_eq!(ctx.correlation_id, "req-42");
    }

    #[test]
    fn engine_errors_map_to_stable_statuses() {
        let cases = [
            (EngineError::Validation { message: "x".into() }, StatusCode::BAD_REQUEST),
            (EngineError::Permission { message: "x".into() }, StatusCode::FORBIDDEN),
            (
                EngineError::ResourceBusy { lock_key: "k".into(), owner: "o".into() },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::Timeout { scope: "step".into(), budget_ms: 1 },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                EngineError::StoreUnavailable { message: "x".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, status) in cases {
            let api_error = ApiError::from(error);
            assert_eq!(api_error.status, status);
        }
    }

    #[test]
    fn execution_bearing_errors_carry_the_id() {
        let error = ApiError::from(EngineError::Cancelled(ExecutionId("exec-9".into())));
        assert_eq!(error.body.execution_id.as_deref(), Some("exec-9"));
    }
}
