//! Cooperative cancellation.
//!
//! A cancel request sets a durable token; running executions observe it
//! between steps, everything not yet running is cancelled on the spot.
//! Repeating a cancel is a no-op that returns the original requester and
//! timestamp.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use fleetrun_core::domain::context::RequestContext;
use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::execution::{ExecutionId, ExecutionStatus};
use fleetrun_core::errors::EngineError;
use fleetrun_core::rbac::check_tenant;
use fleetrun_db::repositories::CancellationFlag;

use crate::events::EventRecorder;
use crate::stores::{store_error, EngineStores};

#[derive(Clone, Debug, PartialEq)]
pub struct CancelOutcome {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub cancelled_by: String,
    pub cancelled_at: DateTime<Utc>,
    pub already_cancelled: bool,
}

pub struct CancellationService {
    stores: EngineStores,
    recorder: EventRecorder,
    token_ttl: Duration,
}

impl CancellationService {
    pub fn new(stores: EngineStores, recorder: EventRecorder, token_ttl_secs: u64) -> Self {
        Self { stores, recorder, token_ttl: Duration::seconds(token_ttl_secs as i64) }
    }

    pub async fn request_cancel(
        &self,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let execution = self
            .stores
            .executions
            .find_by_id(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::Validation {
                message: format!("execution `{}` not found", execution_id.0),
            })?;

        if let Err(denial) = check_tenant(&execution.tenant_id, &ctx.tenant_id) {
            self.recorder
                .record_best_effort(
                    execution_id,
                    EventKind::RbacViolation,
                    EventSeverity::Critical,
                    json!({ "operation": "cancel", "reason": denial.reason() }),
                )
                .await;
            return Err(EngineError::TenantMismatch {
                expected: execution.tenant_id.0,
                actual: ctx.tenant_id.0.clone(),
            });
        }

        match execution.status {
            ExecutionStatus::Cancelled => Ok(CancelOutcome {
                execution_id: execution_id.clone(),
                status: ExecutionStatus::Cancelled,
                cancelled_by: execution.cancelled_by.unwrap_or_default(),
                cancelled_at: execution.cancelled_at.unwrap_or(execution.updated_at),
                already_cancelled: true,
            }),
            ExecutionStatus::Succeeded | ExecutionStatus::Failed => {
                Err(EngineError::IllegalStateTransition {
                    from: execution.status.as_str().to_string(),
                    to: ExecutionStatus::Cancelled.as_str().to_string(),
                })
            }
            ExecutionStatus::Running => {
                let now = Utc::now();
                self.set_flag(execution_id, ctx, reason.clone(), now).await?;
                self.recorder
                    .record_best_effort(
                        execution_id,
                        EventKind::CancellationRequested,
                        EventSeverity::Info,
                        json!({ "requested_by": ctx.actor_id.0, "reason": reason }),
                    )
                    .await;

                // First writer wins: report whoever actually holds the token.
                let flag = self
                    .stores
                    .cancellations
                    .get(execution_id, now)
                    .await
                    .map_err(store_error)?;
                let (cancelled_by, cancelled_at) = match flag {
                    Some(flag) => (flag.requested_by, flag.requested_at),
                    None => (ctx.actor_id.0.clone(), now),
                };

                Ok(CancelOutcome {
                    execution_id: execution_id.clone(),
                    status: ExecutionStatus::Running,
                    cancelled_by,
                    cancelled_at,
                    already_cancelled: false,
                })
            }
            ExecutionStatus::Pending
            | ExecutionStatus::AwaitingApproval
            | ExecutionStatus::Approved => {
                let now = Utc::now();
                // The flag makes any queued delivery a no-op for workers.
                self.set_flag(execution_id, ctx, reason.clone(), now).await?;
                self.stores
                    .executions
                    .mark_cancelled(execution_id, execution.status, &ctx.actor_id.0, now)
                    .await
                    .map_err(store_error)?;
                self.recorder
                    .record_best_effort(
                        execution_id,
                        EventKind::Cancelled,
                        EventSeverity::Info,
                        json!({ "cancelled_by": ctx.actor_id.0, "reason": reason }),
                    )
                    .await;

                Ok(CancelOutcome {
                    execution_id: execution_id.clone(),
                    status: ExecutionStatus::Cancelled,
                    cancelled_by: ctx.actor_id.0.clone(),
                    cancelled_at: now,
                    already_cancelled: false,
                })
            }
        }
    }

    async fn set_flag(
        &self,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.stores
            .cancellations
            .set(CancellationFlag {
                execution_id: execution_id.clone(),
                requested_by: ctx.actor_id.0.clone(),
                reason,
                requested_at: now,
                expires_at: now + self.token_ttl,
            })
            .await
            .map_err(store_error)
    }
}
