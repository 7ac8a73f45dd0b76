//! Approval gate decisions.
//!
//! Approving dispatches the execution onto the queue; rejecting cancels it.
//! Deciding requires the gate's named role, checked against the directory at
//! decision time.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use fleetrun_core::config::EngineConfig;
use fleetrun_core::domain::approval::ApprovalState;
use fleetrun_core::domain::context::RequestContext;
use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::execution::{Execution, ExecutionId, ExecutionStatus};
use fleetrun_core::errors::EngineError;
use fleetrun_core::rbac::check_tenant;

use crate::adapters::RbacDirectory;
use crate::events::EventRecorder;
use crate::router::new_queue_item;
use crate::stores::{store_error, EngineStores};

pub struct ApprovalService {
    stores: EngineStores,
    rbac: Arc<dyn RbacDirectory>,
    recorder: EventRecorder,
    config: Arc<EngineConfig>,
}

impl ApprovalService {
    pub fn new(
        stores: EngineStores,
        rbac: Arc<dyn RbacDirectory>,
        recorder: EventRecorder,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { stores, rbac, recorder, config }
    }

    pub async fn approve(
        &self,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
    ) -> Result<Execution, EngineError> {
        let (execution, decider) = self.authorise_decision(execution_id, ctx).await?;
        let approval = self.pending_approval(execution_id).await?;

        self.stores
            .approvals
            .decide(&approval.id, ApprovalState::Approved, &decider, None, Utc::now())
            .await
            .map_err(store_error)?;
        self.stores
            .executions
            .update_status(
                execution_id,
                ExecutionStatus::AwaitingApproval,
                ExecutionStatus::Approved,
            )
            .await
            .map_err(store_error)?;
        self.recorder
            .record_best_effort(
                execution_id,
                EventKind::ApprovalDecided,
                EventSeverity::Info,
                json!({ "state": "approved", "decided_by": decider }),
            )
            .await;

        // Approved work always goes through the queue; the approver's HTTP
        // request is not the place to run a provisioning plan.
        let item = new_queue_item(&execution, &self.config);
        self.stores.queue.enqueue(item).await.map_err(store_error)?;
        self.recorder
            .record_best_effort(
                execution_id,
                EventKind::Enqueued,
                EventSeverity::Info,
                json!({ "sla_class": execution.sla_class.as_str() }),
            )
            .await;

        self.stores
            .executions
            .find_by_id(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::StoreUnavailable {
                message: "execution disappeared after approval".to_string(),
            })
    }

    pub async fn reject(
        &self,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
        reason: String,
    ) -> Result<Execution, EngineError> {
        let (_execution, decider) = self.authorise_decision(execution_id, ctx).await?;
        let approval = self.pending_approval(execution_id).await?;

        self.stores
            .approvals
            .decide(&approval.id, ApprovalState::Rejected, &decider, Some(&reason), Utc::now())
            .await
            .map_err(store_error)?;

        // Rejection cancels; the plan never ran, so `failed` would be wrong.
        let now = Utc::now();
        self.stores
            .executions
            .mark_cancelled(execution_id, ExecutionStatus::AwaitingApproval, &decider, now)
            .await
            .map_err(store_error)?;
        self.recorder
            .record_best_effort(
                execution_id,
                EventKind::ApprovalDecided,
                EventSeverity::Info,
                json!({ "state": "rejected", "decided_by": decider, "reason": reason }),
            )
            .await;
        self.recorder
            .record_best_effort(
                execution_id,
                EventKind::Cancelled,
                EventSeverity::Info,
                json!({ "cancelled_by": decider, "reason": reason }),
            )
            .await;

        self.stores
            .executions
            .find_by_id(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::StoreUnavailable {
                message: "execution disappeared after rejection".to_string(),
            })
    }

    async fn authorise_decision(
        &self,
        execution_id: &ExecutionId,
        ctx: &RequestContext,
    ) -> Result<(Execution, String), EngineError> {
        let execution = self
            .stores
            .executions
            .find_by_id(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::Validation {
                message: format!("execution `{}` not found", execution_id.0),
            })?;

        let user = self.rbac.get_user(&ctx.actor_id).await?;
        if let Err(denial) = check_tenant(&execution.tenant_id, &user.tenant_id) {
            self.recorder
                .record_best_effort(
                    execution_id,
                    EventKind::RbacViolation,
                    EventSeverity::Critical,
                    json!({ "operation": "approval_decision", "reason": denial.reason() }),
                )
                .await;
            return Err(EngineError::TenantMismatch {
                expected: execution.tenant_id.0.clone(),
                actual: user.tenant_id.0.clone(),
            });
        }

        let approval = self.pending_approval(execution_id).await?;
        if !user.roles.iter().any(|role| role == &approval.required_role) {
            let reason = format!(
                "approval decisions for this execution require role `{}`",
                approval.required_role
            );
            self.recorder
                .record_best_effort(
                    execution_id,
                    EventKind::RbacViolation,
                    EventSeverity::Critical,
                    json!({ "operation": "approval_decision", "reason": reason }),
                )
                .await;
            return Err(EngineError::Permission { message: reason });
        }

        Ok((execution, user.id))
    }

    async fn pending_approval(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<fleetrun_core::domain::approval::Approval, EngineError> {
        self.stores
            .approvals
            .find_by_execution(execution_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::Validation {
                message: format!("execution `{}` has no approval gate", execution_id.0),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use fleetrun_core::config::AppConfig;
    use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
    use fleetrun_core::domain::context::{ActorId, RequestContext, TenantId};
    use fleetrun_core::domain::execution::{
        ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
    };
    use fleetrun_core::masking::Masker;

    use super::ApprovalService;
    use crate::adapters::{DirectoryUser, InMemoryRbacDirectory};
    use crate::events::EventRecorder;
    use crate::observe::stream::EventStream;
    use crate::stores::EngineStores;

    struct Fixture {
        stores: EngineStores,
        service: ApprovalService,
        rbac: Arc<InMemoryRbacDirectory>,
    }

    fn fixture() -> Fixture {
        let stores = EngineStores::in_memory();
        let rbac = Arc::new(InMemoryRbacDirectory::default());
        let recorder = EventRecorder::new(
            stores.events.clone(),
            EventStream::default(),
            Arc::new(Masker::default()),
        );
        let service = ApprovalService::new(
            stores.clone(),
            rbac.clone(),
            recorder,
            Arc::new(AppConfig::default().engine),
        );
        Fixture { stores, service, rbac }
    }

    async fn seed_gated_execution(fixture: &Fixture) -> ExecutionId {
        let now = Utc::now();
        let id = ExecutionId(Uuid::new_v4().to_string());
        fixture
            .stores
            .executions
            .create(Execution {
                id: id.clone(),
                tenant_id: TenantId("t-1".to_string()),
                actor_id: ActorId("u-ops".to_string()),
                idempotency_key: Uuid::new_v4().to_string(),
                plan_snapshot: json!({ "steps": [] }),
                status: ExecutionStatus::AwaitingApproval,
                mode: ExecutionMode::Background,
                sla_class: SlaClass::Medium,
                action_class: ActionClass::Provisioning,
                timed_out: false,
                cancelled_by: None,
                cancelled_at: None,
                ended_at: None,
                error_class: None,
                error_message: None,
                output: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("create");

        fixture
            .stores
            .approvals
            .create(Approval {
                id: ApprovalId(Uuid::new_v4().to_string()),
                execution_id: id.clone(),
                required_role: "provisioning-approver".to_string(),
                state: ApprovalState::Pending,
                decided_by: None,
                decided_at: None,
                reason: None,
                created_at: now,
            })
            .await
            .expect("approval");

        id
    }

    fn approver(fixture: &Fixture) -> RequestContext {
        fixture.rbac.add_user(DirectoryUser {
            id: "u-approver".to_string(),
            tenant_id: TenantId("t-1".to_string()),
            roles: vec!["provisioning-approver".to_string()],
        });
        RequestContext::new("t-1", "u-approver")
    }

    #[tokio::test]
    async fn approval_dispatches_to_the_queue() {
        let fixture = fixture();
        let id = seed_gated_execution(&fixture).await;
        let ctx = approver(&fixture);

        let execution = fixture.service.approve(&id, &ctx).await.expect("approve");
        assert_eq!(execution.status, ExecutionStatus::Approved);

        let approval =
            fixture.stores.approvals.find_by_execution(&id).await.expect("find").expect("row");
        assert_eq!(approval.state, ApprovalState::Approved);
        assert_eq!(approval.decided_by.as_deref(), Some("u-approver"));

        assert_eq!(fixture.stores.queue.depth(Utc::now()).await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn rejection_cancels_rather_than_fails() {
        let fixture = fixture();
        let id = seed_gated_execution(&fixture).await;
        let ctx = approver(&fixture);

        let execution = fixture
            .service
            .reject(&id, &ctx, "change window closed".to_string())
            .await
            .expect("reject");

        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.cancelled_by.as_deref(), Some("u-approver"));
        assert!(execution.cancelled_at.is_some());

        // nothing was queued
        assert_eq!(fixture.stores.queue.depth(Utc::now()).await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn deciders_without_the_required_role_are_denied() {
        let fixture = fixture();
        let id = seed_gated_execution(&fixture).await;

        fixture.rbac.add_user(DirectoryUser {
            id: "u-operator".to_string(),
            tenant_id: TenantId("t-1".to_string()),
            roles: vec!["operator".to_string()],
        });
        let ctx = RequestContext::new("t-1", "u-operator");

        let error = fixture.service.approve(&id, &ctx).await.expect_err("denied");
        assert_eq!(error.error_class(), "PermissionError");

        let approval =
            fixture.stores.approvals.find_by_execution(&id).await.expect("find").expect("row");
        assert_eq!(approval.state, ApprovalState::Pending);
    }

    #[tokio::test]
    async fn double_decision_is_rejected() {
        let fixture = fixture();
        let id = seed_gated_execution(&fixture).await;
        let ctx = approver(&fixture);

        fixture.service.approve(&id, &ctx).await.expect("approve");
        let error = fixture
            .service
            .reject(&id, &ctx, "too late".to_string())
            .await
            .expect_err("already decided");
        assert_eq!(error.error_class(), "IllegalStateTransition");
    }
}
