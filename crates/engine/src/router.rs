//! Submission entry point.
//!
//! One pass, in order: shape validation, SLA and action classification,
//! dispatch mode, timeout policy, deduplication, permission checks, approval
//! gating, then the durable create and either a synchronous run or an
//! enqueue. Everything the rest of the engine needs later (classes, mode,
//! snapshot) is decided here exactly once.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use fleetrun_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use fleetrun_core::classify;
use fleetrun_core::config::EngineConfig;
use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
use fleetrun_core::domain::context::RequestContext;
use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::execution::{
    ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus,
};
use fleetrun_core::domain::queue::{QueueItem, QueueItemId};
use fleetrun_core::domain::step::{Step, StepId, StepStatus};
use fleetrun_core::errors::EngineError;
use fleetrun_core::idempotency;
use fleetrun_core::plan::Plan;
use fleetrun_core::rbac;
use fleetrun_db::repositories::FinishRecord;

use crate::adapters::RbacDirectory;
use crate::events::EventRecorder;
use crate::executor::ExecutorCore;
use crate::stores::{store_error, EngineStores};

#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteOutcome {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub cache_hit: bool,
    pub output: Option<serde_json::Value>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

impl ExecuteOutcome {
    fn from_existing(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id.clone(),
            status: execution.status,
            mode: execution.mode,
            cache_hit: true,
            output: execution.output.clone(),
            error_class: execution.error_class.clone(),
            error_message: execution.error_message.clone(),
        }
    }
}

pub struct Router {
    stores: EngineStores,
    executor: Arc<ExecutorCore>,
    rbac: Arc<dyn RbacDirectory>,
    recorder: EventRecorder,
    audit: Arc<dyn AuditSink>,
    config: Arc<EngineConfig>,
}

impl Router {
    pub fn new(
        stores: EngineStores,
        executor: Arc<ExecutorCore>,
        rbac: Arc<dyn RbacDirectory>,
        recorder: EventRecorder,
        audit: Arc<dyn AuditSink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { stores, executor, rbac, recorder, audit, config }
    }

    pub async fn execute(
        &self,
        plan_value: serde_json::Value,
        ctx: RequestContext,
    ) -> Result<ExecuteOutcome, EngineError> {
        // 1. shape
        let plan = Plan::from_value(&plan_value).map_err(|error| EngineError::Validation {
            message: format!("plan does not match the expected shape: {error}"),
        })?;
        if let Err(violations) = plan.validate() {
            let message = violations
                .iter()
                .map(|violation| violation.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::Validation { message });
        }

        // 2-4. classification and dispatch mode
        let sla_class = classify::sla_class(&plan);
        let action_class = classify::plan_action_class(&plan);
        let mode = classify::execution_mode(&plan, sla_class, self.config.immediate_budget_ms);

        // 5. the policy cell must exist before anything durable happens
        let policy_missing = self
            .stores
            .policies
            .lookup(sla_class, action_class)
            .await
            .map_err(store_error)?
            .is_none();
        if policy_missing {
            tracing::warn!(
                event_name = "engine.router.policy_fallback",
                sla_class = sla_class.as_str(),
                action_class = action_class.as_str(),
                "timeout policy cell not seeded; shipped defaults will apply"
            );
        }

        // 6. deduplication
        let snapshot = plan.to_snapshot();
        let idempotency_key = ctx.idempotency_key.clone().unwrap_or_else(|| {
            idempotency::derive_key(&snapshot, &ctx.tenant_id, &ctx.actor_id)
        });
        let window_start =
            Utc::now() - Duration::hours(self.config.dedup_window_hours as i64);
        if let Some(existing) = self
            .stores
            .executions
            .find_by_idempotency_key(&ctx.tenant_id, &idempotency_key, window_start)
            .await
            .map_err(store_error)?
        {
            // failed and cancelled runs free the key for a retry
            if !matches!(
                existing.status,
                ExecutionStatus::Failed | ExecutionStatus::Cancelled
            ) {
                self.audit_submission(&ctx, Some(&existing.id), "router.duplicate_returned");
                return Ok(ExecuteOutcome::from_existing(&existing));
            }
        }

        // 7. permissions, tenant first
        self.check_access(&plan, &ctx).await?;

        // 8. approval gate
        let requires_approval = classify::requires_approval(&plan, action_class);

        // 9. durable create + dispatch
        let now = Utc::now();
        let execution = Execution {
            id: ExecutionId(Uuid::new_v4().to_string()),
            tenant_id: ctx.tenant_id.clone(),
            actor_id: ctx.actor_id.clone(),
            idempotency_key: idempotency_key.clone(),
            plan_snapshot: snapshot,
            status: if requires_approval {
                ExecutionStatus::AwaitingApproval
            } else {
                ExecutionStatus::Pending
            },
            mode,
            sla_class,
            action_class,
            timed_out: false,
            cancelled_by: None,
            cancelled_at: None,
            ended_at: None,
            error_class: None,
            error_message: None,
            output: None,
            created_at: now,
            updated_at: now,
        };

        match self.stores.executions.create(execution.clone()).await {
            Ok(()) => {}
            Err(fleetrun_db::repositories::RepositoryError::DuplicateIdempotencyKey {
                ..
            }) => {
                // lost a submission race; the winner's row is the answer
                if let Some(existing) = self
                    .stores
                    .executions
                    .find_by_idempotency_key(&ctx.tenant_id, &idempotency_key, window_start)
                    .await
                    .map_err(store_error)?
                {
                    return Ok(ExecuteOutcome::from_existing(&existing));
                }
                return Err(EngineError::DuplicateIdempotencyKey {
                    tenant_id: ctx.tenant_id.0.clone(),
                    idempotency_key,
                });
            }
            Err(error) => return Err(store_error(error)),
        }

        let steps = steps_from_plan(&execution, &plan);
        self.stores.steps.insert_all(&steps).await.map_err(store_error)?;
        self.audit_submission(&ctx, Some(&execution.id), "router.accepted");

        if requires_approval {
            let approval = Approval {
                id: ApprovalId(Uuid::new_v4().to_string()),
                execution_id: execution.id.clone(),
                required_role: required_role(action_class).to_string(),
                state: ApprovalState::Pending,
                decided_by: None,
                decided_at: None,
                reason: None,
                created_at: now,
            };
            self.stores.approvals.create(approval.clone()).await.map_err(store_error)?;
            self.recorder
                .record_best_effort(
                    &execution.id,
                    EventKind::ApprovalRequested,
                    EventSeverity::Info,
                    json!({ "required_role": approval.required_role }),
                )
                .await;

            return Ok(ExecuteOutcome {
                execution_id: execution.id,
                status: ExecutionStatus::AwaitingApproval,
                mode,
                cache_hit: false,
                output: None,
                error_class: None,
                error_message: None,
            });
        }

        match mode {
            ExecutionMode::Immediate => {
                self.stores
                    .executions
                    .update_status(&execution.id, ExecutionStatus::Pending, ExecutionStatus::Running)
                    .await
                    .map_err(store_error)?;
                let mut running = execution;
                running.status = ExecutionStatus::Running;

                match self.executor.run(&running).await {
                    Ok(outcome) => Ok(ExecuteOutcome {
                        execution_id: outcome.execution_id,
                        status: outcome.status,
                        mode,
                        cache_hit: false,
                        output: outcome.output,
                        error_class: outcome.error_class,
                        error_message: outcome.error_message,
                    }),
                    // No queue behind an immediate submission, so a halted
                    // step failure settles here instead of at a worker.
                    Err(error) => {
                        let error_class = error.error_class().to_string();
                        let error_message =
                            self.recorder.masker().mask_message(&error.to_string());
                        self.stores
                            .executions
                            .mark_finished(
                                &running.id,
                                ExecutionStatus::Running,
                                &FinishRecord {
                                    status: ExecutionStatus::Failed,
                                    timed_out: false,
                                    error_class: Some(error_class.clone()),
                                    error_message: Some(error_message.clone()),
                                    output: None,
                                    ended_at: Utc::now(),
                                },
                            )
                            .await
                            .map_err(store_error)?;
                        self.recorder
                            .record_best_effort(
                                &running.id,
                                EventKind::StatusChanged,
                                EventSeverity::Info,
                                json!({
                                    "from": "running",
                                    "to": "failed",
                                    "error_class": error_class,
                                }),
                            )
                            .await;

                        Ok(ExecuteOutcome {
                            execution_id: running.id,
                            status: ExecutionStatus::Failed,
                            mode,
                            cache_hit: false,
                            output: None,
                            error_class: Some(error_class),
                            error_message: Some(error_message),
                        })
                    }
                }
            }
            ExecutionMode::Background => {
                let item = new_queue_item(&execution, &self.config);
                self.stores.queue.enqueue(item).await.map_err(store_error)?;
                self.recorder
                    .record_best_effort(
                        &execution.id,
                        EventKind::Enqueued,
                        EventSeverity::Info,
                        json!({
                            "sla_class": execution.sla_class.as_str(),
                            "priority": execution.sla_class.priority(),
                        }),
                    )
                    .await;

                Ok(ExecuteOutcome {
                    execution_id: execution.id,
                    status: ExecutionStatus::Pending,
                    mode,
                    cache_hit: false,
                    output: None,
                    error_class: None,
                    error_message: None,
                })
            }
        }
    }

    /// Tenant isolation first, then one directory check per distinct
    /// permission the plan needs.
    async fn check_access(&self, plan: &Plan, ctx: &RequestContext) -> Result<(), EngineError> {
        let user = self.rbac.get_user(&ctx.actor_id).await?;
        if let Err(denial) = rbac::check_tenant(&ctx.tenant_id, &user.tenant_id) {
            self.audit_rbac_violation(ctx, &denial.reason());
            return Err(EngineError::TenantMismatch {
                expected: ctx.tenant_id.0.clone(),
                actual: user.tenant_id.0.clone(),
            });
        }

        for permission in rbac::plan_permissions(plan) {
            let allowed = self
                .rbac
                .check_permission(&ctx.tenant_id, &ctx.actor_id, permission)
                .await?;
            if !allowed {
                let reason =
                    format!("actor lacks required permission `{}`", permission.as_str());
                self.audit_rbac_violation(ctx, &reason);
                return Err(EngineError::Permission { message: reason });
            }
        }
        Ok(())
    }

    fn audit_rbac_violation(&self, ctx: &RequestContext, reason: &str) {
        self.audit.emit(
            AuditEvent::new(
                None,
                Some(ctx.tenant_id.0.clone()),
                ctx.correlation_id.clone(),
                "rbac_violation",
                AuditCategory::Rbac,
                ctx.actor_id.0.clone(),
                AuditOutcome::Rejected,
            )
            .with_metadata("reason", reason)
            .with_metadata("severity", "critical"),
        );
    }

    fn audit_submission(
        &self,
        ctx: &RequestContext,
        execution_id: Option<&ExecutionId>,
        event_type: &str,
    ) {
        self.audit.emit(AuditEvent::new(
            execution_id.cloned(),
            Some(ctx.tenant_id.0.clone()),
            ctx.correlation_id.clone(),
            event_type,
            AuditCategory::Router,
            ctx.actor_id.0.clone(),
            AuditOutcome::Success,
        ));
    }
}

/// Approver role gating a plan of this risk class.
pub fn required_role(action_class: ActionClass) -> &'static str {
    match action_class {
        ActionClass::Provisioning => "provisioning-approver",
        _ => "operations-approver",
    }
}

pub(crate) fn new_queue_item(execution: &Execution, config: &EngineConfig) -> QueueItem {
    let now = Utc::now();
    QueueItem {
        id: QueueItemId(Uuid::new_v4().to_string()),
        execution_id: execution.id.clone(),
        tenant_id: execution.tenant_id.clone(),
        sla_class: execution.sla_class,
        priority: execution.sla_class.priority(),
        available_at: now,
        leased_by: None,
        lease_expires_at: None,
        attempts: 0,
        max_attempts: config.max_attempts_for(execution.sla_class),
        created_at: now,
    }
}

fn steps_from_plan(execution: &Execution, plan: &Plan) -> Vec<Step> {
    plan.steps
        .iter()
        .enumerate()
        .filter_map(|(ordinal, plan_step)| {
            plan_step.family().map(|family| Step {
                id: StepId(Uuid::new_v4().to_string()),
                execution_id: execution.id.clone(),
                ordinal: ordinal as u32,
                family,
                step_type: plan_step.step_type.clone(),
                target_ref: plan_step.target.clone(),
                action: plan_step.action.clone(),
                inputs: plan_step.inputs.clone(),
                status: StepStatus::Pending,
                started_at: None,
                ended_at: None,
                timed_out: false,
                attempts: 0,
                output: None,
                error_class: None,
                error_message: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use fleetrun_core::audit::InMemoryAuditSink;
    use fleetrun_core::config::AppConfig;
    use fleetrun_core::domain::context::{ActorId, RequestContext, TenantId};
    use fleetrun_core::domain::execution::{ExecutionMode, ExecutionStatus};
    use fleetrun_core::masking::Masker;
    use fleetrun_core::rbac::Permission;

    use super::Router;
    use crate::adapters::{
        Asset, AssetOs, DirectoryUser, EngineAdapters, InMemoryAssetService,
        InMemoryAutomationService, InMemoryRbacDirectory, InMemorySecretStore,
    };
    use crate::events::EventRecorder;
    use crate::executor::ExecutorCore;
    use crate::handlers::HandlerRegistry;
    use crate::observe::stream::EventStream;
    use crate::stores::EngineStores;

    struct Fixture {
        router: Router,
        stores: EngineStores,
        assets: Arc<InMemoryAssetService>,
        rbac: Arc<InMemoryRbacDirectory>,
        audit: InMemoryAuditSink,
        tenant: TenantId,
        actor: ActorId,
    }

    fn fixture() -> Fixture {
        let tenant = TenantId("t-1".to_string());
        let actor = ActorId("u-ops".to_string());

        let assets = Arc::new(InMemoryAssetService::with_assets(
            (1..=6)
                .map(|index| Asset {
                    id: format!("a-{index}"),
                    hostname: format!("server-{index:02}"),
                    os: AssetOs::Linux,
                    tenant_id: tenant.clone(),
                })
                .collect(),
        ));
        let rbac = Arc::new(InMemoryRbacDirectory::default());
        rbac.add_user(DirectoryUser {
            id: actor.0.clone(),
            tenant_id: tenant.clone(),
            roles: vec!["operator".to_string()],
        });
        rbac.grant(&tenant, &actor, Permission::AssetRead);
        rbac.grant(&tenant, &actor, Permission::AutomationExecute);
        rbac.grant(&tenant, &actor, Permission::AutomationDeploy);

        let stores = EngineStores::in_memory();
        let adapters = EngineAdapters {
            assets: assets.clone(),
            automation: Arc::new(InMemoryAutomationService::default()),
            secrets: Arc::new(InMemorySecretStore::default()),
            rbac: rbac.clone(),
        };
        let masker = Arc::new(Masker::default());
        let recorder =
            EventRecorder::new(stores.events.clone(), EventStream::default(), masker);
        let executor = Arc::new(ExecutorCore::new(
            stores.clone(),
            Arc::new(HandlerRegistry::standard(&adapters)),
            adapters.secrets.clone(),
            recorder.clone(),
        ));
        let audit = InMemoryAuditSink::default();
        let config = Arc::new(AppConfig::default().engine);

        let router = Router::new(
            stores.clone(),
            executor,
            rbac.clone(),
            recorder,
            Arc::new(audit.clone()),
            config,
        );

        Fixture { router, stores, assets, rbac, audit, tenant, actor }
    }

    fn ctx(fixture: &Fixture) -> RequestContext {
        RequestContext::new(fixture.tenant.0.clone(), fixture.actor.0.clone())
    }

    fn count_plan() -> serde_json::Value {
        json!({ "steps": [{ "type": "asset-query", "inputs": { "mode": "count" } }] })
    }

    #[tokio::test]
    async fn fast_query_runs_immediately_and_returns_the_result() {
        let fixture = fixture();

        let outcome = fixture
            .router
            .execute(count_plan(), ctx(&fixture).with_idempotency_key("K"))
            .await
            .expect("execute");

        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.mode, ExecutionMode::Immediate);
        assert!(!outcome.cache_hit);
        assert_eq!(outcome.output.expect("output")["total_count"], 6);
    }

    #[tokio::test]
    async fn duplicate_submission_returns_the_first_result_without_rerunning() {
        let fixture = fixture();

        let first = fixture
            .router
            .execute(count_plan(), ctx(&fixture).with_idempotency_key("K"))
            .await
            .expect("first");
        let calls_after_first = fixture.assets.call_count();

        let second = fixture
            .router
            .execute(count_plan(), ctx(&fixture).with_idempotency_key("K"))
            .await
            .expect("second");

        assert!(second.cache_hit);
        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.status, ExecutionStatus::Succeeded);
        assert_eq!(second.output.expect("output")["total_count"], 6);
        // the asset service was not called again
        assert_eq!(fixture.assets.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn derived_keys_deduplicate_identical_plans() {
        let fixture = fixture();

        let first = fixture.router.execute(count_plan(), ctx(&fixture)).await.expect("first");
        let second = fixture.router.execute(count_plan(), ctx(&fixture)).await.expect("second");

        assert!(second.cache_hit);
        assert_eq!(second.execution_id, first.execution_id);
    }

    #[tokio::test]
    async fn failed_execution_frees_the_key_for_retry() {
        let fixture = fixture();
        // unknown permission: revoke to force a pre-create failure first?
        // Simpler: submit a plan whose step fails, then resubmit.
        let failing = json!({
            "steps": [{
                "type": "command",
                "target": "server-99",
                "inputs": { "command": "x" },
                "estimated_duration_ms": 1000
            }]
        });

        let first = fixture
            .router
            .execute(failing.clone(), ctx(&fixture).with_idempotency_key("K"))
            .await
            .expect("first");
        assert_eq!(first.status, ExecutionStatus::Failed);

        let second = fixture
            .router
            .execute(failing, ctx(&fixture).with_idempotency_key("K"))
            .await
            .expect("second");
        assert!(!second.cache_hit);
        assert_ne!(second.execution_id, first.execution_id);
    }

    #[tokio::test]
    async fn malformed_and_invalid_plans_are_rejected() {
        let fixture = fixture();

        let error = fixture
            .router
            .execute(json!({ "steps": "not-a-list" }), ctx(&fixture))
            .await
            .expect_err("malformed");
        assert_eq!(error.error_class(), "ValidationError");

        let error = fixture
            .router
            .execute(json!({ "steps": [{ "type": "teleport" }] }), ctx(&fixture))
            .await
            .expect_err("unknown type");
        assert_eq!(error.error_class(), "ValidationError");
    }

    #[tokio::test]
    async fn missing_permission_is_denied_and_audited() {
        let fixture = fixture();
        fixture.rbac.revoke(&fixture.tenant, &fixture.actor, Permission::AutomationExecute);

        let plan = json!({
            "steps": [{ "type": "command", "target": "server-01", "inputs": { "command": "x" } }]
        });
        let error = fixture.router.execute(plan, ctx(&fixture)).await.expect_err("denied");
        assert_eq!(error.error_class(), "PermissionError");

        let audited = fixture.audit.events();
        assert!(audited.iter().any(|event| event.event_type == "rbac_violation"));
    }

    #[tokio::test]
    async fn foreign_tenant_actor_is_a_tenant_mismatch() {
        let fixture = fixture();
        let foreign_ctx = RequestContext::new("t-other", fixture.actor.0.clone());

        let error =
            fixture.router.execute(count_plan(), foreign_ctx).await.expect_err("mismatch");
        assert_eq!(error.error_class(), "TenantMismatch");
    }

    #[tokio::test]
    async fn provisioning_plans_wait_for_approval_and_never_enqueue() {
        let fixture = fixture();
        let plan = json!({
            "steps": [{
                "type": "command",
                "target": "server-01",
                "action": "deploy_agent",
                "inputs": { "command": "install.sh" }
            }]
        });

        let outcome = fixture.router.execute(plan, ctx(&fixture)).await.expect("execute");
        assert_eq!(outcome.status, ExecutionStatus::AwaitingApproval);

        let approval = fixture
            .stores
            .approvals
            .find_by_execution(&outcome.execution_id)
            .await
            .expect("find")
            .expect("approval row");
        assert_eq!(approval.required_role, "provisioning-approver");

        // nothing went on the queue
        assert_eq!(fixture.stores.queue.depth(chrono::Utc::now()).await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn slow_plans_enqueue_for_background_execution() {
        let fixture = fixture();
        let plan = json!({
            "steps": [
                { "type": "command", "target": "server-01", "inputs": { "command": "a" },
                  "estimated_duration_ms": 30000 },
                { "type": "command", "target": "server-02", "inputs": { "command": "b" },
                  "estimated_duration_ms": 30000 }
            ]
        });

        let outcome = fixture.router.execute(plan, ctx(&fixture)).await.expect("execute");
        assert_eq!(outcome.status, ExecutionStatus::Pending);
        assert_eq!(outcome.mode, ExecutionMode::Background);
        assert_eq!(fixture.stores.queue.depth(chrono::Utc::now()).await.expect("depth"), 1);

        let item = fixture
            .stores
            .queue
            .dequeue_with_lease("probe", 1_000, chrono::Utc::now())
            .await
            .expect("dequeue")
            .expect("item");
        assert_eq!(item.execution_id, outcome.execution_id);
        assert_eq!(item.max_attempts, 3);
    }
}
