//! Executor core: runs the steps of one execution under the safety guards.
//!
//! Per step, in order: cancellation poll, budget check, secret resolution,
//! per-asset mutex, handler dispatch under a deadline, guaranteed mutex
//! release, durable outcome record, event append. Steps already succeeded on
//! a previous attempt are skipped, which is what makes queue redelivery
//! after a worker crash safe to resume.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::execution::{Execution, ExecutionId, ExecutionStatus};
use fleetrun_core::domain::lock::{AssetLock, LockKey};
use fleetrun_core::domain::policy::{default_matrix, TimeoutPolicy};
use fleetrun_core::domain::step::{Step, StepFamily, StepStatus};
use fleetrun_core::errors::{AdapterFamily, EngineError};
use fleetrun_core::plan::{FailurePolicy, Plan};
use fleetrun_core::secrets;
use fleetrun_db::repositories::{FinishRecord, RepositoryError};

use crate::adapters::SecretStore;
use crate::events::EventRecorder;
use crate::handlers::{HandlerRegistry, StepInvocation};
use crate::stores::{store_error, EngineStores};

/// Slack added to a mutex TTL beyond the step budget, so the lock outlives
/// the step it protects but not by much.
const LOCK_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub timed_out: bool,
    pub output: Option<serde_json::Value>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

pub struct ExecutorCore {
    stores: EngineStores,
    handlers: Arc<HandlerRegistry>,
    secrets: Arc<dyn SecretStore>,
    recorder: EventRecorder,
}

impl ExecutorCore {
    pub fn new(
        stores: EngineStores,
        handlers: Arc<HandlerRegistry>,
        secrets: Arc<dyn SecretStore>,
        recorder: EventRecorder,
    ) -> Self {
        Self { stores, handlers, secrets, recorder }
    }

    /// Run an execution that is already in `running` status.
    ///
    /// Returns `Ok` only when the execution reached a terminal state on its
    /// own terms: every step succeeded, a continue-policy plan ran to the
    /// end, the execution budget lapsed, or a cancellation token stopped it.
    /// A step failure under the halt policy returns `Err` with the failing
    /// step's error; the execution stays in `running` with its step state
    /// durable, and the caller owns disposition — the worker backs off or
    /// dead-letters, the router settles immediate submissions in place.
    pub async fn run(&self, execution: &Execution) -> Result<ExecutionOutcome, EngineError> {
        let policy = self.effective_policy(execution).await?;
        let execution_budget = Duration::from_millis(policy.execution_timeout_ms);
        let failure_policy = failure_policy_of(execution);

        let mut steps =
            self.stores.steps.list_for_execution(&execution.id).await.map_err(store_error)?;

        let started = tokio::time::Instant::now();
        let mut merged_output = serde_json::Map::new();
        let mut completed_steps = 0usize;
        let mut first_failure: Option<(String, String)> = None;
        let mut execution_timed_out = false;
        let mut cancellation = None;

        for step in steps.iter_mut() {
            match step.status {
                StepStatus::Succeeded => {
                    merge_output(&mut merged_output, step.output.as_ref());
                    completed_steps += 1;
                    continue;
                }
                StepStatus::Skipped => continue,
                // Pending, Failed (prior attempt), and stale Running all run.
                _ => {}
            }

            // Cancellation is polled between steps; an in-flight step always
            // finishes or times out on its own budget.
            if let Some(flag) = self
                .stores
                .cancellations
                .get(&execution.id, Utc::now())
                .await
                .map_err(store_error)?
            {
                cancellation = Some(flag);
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= execution_budget {
                execution_timed_out = true;
                first_failure.get_or_insert((
                    "TimeoutError".to_string(),
                    format!(
                        "execution exceeded its {}ms budget",
                        policy.execution_timeout_ms
                    ),
                ));
                break;
            }

            let step_deadline =
                Duration::from_millis(policy.step_timeout_ms).min(execution_budget - elapsed);

            match self.run_step(execution, step, step_deadline).await {
                Ok(output) => {
                    merge_output(&mut merged_output, Some(&output));
                    completed_steps += 1;
                }
                Err(error) => match failure_policy {
                    // The failed step is already durable; whether to back
                    // off, dead-letter, or settle is the caller's call.
                    FailurePolicy::Halt => return Err(error),
                    FailurePolicy::Continue => {
                        if first_failure.is_none() {
                            let message =
                                self.recorder.masker().mask_message(&error.to_string());
                            first_failure = Some((error.error_class().to_string(), message));
                        }
                        continue;
                    }
                },
            }
        }

        if let Some(flag) = cancellation {
            let cancelled_at = Utc::now();
            self.stores
                .executions
                .mark_cancelled(
                    &execution.id,
                    ExecutionStatus::Running,
                    &flag.requested_by,
                    cancelled_at,
                )
                .await
                .map_err(store_error)?;
            self.recorder
                .record_best_effort(
                    &execution.id,
                    EventKind::Cancelled,
                    EventSeverity::Info,
                    json!({ "cancelled_by": flag.requested_by, "reason": flag.reason }),
                )
                .await;
            return Ok(ExecutionOutcome {
                execution_id: execution.id.clone(),
                status: ExecutionStatus::Cancelled,
                timed_out: false,
                output: None,
                error_class: None,
                error_message: None,
            });
        }

        let status = if first_failure.is_none() {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        let (error_class, error_message) = match &first_failure {
            Some((class, message)) => (Some(class.clone()), Some(message.clone())),
            None => (None, None),
        };

        let mut output = merged_output;
        output.insert("completed_steps".to_string(), json!(completed_steps));
        let output = serde_json::Value::Object(output);

        let record = FinishRecord {
            status,
            timed_out: execution_timed_out,
            error_class: error_class.clone(),
            error_message: error_message.clone(),
            output: Some(output.clone()),
            ended_at: Utc::now(),
        };
        self.stores
            .executions
            .mark_finished(&execution.id, ExecutionStatus::Running, &record)
            .await
            .map_err(store_error)?;
        self.recorder
            .record_best_effort(
                &execution.id,
                EventKind::StatusChanged,
                EventSeverity::Info,
                json!({ "from": "running", "to": status.as_str(), "timed_out": execution_timed_out }),
            )
            .await;

        Ok(ExecutionOutcome {
            execution_id: execution.id.clone(),
            status,
            timed_out: execution_timed_out,
            output: Some(output),
            error_class,
            error_message,
        })
    }

    async fn effective_policy(&self, execution: &Execution) -> Result<TimeoutPolicy, EngineError> {
        if let Some(policy) = self
            .stores
            .policies
            .lookup(execution.sla_class, execution.action_class)
            .await
            .map_err(store_error)?
        {
            return Ok(policy);
        }
        // Unseeded installs fall back to the shipped matrix.
        default_matrix()
            .into_iter()
            .find(|cell| {
                cell.sla_class == execution.sla_class
                    && cell.action_class == execution.action_class
            })
            .ok_or_else(|| EngineError::StoreUnavailable {
                message: "timeout policy matrix is unavailable".to_string(),
            })
    }

    async fn run_step(
        &self,
        execution: &Execution,
        step: &mut Step,
        deadline: Duration,
    ) -> Result<serde_json::Value, EngineError> {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.ended_at = None;
        step.timed_out = false;
        step.attempts += 1;
        step.error_class = None;
        step.error_message = None;
        self.stores.steps.update(step).await.map_err(store_error)?;
        self.recorder
            .record_best_effort(
                &execution.id,
                EventKind::StepStarted,
                EventSeverity::Info,
                json!({
                    "ordinal": step.ordinal,
                    "step_type": step.step_type,
                    "target": step.target_ref,
                    "attempt": step.attempts,
                }),
            )
            .await;

        let result = self.invoke_guarded(execution, step, deadline).await;
        let ended_at = Utc::now();

        match result {
            Ok(output) => {
                let masked = self.recorder.masker().masked(&output);
                step.status = StepStatus::Succeeded;
                step.ended_at = Some(ended_at);
                step.output = Some(masked.clone());
                self.stores.steps.update(step).await.map_err(store_error)?;
                self.recorder
                    .record_best_effort(
                        &execution.id,
                        EventKind::StepCompleted,
                        EventSeverity::Info,
                        json!({ "ordinal": step.ordinal, "status": "succeeded" }),
                    )
                    .await;
                Ok(masked)
            }
            Err(error) => {
                if matches!(&error, EngineError::Timeout { .. }) {
                    step.timed_out = true;
                }
                let description = match self.handlers.get(step.family) {
                    Some(handler) => handler.describe_error(&error),
                    None => error.to_string(),
                };
                step.status = StepStatus::Failed;
                step.ended_at = Some(ended_at);
                step.error_class = Some(error.error_class().to_string());
                step.error_message =
                    Some(self.recorder.masker().mask_message(&description));
                self.stores.steps.update(step).await.map_err(store_error)?;
                self.recorder
                    .record_best_effort(
                        &execution.id,
                        EventKind::StepCompleted,
                        EventSeverity::Warning,
                        json!({
                            "ordinal": step.ordinal,
                            "status": "failed",
                            "error_class": error.error_class(),
                            "timed_out": step.timed_out,
                        }),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Secret resolution, mutex acquisition, handler dispatch under the
    /// deadline, and mutex release on every exit path.
    async fn invoke_guarded(
        &self,
        execution: &Execution,
        step: &Step,
        deadline: Duration,
    ) -> Result<serde_json::Value, EngineError> {
        let handler = self.handlers.get(step.family).ok_or_else(|| EngineError::Validation {
            message: format!("no handler registered for `{}` steps", step.family.as_str()),
        })?;

        // Secrets materialise just-in-time and live only for this call.
        let refs = secrets::collect_refs(&step.inputs).map_err(|error| {
            EngineError::SecretResolution { path: "<inputs>".to_string(), message: error.to_string() }
        })?;
        let mut fetched = BTreeMap::new();
        for path in &refs {
            let value = self.secrets.get(&execution.tenant_id, path).await?;
            self.recorder
                .record_best_effort(
                    &execution.id,
                    EventKind::SecretAccess,
                    EventSeverity::Info,
                    json!({ "path": path, "ordinal": step.ordinal }),
                )
                .await;
            fetched.insert(path.clone(), value);
        }
        let inputs = secrets::materialise(&step.inputs, &fetched).map_err(|error| {
            EngineError::SecretResolution { path: "<inputs>".to_string(), message: error.to_string() }
        })?;

        let lock_key = step.target_ref.as_deref().map(|target| {
            let action = step
                .action
                .clone()
                .unwrap_or_else(|| step.family.as_str().to_string());
            LockKey::new(&execution.tenant_id, target, &action)
        });

        if let Some(key) = &lock_key {
            let now = Utc::now();
            let ttl = deadline + LOCK_GRACE;
            let lock = AssetLock {
                lock_key: key.clone(),
                execution_id: execution.id.clone(),
                owner_tag: execution.id.0.clone(),
                acquired_at: now,
                expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            };
            match self.stores.locks.try_acquire(lock).await {
                Ok(()) => {}
                Err(RepositoryError::LockHeld { lock_key, owner }) => {
                    self.recorder
                        .record_best_effort(
                            &execution.id,
                            EventKind::MutexConflict,
                            EventSeverity::Warning,
                            json!({ "lock_key": lock_key, "owner": owner, "ordinal": step.ordinal }),
                        )
                        .await;
                    return Err(EngineError::ResourceBusy { lock_key, owner });
                }
                Err(error) => return Err(store_error(error)),
            }
        }

        let invocation = StepInvocation { execution, step, inputs, deadline };
        let invoked = tokio::time::timeout(deadline, handler.invoke(invocation)).await;

        // Release happens before any result inspection; a failed release is
        // logged and left to the reaper, never surfaced as the step outcome.
        if let Some(key) = &lock_key {
            if let Err(error) = self.stores.locks.release(key, &execution.id.0).await {
                tracing::warn!(
                    event_name = "engine.executor.lock_release_failed",
                    execution_id = %execution.id.0,
                    lock_key = key.as_str(),
                    error = %error,
                    "mutex release failed; the reaper will collect it"
                );
            }
        }

        let output = match invoked {
            Err(_) => {
                self.recorder
                    .record_best_effort(
                        &execution.id,
                        EventKind::Timeout,
                        EventSeverity::Warning,
                        json!({ "ordinal": step.ordinal, "budget_ms": deadline.as_millis() as u64 }),
                    )
                    .await;
                return Err(EngineError::Timeout {
                    scope: format!("step {}", step.ordinal),
                    budget_ms: deadline.as_millis() as u64,
                });
            }
            Ok(Err(error)) => return Err(error),
            Ok(Ok(output)) => output,
        };

        if handler.check_success(&output) {
            Ok(output.data)
        } else {
            Err(EngineError::Adapter {
                family: adapter_family_of(step.family),
                message: failure_summary(&output.data),
            })
        }
    }
}

fn failure_policy_of(execution: &Execution) -> FailurePolicy {
    Plan::from_value(&execution.plan_snapshot)
        .map(|plan| plan.failure_policy)
        .unwrap_or_default()
}

fn adapter_family_of(family: StepFamily) -> AdapterFamily {
    match family {
        StepFamily::Http => AdapterFamily::Http,
        StepFamily::Database => AdapterFamily::Database,
        StepFamily::AssetQuery | StepFamily::CredentialsRead => AdapterFamily::Asset,
        StepFamily::Command | StepFamily::FileTransfer | StepFamily::Validation => {
            AdapterFamily::Automation
        }
    }
}

fn failure_summary(data: &serde_json::Value) -> String {
    for key in ["stderr", "detail", "error", "status"] {
        if let Some(value) = data.get(key) {
            let text = match value {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                return format!("step reported failure: {text}");
            }
        }
    }
    "step reported failure".to_string()
}

fn merge_output(merged: &mut serde_json::Map<String, serde_json::Value>, output: Option<&serde_json::Value>) {
    if let Some(serde_json::Value::Object(map)) = output {
        for (key, value) in map {
            merged.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use fleetrun_core::domain::context::{ActorId, TenantId};
    use fleetrun_core::domain::event::EventKind;
    use fleetrun_core::domain::execution::{
        ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
    };
    use fleetrun_core::domain::lock::{AssetLock, LockKey};
    use fleetrun_core::domain::policy::TimeoutPolicy;
    use fleetrun_core::domain::step::{Step, StepId, StepStatus};
    use fleetrun_core::masking::{Masker, REDACTED};
    use fleetrun_core::plan::{Plan, PlanStep};
    use fleetrun_db::repositories::{CancellationFlag, InMemoryTimeoutPolicyRepository};

    use super::{ExecutorCore, ExecutionOutcome};
    use crate::adapters::{
        Asset, AssetOs, EngineAdapters, InMemoryAssetService, InMemoryAutomationService,
        InMemoryRbacDirectory, InMemorySecretStore,
    };
    use crate::events::EventRecorder;
    use crate::handlers::HandlerRegistry;
    use crate::observe::stream::EventStream;
    use crate::stores::EngineStores;

    struct Fixture {
        stores: EngineStores,
        executor: ExecutorCore,
        assets: Arc<InMemoryAssetService>,
        automation: Arc<InMemoryAutomationService>,
        secrets: Arc<InMemorySecretStore>,
        tenant: TenantId,
    }

    fn fixture_with_policy(policy: Option<TimeoutPolicy>) -> Fixture {
        let tenant = TenantId("t-1".to_string());
        let assets = Arc::new(InMemoryAssetService::with_assets(vec![
            Asset {
                id: "a-1".to_string(),
                hostname: "server-01".to_string(),
                os: AssetOs::Linux,
                tenant_id: tenant.clone(),
            },
            Asset {
                id: "a-2".to_string(),
                hostname: "server-02".to_string(),
                os: AssetOs::Windows,
                tenant_id: tenant.clone(),
            },
        ]));
        let automation = Arc::new(InMemoryAutomationService::default());
        let secrets = Arc::new(InMemorySecretStore::with_secrets(&[(
            "infra/ssh/key",
            "ssh-private-key-material",
        )]));

        let mut stores = EngineStores::in_memory();
        if let Some(policy) = policy {
            stores.policies = Arc::new(InMemoryTimeoutPolicyRepository::with_cells(vec![policy]));
        }

        let adapters = EngineAdapters {
            assets: assets.clone(),
            automation: automation.clone(),
            secrets: secrets.clone(),
            rbac: Arc::new(InMemoryRbacDirectory::default()),
        };
        let recorder = EventRecorder::new(
            stores.events.clone(),
            EventStream::default(),
            Arc::new(Masker::default()),
        );
        let executor = ExecutorCore::new(
            stores.clone(),
            Arc::new(HandlerRegistry::standard(&adapters)),
            secrets.clone(),
            recorder,
        );

        Fixture { stores, executor, assets, automation, secrets, tenant }
    }

    fn fixture() -> Fixture {
        fixture_with_policy(None)
    }

    async fn seed_execution(
        fixture: &Fixture,
        plan: &Plan,
        sla_class: SlaClass,
        action_class: ActionClass,
    ) -> Execution {
        let now = Utc::now();
        let execution = Execution {
            id: ExecutionId(Uuid::new_v4().to_string()),
            tenant_id: fixture.tenant.clone(),
            actor_id: ActorId("u-ops".to_string()),
            idempotency_key: Uuid::new_v4().to_string(),
            plan_snapshot: plan.to_snapshot(),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Immediate,
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
        fixture.stores.executions.create(execution.clone()).await.expect("create execution");

        let steps: Vec<Step> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(ordinal, plan_step)| Step {
                id: StepId(Uuid::new_v4().to_string()),
                execution_id: execution.id.clone(),
                ordinal: ordinal as u32,
                family: plan_step.family().expect("known family"),
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
            .collect();
        fixture.stores.steps.insert_all(&steps).await.expect("insert steps");

        execution
    }

    fn plan_step(step_type: &str, target: Option<&str>, inputs: serde_json::Value) -> PlanStep {
        PlanStep {
            name: None,
            step_type: step_type.to_string(),
            target: target.map(str::to_string),
            action: None,
            inputs,
            estimated_duration_ms: None,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: fleetrun_core::plan::FailurePolicy::Halt,
            steps,
        }
    }

    #[tokio::test]
    async fn single_query_step_succeeds_and_merges_output() {
        let fixture = fixture();
        let plan = plan(vec![plan_step("asset-query", None, json!({ "mode": "count" }))]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Fast, ActionClass::Information).await;

        let outcome = fixture.executor.run(&execution).await.expect("run");

        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        let output = outcome.output.expect("output");
        assert_eq!(output["total_count"], 2);
        assert_eq!(output["completed_steps"], 1);

        let stored =
            fixture.stores.executions.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
        assert!(stored.ended_at.is_some());

        let events =
            fixture.stores.events.list_for_execution(&execution.id, 0, 100).await.expect("events");
        let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
        assert!(kinds.contains(&EventKind::StepStarted));
        assert!(kinds.contains(&EventKind::StepCompleted));
        assert!(kinds.contains(&EventKind::StatusChanged));
    }

    #[tokio::test]
    async fn held_mutex_fails_fast_without_touching_the_asset() {
        let fixture = fixture();
        let plan = plan(vec![{
            let mut step =
                plan_step("command", Some("server-01"), json!({ "command": "reboot" }));
            step.action = Some("restart_service".to_string());
            step
        }]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Fast, ActionClass::Operational).await;

        // another execution already holds the asset for this action
        let key = LockKey::new(&fixture.tenant, "server-01", "restart_service");
        fixture
            .stores
            .locks
            .try_acquire(AssetLock {
                lock_key: key.clone(),
                execution_id: ExecutionId("exec-other".to_string()),
                owner_tag: "exec-other".to_string(),
                acquired_at: Utc::now(),
                expires_at: Utc::now() + ChronoDuration::seconds(60),
            })
            .await
            .expect("pre-acquire");

        let error = fixture.executor.run(&execution).await.expect_err("busy asset");
        assert_eq!(error.error_class(), "ResourceBusyError");
        assert!(error.to_string().contains("exec-other"));

        // the execution stays running; disposition belongs to the caller
        let stored =
            fixture.stores.executions.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Running);

        // the asset was never touched
        assert!(fixture.automation.recorded_commands().is_empty());

        // the conflict is observable as an event naming the owner
        let conflicts = fixture
            .stores
            .events
            .list_recent(Some(EventKind::MutexConflict), 10)
            .await
            .expect("events");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].payload["owner"], "exec-other");

        // and the holder's lock is untouched
        let held = fixture.stores.locks.find(&key).await.expect("find").expect("still held");
        assert_eq!(held.owner_tag, "exec-other");
    }

    #[tokio::test]
    async fn halting_step_failure_surfaces_and_leaves_execution_running() {
        let fixture = fixture();
        fixture.automation.fail_on("server-01");
        let plan = plan(vec![plan_step(
            "command",
            Some("server-01"),
            json!({ "command": "deploy.sh" }),
        )]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Medium, ActionClass::Operational).await;

        let error = fixture.executor.run(&execution).await.expect_err("failing step");
        assert_eq!(error.error_class(), "AdapterError");
        assert!(error.is_retryable());

        let stored =
            fixture.stores.executions.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Running);

        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].attempts, 1);

        // a redelivered attempt re-runs the failed step
        let error = fixture.executor.run(&execution).await.expect_err("still failing");
        assert_eq!(error.error_class(), "AdapterError");

        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert_eq!(steps[0].attempts, 2);
    }

    #[tokio::test]
    async fn cancellation_flag_stops_the_plan_between_steps() {
        let fixture = fixture();
        let plan = plan(vec![
            plan_step("asset-query", None, json!({ "mode": "count" })),
            plan_step("command", Some("server-01"), json!({ "command": "step-2" })),
            plan_step("command", Some("server-01"), json!({ "command": "step-3" })),
        ]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Medium, ActionClass::Operational).await;

        fixture
            .stores
            .cancellations
            .set(CancellationFlag {
                execution_id: execution.id.clone(),
                requested_by: "u-admin".to_string(),
                reason: Some("maintenance window closed".to_string()),
                requested_at: Utc::now(),
                expires_at: Utc::now() + ChronoDuration::hours(9),
            })
            .await
            .expect("set flag");

        let outcome = fixture.executor.run(&execution).await.expect("run");
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);

        let stored =
            fixture.stores.executions.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(stored.cancelled_by.as_deref(), Some("u-admin"));
        assert!(stored.cancelled_at.is_some());

        // no step ran, none left running, and no locks are held
        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert!(steps.iter().all(|step| step.status == StepStatus::Pending));
        assert!(fixture.automation.recorded_commands().is_empty());
    }

    #[tokio::test]
    async fn hanging_step_times_out_and_releases_its_lock() {
        let policy = TimeoutPolicy {
            sla_class: SlaClass::Fast,
            action_class: ActionClass::Operational,
            execution_timeout_ms: 2_000,
            step_timeout_ms: 100,
        };
        let fixture = fixture_with_policy(Some(policy));
        fixture.automation.hang_on("server-01");

        let plan = plan(vec![plan_step(
            "command",
            Some("server-01"),
            json!({ "command": "sleep forever" }),
        )]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Fast, ActionClass::Operational).await;

        let error = fixture.executor.run(&execution).await.expect_err("hanging step");
        assert_eq!(error.error_class(), "TimeoutError");

        // the step budget breach is recorded on the step, not the execution
        let stored =
            fixture.stores.executions.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Running);
        assert!(!stored.timed_out);

        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert!(steps[0].timed_out);
        assert_eq!(steps[0].status, StepStatus::Failed);

        let key = LockKey::new(&fixture.tenant, "server-01", "command");
        assert!(fixture.stores.locks.find(&key).await.expect("find").is_none());

        let timeouts = fixture
            .stores
            .events
            .list_recent(Some(EventKind::Timeout), 10)
            .await
            .expect("events");
        assert_eq!(timeouts.len(), 1);
    }

    #[tokio::test]
    async fn secrets_resolve_just_in_time_and_never_persist() {
        let fixture = fixture();
        let plan = plan(vec![plan_step(
            "command",
            Some("server-01"),
            json!({
                "command": "rsync deploy",
                "credentials": { "type": "secret", "path": "infra/ssh/key" }
            }),
        )]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Medium, ActionClass::Operational).await;

        let outcome = fixture.executor.run(&execution).await.expect("run");
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);

        // the secret reached the adapter
        let recorded = fixture.automation.recorded_commands();
        assert!(recorded[0].had_credentials);

        // access was audited by path
        assert_eq!(fixture.secrets.accessed_paths(), vec!["infra/ssh/key".to_string()]);
        let accesses = fixture
            .stores
            .events
            .list_recent(Some(EventKind::SecretAccess), 10)
            .await
            .expect("events");
        assert_eq!(accesses[0].payload["path"], "infra/ssh/key");

        // the raw value appears nowhere durable
        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        let step_json = serde_json::to_string(&steps).expect("serialise");
        assert!(!step_json.contains("ssh-private-key-material"));
        let events = fixture.stores.events.list_recent(None, 100).await.expect("events");
        let events_json = serde_json::to_string(&events).expect("serialise");
        assert!(!events_json.contains("ssh-private-key-material"));
    }

    #[tokio::test]
    async fn continue_policy_runs_remaining_steps_and_promotes_first_failure() {
        let fixture = fixture();
        fixture.automation.fail_on("server-01");

        let mut failing_plan = plan(vec![
            plan_step("command", Some("server-01"), json!({ "command": "will fail" })),
            plan_step("command", Some("server-02"), json!({ "command": "will pass" })),
        ]);
        failing_plan.failure_policy = fleetrun_core::plan::FailurePolicy::Continue;

        let execution =
            seed_execution(&fixture, &failing_plan, SlaClass::Medium, ActionClass::Operational)
                .await;

        let outcome = fixture.executor.run(&execution).await.expect("run");
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error_class.as_deref(), Some("AdapterError"));

        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[1].status, StepStatus::Succeeded);
        // winrm because server-02 is a windows asset
        assert_eq!(fixture.automation.recorded_commands()[1].connection_type, "winrm");
    }

    #[tokio::test]
    async fn resumed_execution_skips_already_succeeded_steps() {
        let fixture = fixture();
        let plan = plan(vec![
            plan_step("asset-query", None, json!({ "mode": "count" })),
            plan_step("command", Some("server-01"), json!({ "command": "finish" })),
        ]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Medium, ActionClass::Operational).await;

        // first step already completed on a previous attempt
        let mut steps =
            fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        steps[0].status = StepStatus::Succeeded;
        steps[0].started_at = Some(Utc::now() - ChronoDuration::seconds(30));
        steps[0].ended_at = Some(Utc::now() - ChronoDuration::seconds(29));
        steps[0].attempts = 1;
        steps[0].output = Some(json!({ "total_count": 2 }));
        fixture.stores.steps.update(&steps[0]).await.expect("update");

        let outcome = fixture.executor.run(&execution).await.expect("run");
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);

        // only the second step's command ran
        let recorded = fixture.automation.recorded_commands();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].command, "finish");

        // prior output still contributes to the merged payload
        assert_eq!(outcome.output.expect("output")["total_count"], 2);

        // asset service saw only the command-target lookup, not a re-query
        assert_eq!(fixture.assets.call_count(), 1);
    }

    #[tokio::test]
    async fn step_error_messages_are_masked_before_persistence() {
        let fixture = fixture();
        let plan = plan(vec![plan_step(
            "command",
            Some("server-01"),
            json!({
                "command": "login",
                "credentials": { "type": "secret", "path": "infra/missing" }
            }),
        )]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Medium, ActionClass::Operational).await;

        let error = fixture.executor.run(&execution).await.expect_err("unresolvable secret");
        assert_eq!(error.error_class(), "SecretResolutionError");
        assert!(!error.is_retryable());

        let steps = fixture.stores.steps.list_for_execution(&execution.id).await.expect("steps");
        assert_eq!(steps[0].status, StepStatus::Failed);
        let message = steps[0].error_message.clone().unwrap_or_default();
        assert!(message.contains("infra/missing") || message.contains(REDACTED));
    }

    #[tokio::test]
    async fn outcome_reports_the_execution_id_it_ran() {
        let fixture = fixture();
        let plan = plan(vec![plan_step("asset-query", None, json!({}))]);
        let execution =
            seed_execution(&fixture, &plan, SlaClass::Fast, ActionClass::Information).await;

        let ExecutionOutcome { execution_id, .. } =
            fixture.executor.run(&execution).await.expect("run");
        assert_eq!(execution_id, execution.id);
    }
}
