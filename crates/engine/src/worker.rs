//! Queue workers.
//!
//! A worker leases one item at a time, revalidates permissions at lease
//! start, keeps the lease renewed while the executor runs, and settles the
//! item: ack on a terminal outcome, jittered backoff on a retryable
//! failure, dead-letter on anything non-retryable. A supervisor keeps the
//! configured number of workers alive and drains them on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use fleetrun_core::config::EngineConfig;
use fleetrun_core::domain::event::{EventKind, EventSeverity};
use fleetrun_core::domain::execution::{Execution, ExecutionStatus};
use fleetrun_core::domain::queue::{DlqItem, DlqItemId, QueueItem};
use fleetrun_core::errors::EngineError;
use fleetrun_core::plan::Plan;
use fleetrun_core::rbac::{check_tenant, plan_permissions};
use fleetrun_db::repositories::FinishRecord;

use crate::adapters::RbacDirectory;
use crate::events::EventRecorder;
use crate::executor::ExecutorCore;
use crate::stores::{store_error, EngineStores};

const IDLE_SLEEP_MIN: Duration = Duration::from_millis(200);
const IDLE_SLEEP_MAX: Duration = Duration::from_secs(5);
const BACKOFF_BASE_MS: u64 = 5_000;
const BACKOFF_CAP_MS: u64 = 300_000;

/// Everything a worker needs; cloned per worker by the pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub stores: EngineStores,
    pub executor: Arc<ExecutorCore>,
    pub rbac: Arc<dyn RbacDirectory>,
    pub recorder: EventRecorder,
    pub config: Arc<EngineConfig>,
}

pub struct Worker {
    pub id: String,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(id: impl Into<String>, deps: WorkerDeps) -> Self {
        Self { id: id.into(), deps }
    }

    /// Lease and process at most one item. Returns whether anything was
    /// there to do.
    pub async fn poll_once(&self) -> Result<bool, EngineError> {
        let now = Utc::now();
        let Some(item) = self
            .deps
            .stores
            .queue
            .dequeue_with_lease(&self.id, self.deps.config.lease_ms, now)
            .await
            .map_err(store_error)?
        else {
            return Ok(false);
        };

        self.deps
            .recorder
            .record_best_effort(
                &item.execution_id,
                EventKind::Leased,
                EventSeverity::Info,
                json!({ "worker": self.id, "attempts": item.attempts }),
            )
            .await;

        self.process(item).await?;
        Ok(true)
    }

    async fn process(&self, item: QueueItem) -> Result<(), EngineError> {
        let Some(execution) = self
            .deps
            .stores
            .executions
            .find_by_id(&item.execution_id)
            .await
            .map_err(store_error)?
        else {
            // orphaned item; nothing to run
            self.ack(&item).await;
            return Ok(());
        };

        if execution.status.is_terminal() {
            self.ack(&item).await;
            return Ok(());
        }

        // A cancel that landed while the item sat in the queue makes the
        // delivery a no-op.
        if self
            .deps
            .stores
            .cancellations
            .get(&execution.id, Utc::now())
            .await
            .map_err(store_error)?
            .is_some()
        {
            if matches!(
                execution.status,
                ExecutionStatus::Pending | ExecutionStatus::Approved
            ) {
                let flag = self
                    .deps
                    .stores
                    .cancellations
                    .get(&execution.id, Utc::now())
                    .await
                    .map_err(store_error)?;
                let cancelled_by =
                    flag.map(|flag| flag.requested_by).unwrap_or_else(|| "system".to_string());
                if self
                    .deps
                    .stores
                    .executions
                    .mark_cancelled(&execution.id, execution.status, &cancelled_by, Utc::now())
                    .await
                    .is_ok()
                {
                    self.deps
                        .recorder
                        .record_best_effort(
                            &execution.id,
                            EventKind::Cancelled,
                            EventSeverity::Info,
                            json!({ "cancelled_by": cancelled_by }),
                        )
                        .await;
                }
            }
            self.ack(&item).await;
            return Ok(());
        }

        // Permissions may have been revoked while the item was queued.
        if let Err(denial) = self.revalidate_access(&execution).await {
            return self.dead_letter_denied(&item, &execution, denial).await;
        }

        let renewal = self.spawn_lease_renewal(item.clone());

        let from = execution.status;
        if let Err(error) = self
            .deps
            .stores
            .executions
            .update_status(&execution.id, from, ExecutionStatus::Running)
            .await
        {
            renewal.abort();
            tracing::warn!(
                event_name = "engine.worker.start_transition_failed",
                worker = %self.id,
                execution_id = %execution.id.0,
                error = %error,
                "item no longer startable; acking"
            );
            self.ack(&item).await;
            return Ok(());
        }
        let mut running = execution.clone();
        running.status = ExecutionStatus::Running;

        let result = self.deps.executor.run(&running).await;
        renewal.abort();

        // Disposition: terminal outcomes ack; retryable failures back off
        // until the attempt budget runs out; everything else dead-letters.
        let attempts_remain = item.attempts + 1 < item.max_attempts;
        match result {
            Ok(_outcome) => {
                self.ack(&item).await;
                self.deps
                    .recorder
                    .record_best_effort(
                        &item.execution_id,
                        EventKind::Acked,
                        EventSeverity::Info,
                        json!({ "worker": self.id }),
                    )
                    .await;
                Ok(())
            }
            Err(error) if error.is_retryable() && attempts_remain => {
                let backoff = backoff_with_jitter(item.attempts);
                let next_available = Utc::now() + chrono::Duration::milliseconds(backoff as i64);
                match self
                    .deps
                    .stores
                    .queue
                    .nack_with_backoff(&item.id, &self.id, next_available)
                    .await
                {
                    Ok(attempts) => {
                        self.deps
                            .recorder
                            .record_best_effort(
                                &item.execution_id,
                                EventKind::Nacked,
                                EventSeverity::Warning,
                                json!({
                                    "worker": self.id,
                                    "attempts": attempts,
                                    "backoff_ms": backoff,
                                    "error_class": error.error_class(),
                                }),
                            )
                            .await;
                    }
                    Err(nack_error) => {
                        // lease lost (expired and reaped); the item is
                        // already back in the pool
                        tracing::warn!(
                            event_name = "engine.worker.nack_failed",
                            worker = %self.id,
                            execution_id = %item.execution_id.0,
                            error = %nack_error,
                            "backoff handoff failed"
                        );
                    }
                }
                Ok(())
            }
            Err(error) => self.dead_letter_failed(&item, &execution, error).await,
        }
    }

    async fn revalidate_access(&self, execution: &Execution) -> Result<(), EngineError> {
        let user = self.deps.rbac.get_user(&execution.actor_id).await?;
        if let Err(denial) = check_tenant(&execution.tenant_id, &user.tenant_id) {
            return Err(EngineError::TenantMismatch {
                expected: execution.tenant_id.0.clone(),
                actual: denial_actual(&denial),
            });
        }

        let plan =
            Plan::from_value(&execution.plan_snapshot).map_err(|error| EngineError::Validation {
                message: format!("stored plan snapshot does not deserialise: {error}"),
            })?;

        for permission in plan_permissions(&plan) {
            let allowed = self
                .deps
                .rbac
                .check_permission(&execution.tenant_id, &execution.actor_id, permission)
                .await?;
            if !allowed {
                return Err(EngineError::Permission {
                    message: format!(
                        "actor `{}` no longer holds `{}`",
                        execution.actor_id.0,
                        permission.as_str()
                    ),
                });
            }
        }
        Ok(())
    }

    async fn dead_letter_denied(
        &self,
        item: &QueueItem,
        execution: &Execution,
        error: EngineError,
    ) -> Result<(), EngineError> {
        self.deps
            .recorder
            .record_best_effort(
                &execution.id,
                EventKind::RbacViolation,
                EventSeverity::Critical,
                json!({
                    "operation": "worker_revalidation",
                    "error_class": error.error_class(),
                    "detail": error.to_string(),
                }),
            )
            .await;

        let record = FinishRecord {
            status: ExecutionStatus::Failed,
            timed_out: false,
            error_class: Some(error.error_class().to_string()),
            error_message: Some(error.user_message()),
            output: None,
            ended_at: Utc::now(),
        };
        if let Err(finish_error) = self
            .deps
            .stores
            .executions
            .mark_finished(&execution.id, execution.status, &record)
            .await
        {
            tracing::warn!(
                event_name = "engine.worker.denied_finish_failed",
                execution_id = %execution.id.0,
                error = %finish_error,
                "could not mark denied execution failed"
            );
        }

        self.move_to_dlq(item, execution, &error).await
    }

    /// Settle an execution whose attempt budget is spent or whose failure
    /// class is not retryable: mark it failed and park the item for human
    /// disposition.
    async fn dead_letter_failed(
        &self,
        item: &QueueItem,
        execution: &Execution,
        error: EngineError,
    ) -> Result<(), EngineError> {
        let record = FinishRecord {
            status: ExecutionStatus::Failed,
            timed_out: false,
            error_class: Some(error.error_class().to_string()),
            error_message: Some(self.deps.recorder.masker().mask_message(&error.to_string())),
            output: None,
            ended_at: Utc::now(),
        };
        if let Err(finish_error) = self
            .deps
            .stores
            .executions
            .mark_finished(&execution.id, ExecutionStatus::Running, &record)
            .await
        {
            // possible when the executor never reached `running`; the
            // dead-letter record still carries the failure
            tracing::warn!(
                event_name = "engine.worker.failed_finish_failed",
                execution_id = %execution.id.0,
                error = %finish_error,
                "could not mark exhausted execution failed"
            );
        }
        self.deps
            .recorder
            .record_best_effort(
                &execution.id,
                EventKind::StatusChanged,
                EventSeverity::Warning,
                json!({
                    "from": "running",
                    "to": "failed",
                    "error_class": error.error_class(),
                    "attempts": item.attempts + 1,
                }),
            )
            .await;

        self.move_to_dlq(item, execution, &error).await
    }

    async fn move_to_dlq(
        &self,
        item: &QueueItem,
        execution: &Execution,
        error: &EngineError,
    ) -> Result<(), EngineError> {
        self.deps
            .stores
            .dlq
            .insert(DlqItem {
                id: DlqItemId(Uuid::new_v4().to_string()),
                execution_id: item.execution_id.clone(),
                tenant_id: execution.tenant_id.clone(),
                failure_reason: self.deps.recorder.masker().mask_message(&error.to_string()),
                error_class: Some(error.error_class().to_string()),
                archived: false,
                created_at: Utc::now(),
            })
            .await
            .map_err(store_error)?;
        self.ack(item).await;
        self.deps
            .recorder
            .record_best_effort(
                &item.execution_id,
                EventKind::DeadLettered,
                EventSeverity::Warning,
                json!({ "worker": self.id, "error_class": error.error_class() }),
            )
            .await;
        Ok(())
    }

    async fn ack(&self, item: &QueueItem) {
        if let Err(error) = self.deps.stores.queue.ack(&item.id, &self.id).await {
            tracing::warn!(
                event_name = "engine.worker.ack_failed",
                worker = %self.id,
                queue_item = %item.id.0,
                error = %error,
                "queue ack failed; the reaper will recover the row"
            );
        }
    }

    fn spawn_lease_renewal(&self, item: QueueItem) -> tokio::task::JoinHandle<()> {
        let queue = self.deps.stores.queue.clone();
        let owner = self.id.clone();
        let renew_every = Duration::from_millis(self.deps.config.lease_renew_ms);
        let lease_ms = self.deps.config.lease_ms;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let new_expiry = Utc::now() + chrono::Duration::milliseconds(lease_ms as i64);
                if queue.renew_lease(&item.id, &owner, new_expiry).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Poll loop with bounded idle backoff, until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut idle = IDLE_SLEEP_MIN;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(true) => idle = IDLE_SLEEP_MIN,
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                    idle = (idle * 2).min(IDLE_SLEEP_MAX);
                }
                Err(error) => {
                    tracing::warn!(
                        event_name = "engine.worker.poll_failed",
                        worker = %self.id,
                        error = %error,
                        "queue poll failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        _ = shutdown.changed() => {}
                    }
                    idle = (idle * 2).min(IDLE_SLEEP_MAX);
                }
            }
        }
    }
}

fn denial_actual(denial: &fleetrun_core::rbac::AccessDenial) -> String {
    match denial {
        fleetrun_core::rbac::AccessDenial::TenantMismatch { actual, .. } => actual.clone(),
        fleetrun_core::rbac::AccessDenial::MissingPermission { .. } => String::new(),
    }
}

/// Exponential backoff with +/-20% jitter, capped.
pub fn backoff_with_jitter(attempts: u32) -> u64 {
    let exponential = BACKOFF_BASE_MS.saturating_mul(1u64 << attempts.min(16));
    let capped = exponential.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    (capped as f64 * jitter) as u64
}

pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

/// Cheap cloneable view of pool liveness, for health checks.
#[derive(Clone)]
pub struct WorkerPoolStatus {
    active: Arc<AtomicUsize>,
}

impl WorkerPoolStatus {
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl WorkerPoolHandle {
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> WorkerPoolStatus {
        WorkerPoolStatus { active: self.active.clone() }
    }

    /// Stop dequeuing, let in-flight work finish within the grace budget,
    /// then abort whatever remains (its leases expire and get reaped).
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.supervisor.await;
    }
}

pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(deps: WorkerDeps) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let worker_count = deps.config.worker_count.max(1);
        let grace = Duration::from_millis(deps.config.worker_shutdown_grace_ms);

        let supervisor_active = active.clone();
        let supervisor_rx = shutdown_rx.clone();
        let supervisor = tokio::spawn(async move {
            let mut join_set = JoinSet::new();
            for _ in 0..worker_count {
                spawn_worker(&mut join_set, deps.clone(), supervisor_rx.clone(), &supervisor_active);
            }

            let mut shutdown_watch = supervisor_rx.clone();
            loop {
                tokio::select! {
                    joined = join_set.join_next() => {
                        let Some(result) = joined else { break };
                        supervisor_active.fetch_sub(1, Ordering::SeqCst);
                        if *supervisor_rx.borrow() {
                            continue;
                        }
                        if let Err(join_error) = result {
                            tracing::warn!(
                                event_name = "engine.worker_pool.worker_crashed",
                                error = %join_error,
                                "worker crashed; restarting"
                            );
                        }
                        spawn_worker(
                            &mut join_set,
                            deps.clone(),
                            supervisor_rx.clone(),
                            &supervisor_active,
                        );
                    }
                    changed = shutdown_watch.changed() => {
                        if changed.is_err() || *shutdown_watch.borrow() {
                            break;
                        }
                    }
                }
            }

            // drain phase
            let deadline = tokio::time::sleep(grace);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        join_set.abort_all();
                        break;
                    }
                    joined = join_set.join_next() => {
                        match joined {
                            None => break,
                            Some(_) => {
                                supervisor_active.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
        });

        WorkerPoolHandle { shutdown: shutdown_tx, supervisor, active }
    }
}

fn spawn_worker(
    join_set: &mut JoinSet<()>,
    deps: WorkerDeps,
    shutdown: watch::Receiver<bool>,
    active: &Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::SeqCst);
    let id = format!("worker-{}", Uuid::new_v4());
    join_set.spawn(async move {
        let worker = Worker::new(id, deps);
        worker.run(shutdown).await;
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use fleetrun_core::config::AppConfig;
    use fleetrun_core::domain::context::{ActorId, TenantId};
    use fleetrun_core::domain::event::EventKind;
    use fleetrun_core::domain::execution::{
        ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
    };
    use fleetrun_core::domain::queue::{QueueItem, QueueItemId};
    use fleetrun_core::domain::step::{Step, StepId, StepStatus};
    use fleetrun_core::masking::Masker;
    use fleetrun_core::plan::{Plan, PlanStep};
    use fleetrun_core::rbac::Permission;
    use fleetrun_db::repositories::DlqFilter;

    use super::{backoff_with_jitter, Worker, WorkerDeps, WorkerPool};
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
        deps: WorkerDeps,
        rbac: Arc<InMemoryRbacDirectory>,
        automation: Arc<InMemoryAutomationService>,
        tenant: TenantId,
        actor: ActorId,
    }

    fn fixture() -> Fixture {
        let tenant = TenantId("t-1".to_string());
        let actor = ActorId("u-ops".to_string());

        let assets = Arc::new(InMemoryAssetService::with_assets(vec![Asset {
            id: "a-1".to_string(),
            hostname: "server-01".to_string(),
            os: AssetOs::Linux,
            tenant_id: tenant.clone(),
        }]));
        let automation = Arc::new(InMemoryAutomationService::default());
        let rbac = Arc::new(InMemoryRbacDirectory::default());
        rbac.add_user(DirectoryUser {
            id: actor.0.clone(),
            tenant_id: tenant.clone(),
            roles: vec!["operator".to_string()],
        });
        rbac.grant(&tenant, &actor, Permission::AssetRead);
        rbac.grant(&tenant, &actor, Permission::AutomationExecute);

        let stores = EngineStores::in_memory();
        let adapters = EngineAdapters {
            assets,
            automation: automation.clone(),
            secrets: Arc::new(InMemorySecretStore::default()),
            rbac: rbac.clone(),
        };
        let recorder = EventRecorder::new(
            stores.events.clone(),
            EventStream::default(),
            Arc::new(Masker::default()),
        );
        let executor = Arc::new(ExecutorCore::new(
            stores.clone(),
            Arc::new(HandlerRegistry::standard(&adapters)),
            adapters.secrets.clone(),
            recorder.clone(),
        ));

        let deps = WorkerDeps {
            stores,
            executor,
            rbac: rbac.clone(),
            recorder,
            config: Arc::new(AppConfig::default().engine),
        };

        Fixture { deps, rbac, automation, tenant, actor }
    }

    fn command_plan() -> Plan {
        Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: fleetrun_core::plan::FailurePolicy::Halt,
            steps: vec![PlanStep {
                name: None,
                step_type: "command".to_string(),
                target: Some("server-01".to_string()),
                action: Some("restart".to_string()),
                inputs: json!({ "command": "systemctl restart nginx" }),
                estimated_duration_ms: Some(1_000),
            }],
        }
    }

    async fn seed_background(fixture: &Fixture, max_attempts: u32, attempts: u32) -> ExecutionId {
        seed_background_with_plan(fixture, command_plan(), max_attempts, attempts).await
    }

    async fn seed_background_with_plan(
        fixture: &Fixture,
        plan: Plan,
        max_attempts: u32,
        attempts: u32,
    ) -> ExecutionId {
        let now = Utc::now();
        let id = ExecutionId(Uuid::new_v4().to_string());
        fixture
            .deps
            .stores
            .executions
            .create(Execution {
                id: id.clone(),
                tenant_id: fixture.tenant.clone(),
                actor_id: fixture.actor.clone(),
                idempotency_key: Uuid::new_v4().to_string(),
                plan_snapshot: plan.to_snapshot(),
                status: ExecutionStatus::Pending,
                mode: ExecutionMode::Background,
                sla_class: SlaClass::Medium,
                action_class: ActionClass::Operational,
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
            .expect("create execution");

        let steps: Vec<Step> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(ordinal, plan_step)| Step {
                id: StepId(Uuid::new_v4().to_string()),
                execution_id: id.clone(),
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
        fixture.deps.stores.steps.insert_all(&steps).await.expect("insert steps");

        fixture
            .deps
            .stores
            .queue
            .enqueue(QueueItem {
                id: QueueItemId(Uuid::new_v4().to_string()),
                execution_id: id.clone(),
                tenant_id: fixture.tenant.clone(),
                sla_class: SlaClass::Medium,
                priority: SlaClass::Medium.priority(),
                available_at: now,
                leased_by: None,
                lease_expires_at: None,
                attempts,
                max_attempts,
                created_at: now,
            })
            .await
            .expect("enqueue");

        id
    }

    #[tokio::test]
    async fn worker_runs_a_leased_item_to_success() {
        let fixture = fixture();
        let execution_id = seed_background(&fixture, 3, 0).await;
        let worker = Worker::new("worker-test", fixture.deps.clone());

        let worked = worker.poll_once().await.expect("poll");
        assert!(worked);

        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Succeeded);

        // the queue row is gone
        assert_eq!(fixture.deps.stores.queue.depth(Utc::now()).await.expect("depth"), 0);

        // nothing more to do
        assert!(!worker.poll_once().await.expect("poll"));
    }

    #[tokio::test]
    async fn revoked_permission_at_lease_start_dead_letters_the_item() {
        let fixture = fixture();
        let execution_id = seed_background(&fixture, 3, 0).await;

        // revoked after enqueue, before lease
        fixture.rbac.revoke(&fixture.tenant, &fixture.actor, Permission::AutomationExecute);

        let worker = Worker::new("worker-test", fixture.deps.clone());
        worker.poll_once().await.expect("poll");

        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error_class.as_deref(), Some("PermissionError"));

        // the adapter was never touched
        assert!(fixture.automation.recorded_commands().is_empty());

        // the violation is audited and the item dead-lettered
        let violations = fixture
            .deps
            .stores
            .events
            .list_recent(Some(EventKind::RbacViolation), 10)
            .await
            .expect("events");
        assert_eq!(violations.len(), 1);

        let dlq = fixture
            .deps
            .stores
            .dlq
            .query(&DlqFilter { tenant_id: None, include_archived: false, limit: 10 })
            .await
            .expect("dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].error_class.as_deref(), Some("PermissionError"));
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_with_incremented_attempts() {
        let fixture = fixture();
        fixture.automation.fail_on("server-01");
        let execution_id = seed_background(&fixture, 3, 0).await;

        let worker = Worker::new("worker-test", fixture.deps.clone());
        worker.poll_once().await.expect("poll");

        // execution left running for the next attempt
        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Running);

        // item back in the pool with a future availability
        let nacked = fixture
            .deps
            .stores
            .events
            .list_recent(Some(EventKind::Nacked), 10)
            .await
            .expect("events");
        assert_eq!(nacked.len(), 1);
        assert_eq!(nacked[0].payload["attempts"], 1);

        assert_eq!(fixture.deps.stores.queue.depth(Utc::now()).await.expect("depth"), 0);

        // attempts remain, so nothing is dead-lettered yet
        let dlq = fixture
            .deps
            .stores
            .dlq
            .query(&DlqFilter { tenant_id: None, include_archived: false, limit: 10 })
            .await
            .expect("dlq");
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn exhausted_attempts_settle_the_execution_and_dead_letter_the_item() {
        let fixture = fixture();
        fixture.automation.fail_on("server-01");
        // attempts already at max - 1: this delivery is the last one
        let execution_id = seed_background(&fixture, 3, 2).await;

        let worker = Worker::new("worker-test", fixture.deps.clone());
        worker.poll_once().await.expect("poll");

        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error_class.as_deref(), Some("AdapterError"));
        assert_eq!(fixture.deps.stores.queue.depth(Utc::now()).await.expect("depth"), 0);

        // exhaustion parks the work for human disposition
        let dlq = fixture
            .deps
            .stores
            .dlq
            .query(&DlqFilter { tenant_id: None, include_archived: false, limit: 10 })
            .await
            .expect("dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].execution_id, execution_id);
        assert_eq!(dlq[0].error_class.as_deref(), Some("AdapterError"));

        let dead_lettered = fixture
            .deps
            .stores
            .events
            .list_recent(Some(EventKind::DeadLettered), 10)
            .await
            .expect("events");
        assert_eq!(dead_lettered.len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_on_the_first_attempt() {
        let fixture = fixture();
        let mut plan = command_plan();
        // the fixture's secret store is empty, so resolution fails with a
        // non-retryable class
        plan.steps[0].inputs = json!({
            "command": "rotate-keys",
            "credentials": { "type": "secret", "path": "infra/unknown" }
        });
        let execution_id = seed_background_with_plan(&fixture, plan, 3, 0).await;

        let worker = Worker::new("worker-test", fixture.deps.clone());
        worker.poll_once().await.expect("poll");

        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error_class.as_deref(), Some("SecretResolutionError"));

        // no backoff for a failure retrying cannot fix
        assert_eq!(fixture.deps.stores.queue.depth(Utc::now()).await.expect("depth"), 0);
        let nacked = fixture
            .deps
            .stores
            .events
            .list_recent(Some(EventKind::Nacked), 10)
            .await
            .expect("events");
        assert!(nacked.is_empty());

        let dlq = fixture
            .deps
            .stores
            .dlq
            .query(&DlqFilter { tenant_id: None, include_archived: false, limit: 10 })
            .await
            .expect("dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].execution_id, execution_id);
        assert_eq!(dlq[0].error_class.as_deref(), Some("SecretResolutionError"));
    }

    #[tokio::test]
    async fn cancelled_flag_makes_the_delivery_a_no_op() {
        let fixture = fixture();
        let execution_id = seed_background(&fixture, 3, 0).await;

        fixture
            .deps
            .stores
            .cancellations
            .set(fleetrun_db::repositories::CancellationFlag {
                execution_id: execution_id.clone(),
                requested_by: "u-admin".to_string(),
                reason: None,
                requested_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::hours(9),
            })
            .await
            .expect("flag");

        let worker = Worker::new("worker-test", fixture.deps.clone());
        worker.poll_once().await.expect("poll");

        let stored = fixture
            .deps
            .stores
            .executions
            .find_by_id(&execution_id)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(stored.cancelled_by.as_deref(), Some("u-admin"));
        assert!(fixture.automation.recorded_commands().is_empty());
    }

    #[tokio::test]
    async fn pool_processes_work_and_shuts_down_gracefully() {
        let fixture = fixture();
        let execution_id = seed_background(&fixture, 3, 0).await;

        let handle = WorkerPool::spawn(fixture.deps.clone());

        // wait for the pool to drain the queue
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = fixture
                .deps
                .stores
                .executions
                .find_by_id(&execution_id)
                .await
                .expect("find")
                .expect("row");
            if stored.status == ExecutionStatus::Succeeded {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "pool never ran the item");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert!(handle.active_workers() > 0);
        handle.shutdown().await;
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter_and_cap() {
        let first = backoff_with_jitter(0);
        assert!((4_000..=6_000).contains(&first));

        let third = backoff_with_jitter(2);
        assert!((16_000..=24_000).contains(&third));

        let huge = backoff_with_jitter(20);
        assert!(huge <= 360_000);
    }
}
