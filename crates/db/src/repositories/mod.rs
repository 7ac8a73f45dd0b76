use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
use fleetrun_core::domain::context::{ActorId, TenantId};
use fleetrun_core::domain::event::{EventKind, EventSeverity, ExecutionEvent};
use fleetrun_core::domain::execution::{
    ActionClass, Execution, ExecutionId, ExecutionStatus, SlaClass,
};
use fleetrun_core::domain::lock::{AssetLock, LockKey};
use fleetrun_core::domain::policy::TimeoutPolicy;
use fleetrun_core::domain::queue::{DlqItem, DlqItemId, QueueItem, QueueItemId};
use fleetrun_core::domain::step::{Step, StepFamily};

pub mod approval;
mod codec;
pub mod event;
pub mod execution;
pub mod lock;
pub mod memory;
pub mod policy;
pub mod queue;

pub use approval::SqlApprovalRepository;
pub use event::{SqlCancellationRepository, SqlEventRepository};
pub use execution::{SqlExecutionRepository, SqlStepRepository};
pub use lock::SqlLockRepository;
pub use memory::{
    InMemoryApprovalRepository, InMemoryCancellationRepository, InMemoryDlqRepository,
    InMemoryEventRepository, InMemoryExecutionRepository, InMemoryLockRepository,
    InMemoryQueueRepository, InMemoryStepRepository, InMemoryTimeoutPolicyRepository,
};
pub use policy::SqlTimeoutPolicyRepository;
pub use queue::{SqlDlqRepository, SqlQueueRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("execution already exists for tenant `{tenant_id}` and key `{idempotency_key}`")]
    DuplicateIdempotencyKey { tenant_id: String, idempotency_key: String },
    #[error("illegal {entity} transition from `{from}` to `{to}`")]
    IllegalTransition { entity: &'static str, from: String, to: String },
    #[error("lock `{lock_key}` is held by `{owner}`")]
    LockHeld { lock_key: String, owner: String },
    #[error("`{owner_tag}` does not hold `{lock_key}`")]
    NotOwner { lock_key: String, owner_tag: String },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
}

/// Filter for the execution listing surface. Everything is optional except
/// the tenant; cross-tenant listing is not a thing this layer offers.
#[derive(Clone, Debug)]
pub struct ExecutionFilter {
    pub tenant_id: TenantId,
    pub actor_id: Option<ActorId>,
    pub status: Option<ExecutionStatus>,
    pub sla_class: Option<SlaClass>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl ExecutionFilter {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            actor_id: None,
            status: None,
            sla_class: None,
            created_after: None,
            created_before: None,
            limit: 100,
        }
    }
}

/// Terminal write applied when an execution finishes for any reason.
#[derive(Clone, Debug)]
pub struct FinishRecord {
    pub status: ExecutionStatus,
    pub timed_out: bool,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub output: Option<serde_json::Value>,
    pub ended_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Fails with `DuplicateIdempotencyKey` when `(tenant_id, idempotency_key)`
    /// already exists.
    async fn create(&self, execution: Execution) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError>;

    /// Deduplication lookup, bounded to executions created at or after
    /// `not_before` so old keys age out of the window.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError>;

    /// Atomic compare-and-set status change. Rejects transitions the status
    /// machine does not allow, and fails when the row is not in `from`.
    async fn update_status(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), RepositoryError>;

    async fn mark_cancelled(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        cancelled_by: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn mark_finished(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        record: &FinishRecord,
    ) -> Result<(), RepositoryError>;

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError>;

    async fn count_by_status(&self, status: ExecutionStatus) -> Result<i64, RepositoryError>;
}

#[async_trait]
pub trait StepRepository: Send + Sync {
    async fn insert_all(&self, steps: &[Step]) -> Result<(), RepositoryError>;

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Step>, RepositoryError>;

    async fn update(&self, step: &Step) -> Result<(), RepositoryError>;

    /// `(family, duration_ms)` pairs for steps finished since `since`; feeds
    /// percentile metrics and completion estimates.
    async fn recent_durations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(StepFamily, i64)>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn create(&self, approval: Approval) -> Result<(), RepositoryError>;

    async fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Approval>, RepositoryError>;

    /// Pending-only compare-and-set; deciding an already-decided approval is
    /// an `IllegalTransition`.
    async fn decide(
        &self,
        id: &ApprovalId,
        state: ApprovalState,
        decided_by: &str,
        reason: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<(), RepositoryError>;

    /// Atomically claim the best available item: highest priority first, then
    /// earliest `available_at`, skipping rows with a live lease.
    async fn dequeue_with_lease(
        &self,
        owner: &str,
        lease_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, RepositoryError>;

    async fn renew_lease(
        &self,
        id: &QueueItemId,
        owner: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Delete the row on success. Owner-checked.
    async fn ack(&self, id: &QueueItemId, owner: &str) -> Result<(), RepositoryError>;

    /// Return the item to the pool with a backoff delay; increments the
    /// attempt counter and returns the new count.
    async fn nack_with_backoff(
        &self,
        id: &QueueItemId,
        owner: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<u32, RepositoryError>;

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn find(&self, id: &QueueItemId) -> Result<Option<QueueItem>, RepositoryError>;

    async fn depth(&self, now: DateTime<Utc>) -> Result<i64, RepositoryError>;

    async fn oldest_available_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;
}

#[derive(Clone, Debug, Default)]
pub struct DlqFilter {
    pub tenant_id: Option<TenantId>,
    pub include_archived: bool,
    pub limit: u32,
}

#[async_trait]
pub trait DlqRepository: Send + Sync {
    async fn insert(&self, item: DlqItem) -> Result<(), RepositoryError>;

    async fn query(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, RepositoryError>;

    async fn find(&self, id: &DlqItemId) -> Result<Option<DlqItem>, RepositoryError>;

    /// Put the failed work back on the queue (fresh attempts) and archive the
    /// dead-letter row, atomically.
    async fn requeue(&self, id: &DlqItemId, item: QueueItem) -> Result<(), RepositoryError>;

    async fn archive(&self, id: &DlqItemId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Succeeds iff no live lock exists under the key; an expired lock is
    /// stolen in the same statement. Fails fast with `LockHeld` naming the
    /// current owner.
    async fn try_acquire(&self, lock: AssetLock) -> Result<(), RepositoryError>;

    /// Owner-checked delete; releasing someone else's lock is `NotOwner`.
    async fn release(&self, lock_key: &LockKey, owner_tag: &str) -> Result<(), RepositoryError>;

    async fn find(&self, lock_key: &LockKey) -> Result<Option<AssetLock>, RepositoryError>;

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait TimeoutPolicyRepository: Send + Sync {
    async fn lookup(
        &self,
        sla_class: SlaClass,
        action_class: ActionClass,
    ) -> Result<Option<TimeoutPolicy>, RepositoryError>;

    /// Insert any missing cells of the default matrix; returns how many were
    /// inserted. Existing cells are left untouched.
    async fn seed_defaults(&self) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append-only; the store assigns `seq`. Payloads arrive pre-masked.
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: EventKind,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, RepositoryError>;

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError>;

    async fn list_recent(
        &self,
        kind: Option<EventKind>,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError>;

    async fn count_since(
        &self,
        kind: EventKind,
        since: DateTime<Utc>,
    ) -> Result<i64, RepositoryError>;
}

/// Cancellation token record. This deployment keeps tokens in the store; the
/// trait is the seam for a faster key/value backing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationFlag {
    pub execution_id: ExecutionId,
    pub requested_by: String,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CancellationRepository: Send + Sync {
    /// First writer wins; setting a flag that already exists is a no-op so
    /// repeated cancellation stays idempotent.
    async fn set(&self, flag: CancellationFlag) -> Result<(), RepositoryError>;

    async fn get(
        &self,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<CancellationFlag>, RepositoryError>;

    async fn clear(&self, execution_id: &ExecutionId) -> Result<(), RepositoryError>;

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}
