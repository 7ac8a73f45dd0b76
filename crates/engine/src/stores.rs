use std::sync::Arc;

use fleetrun_core::errors::EngineError;
use fleetrun_db::repositories::{
    ApprovalRepository, CancellationRepository, DlqRepository, EventRepository,
    ExecutionRepository, InMemoryApprovalRepository, InMemoryCancellationRepository,
    InMemoryDlqRepository, InMemoryEventRepository, InMemoryExecutionRepository,
    InMemoryLockRepository, InMemoryQueueRepository, InMemoryStepRepository,
    InMemoryTimeoutPolicyRepository, LockRepository, QueueRepository, RepositoryError,
    SqlApprovalRepository, SqlCancellationRepository, SqlDlqRepository, SqlEventRepository,
    SqlExecutionRepository, SqlLockRepository, SqlQueueRepository, SqlStepRepository,
    SqlTimeoutPolicyRepository, StepRepository, TimeoutPolicyRepository,
};
use fleetrun_db::DbPool;

/// Every durable surface the engine touches, behind trait objects so tests
/// can swap the SQL store for the in-memory twins wholesale.
#[derive(Clone)]
pub struct EngineStores {
    pub executions: Arc<dyn ExecutionRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub approvals: Arc<dyn ApprovalRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub dlq: Arc<dyn DlqRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub policies: Arc<dyn TimeoutPolicyRepository>,
    pub events: Arc<dyn EventRepository>,
    pub cancellations: Arc<dyn CancellationRepository>,
}

impl EngineStores {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            executions: Arc::new(SqlExecutionRepository::new(pool.clone())),
            steps: Arc::new(SqlStepRepository::new(pool.clone())),
            approvals: Arc::new(SqlApprovalRepository::new(pool.clone())),
            queue: Arc::new(SqlQueueRepository::new(pool.clone())),
            dlq: Arc::new(SqlDlqRepository::new(pool.clone())),
            locks: Arc::new(SqlLockRepository::new(pool.clone())),
            policies: Arc::new(SqlTimeoutPolicyRepository::new(pool.clone())),
            events: Arc::new(SqlEventRepository::new(pool.clone())),
            cancellations: Arc::new(SqlCancellationRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let queue = Arc::new(InMemoryQueueRepository::default());
        Self {
            executions: Arc::new(InMemoryExecutionRepository::default()),
            steps: Arc::new(InMemoryStepRepository::default()),
            approvals: Arc::new(InMemoryApprovalRepository::default()),
            dlq: Arc::new(InMemoryDlqRepository::with_queue(queue.clone())),
            queue,
            locks: Arc::new(InMemoryLockRepository::default()),
            policies: Arc::new(InMemoryTimeoutPolicyRepository::default()),
            events: Arc::new(InMemoryEventRepository::default()),
            cancellations: Arc::new(InMemoryCancellationRepository::default()),
        }
    }
}

/// Map store failures onto the engine taxonomy. Constraint violations carry
/// their meaning across; transport problems become `StoreUnavailable`.
pub fn store_error(error: RepositoryError) -> EngineError {
    match error {
        RepositoryError::DuplicateIdempotencyKey { tenant_id, idempotency_key } => {
            EngineError::DuplicateIdempotencyKey { tenant_id, idempotency_key }
        }
        RepositoryError::IllegalTransition { from, to, .. } => {
            EngineError::IllegalStateTransition { from, to }
        }
        RepositoryError::LockHeld { lock_key, owner } => {
            EngineError::ResourceBusy { lock_key, owner }
        }
        RepositoryError::NotFound { entity, id } => {
            EngineError::Validation { message: format!("{entity} `{id}` not found") }
        }
        RepositoryError::Database(error) => {
            EngineError::StoreUnavailable { message: error.to_string() }
        }
        RepositoryError::Decode(message) => EngineError::StoreUnavailable { message },
        RepositoryError::NotOwner { lock_key, owner_tag } => EngineError::StoreUnavailable {
            message: format!("`{lock_key}` is no longer held by `{owner_tag}`"),
        },
    }
}

#[cfg(test)]
mod tests {
    use fleetrun_core::errors::EngineError;
    use fleetrun_db::repositories::RepositoryError;

    use super::store_error;

    #[test]
    fn constraint_violations_keep_their_class() {
        let duplicate = store_error(RepositoryError::DuplicateIdempotencyKey {
            tenant_id: "t".into(),
            idempotency_key: "k".into(),
        });
        assert_eq!(duplicate.error_class(), "DuplicateIdempotencyKey");

        let held = store_error(RepositoryError::LockHeld {
            lock_key: "v1:t:a:restart".into(),
            owner: "exec-1".into(),
        });
        assert!(matches!(held, EngineError::ResourceBusy { ref owner, .. } if owner == "exec-1"));

        let illegal = store_error(RepositoryError::IllegalTransition {
            entity: "execution",
            from: "succeeded".into(),
            to: "running".into(),
        });
        assert_eq!(illegal.error_class(), "IllegalStateTransition");
    }

    #[test]
    fn transport_failures_become_store_unavailable() {
        let error = store_error(RepositoryError::Decode("bad row".into()));
        assert_eq!(error.error_class(), "StoreUnavailable");
    }
}
