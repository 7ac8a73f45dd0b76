//! In-memory repository twins. Same contracts as the `Sql*` implementations,
//! backed by maps behind async locks; used by engine and handler tests that
//! do not want a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
use fleetrun_core::domain::context::TenantId;
use fleetrun_core::domain::event::{EventKind, EventSeverity, ExecutionEvent};
use fleetrun_core::domain::execution::{
    ActionClass, Execution, ExecutionId, ExecutionStatus, SlaClass,
};
use fleetrun_core::domain::lock::{AssetLock, LockKey};
use fleetrun_core::domain::policy::{default_matrix, TimeoutPolicy};
use fleetrun_core::domain::queue::{DlqItem, DlqItemId, QueueItem, QueueItemId};
use fleetrun_core::domain::step::{Step, StepFamily};

use super::{
    ApprovalRepository, CancellationFlag, CancellationRepository, DlqFilter, DlqRepository,
    ExecutionFilter, ExecutionRepository, EventRepository, FinishRecord, LockRepository,
    QueueRepository, RepositoryError, StepRepository, TimeoutPolicyRepository,
};

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<String, Execution>>,
}

#[async_trait::async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create(&self, execution: Execution) -> Result<(), RepositoryError> {
        let mut executions = self.executions.write().await;
        let duplicate = executions.values().any(|existing| {
            existing.tenant_id == execution.tenant_id
                && existing.idempotency_key == execution.idempotency_key
        });
        if duplicate {
            return Err(RepositoryError::DuplicateIdempotencyKey {
                tenant_id: execution.tenant_id.0,
                idempotency_key: execution.idempotency_key,
            });
        }
        executions.insert(execution.id.0.clone(), execution);
        Ok(())
    }

    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.read().await.get(&id.0).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|execution| {
                execution.tenant_id == *tenant_id
                    && execution.idempotency_key == idempotency_key
                    && execution.created_at >= not_before
            })
            .max_by_key(|execution| execution.created_at)
            .cloned())
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(to) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound { entity: "execution", id: id.0.clone() })?;

        if execution.status != from {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: execution.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        execution.status = to;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        cancelled_by: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(ExecutionStatus::Cancelled) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: "cancelled".to_string(),
            });
        }

        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound { entity: "execution", id: id.0.clone() })?;

        if execution.status != from {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: execution.status.as_str().to_string(),
                to: "cancelled".to_string(),
            });
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.cancelled_by = Some(cancelled_by.to_string());
        execution.cancelled_at = Some(cancelled_at);
        execution.ended_at = Some(cancelled_at);
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_finished(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        record: &FinishRecord,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(record.status) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: record.status.as_str().to_string(),
            });
        }

        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound { entity: "execution", id: id.0.clone() })?;

        if execution.status != from {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: execution.status.as_str().to_string(),
                to: record.status.as_str().to_string(),
            });
        }

        execution.status = record.status;
        execution.timed_out = record.timed_out;
        execution.error_class = record.error_class.clone();
        execution.error_message = record.error_message.clone();
        execution.output = record.output.clone();
        execution.ended_at = Some(record.ended_at);
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut entries: Vec<Execution> = executions
            .values()
            .filter(|execution| execution.tenant_id == filter.tenant_id)
            .filter(|execution| {
                filter.actor_id.as_ref().map_or(true, |actor| execution.actor_id == *actor)
            })
            .filter(|execution| filter.status.map_or(true, |status| execution.status == status))
            .filter(|execution| filter.sla_class.map_or(true, |sla| execution.sla_class == sla))
            .filter(|execution| {
                filter.created_after.map_or(true, |after| execution.created_at >= after)
            })
            .filter(|execution| {
                filter.created_before.map_or(true, |before| execution.created_at <= before)
            })
            .cloned()
            .collect();
        entries.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        entries.truncate(filter.limit.clamp(1, 1_000) as usize);
        Ok(entries)
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let executions = self.executions.read().await;
        let mut entries: Vec<Execution> =
            executions.values().filter(|execution| execution.status == status).cloned().collect();
        entries.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        entries.truncate(limit.clamp(1, 10_000) as usize);
        Ok(entries)
    }

    async fn count_by_status(&self, status: ExecutionStatus) -> Result<i64, RepositoryError> {
        let executions = self.executions.read().await;
        Ok(executions.values().filter(|execution| execution.status == status).count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryStepRepository {
    steps: RwLock<HashMap<String, Step>>,
}

#[async_trait::async_trait]
impl StepRepository for InMemoryStepRepository {
    async fn insert_all(&self, steps: &[Step]) -> Result<(), RepositoryError> {
        let mut stored = self.steps.write().await;
        for step in steps {
            stored.insert(step.id.0.clone(), step.clone());
        }
        Ok(())
    }

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Step>, RepositoryError> {
        let steps = self.steps.read().await;
        let mut entries: Vec<Step> =
            steps.values().filter(|step| step.execution_id == *execution_id).cloned().collect();
        entries.sort_by_key(|step| step.ordinal);
        Ok(entries)
    }

    async fn update(&self, step: &Step) -> Result<(), RepositoryError> {
        let mut steps = self.steps.write().await;
        steps.insert(step.id.0.clone(), step.clone());
        Ok(())
    }

    async fn recent_durations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(StepFamily, i64)>, RepositoryError> {
        let steps = self.steps.read().await;
        Ok(steps
            .values()
            .filter_map(|step| match (step.started_at, step.ended_at) {
                (Some(started), Some(ended)) if ended >= since => {
                    Some((step.family, (ended - started).num_milliseconds()))
                }
                _ => None,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryApprovalRepository {
    approvals: RwLock<HashMap<String, Approval>>,
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn create(&self, approval: Approval) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        approvals.insert(approval.id.0.clone(), approval);
        Ok(())
    }

    async fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .filter(|approval| approval.execution_id == *execution_id)
            .max_by_key(|approval| approval.created_at)
            .cloned())
    }

    async fn decide(
        &self,
        id: &ApprovalId,
        state: ApprovalState,
        decided_by: &str,
        reason: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound { entity: "approval", id: id.0.clone() })?;

        if approval.state != ApprovalState::Pending {
            return Err(RepositoryError::IllegalTransition {
                entity: "approval",
                from: approval.state.as_str().to_string(),
                to: state.as_str().to_string(),
            });
        }

        approval.state = state;
        approval.decided_by = Some(decided_by.to_string());
        approval.decided_at = Some(decided_at);
        approval.reason = reason.map(str::to_string);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryQueueRepository {
    items: RwLock<HashMap<String, QueueItem>>,
}

#[async_trait::async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, item: QueueItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        items.insert(item.id.0.clone(), item);
        Ok(())
    }

    async fn dequeue_with_lease(
        &self,
        owner: &str,
        lease_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, RepositoryError> {
        let mut items = self.items.write().await;

        let candidate_id = items
            .values()
            .filter(|item| item.available_at <= now && !item.is_leased(now))
            .max_by(|left, right| {
                left.priority
                    .cmp(&right.priority)
                    .then_with(|| right.available_at.cmp(&left.available_at))
            })
            .map(|item| item.id.0.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let Some(item) = items.get_mut(&id) else {
            return Ok(None);
        };
        item.leased_by = Some(owner.to_string());
        item.lease_expires_at = Some(now + Duration::milliseconds(lease_ms as i64));
        Ok(Some(item.clone()))
    }

    async fn renew_lease(
        &self,
        id: &QueueItemId,
        owner: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(item) if item.leased_by.as_deref() == Some(owner) => {
                item.lease_expires_at = Some(new_expiry);
                Ok(())
            }
            _ => Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            }),
        }
    }

    async fn ack(&self, id: &QueueItemId, owner: &str) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        match items.get(&id.0) {
            Some(item) if item.leased_by.as_deref() == Some(owner) => {
                items.remove(&id.0);
                Ok(())
            }
            _ => Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            }),
        }
    }

    async fn nack_with_backoff(
        &self,
        id: &QueueItemId,
        owner: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<u32, RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(item) if item.leased_by.as_deref() == Some(owner) => {
                item.leased_by = None;
                item.lease_expires_at = None;
                item.attempts += 1;
                item.available_at = next_available_at;
                Ok(item.attempts)
            }
            _ => Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            }),
        }
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut items = self.items.write().await;
        let mut reaped = 0;
        for item in items.values_mut() {
            if item.lease_expired(now) {
                item.leased_by = None;
                item.lease_expires_at = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn find(&self, id: &QueueItemId) -> Result<Option<QueueItem>, RepositoryError> {
        Ok(self.items.read().await.get(&id.0).cloned())
    }

    async fn depth(&self, now: DateTime<Utc>) -> Result<i64, RepositoryError> {
        let items = self.items.read().await;
        Ok(items
            .values()
            .filter(|item| item.available_at <= now && !item.is_leased(now))
            .count() as i64)
    }

    async fn oldest_available_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let items = self.items.read().await;
        Ok(items
            .values()
            .filter(|item| item.available_at <= now && !item.is_leased(now))
            .map(|item| item.available_at)
            .min())
    }
}

#[derive(Default)]
pub struct InMemoryDlqRepository {
    items: RwLock<HashMap<String, DlqItem>>,
    queue: Option<std::sync::Arc<InMemoryQueueRepository>>,
}

impl InMemoryDlqRepository {
    /// Link the twin queue so `requeue` actually re-inserts work, matching
    /// the SQL implementation's transaction.
    pub fn with_queue(queue: std::sync::Arc<InMemoryQueueRepository>) -> Self {
        Self { items: RwLock::new(HashMap::new()), queue: Some(queue) }
    }
}

#[async_trait::async_trait]
impl DlqRepository for InMemoryDlqRepository {
    async fn insert(&self, item: DlqItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        items.insert(item.id.0.clone(), item);
        Ok(())
    }

    async fn query(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut entries: Vec<DlqItem> = items
            .values()
            .filter(|item| {
                filter.tenant_id.as_ref().map_or(true, |tenant| item.tenant_id == *tenant)
            })
            .filter(|item| filter.include_archived || !item.archived)
            .cloned()
            .collect();
        entries.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        entries.truncate(filter.limit.clamp(1, 1_000) as usize);
        Ok(entries)
    }

    async fn find(&self, id: &DlqItemId) -> Result<Option<DlqItem>, RepositoryError> {
        Ok(self.items.read().await.get(&id.0).cloned())
    }

    async fn requeue(&self, id: &DlqItemId, item: QueueItem) -> Result<(), RepositoryError> {
        {
            let mut items = self.items.write().await;
            match items.get_mut(&id.0) {
                Some(dlq_item) if !dlq_item.archived => dlq_item.archived = true,
                _ => {
                    return Err(RepositoryError::NotFound {
                        entity: "dlq_item",
                        id: id.0.clone(),
                    })
                }
            }
        }
        if let Some(queue) = &self.queue {
            queue.enqueue(item).await?;
        }
        Ok(())
    }

    async fn archive(&self, id: &DlqItemId) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(item) => {
                item.archived = true;
                Ok(())
            }
            None => Err(RepositoryError::NotFound { entity: "dlq_item", id: id.0.clone() }),
        }
    }
}

#[derive(Default)]
pub struct InMemoryLockRepository {
    locks: RwLock<HashMap<String, AssetLock>>,
}

#[async_trait::async_trait]
impl LockRepository for InMemoryLockRepository {
    async fn try_acquire(&self, lock: AssetLock) -> Result<(), RepositoryError> {
        let mut locks = self.locks.write().await;
        if let Some(existing) = locks.get(lock.lock_key.as_str()) {
            if !existing.is_expired(lock.acquired_at) {
                return Err(RepositoryError::LockHeld {
                    lock_key: lock.lock_key.0.clone(),
                    owner: existing.owner_tag.clone(),
                });
            }
        }
        locks.insert(lock.lock_key.0.clone(), lock);
        Ok(())
    }

    async fn release(&self, lock_key: &LockKey, owner_tag: &str) -> Result<(), RepositoryError> {
        let mut locks = self.locks.write().await;
        match locks.get(lock_key.as_str()) {
            Some(existing) if existing.owner_tag == owner_tag => {
                locks.remove(lock_key.as_str());
                Ok(())
            }
            _ => Err(RepositoryError::NotOwner {
                lock_key: lock_key.0.clone(),
                owner_tag: owner_tag.to_string(),
            }),
        }
    }

    async fn find(&self, lock_key: &LockKey) -> Result<Option<AssetLock>, RepositoryError> {
        Ok(self.locks.read().await.get(lock_key.as_str()).cloned())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired(now));
        Ok((before - locks.len()) as u64)
    }
}

pub struct InMemoryTimeoutPolicyRepository {
    cells: RwLock<Vec<TimeoutPolicy>>,
}

impl Default for InMemoryTimeoutPolicyRepository {
    fn default() -> Self {
        Self { cells: RwLock::new(default_matrix()) }
    }
}

impl InMemoryTimeoutPolicyRepository {
    pub fn empty() -> Self {
        Self { cells: RwLock::new(Vec::new()) }
    }

    pub fn with_cells(cells: Vec<TimeoutPolicy>) -> Self {
        Self { cells: RwLock::new(cells) }
    }
}

#[async_trait::async_trait]
impl TimeoutPolicyRepository for InMemoryTimeoutPolicyRepository {
    async fn lookup(
        &self,
        sla_class: SlaClass,
        action_class: ActionClass,
    ) -> Result<Option<TimeoutPolicy>, RepositoryError> {
        let cells = self.cells.read().await;
        Ok(cells
            .iter()
            .find(|cell| cell.sla_class == sla_class && cell.action_class == action_class)
            .cloned())
    }

    async fn seed_defaults(&self) -> Result<u64, RepositoryError> {
        let mut cells = self.cells.write().await;
        let mut inserted = 0;
        for cell in default_matrix() {
            let missing = !cells.iter().any(|existing| {
                existing.sla_class == cell.sla_class && existing.action_class == cell.action_class
            });
            if missing {
                cells.push(cell);
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[derive(Default)]
pub struct InMemoryEventRepository {
    events: RwLock<Vec<ExecutionEvent>>,
    next_seq: AtomicI64,
}

#[async_trait::async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: EventKind,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, RepositoryError> {
        let event = ExecutionEvent {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
            execution_id: execution_id.clone(),
            kind,
            severity,
            payload,
            ts: Utc::now(),
        };
        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.execution_id == *execution_id && event.seq > after_seq)
            .take(limit.clamp(1, 1_000) as usize)
            .cloned()
            .collect())
    }

    async fn list_recent(
        &self,
        kind: Option<EventKind>,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .rev()
            .filter(|event| kind.map_or(true, |expected| event.kind == expected))
            .take(limit.clamp(1, 1_000) as usize)
            .cloned()
            .collect())
    }

    async fn count_since(
        &self,
        kind: EventKind,
        since: DateTime<Utc>,
    ) -> Result<i64, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|event| event.kind == kind && event.ts >= since).count() as i64)
    }
}

#[derive(Default)]
pub struct InMemoryCancellationRepository {
    flags: RwLock<HashMap<String, CancellationFlag>>,
}

#[async_trait::async_trait]
impl CancellationRepository for InMemoryCancellationRepository {
    async fn set(&self, flag: CancellationFlag) -> Result<(), RepositoryError> {
        let mut flags = self.flags.write().await;
        flags.entry(flag.execution_id.0.clone()).or_insert(flag);
        Ok(())
    }

    async fn get(
        &self,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<CancellationFlag>, RepositoryError> {
        let flags = self.flags.read().await;
        Ok(flags.get(&execution_id.0).filter(|flag| flag.expires_at > now).cloned())
    }

    async fn clear(&self, execution_id: &ExecutionId) -> Result<(), RepositoryError> {
        self.flags.write().await.remove(&execution_id.0);
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut flags = self.flags.write().await;
        let before = flags.len();
        flags.retain(|_, flag| flag.expires_at > now);
        Ok((before - flags.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use fleetrun_core::domain::context::TenantId;
    use fleetrun_core::domain::execution::{ExecutionId, SlaClass};
    use fleetrun_core::domain::queue::{QueueItem, QueueItemId};

    use super::InMemoryQueueRepository;
    use crate::repositories::QueueRepository;

    fn item(id: &str, sla_class: SlaClass, available_at_offset_secs: i64) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: QueueItemId(id.to_string()),
            execution_id: ExecutionId(format!("exec-{id}")),
            tenant_id: TenantId("t-1".to_string()),
            sla_class,
            priority: sla_class.priority(),
            available_at: now + Duration::seconds(available_at_offset_secs),
            leased_by: None,
            lease_expires_at: None,
            attempts: 0,
            max_attempts: 3,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn in_memory_queue_matches_sql_dispatch_order() {
        let queue = InMemoryQueueRepository::default();
        queue.enqueue(item("a", SlaClass::Long, -10)).await.expect("enqueue");
        queue.enqueue(item("b", SlaClass::Fast, -5)).await.expect("enqueue");
        queue.enqueue(item("c", SlaClass::Fast, -20)).await.expect("enqueue");

        let now = Utc::now();
        let first = queue
            .dequeue_with_lease("w1", 60_000, now)
            .await
            .expect("dequeue")
            .expect("item");
        // fast beats long; among fast, the older item wins
        assert_eq!(first.id.0, "c");

        let second =
            queue.dequeue_with_lease("w2", 60_000, now).await.expect("dequeue").expect("item");
        assert_eq!(second.id.0, "b");

        let third =
            queue.dequeue_with_lease("w3", 60_000, now).await.expect("dequeue").expect("item");
        assert_eq!(third.id.0, "a");
    }
}
