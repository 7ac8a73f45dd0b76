use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::TenantId;
use crate::domain::execution::{ExecutionId, SlaClass};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueItemId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DlqItemId(pub String);

/// Durable work unit for background executions. An item is exactly one of:
/// available (no lease), leased (live lease), or expired-lease (eligible for
/// the reaper to return to the pool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub sla_class: SlaClass,
    pub priority: i64,
    pub available_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        match (&self.leased_by, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.leased_by, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires <= now,
            _ => false,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Queue item that exhausted its retries (or hit a non-retryable failure).
/// Held for human disposition: requeue or archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: DlqItemId,
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub failure_reason: String,
    pub error_class: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{QueueItem, QueueItemId};
    use crate::domain::context::TenantId;
    use crate::domain::execution::{ExecutionId, SlaClass};

    fn item() -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: QueueItemId("qi-1".to_string()),
            execution_id: ExecutionId("exec-1".to_string()),
            tenant_id: TenantId("t-1".to_string()),
            sla_class: SlaClass::Medium,
            priority: SlaClass::Medium.priority(),
            available_at: now,
            leased_by: None,
            lease_expires_at: None,
            attempts: 0,
            max_attempts: 3,
            created_at: now,
        }
    }

    #[test]
    fn unleased_item_is_neither_leased_nor_expired() {
        let now = Utc::now();
        let item = item();
        assert!(!item.is_leased(now));
        assert!(!item.lease_expired(now));
    }

    #[test]
    fn live_lease_is_leased_until_expiry() {
        let now = Utc::now();
        let mut item = item();
        item.leased_by = Some("worker-1".to_string());
        item.lease_expires_at = Some(now + Duration::seconds(30));

        assert!(item.is_leased(now));
        assert!(!item.lease_expired(now));

        let later = now + Duration::seconds(31);
        assert!(!item.is_leased(later));
        assert!(item.lease_expired(later));
    }

    #[test]
    fn attempts_exhaust_at_max() {
        let mut item = item();
        assert!(!item.attempts_exhausted());
        item.attempts = 3;
        assert!(item.attempts_exhausted());
    }
}
