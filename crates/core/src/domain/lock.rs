use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::TenantId;
use crate::domain::execution::ExecutionId;

/// Versioned mutex key scoping exclusive access to one asset for one action
/// within a tenant: `v1:{tenant}:{target_ref}:{action}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(pub String);

impl LockKey {
    pub const VERSION: &'static str = "v1";

    pub fn new(tenant_id: &TenantId, target_ref: &str, action: &str) -> Self {
        Self(format!("{}:{}:{}:{}", Self::VERSION, tenant_id.0, target_ref, action))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Active per-asset mutex record. The owner tag is the holding execution id
/// so external observers can see who holds a contended asset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLock {
    pub lock_key: LockKey,
    pub execution_id: ExecutionId,
    pub owner_tag: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AssetLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}
