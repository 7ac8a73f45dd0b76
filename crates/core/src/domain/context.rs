use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

/// Per-request caller identity. Threaded explicitly through every engine
/// entry point; nothing identity-bearing lives in globals or task-locals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    /// Caller-supplied deduplication key. When absent the engine derives one
    /// from the canonical plan snapshot.
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: TenantId(tenant_id.into()),
            actor_id: ActorId(actor_id.into()),
            idempotency_key: None,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}
