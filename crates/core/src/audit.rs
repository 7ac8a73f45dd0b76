use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::execution::ExecutionId;
use crate::masking::Masker;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Router,
    Execution,
    Queue,
    Rbac,
    Secret,
    Approval,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub execution_id: Option<ExecutionId>,
    pub tenant_id: Option<String>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        execution_id: Option<ExecutionId>,
        tenant_id: Option<String>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
        category: AuditCategory,
        actor: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            execution_id,
            tenant_id,
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            category,
            actor: actor.into(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Sink that forwards audit events to the structured log stream, where the
/// masking writer already guards the bytes.
#[derive(Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        tracing::info!(
            event_name = "audit",
            audit_event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            actor = %event.actor,
            tenant_id = event.tenant_id.as_deref().unwrap_or("unknown"),
            execution_id = event.execution_id.as_ref().map(|id| id.0.as_str()).unwrap_or("none"),
            outcome = ?event.outcome,
            metadata = %metadata,
            "audit event"
        );
    }
}

/// Sink decorator that masks metadata values before delegating. Installed
/// once at wiring time; emitters never think about masking.
pub struct MaskingAuditSink<S: AuditSink> {
    inner: S,
    masker: Arc<Masker>,
}

impl<S: AuditSink> MaskingAuditSink<S> {
    pub fn new(inner: S, masker: Arc<Masker>) -> Self {
        Self { inner, masker }
    }
}

impl<S: AuditSink> AuditSink for MaskingAuditSink<S> {
    fn emit(&self, mut event: AuditEvent) {
        for (key, value) in std::mem::take(&mut event.metadata) {
            let masked = if self.masker.field_is_sensitive(&key) {
                crate::masking::REDACTED.to_string()
            } else {
                self.masker.mask_message(&value)
            };
            event.metadata.insert(key, masked);
        }
        self.inner.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::audit::{
        AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, MaskingAuditSink,
    };
    use crate::domain::execution::ExecutionId;
    use crate::masking::{Masker, REDACTED};

    #[test]
    fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryAuditSink::default();
        sink.emit(
            AuditEvent::new(
                Some(ExecutionId("exec-42".to_owned())),
                Some("t-acme".to_owned()),
                "req-123",
                "router.dispatched",
                AuditCategory::Router,
                "u-ops",
                AuditOutcome::Success,
            )
            .with_metadata("mode", "background")
            .with_metadata("sla_class", "medium"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "req-123");
        assert_eq!(events[0].tenant_id.as_deref(), Some("t-acme"));
        assert_eq!(events[0].execution_id.as_ref().map(|id| id.0.as_str()), Some("exec-42"));
        assert!(events[0].metadata.contains_key("mode"));
    }

    #[test]
    fn masking_sink_scrubs_metadata_before_delegation() {
        let inner = InMemoryAuditSink::default();
        let sink = MaskingAuditSink::new(inner.clone(), Arc::new(Masker::default()));

        sink.emit(
            AuditEvent::new(
                None,
                None,
                "req-1",
                "secret.accessed",
                AuditCategory::Secret,
                "worker-1",
                AuditOutcome::Failed,
            )
            .with_metadata("api_key", "key-material-123")
            .with_metadata("detail", "fetch failed: token=tk-99"),
        );

        let events = inner.events();
        assert_eq!(events[0].metadata["api_key"], REDACTED);
        assert_eq!(events[0].metadata["detail"], format!("fetch failed: token={REDACTED}"));
        assert!(!events[0].metadata.values().any(|value| value.contains("key-material-123")));
    }
}
