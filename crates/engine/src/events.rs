//! The single path through which operational events leave the engine. Every
//! payload is masked here, then persisted and fanned out to live
//! subscribers, so no emitter can bypass the sink-level scrubbing.

use std::sync::Arc;

use fleetrun_core::domain::event::{EventKind, EventSeverity, ExecutionEvent};
use fleetrun_core::domain::execution::ExecutionId;
use fleetrun_core::errors::EngineError;
use fleetrun_core::masking::Masker;
use fleetrun_db::repositories::EventRepository;

use crate::observe::stream::EventStream;
use crate::stores::store_error;

#[derive(Clone)]
pub struct EventRecorder {
    events: Arc<dyn EventRepository>,
    stream: EventStream,
    masker: Arc<Masker>,
}

impl EventRecorder {
    pub fn new(events: Arc<dyn EventRepository>, stream: EventStream, masker: Arc<Masker>) -> Self {
        Self { events, stream, masker }
    }

    pub fn masker(&self) -> &Arc<Masker> {
        &self.masker
    }

    pub async fn record(
        &self,
        execution_id: &ExecutionId,
        kind: EventKind,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, EngineError> {
        let masked = self.masker.masked(&payload);
        let event = self
            .events
            .append(execution_id, kind, severity, masked)
            .await
            .map_err(store_error)?;
        self.stream.publish(event.clone());
        Ok(event)
    }

    /// Record-or-log for paths where event loss must not abort the
    /// operation (e.g. while already handling a failure).
    pub async fn record_best_effort(
        &self,
        execution_id: &ExecutionId,
        kind: EventKind,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) {
        if let Err(error) = self.record(execution_id, kind, severity, payload).await {
            tracing::warn!(
                event_name = "engine.events.append_failed",
                execution_id = %execution_id.0,
                kind = kind.as_str(),
                error = %error,
                "failed to append execution event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use fleetrun_core::domain::event::{EventKind, EventSeverity};
    use fleetrun_core::domain::execution::ExecutionId;
    use fleetrun_core::masking::{Masker, REDACTED};
    use fleetrun_db::repositories::{EventRepository, InMemoryEventRepository};

    use super::EventRecorder;
    use crate::observe::stream::EventStream;

    #[tokio::test]
    async fn payloads_are_masked_before_persistence_and_fanout() {
        let repo: Arc<InMemoryEventRepository> = Arc::new(InMemoryEventRepository::default());
        let stream = EventStream::with_capacity(16);
        let recorder =
            EventRecorder::new(repo.clone(), stream.clone(), Arc::new(Masker::default()));
        let execution_id = ExecutionId("exec-1".to_string());
        let mut receiver = stream.subscribe();

        recorder
            .record(
                &execution_id,
                EventKind::StepCompleted,
                EventSeverity::Info,
                json!({ "exit_code": 1, "stderr": "login failed: password=P@ss123" }),
            )
            .await
            .expect("record");

        let stored = repo.list_for_execution(&execution_id, 0, 10).await.expect("list");
        let rendered = stored[0].payload.to_string();
        assert!(rendered.contains(REDACTED));
        assert!(!rendered.contains("P@ss123"));

        let live = receiver.recv().await.expect("event");
        assert!(!live.payload.to_string().contains("P@ss123"));
    }
}
