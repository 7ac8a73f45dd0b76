//! Live event fan-out with bounded replay.
//!
//! Durable history lives in the store; this is the hot path for streaming
//! consumers. A ring buffer keeps the recent past so a subscriber that just
//! connected can catch up without a store query.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use fleetrun_core::domain::event::{EventKind, ExecutionEvent};
use fleetrun_core::domain::execution::ExecutionId;

const DEFAULT_BUFFER: usize = 1_024;

#[derive(Clone)]
pub struct EventStream {
    buffer: Arc<Mutex<VecDeque<ExecutionEvent>>>,
    capacity: usize,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER)
    }
}

impl EventStream {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(16),
            sender,
        }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        if let Ok(mut buffer) = self.buffer.lock() {
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }
        // No receivers is fine; the buffer still serves replay.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Recent events for one execution with `seq > after_seq`.
    pub fn replay_for_execution(
        &self,
        execution_id: &ExecutionId,
        after_seq: i64,
    ) -> Vec<ExecutionEvent> {
        match self.buffer.lock() {
            Ok(buffer) => buffer
                .iter()
                .filter(|event| event.execution_id == *execution_id && event.seq > after_seq)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Recent events of one kind, newest last.
    pub fn replay_by_kind(&self, kind: EventKind) -> Vec<ExecutionEvent> {
        match self.buffer.lock() {
            Ok(buffer) => buffer.iter().filter(|event| event.kind == kind).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
