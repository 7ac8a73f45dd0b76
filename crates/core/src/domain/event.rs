use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::ExecutionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged,
    StepStarted,
    StepCompleted,
    MutexConflict,
    RbacViolation,
    SecretAccess,
    Timeout,
    CancellationRequested,
    Cancelled,
    ApprovalRequested,
    ApprovalDecided,
    Enqueued,
    Leased,
    Acked,
    Nacked,
    DeadLettered,
    Requeued,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChanged => "status_changed",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::MutexConflict => "mutex_conflict",
            Self::RbacViolation => "rbac_violation",
            Self::SecretAccess => "secret_access",
            Self::Timeout => "timeout",
            Self::CancellationRequested => "cancellation_requested",
            Self::Cancelled => "cancelled",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalDecided => "approval_decided",
            Self::Enqueued => "enqueued",
            Self::Leased => "leased",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::DeadLettered => "dead_lettered",
            Self::Requeued => "requeued",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "status_changed" => Some(Self::StatusChanged),
            "step_started" => Some(Self::StepStarted),
            "step_completed" => Some(Self::StepCompleted),
            "mutex_conflict" => Some(Self::MutexConflict),
            "rbac_violation" => Some(Self::RbacViolation),
            "secret_access" => Some(Self::SecretAccess),
            "timeout" => Some(Self::Timeout),
            "cancellation_requested" => Some(Self::CancellationRequested),
            "cancelled" => Some(Self::Cancelled),
            "approval_requested" => Some(Self::ApprovalRequested),
            "approval_decided" => Some(Self::ApprovalDecided),
            "enqueued" => Some(Self::Enqueued),
            "leased" => Some(Self::Leased),
            "acked" => Some(Self::Acked),
            "nacked" => Some(Self::Nacked),
            "dead_lettered" => Some(Self::DeadLettered),
            "requeued" => Some(Self::Requeued),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Append-only operational event. The payload is masked before it is
/// persisted; `seq` is assigned by the store and is strictly increasing per
/// execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub seq: i64,
    pub execution_id: ExecutionId,
    pub kind: EventKind,
    pub severity: EventSeverity,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}
