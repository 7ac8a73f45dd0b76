use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::{ActorId, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    AwaitingApproval,
    Approved,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "approved" => Some(Self::Approved),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Legal status transitions. Forward-only; a transition to the current
    /// status is always allowed so repeated writes stay idempotent.
    pub fn can_transition_to(&self, to: Self) -> bool {
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Self::Pending, Self::AwaitingApproval)
                | (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Failed)
                | (Self::AwaitingApproval, Self::Approved)
                | (Self::AwaitingApproval, Self::Cancelled)
                | (Self::Approved, Self::Running)
                | (Self::Approved, Self::Cancelled)
                | (Self::Approved, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Immediate,
    Background,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Background => "background",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(Self::Immediate),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

/// Service-level class of an execution; drives queue priority, timeout
/// budgets, and retry allowances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaClass {
    Fast,
    Medium,
    Long,
}

impl SlaClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "medium" => Some(Self::Medium),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    /// Queue priority. Higher dequeues first.
    pub fn priority(&self) -> i64 {
        match self {
            Self::Fast => 100,
            Self::Medium => 50,
            Self::Long => 10,
        }
    }

    pub fn default_max_attempts(&self) -> u32 {
        match self {
            Self::Fast => 2,
            Self::Medium => 3,
            Self::Long => 5,
        }
    }
}

/// Coarse risk category derived from the highest-risk step in a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Information,
    Diagnostic,
    Operational,
    Provisioning,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Information => "information",
            Self::Diagnostic => "diagnostic",
            Self::Operational => "operational",
            Self::Provisioning => "provisioning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "information" => Some(Self::Information),
            "diagnostic" => Some(Self::Diagnostic),
            "operational" => Some(Self::Operational),
            "provisioning" => Some(Self::Provisioning),
            _ => None,
        }
    }

    pub fn risk_rank(&self) -> u8 {
        match self {
            Self::Information => 0,
            Self::Diagnostic => 1,
            Self::Operational => 2,
            Self::Provisioning => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub idempotency_key: String,
    /// Immutable copy of the submitted plan; the audit record of what was
    /// asked for, independent of later catalog or plan changes.
    pub plan_snapshot: serde_json::Value,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub sla_class: SlaClass,
    pub action_class: ActionClass,
    pub timed_out: bool,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::{ActionClass, ExecutionMode, ExecutionStatus, SlaClass};

    #[test]
    fn execution_status_round_trips_from_storage_encoding() {
        let cases = [
            ExecutionStatus::Pending,
            ExecutionStatus::AwaitingApproval,
            ExecutionStatus::Approved,
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ];

        for status in cases {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn forward_transitions_are_legal() {
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::AwaitingApproval));
        assert!(ExecutionStatus::AwaitingApproval.can_transition_to(ExecutionStatus::Approved));
        assert!(ExecutionStatus::AwaitingApproval.can_transition_to(ExecutionStatus::Cancelled));
        assert!(ExecutionStatus::Approved.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Approved.can_transition_to(ExecutionStatus::Failed));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Succeeded));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Failed));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Cancelled));
    }

    #[test]
    fn backward_and_terminal_transitions_are_rejected() {
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
        assert!(!ExecutionStatus::Succeeded.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Succeeded));
        assert!(!ExecutionStatus::Cancelled.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Approved.can_transition_to(ExecutionStatus::AwaitingApproval));
    }

    #[test]
    fn same_status_transition_is_idempotent() {
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Cancelled.can_transition_to(ExecutionStatus::Cancelled));
    }

    #[test]
    fn sla_priority_orders_fast_before_long() {
        assert!(SlaClass::Fast.priority() > SlaClass::Medium.priority());
        assert!(SlaClass::Medium.priority() > SlaClass::Long.priority());
    }

    #[test]
    fn retry_allowance_grows_with_sla_class() {
        assert_eq!(SlaClass::Fast.default_max_attempts(), 2);
        assert_eq!(SlaClass::Medium.default_max_attempts(), 3);
        assert_eq!(SlaClass::Long.default_max_attempts(), 5);
    }

    #[test]
    fn action_class_risk_rank_is_monotonic() {
        assert!(ActionClass::Information.risk_rank() < ActionClass::Diagnostic.risk_rank());
        assert!(ActionClass::Diagnostic.risk_rank() < ActionClass::Operational.risk_rank());
        assert!(ActionClass::Operational.risk_rank() < ActionClass::Provisioning.risk_rank());
    }

    #[test]
    fn mode_round_trips_from_storage_encoding() {
        for mode in [ExecutionMode::Immediate, ExecutionMode::Background] {
            assert_eq!(ExecutionMode::parse(mode.as_str()), Some(mode));
        }
    }
}
