//! Deterministic plan classification.
//!
//! SLA class comes from the plan's total duration estimate; action class from
//! its highest-risk step. Both are computed once at submission and stored on
//! the execution so later stages never re-derive them differently.

use crate::domain::execution::{ActionClass, ExecutionMode, SlaClass};
use crate::domain::step::StepFamily;
use crate::plan::{Plan, PlanStep};

/// Plans estimated under this run as `fast`.
pub const FAST_ESTIMATE_CEILING_MS: u64 = 10_000;
/// Plans estimated over this run as `long`.
pub const LONG_ESTIMATE_FLOOR_MS: u64 = 300_000;

/// Fallback duration estimate for a step that does not declare one.
pub fn step_estimate_ms(step: &PlanStep) -> u64 {
    if let Some(estimate) = step.estimated_duration_ms {
        return estimate;
    }
    match step.family() {
        Some(StepFamily::AssetQuery | StepFamily::CredentialsRead) => 1_000,
        Some(StepFamily::Validation) => 2_000,
        Some(StepFamily::Http) => 2_000,
        Some(StepFamily::Database) => 5_000,
        Some(StepFamily::Command) => 10_000,
        Some(StepFamily::FileTransfer) => 30_000,
        None => 10_000,
    }
}

pub fn total_estimate_ms(plan: &Plan) -> u64 {
    plan.steps.iter().map(step_estimate_ms).sum()
}

pub fn sla_class(plan: &Plan) -> SlaClass {
    let estimate = total_estimate_ms(plan);
    if estimate < FAST_ESTIMATE_CEILING_MS {
        SlaClass::Fast
    } else if estimate > LONG_ESTIMATE_FLOOR_MS {
        SlaClass::Long
    } else {
        SlaClass::Medium
    }
}

/// Risk category of a single step: the family baseline, lowered for
/// read-only HTTP/SQL, raised for provisioning-shaped actions.
pub fn step_action_class(step: &PlanStep) -> ActionClass {
    let Some(family) = step.family() else {
        return ActionClass::Operational;
    };

    if is_provisioning_action(step) {
        return ActionClass::Provisioning;
    }

    match family {
        StepFamily::Http => {
            let method = step
                .inputs
                .get("method")
                .and_then(|value| value.as_str())
                .unwrap_or("GET")
                .to_ascii_uppercase();
            if method == "GET" || method == "HEAD" {
                ActionClass::Information
            } else {
                ActionClass::Operational
            }
        }
        StepFamily::Database => {
            let query = step
                .inputs
                .get("query")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .trim_start()
                .to_ascii_lowercase();
            if query.starts_with("select") {
                ActionClass::Information
            } else {
                ActionClass::Operational
            }
        }
        other => other.base_action_class(),
    }
}

fn is_provisioning_action(step: &PlanStep) -> bool {
    let action = step.action.as_deref().unwrap_or_default().to_ascii_lowercase();
    ["deploy", "provision", "install", "decommission"]
        .iter()
        .any(|marker| action.contains(marker))
}

/// Action class of a whole plan: the highest-risk step wins.
pub fn plan_action_class(plan: &Plan) -> ActionClass {
    plan.steps
        .iter()
        .map(step_action_class)
        .max_by_key(ActionClass::risk_rank)
        .unwrap_or(ActionClass::Information)
}

/// Whether the plan must pass an approval gate before running: an explicit
/// plan attribute, any risk flag, provisioning-class work, or a gated
/// credential read.
pub fn requires_approval(plan: &Plan, action_class: ActionClass) -> bool {
    plan.requires_approval
        || !plan.risk_flags.is_empty()
        || action_class == ActionClass::Provisioning
        || plan
            .steps
            .iter()
            .any(|step| step.family() == Some(StepFamily::CredentialsRead))
}

/// Immediate mode is reserved for fast plans that also fit the configured
/// synchronous budget; everything else goes through the queue.
pub fn execution_mode(plan: &Plan, sla: SlaClass, immediate_budget_ms: u64) -> ExecutionMode {
    if sla == SlaClass::Fast && total_estimate_ms(plan) <= immediate_budget_ms {
        ExecutionMode::Immediate
    } else {
        ExecutionMode::Background
    }
}
