//! Validated plan model.
//!
//! The engine does not author plans; it receives them fully formed from the
//! planning stage and re-checks their shape before anything durable happens.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::step::StepFamily;

/// What to do when a step fails: stop the plan (default) or keep going and
/// report the failure in the aggregate result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Continue,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Continue => "continue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "halt" => Some(Self::Halt),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default = "empty_inputs")]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

fn empty_inputs() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl PlanStep {
    pub fn family(&self) -> Option<StepFamily> {
        StepFamily::from_alias(&self.step_type)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub steps: Vec<PlanStep>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanViolation {
    #[error("plan has no steps")]
    Empty,
    #[error("step {ordinal}: unknown step type `{step_type}`")]
    UnknownStepType { ordinal: usize, step_type: String },
    #[error("step {ordinal}: `{step_type}` requires a target asset")]
    MissingTarget { ordinal: usize, step_type: String },
    #[error("step {ordinal}: inputs must be a JSON object")]
    InputsNotObject { ordinal: usize },
    #[error("step {ordinal}: credential reads require an explicit `reason` input")]
    CredentialReadWithoutReason { ordinal: usize },
}

impl Plan {
    /// Shape check only. Permission, idempotency, and approval gating happen
    /// later at dispatch; this rejects plans the executor could never run.
    pub fn validate(&self) -> Result<(), Vec<PlanViolation>> {
        let mut violations = Vec::new();

        if self.steps.is_empty() {
            violations.push(PlanViolation::Empty);
        }

        for (ordinal, step) in self.steps.iter().enumerate() {
            let Some(family) = step.family() else {
                violations.push(PlanViolation::UnknownStepType {
                    ordinal,
                    step_type: step.step_type.clone(),
                });
                continue;
            };

            if family.requires_target()
                && step.target.as_deref().map(str::trim).filter(|t| !t.is_empty()).is_none()
            {
                violations.push(PlanViolation::MissingTarget {
                    ordinal,
                    step_type: step.step_type.clone(),
                });
            }

            if !step.inputs.is_object() {
                violations.push(PlanViolation::InputsNotObject { ordinal });
            }

            if family == StepFamily::CredentialsRead {
                let has_reason = step
                    .inputs
                    .get("reason")
                    .and_then(|value| value.as_str())
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .is_some();
                if !has_reason {
                    violations.push(PlanViolation::CredentialReadWithoutReason { ordinal });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FailurePolicy, Plan, PlanStep, PlanViolation};

    fn step(step_type: &str, target: Option<&str>) -> PlanStep {
        PlanStep {
            name: None,
            step_type: step_type.to_string(),
            target: target.map(str::to_string),
            action: None,
            inputs: json!({}),
            estimated_duration_ms: None,
        }
    }

    #[test]
    fn valid_plan_passes_shape_check() {
        let plan = Plan {
            name: Some("restart web tier".to_string()),
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: FailurePolicy::Halt,
            steps: vec![
                step("asset-query", None),
                step("command", Some("server-01")),
                step("check", None),
            ],
        };

        assert!(plan.validate().is_ok());
    }

    #[test]
    fn empty_plan_is_rejected() {
        let plan = Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: FailurePolicy::default(),
            steps: vec![],
        };

        assert_eq!(plan.validate().unwrap_err(), vec![PlanViolation::Empty]);
    }

    #[test]
    fn unknown_step_type_is_rejected_with_ordinal() {
        let plan = Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: FailurePolicy::default(),
            steps: vec![step("asset-query", None), step("teleport", None)],
        };

        let violations = plan.validate().unwrap_err();
        assert_eq!(
            violations,
            vec![PlanViolation::UnknownStepType { ordinal: 1, step_type: "teleport".to_string() }]
        );
    }

    #[test]
    fn command_without_target_is_rejected() {
        let plan = Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: FailurePolicy::default(),
            steps: vec![step("shell", None)],
        };

        let violations = plan.validate().unwrap_err();
        assert!(matches!(violations[0], PlanViolation::MissingTarget { ordinal: 0, .. }));
    }

    #[test]
    fn credential_read_requires_a_reason() {
        let mut bare = step("credentials-read", None);
        bare.inputs = json!({ "asset_id": "a-1" });
        let plan = Plan {
            name: None,
            requires_approval: false,
            risk_flags: vec![],
            failure_policy: FailurePolicy::default(),
            steps: vec![bare],
        };
        assert!(matches!(
            plan.validate().unwrap_err()[0],
            PlanViolation::CredentialReadWithoutReason { ordinal: 0 }
        ));

        let mut with_reason = step("credentials-read", None);
        with_reason.inputs = json!({ "asset_id": "a-1", "reason": "rotate service account" });
        let plan = Plan { steps: vec![with_reason], ..plan };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn plan_deserialises_from_submitted_json() {
        let value = json!({
            "name": "disk check",
            "failure_policy": "continue",
            "steps": [
                { "type": "asset-query", "inputs": { "mode": "count" } },
                { "type": "command", "target": "db-02", "action": "df", "inputs": {} }
            ]
        });

        let plan = Plan::from_value(&value).expect("plan should deserialise");
        assert_eq!(plan.failure_policy, FailurePolicy::Continue);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].target.as_deref(), Some("db-02"));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let plan = Plan {
            name: Some("p".to_string()),
            requires_approval: true,
            risk_flags: vec!["maintenance-window".to_string()],
            failure_policy: FailurePolicy::Halt,
            steps: vec![step("api", None)],
        };

        let snapshot = plan.to_snapshot();
        let restored = Plan::from_value(&snapshot).expect("snapshot should round trip");
        assert_eq!(restored, plan);
    }
}
