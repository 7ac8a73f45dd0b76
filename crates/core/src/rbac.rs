//! Permission mapping for plan steps.
//!
//! The directory that answers "does this actor hold this permission" is an
//! external service; what lives here is the deterministic mapping from step
//! risk to required permission, and the tenant gate that runs before any
//! permission question is even asked.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::context::TenantId;
use crate::domain::execution::ActionClass;
use crate::plan::Plan;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    AssetRead,
    AutomationExecute,
    AutomationDeploy,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetRead => "asset:read",
            Self::AutomationExecute => "automation:execute",
            Self::AutomationDeploy => "automation:deploy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "asset:read" => Some(Self::AssetRead),
            "automation:execute" => Some(Self::AutomationExecute),
            "automation:deploy" => Some(Self::AutomationDeploy),
            _ => None,
        }
    }
}

/// Permission required for a step of the given risk category.
pub fn required_permission(action_class: ActionClass) -> Permission {
    match action_class {
        ActionClass::Information => Permission::AssetRead,
        ActionClass::Diagnostic | ActionClass::Operational => Permission::AutomationExecute,
        ActionClass::Provisioning => Permission::AutomationDeploy,
    }
}

/// Distinct permissions a plan needs, one per step risk category present.
pub fn plan_permissions(plan: &Plan) -> BTreeSet<Permission> {
    plan.steps
        .iter()
        .map(|step| required_permission(crate::classify::step_action_class(step)))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessDenial {
    TenantMismatch { expected: String, actual: String },
    MissingPermission { permission: String },
}

impl AccessDenial {
    pub fn reason(&self) -> String {
        match self {
            Self::TenantMismatch { expected, actual } => {
                format!("actor tenant `{actual}` does not match execution tenant `{expected}`")
            }
            Self::MissingPermission { permission } => {
                format!("actor lacks required permission `{permission}`")
            }
        }
    }
}

/// Tenant isolation gate. Runs before any permission lookup; a mismatch is a
/// hard denial regardless of what the directory would say.
pub fn check_tenant(expected: &TenantId, actual: &TenantId) -> Result<(), AccessDenial> {
    if expected == actual {
        Ok(())
    } else {
        Err(AccessDenial::TenantMismatch {
            expected: expected.0.clone(),
            actual: actual.0.clone(),
        })
    }
}
