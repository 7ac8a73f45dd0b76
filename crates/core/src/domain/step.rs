use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::{ActionClass, ExecutionId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Handler family a step dispatches to. Each family accepts several aliases
/// in submitted plans; new behaviour is added by registering a handler for a
/// family, not by branching at call sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFamily {
    Command,
    Http,
    Database,
    FileTransfer,
    Validation,
    AssetQuery,
    CredentialsRead,
}

impl StepFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Http => "http",
            Self::Database => "database",
            Self::FileTransfer => "file_transfer",
            Self::Validation => "validation",
            Self::AssetQuery => "asset_query",
            Self::CredentialsRead => "credentials_read",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "command" => Some(Self::Command),
            "http" => Some(Self::Http),
            "database" => Some(Self::Database),
            "file_transfer" => Some(Self::FileTransfer),
            "validation" => Some(Self::Validation),
            "asset_query" => Some(Self::AssetQuery),
            "credentials_read" => Some(Self::CredentialsRead),
            _ => None,
        }
    }

    /// Resolve a plan-supplied step type, including accepted aliases.
    pub fn from_alias(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "command" | "shell" | "script" | "powershell" => Some(Self::Command),
            "api" | "http" | "rest" => Some(Self::Http),
            "database" | "sql" => Some(Self::Database),
            "file" | "copy" | "transfer" => Some(Self::FileTransfer),
            "validation" | "check" | "verify" => Some(Self::Validation),
            "asset-query" | "asset-list" => Some(Self::AssetQuery),
            "credentials-read" => Some(Self::CredentialsRead),
            _ => None,
        }
    }

    /// Baseline risk category for a step of this family. Individual actions
    /// can elevate this (see `classify`).
    pub fn base_action_class(&self) -> ActionClass {
        match self {
            Self::AssetQuery | Self::CredentialsRead => ActionClass::Information,
            Self::Validation => ActionClass::Diagnostic,
            Self::Command | Self::Http | Self::Database | Self::FileTransfer => {
                ActionClass::Operational
            }
        }
    }

    /// Whether a step of this family needs a concrete target asset.
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Command | Self::Database | Self::FileTransfer)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub execution_id: ExecutionId,
    pub ordinal: u32,
    pub family: StepFamily,
    /// Raw step type as submitted, retained for audit (e.g. `powershell`).
    pub step_type: String,
    pub target_ref: Option<String>,
    pub action: Option<String>,
    /// Inputs carry secret references only, never secret values.
    pub inputs: serde_json::Value,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
}

impl Step {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(started), Some(ended)) => Some((ended - started).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StepFamily, StepStatus};
    use crate::domain::execution::ActionClass;

    #[test]
    fn step_status_round_trips_from_storage_encoding() {
        let cases = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
        ];

        for status in cases {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn families_resolve_their_aliases() {
        for alias in ["command", "shell", "script", "powershell"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::Command));
        }
        for alias in ["api", "http", "rest"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::Http));
        }
        for alias in ["database", "sql"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::Database));
        }
        for alias in ["file", "copy", "transfer"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::FileTransfer));
        }
        for alias in ["validation", "check", "verify"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::Validation));
        }
        for alias in ["asset-query", "asset-list"] {
            assert_eq!(StepFamily::from_alias(alias), Some(StepFamily::AssetQuery));
        }
        assert_eq!(StepFamily::from_alias("credentials-read"), Some(StepFamily::CredentialsRead));
        assert_eq!(StepFamily::from_alias("teleport"), None);
    }

    #[test]
    fn read_only_families_classify_as_information() {
        assert_eq!(StepFamily::AssetQuery.base_action_class(), ActionClass::Information);
        assert_eq!(StepFamily::Validation.base_action_class(), ActionClass::Diagnostic);
        assert_eq!(StepFamily::Command.base_action_class(), ActionClass::Operational);
    }

    #[test]
    fn remote_families_require_a_target() {
        assert!(StepFamily::Command.requires_target());
        assert!(StepFamily::FileTransfer.requires_target());
        assert!(!StepFamily::AssetQuery.requires_target());
        assert!(!StepFamily::Http.requires_target());
    }
}
