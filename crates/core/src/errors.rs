use thiserror::Error;

use crate::domain::execution::ExecutionId;

/// Family tag for upstream adapter failures, so operators can tell a broken
/// SSH path from a broken HTTP endpoint without reading messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterFamily {
    Asset,
    Automation,
    SecretStore,
    Rbac,
    Http,
    Database,
}

impl AdapterFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Automation => "automation",
            Self::SecretStore => "secret_store",
            Self::Rbac => "rbac",
            Self::Http => "http",
            Self::Database => "database",
        }
    }
}

/// The engine-wide failure taxonomy. Every externally visible failure maps to
/// exactly one of these classes; the class string is stable API surface.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("plan validation failed: {message}")]
    Validation { message: String },
    #[error("permission denied: {message}")]
    Permission { message: String },
    #[error("tenant mismatch: actor tenant `{actual}` cannot act in tenant `{expected}`")]
    TenantMismatch { expected: String, actual: String },
    #[error("duplicate submission under idempotency key `{idempotency_key}`")]
    DuplicateIdempotencyKey { tenant_id: String, idempotency_key: String },
    #[error("resource busy: `{lock_key}` held by execution `{owner}`")]
    ResourceBusy { lock_key: String, owner: String },
    #[error("execution `{}` is awaiting approval", .0.0)]
    ApprovalRequired(ExecutionId),
    #[error("approval for execution `{}` was rejected: {reason}", execution_id.0)]
    ApprovalRejected { execution_id: ExecutionId, reason: String },
    #[error("execution `{}` was cancelled", .0.0)]
    Cancelled(ExecutionId),
    #[error("{scope} exceeded its {budget_ms}ms budget")]
    Timeout { scope: String, budget_ms: u64 },
    #[error("{} adapter failed: {message}", family.as_str())]
    Adapter { family: AdapterFamily, message: String },
    #[error("secret resolution failed for `{path}`: {message}")]
    SecretResolution { path: String, message: String },
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("illegal state transition `{from}` -> `{to}`")]
    IllegalStateTransition { from: String, to: String },
    #[error("queue is full")]
    QueueFull,
}

impl EngineError {
    /// Stable class code carried in API error bodies and audit events.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Permission { .. } => "PermissionError",
            Self::TenantMismatch { .. } => "TenantMismatch",
            Self::DuplicateIdempotencyKey { .. } => "DuplicateIdempotencyKey",
            Self::ResourceBusy { .. } => "ResourceBusyError",
            Self::ApprovalRequired(_) => "ApprovalRequired",
            Self::ApprovalRejected { .. } => "ApprovalRejected",
            Self::Cancelled(_) => "Cancelled",
            Self::Timeout { .. } => "TimeoutError",
            Self::Adapter { .. } => "AdapterError",
            Self::SecretResolution { .. } => "SecretResolutionError",
            Self::StoreUnavailable { .. } => "StoreUnavailable",
            Self::IllegalStateTransition { .. } => "IllegalStateTransition",
            Self::QueueFull => "QueueFull",
        }
    }

    /// Message safe for external responses: no internal detail, no secret
    /// material. Full detail stays in audit events behind RBAC.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation { message } => format!("The submitted plan is invalid: {message}"),
            Self::Permission { .. } | Self::TenantMismatch { .. } => {
                "You are not permitted to perform this operation.".to_string()
            }
            Self::DuplicateIdempotencyKey { .. } => {
                "An identical submission already exists.".to_string()
            }
            Self::ResourceBusy { owner, .. } => {
                format!("The target asset is busy with execution `{owner}`. Retry later.")
            }
            Self::ApprovalRequired(_) => {
                "This plan requires approval before it can run.".to_string()
            }
            Self::ApprovalRejected { reason, .. } => {
                format!("The approval request was rejected: {reason}")
            }
            Self::Cancelled(_) => "The execution was cancelled.".to_string(),
            Self::Timeout { .. } => "The operation exceeded its time budget.".to_string(),
            Self::Adapter { .. } => {
                "An upstream service failed while carrying out a step.".to_string()
            }
            Self::SecretResolution { .. } => {
                "A required credential could not be resolved.".to_string()
            }
            Self::StoreUnavailable { .. } | Self::QueueFull => {
                "The service is temporarily unavailable. Please retry shortly.".to_string()
            }
            Self::IllegalStateTransition { .. } => {
                "The execution is not in a state that allows this operation.".to_string()
            }
        }
    }

    /// Whether a background attempt that hit this error should be retried.
    /// Adapter, store, timeout, and contention failures are retryable until
    /// the attempt budget runs out; everything identity- or shape-related is
    /// terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Adapter { .. }
                | Self::StoreUnavailable { .. }
                | Self::Timeout { .. }
                | Self::ResourceBusy { .. }
                | Self::QueueFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{AdapterFamily, EngineError};
    use crate::domain::execution::ExecutionId;

    #[test]
    fn every_variant_has_a_stable_class_code() {
        let cases: Vec<(EngineError, &str)> = vec![
            (EngineError::Validation { message: "x".into() }, "ValidationError"),
            (EngineError::Permission { message: "x".into() }, "PermissionError"),
            (
                EngineError::TenantMismatch { expected: "a".into(), actual: "b".into() },
                "TenantMismatch",
            ),
            (
                EngineError::DuplicateIdempotencyKey {
                    tenant_id: "t".into(),
                    idempotency_key: "k".into(),
                },
                "DuplicateIdempotencyKey",
            ),
            (
                EngineError::ResourceBusy { lock_key: "v1:t:a:x".into(), owner: "e".into() },
                "ResourceBusyError",
            ),
            (EngineError::ApprovalRequired(ExecutionId("e".into())), "ApprovalRequired"),
            (
                EngineError::ApprovalRejected {
                    execution_id: ExecutionId("e".into()),
                    reason: "no".into(),
                },
                "ApprovalRejected",
            ),
            (EngineError::Cancelled(ExecutionId("e".into())), "Cancelled"),
            (EngineError::Timeout { scope: "step".into(), budget_ms: 5 }, "TimeoutError"),
            (
                EngineError::Adapter { family: AdapterFamily::Automation, message: "x".into() },
                "AdapterError",
            ),
            (
                EngineError::SecretResolution { path: "p".into(), message: "x".into() },
                "SecretResolutionError",
            ),
            (EngineError::StoreUnavailable { message: "x".into() }, "StoreUnavailable"),
            (
                EngineError::IllegalStateTransition {
                    from: "succeeded".into(),
                    to: "running".into(),
                },
                "IllegalStateTransition",
            ),
            (EngineError::QueueFull, "QueueFull"),
        ];

        for (error, class) in cases {
            assert_eq!(error.error_class(), class);
        }
    }

    #[test]
    fn permission_failures_share_an_opaque_user_message() {
        let permission = EngineError::Permission { message: "lacks automation:deploy".into() };
        let mismatch = EngineError::TenantMismatch { expected: "a".into(), actual: "b".into() };

        assert_eq!(permission.user_message(), mismatch.user_message());
        assert!(!permission.user_message().contains("automation:deploy"));
    }

    #[test]
    fn retry_classification_follows_the_deny_list() {
        assert!(EngineError::Adapter { family: AdapterFamily::Http, message: "503".into() }
            .is_retryable());
        assert!(EngineError::StoreUnavailable { message: "locked".into() }.is_retryable());
        assert!(EngineError::Timeout { scope: "step".into(), budget_ms: 1 }.is_retryable());
        assert!(EngineError::ResourceBusy { lock_key: "k".into(), owner: "o".into() }
            .is_retryable());

        assert!(!EngineError::Permission { message: "x".into() }.is_retryable());
        assert!(!EngineError::TenantMismatch { expected: "a".into(), actual: "b".into() }
            .is_retryable());
        assert!(!EngineError::Validation { message: "x".into() }.is_retryable());
        assert!(!EngineError::SecretResolution { path: "p".into(), message: "x".into() }
            .is_retryable());
    }
}
