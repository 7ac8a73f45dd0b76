// Re-export chrono for downstream crates that need DateTime types
pub use chrono;

pub mod audit;
pub mod classify;
pub mod config;
pub mod domain;
pub mod errors;
pub mod idempotency;
pub mod masking;
pub mod plan;
pub mod progress;
pub mod rbac;
pub mod secrets;

pub use audit::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, MaskingAuditSink,
    TracingAuditSink,
};
pub use domain::approval::{Approval, ApprovalId, ApprovalState};
pub use domain::context::{ActorId, RequestContext, TenantId};
pub use domain::event::{EventKind, EventSeverity, ExecutionEvent};
pub use domain::execution::{
    ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
};
pub use domain::lock::{AssetLock, LockKey};
pub use domain::policy::{default_matrix, max_execution_timeout_ms, TimeoutPolicy};
pub use domain::queue::{DlqItem, DlqItemId, QueueItem, QueueItemId};
pub use domain::step::{Step, StepFamily, StepId, StepStatus};
pub use errors::{AdapterFamily, EngineError};
pub use masking::{Masker, MaskingWriter, DEFAULT_DENYLIST, REDACTED};
pub use plan::{FailurePolicy, Plan, PlanStep, PlanViolation};
pub use progress::ProgressSnapshot;
pub use rbac::{AccessDenial, Permission};
pub use secrets::SecretRefError;
