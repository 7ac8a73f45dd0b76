pub mod adapters;
pub mod approvals;
pub mod cancel;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod observe;
pub mod reaper;
pub mod router;
pub mod service;
pub mod stores;
pub mod worker;

pub use adapters::{
    Asset, AssetOs, AssetService, AutomationService, ConnectionType, DirectoryUser,
    EngineAdapters, RbacDirectory, SecretStore,
};
pub use approvals::ApprovalService;
pub use cancel::{CancelOutcome, CancellationService};
pub use events::EventRecorder;
pub use executor::{ExecutionOutcome, ExecutorCore};
pub use handlers::{HandlerRegistry, StepHandler, StepInvocation, StepOutput};
pub use observe::{EventStream, ExecutionProgress, MetricsService, MetricsSnapshot,
    ProgressService, StepDurationStats};
pub use reaper::{ReapReport, Reaper};
pub use router::{ExecuteOutcome, Router};
pub use service::Engine;
pub use stores::{store_error, EngineStores};
pub use worker::{Worker, WorkerDeps, WorkerPool, WorkerPoolHandle, WorkerPoolStatus};
