pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{
    ApprovalRepository, CancellationFlag, CancellationRepository, DlqFilter, DlqRepository,
    ExecutionFilter, ExecutionRepository, EventRepository, FinishRecord, LockRepository,
    QueueRepository, RepositoryError, StepRepository, TimeoutPolicyRepository,
};
