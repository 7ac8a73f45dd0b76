pub mod metrics;
pub mod progress;
pub mod stream;

pub use metrics::{MetricsService, MetricsSnapshot, StepDurationStats};
pub use progress::{ExecutionProgress, ProgressService};
pub use stream::EventStream;
