//! Step handler dispatch.
//!
//! One handler per step-type family, registered once at wiring time. The
//! executor resolves inputs and budgets, then hands the step to whichever
//! handler owns its family; adding a step type means adding a handler here,
//! not another branch in the executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fleetrun_core::domain::execution::Execution;
use fleetrun_core::domain::step::{Step, StepFamily};
use fleetrun_core::errors::EngineError;

use crate::adapters::EngineAdapters;

pub mod asset_query;
pub mod command;
pub mod credentials;
pub mod database;
pub mod file;
pub mod http;
pub mod validation;

pub use asset_query::AssetQueryHandler;
pub use command::CommandHandler;
pub use credentials::CredentialsReadHandler;
pub use database::DatabaseHandler;
pub use file::FileTransferHandler;
pub use http::HttpRequestHandler;
pub use validation::ValidationHandler;

/// One step, ready to run: inputs have secrets materialised and the deadline
/// is the remaining step budget.
pub struct StepInvocation<'a> {
    pub execution: &'a Execution,
    pub step: &'a Step,
    pub inputs: serde_json::Value,
    pub deadline: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepOutput {
    pub data: serde_json::Value,
}

impl StepOutput {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn family(&self) -> StepFamily;

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError>;

    /// Whether a clean return actually succeeded (exit codes, HTTP status,
    /// probe verdicts).
    fn check_success(&self, _output: &StepOutput) -> bool {
        true
    }

    /// Human-readable failure summary recorded on the step.
    fn describe_error(&self, error: &EngineError) -> String {
        error.to_string()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepFamily, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.family(), handler);
    }

    pub fn get(&self, family: StepFamily) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&family).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The full standard set, wired to the given upstream adapters.
    pub fn standard(adapters: &EngineAdapters) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(AssetQueryHandler::new(adapters.assets.clone())));
        registry.register(Arc::new(CommandHandler::new(
            adapters.assets.clone(),
            adapters.automation.clone(),
        )));
        registry.register(Arc::new(CredentialsReadHandler::new(adapters.assets.clone())));
        registry.register(Arc::new(DatabaseHandler::new(
            adapters.assets.clone(),
            adapters.automation.clone(),
        )));
        registry.register(Arc::new(FileTransferHandler::new(
            adapters.assets.clone(),
            adapters.automation.clone(),
        )));
        registry.register(Arc::new(HttpRequestHandler::new()));
        registry.register(Arc::new(ValidationHandler::new(
            adapters.assets.clone(),
            adapters.automation.clone(),
        )));
        registry
    }
}

pub(crate) fn required_string_input<'a>(
    inputs: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, EngineError> {
    inputs
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EngineError::Validation {
            message: format!("step inputs are missing required string `{key}`"),
        })
}
