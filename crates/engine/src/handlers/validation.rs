use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{StepHandler, StepInvocation, StepOutput};
use crate::adapters::{AssetService, AutomationService, CommandRequest};

/// Predicate-returning probes. With a target and a `command`, the probe runs
/// remotely and passes on exit code zero; without one, `expected` is
/// compared against `actual` locally.
pub struct ValidationHandler {
    assets: Arc<dyn AssetService>,
    automation: Arc<dyn AutomationService>,
}

impl ValidationHandler {
    pub fn new(assets: Arc<dyn AssetService>, automation: Arc<dyn AutomationService>) -> Self {
        Self { assets, automation }
    }
}

#[async_trait]
impl StepHandler for ValidationHandler {
    fn family(&self) -> StepFamily {
        StepFamily::Validation
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let remote_probe = invocation
            .step
            .target_ref
            .as_deref()
            .zip(invocation.inputs.get("command").and_then(|value| value.as_str()));

        if let Some((target_ref, command)) = remote_probe {
            let asset =
                self.assets.get_asset(&invocation.execution.tenant_id, target_ref).await?;
            let result = self
                .automation
                .execute_command(CommandRequest {
                    connection_type: asset.os.connection_type(),
                    target: asset,
                    command: command.to_string(),
                    credentials: None,
                    deadline: invocation.deadline,
                })
                .await?;

            let passed = result.exit_code == 0;
            return Ok(StepOutput::new(json!({
                "passed": passed,
                "detail": if passed { result.stdout } else { result.stderr },
            })));
        }

        let expected = invocation.inputs.get("expected");
        let actual = invocation.inputs.get("actual");
        match (expected, actual) {
            (Some(expected), Some(actual)) => {
                let passed = expected == actual;
                Ok(StepOutput::new(json!({
                    "passed": passed,
                    "detail": if passed {
                        "values match".to_string()
                    } else {
                        format!("expected {expected}, got {actual}")
                    },
                })))
            }
            _ => Err(EngineError::Validation {
                message:
                    "validation step needs either a target with `command`, or `expected` and \
                     `actual` inputs"
                        .to_string(),
            }),
        }
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output.data.get("passed").and_then(|value| value.as_bool()) == Some(true)
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("validation probe failed: {error}")
    }
}
