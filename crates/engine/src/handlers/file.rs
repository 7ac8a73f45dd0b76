use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{required_string_input, StepHandler, StepInvocation, StepOutput};
use crate::adapters::{
    AssetService, AutomationService, AutomationStatus, WorkflowRequest, WorkflowStep,
};

/// File push/pull against a target asset, carried as a `file_transfer`
/// workflow part on the automation service.
pub struct FileTransferHandler {
    assets: Arc<dyn AssetService>,
    automation: Arc<dyn AutomationService>,
}

impl FileTransferHandler {
    pub fn new(assets: Arc<dyn AssetService>, automation: Arc<dyn AutomationService>) -> Self {
        Self { assets, automation }
    }
}

#[async_trait]
impl StepHandler for FileTransferHandler {
    fn family(&self) -> StepFamily {
        StepFamily::FileTransfer
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let target_ref =
            invocation.step.target_ref.as_deref().ok_or_else(|| EngineError::Validation {
                message: "file transfer step has no target".to_string(),
            })?;
        let source = required_string_input(&invocation.inputs, "source")?;
        let destination = required_string_input(&invocation.inputs, "destination")?;
        let direction = invocation
            .inputs
            .get("direction")
            .and_then(|value| value.as_str())
            .unwrap_or("push");
        if direction != "push" && direction != "pull" {
            return Err(EngineError::Validation {
                message: format!("file transfer direction must be push|pull, got `{direction}`"),
            });
        }

        let asset =
            self.assets.get_asset(&invocation.execution.tenant_id, target_ref).await?;

        let credentials = invocation
            .inputs
            .get("credentials")
            .and_then(|value| value.as_str())
            .map(|value| secrecy::SecretString::from(value.to_string()));

        let execution = self
            .automation
            .execute_workflow(WorkflowRequest {
                target: Some(asset.clone()),
                steps: vec![WorkflowStep {
                    kind: "file_transfer".to_string(),
                    payload: json!({
                        "source": source,
                        "destination": destination,
                        "direction": direction,
                    }),
                }],
                credentials,
                deadline: invocation.deadline,
            })
            .await?;

        Ok(StepOutput::new(json!({
            "hostname": asset.hostname,
            "direction": direction,
            "automation_execution_id": execution.id,
            "status": execution.status,
        })))
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output.data.get("status").and_then(|value| value.as_str())
            == Some(AutomationStatus::Succeeded.as_str())
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("file transfer failed: {error}")
    }
}
