use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{required_string_input, StepHandler, StepInvocation, StepOutput};
use crate::adapters::{
    AssetService, AutomationService, AutomationStatus, WorkflowRequest, WorkflowStep,
};

/// SQL steps ride the automation service's workflow channel: submit a
/// single `sql` part, then the adapter polls the handle to completion
/// within the step budget.
pub struct DatabaseHandler {
    assets: Arc<dyn AssetService>,
    automation: Arc<dyn AutomationService>,
}

impl DatabaseHandler {
    pub fn new(assets: Arc<dyn AssetService>, automation: Arc<dyn AutomationService>) -> Self {
        Self { assets, automation }
    }
}

#[async_trait]
impl StepHandler for DatabaseHandler {
    fn family(&self) -> StepFamily {
        StepFamily::Database
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let query = required_string_input(&invocation.inputs, "query")?;
        let database = invocation.inputs.get("database").and_then(|value| value.as_str());

        let target = match invocation.step.target_ref.as_deref() {
            Some(reference) => {
                Some(self.assets.get_asset(&invocation.execution.tenant_id, reference).await?)
            }
            None => None,
        };

        let credentials = invocation
            .inputs
            .get("credentials")
            .and_then(|value| value.as_str())
            .map(|value| secrecy::SecretString::from(value.to_string()));

        let execution = self
            .automation
            .execute_workflow(WorkflowRequest {
                target,
                steps: vec![WorkflowStep {
                    kind: "sql".to_string(),
                    payload: json!({ "query": query, "database": database }),
                }],
                credentials,
                deadline: invocation.deadline,
            })
            .await?;

        Ok(StepOutput::new(json!({
            "automation_execution_id": execution.id,
            "status": execution.status,
            "result": execution.result,
        })))
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output.data.get("status").and_then(|value| value.as_str())
            == Some(AutomationStatus::Succeeded.as_str())
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("database query failed: {error}")
    }
}
