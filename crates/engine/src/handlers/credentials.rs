use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{required_string_input, StepHandler, StepInvocation, StepOutput};
use crate::adapters::AssetService;

/// Gated credential retrieval. The reason is mandatory and forwarded to the
/// asset service's audit trail; the fetched value itself never appears in
/// the step output.
pub struct CredentialsReadHandler {
    assets: Arc<dyn AssetService>,
}

impl CredentialsReadHandler {
    pub fn new(assets: Arc<dyn AssetService>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl StepHandler for CredentialsReadHandler {
    fn family(&self) -> StepFamily {
        StepFamily::CredentialsRead
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let asset_id = invocation
            .inputs
            .get("asset_id")
            .and_then(|value| value.as_str())
            .or(invocation.step.target_ref.as_deref())
            .ok_or_else(|| EngineError::Validation {
                message: "credential read needs an `asset_id` input or a step target".to_string(),
            })?;
        let reason = required_string_input(&invocation.inputs, "reason")?;

        // Fetch proves access and audits it; the value is dropped here.
        let _credentials = self
            .assets
            .get_asset_credentials(&invocation.execution.tenant_id, asset_id, reason)
            .await?;

        Ok(StepOutput::new(json!({
            "retrieved": true,
            "asset_id": asset_id,
            "reason": reason,
        })))
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output.data.get("retrieved").and_then(|value| value.as_bool()) == Some(true)
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("credential read failed: {error}")
    }
}
