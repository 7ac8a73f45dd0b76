use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{StepHandler, StepInvocation, StepOutput};
use crate::adapters::AssetService;

/// Read-only inventory lookups: `mode: "count"` returns just the total,
/// `mode: "list"` (the default) includes the matching assets.
pub struct AssetQueryHandler {
    assets: Arc<dyn AssetService>,
}

impl AssetQueryHandler {
    pub fn new(assets: Arc<dyn AssetService>) -> Self {
        Self { assets }
    }
}

#[async_trait]
impl StepHandler for AssetQueryHandler {
    fn family(&self) -> StepFamily {
        StepFamily::AssetQuery
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let mode = invocation
            .inputs
            .get("mode")
            .and_then(|value| value.as_str())
            .unwrap_or("list");
        let filters = invocation
            .inputs
            .get("filters")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let assets =
            self.assets.query_assets(&invocation.execution.tenant_id, &filters).await?;

        let data = match mode {
            "count" => json!({ "total_count": assets.len() }),
            _ => json!({
                "total_count": assets.len(),
                "assets": assets
                    .iter()
                    .map(|asset| json!({
                        "id": asset.id,
                        "hostname": asset.hostname,
                        "os": asset.os,
                    }))
                    .collect::<Vec<_>>(),
            }),
        };

        Ok(StepOutput::new(data))
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("asset query failed: {error}")
    }
}
