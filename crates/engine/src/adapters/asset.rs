use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use fleetrun_core::config::UpstreamConfig;
use fleetrun_core::domain::context::TenantId;
use fleetrun_core::errors::{AdapterFamily, EngineError};

use super::{Asset, AssetService};

/// HTTP/JSON client for the asset inventory service.
pub struct HttpAssetService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpAssetService {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(upstream.request_timeout_secs))
            .build()
            .map_err(|error| adapter_error(error.to_string()))?;

        Ok(Self {
            client,
            base_url: upstream.asset_base_url.trim_end_matches('/').to_string(),
            api_token: upstream.api_token.clone(),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder, tenant_id: &TenantId) -> reqwest::RequestBuilder {
        let builder = builder.header("x-tenant-id", &tenant_id.0);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

fn adapter_error(message: String) -> EngineError {
    EngineError::Adapter { family: AdapterFamily::Asset, message }
}

#[derive(Deserialize)]
struct AssetListResponse {
    assets: Vec<Asset>,
}

#[derive(Deserialize)]
struct CredentialResponse {
    value: String,
}

#[async_trait]
impl AssetService for HttpAssetService {
    async fn get_asset(
        &self,
        tenant_id: &TenantId,
        reference: &str,
    ) -> Result<Asset, EngineError> {
        let url = format!("{}/api/v1/assets/{reference}", self.base_url);
        let response = self
            .request(self.client.get(&url), tenant_id)
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!(
                "asset lookup for `{reference}` returned {}",
                response.status()
            )));
        }

        response.json::<Asset>().await.map_err(|error| adapter_error(error.to_string()))
    }

    async fn query_assets(
        &self,
        tenant_id: &TenantId,
        filters: &serde_json::Value,
    ) -> Result<Vec<Asset>, EngineError> {
        let url = format!("{}/api/v1/assets/query", self.base_url);
        let response = self
            .request(self.client.post(&url), tenant_id)
            .json(filters)
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!("asset query returned {}", response.status())));
        }

        let body = response
            .json::<AssetListResponse>()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;
        Ok(body.assets)
    }

    async fn get_asset_credentials(
        &self,
        tenant_id: &TenantId,
        asset_id: &str,
        reason: &str,
    ) -> Result<SecretString, EngineError> {
        let url = format!("{}/api/v1/assets/{asset_id}/credentials", self.base_url);
        let response = self
            .request(self.client.post(&url), tenant_id)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!(
                "credential fetch for `{asset_id}` returned {}",
                response.status()
            )));
        }

        let body = response
            .json::<CredentialResponse>()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;
        Ok(SecretString::from(body.value))
    }
}
