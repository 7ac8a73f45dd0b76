use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use fleetrun_core::config::UpstreamConfig;
use fleetrun_core::domain::context::TenantId;
use fleetrun_core::errors::EngineError;

use super::SecretStore;

/// HTTP client for the secret store. Fetched values go straight into
/// `SecretString` and are never logged; resolution failures carry the path,
/// never the value.
pub struct HttpSecretStore {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpSecretStore {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(upstream.request_timeout_secs))
            .build()
            .map_err(|error| EngineError::SecretResolution {
                path: "<client>".to_string(),
                message: error.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: upstream.secrets_base_url.trim_end_matches('/').to_string(),
            api_token: upstream.api_token.clone(),
        })
    }
}

#[derive(Deserialize)]
struct SecretResponse {
    value: String,
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn get(&self, tenant_id: &TenantId, path: &str) -> Result<SecretString, EngineError> {
        let url = format!("{}/api/v1/secrets/{path}", self.base_url);
        let mut builder = self.client.get(&url).header("x-tenant-id", &tenant_id.0);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(|error| EngineError::SecretResolution {
            path: path.to_string(),
            message: error.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(EngineError::SecretResolution {
                path: path.to_string(),
                message: format!("secret store returned {}", response.status()),
            });
        }

        let body =
            response.json::<SecretResponse>().await.map_err(|error| {
                EngineError::SecretResolution { path: path.to_string(), message: error.to_string() }
            })?;
        Ok(SecretString::from(body.value))
    }
}
