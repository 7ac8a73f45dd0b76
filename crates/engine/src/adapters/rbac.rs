use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use fleetrun_core::config::UpstreamConfig;
use fleetrun_core::domain::context::{ActorId, TenantId};
use fleetrun_core::errors::{AdapterFamily, EngineError};
use fleetrun_core::rbac::Permission;

use super::{DirectoryUser, RbacDirectory};

/// HTTP client for the user/permission directory. The engine never caches
/// answers; revocations must be visible at the next check.
pub struct HttpRbacDirectory {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpRbacDirectory {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(upstream.request_timeout_secs))
            .build()
            .map_err(|error| adapter_error(error.to_string()))?;

        Ok(Self {
            client,
            base_url: upstream.rbac_base_url.trim_end_matches('/').to_string(),
            api_token: upstream.api_token.clone(),
        })
    }

    fn authorised(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

fn adapter_error(message: String) -> EngineError {
    EngineError::Adapter { family: AdapterFamily::Rbac, message }
}

#[derive(Deserialize)]
struct PermissionCheckResponse {
    allowed: bool,
}

#[async_trait]
impl RbacDirectory for HttpRbacDirectory {
    async fn get_user(&self, actor_id: &ActorId) -> Result<DirectoryUser, EngineError> {
        let url = format!("{}/api/v1/users/{}", self.base_url, actor_id.0);
        let response = self
            .authorised(self.client.get(&url))
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::Permission {
                message: format!("actor `{}` is unknown to the directory", actor_id.0),
            });
        }
        if !response.status().is_success() {
            return Err(adapter_error(format!("user lookup returned {}", response.status())));
        }

        response.json::<DirectoryUser>().await.map_err(|error| adapter_error(error.to_string()))
    }

    async fn check_permission(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
        permission: Permission,
    ) -> Result<bool, EngineError> {
        let url = format!("{}/api/v1/permissions/check", self.base_url);
        let response = self
            .authorised(self.client.post(&url))
            .json(&serde_json::json!({
                "tenant_id": tenant_id.0,
                "actor_id": actor_id.0,
                "permission": permission.as_str(),
            }))
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!(
                "permission check returned {}",
                response.status()
            )));
        }

        let body = response
            .json::<PermissionCheckResponse>()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;
        Ok(body.allowed)
    }
}
