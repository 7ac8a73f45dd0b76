use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use fleetrun_core::config::UpstreamConfig;
use fleetrun_core::errors::{AdapterFamily, EngineError};

use super::{
    AutomationExecution, AutomationService, AutomationStatus, CommandRequest, CommandResult,
    WorkflowRequest,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// HTTP/JSON client for the automation (remote execution) service. Commands
/// run synchronously up to the deadline; workflows return a handle that is
/// polled to completion.
pub struct HttpAutomationService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpAutomationService {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(upstream.request_timeout_secs))
            .build()
            .map_err(|error| adapter_error(error.to_string()))?;

        Ok(Self {
            client,
            base_url: upstream.automation_base_url.trim_end_matches('/').to_string(),
            api_token: upstream.api_token.clone(),
        })
    }

    fn authorised(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    /// Poll a workflow handle until it leaves `running` or the deadline
    /// lapses. The deadline is the caller's step budget; hitting it here
    /// surfaces as a step timeout upstream.
    async fn wait_for_completion(
        &self,
        mut execution: AutomationExecution,
        deadline: Duration,
    ) -> Result<AutomationExecution, EngineError> {
        let started = Instant::now();
        while execution.status == AutomationStatus::Running {
            if started.elapsed() >= deadline {
                return Err(EngineError::Timeout {
                    scope: format!("automation workflow `{}`", execution.id),
                    budget_ms: deadline.as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            execution = self.get_execution(&execution.id).await?;
        }
        Ok(execution)
    }
}

fn adapter_error(message: String) -> EngineError {
    EngineError::Adapter { family: AdapterFamily::Automation, message }
}

#[async_trait]
impl AutomationService for HttpAutomationService {
    async fn execute_command(
        &self,
        request: CommandRequest,
    ) -> Result<CommandResult, EngineError> {
        let url = format!("{}/api/v1/commands", self.base_url);
        let body = serde_json::json!({
            "target": request.target.hostname,
            "command": request.command,
            "connection_type": request.connection_type.as_str(),
            "credentials": request.credentials.as_ref().map(|secret| secret.expose_secret()),
            "timeout_ms": request.deadline.as_millis() as u64,
        });

        let response = self
            .authorised(self.client.post(&url))
            .header("x-tenant-id", &request.target.tenant_id.0)
            .json(&body)
            .timeout(request.deadline)
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!(
                "command on `{}` returned {}",
                request.target.hostname,
                response.status()
            )));
        }

        response.json::<CommandResult>().await.map_err(|error| adapter_error(error.to_string()))
    }

    async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> Result<AutomationExecution, EngineError> {
        let url = format!("{}/api/v1/workflows", self.base_url);
        let body = serde_json::json!({
            "target": request.target.as_ref().map(|asset| asset.hostname.clone()),
            "steps": request.steps,
            "credentials": request.credentials.as_ref().map(|secret| secret.expose_secret()),
            "timeout_ms": request.deadline.as_millis() as u64,
        });

        let response = self
            .authorised(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!("workflow submit returned {}", response.status())));
        }

        let execution = response
            .json::<AutomationExecution>()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        self.wait_for_completion(execution, request.deadline).await
    }

    async fn get_execution(&self, id: &str) -> Result<AutomationExecution, EngineError> {
        let url = format!("{}/api/v1/executions/{id}", self.base_url);
        let response = self
            .authorised(self.client.get(&url))
            .send()
            .await
            .map_err(|error| adapter_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(adapter_error(format!(
                "automation execution `{id}` returned {}",
                response.status()
            )));
        }

        response
            .json::<AutomationExecution>()
            .await
            .map_err(|error| adapter_error(error.to_string()))
    }
}
