use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::json;

use fleetrun_core::domain::step::StepFamily;
use fleetrun_core::errors::EngineError;

use super::{required_string_input, StepHandler, StepInvocation, StepOutput};
use crate::adapters::{AssetService, AutomationService, CommandRequest};

/// Remote command execution. Connection type follows the target's OS; any
/// credential arrives pre-resolved in the inputs and goes to the automation
/// service without being recorded.
pub struct CommandHandler {
    assets: Arc<dyn AssetService>,
    automation: Arc<dyn AutomationService>,
}

impl CommandHandler {
    pub fn new(assets: Arc<dyn AssetService>, automation: Arc<dyn AutomationService>) -> Self {
        Self { assets, automation }
    }
}

#[async_trait]
impl StepHandler for CommandHandler {
    fn family(&self) -> StepFamily {
        StepFamily::Command
    }

    async fn invoke(&self, invocation: StepInvocation<'_>) -> Result<StepOutput, EngineError> {
        let target_ref =
            invocation.step.target_ref.as_deref().ok_or_else(|| EngineError::Validation {
                message: "command step has no target".to_string(),
            })?;
        let command = required_string_input(&invocation.inputs, "command")?;
        let credentials = invocation
            .inputs
            .get("credentials")
            .and_then(|value| value.as_str())
            .map(|value| SecretString::from(value.to_string()));

        let asset =
            self.assets.get_asset(&invocation.execution.tenant_id, target_ref).await?;
        let connection_type = asset.os.connection_type();

        let result = self
            .automation
            .execute_command(CommandRequest {
                target: asset.clone(),
                command: command.to_string(),
                connection_type,
                credentials,
                deadline: invocation.deadline,
            })
            .await?;

        Ok(StepOutput::new(json!({
            "hostname": asset.hostname,
            "connection_type": connection_type.as_str(),
            "exit_code": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "duration_ms": result.duration_ms,
        })))
    }

    fn check_success(&self, output: &StepOutput) -> bool {
        output.data.get("exit_code").and_then(|value| value.as_i64()) == Some(0)
    }

    fn describe_error(&self, error: &EngineError) -> String {
        format!("remote command failed: {error}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use fleetrun_core::domain::context::{ActorId, TenantId};
    use fleetrun_core::domain::execution::{
        ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
    };
    use fleetrun_core::domain::step::{Step, StepFamily, StepId, StepStatus};

    use super::CommandHandler;
    use crate::adapters::{
        Asset, AssetOs, InMemoryAssetService, InMemoryAutomationService,
    };
    use crate::handlers::{StepHandler, StepInvocation};

    fn execution() -> Execution {
        let now = Utc::now();
        Execution {
            id: ExecutionId("exec-1".to_string()),
            tenant_id: TenantId("t-1".to_string()),
            actor_id: ActorId("u-ops".to_string()),
            idempotency_key: "key".to_string(),
            plan_snapshot: json!({}),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Immediate,
            sla_class: SlaClass::Fast,
            action_class: ActionClass::Operational,
            timed_out: false,
            cancelled_by: None,
            cancelled_at: None,
            ended_at: None,
            error_class: None,
            error_message: None,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn step(target: &str, inputs: serde_json::Value) -> Step {
        Step {
            id: StepId("step-1".to_string()),
            execution_id: ExecutionId("exec-1".to_string()),
            ordinal: 0,
            family: StepFamily::Command,
            step_type: "shell".to_string(),
            target_ref: Some(target.to_string()),
            action: Some("restart".to_string()),
            inputs,
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            timed_out: false,
            attempts: 1,
            output: None,
            error_class: None,
            error_message: None,
        }
    }

    fn linux_asset(hostname: &str) -> Asset {
        Asset {
            id: format!("a-{hostname}"),
            hostname: hostname.to_string(),
            os: AssetOs::Linux,
            tenant_id: TenantId("t-1".to_string()),
        }
    }

    #[tokio::test]
    async fn runs_the_command_over_the_os_derived_connection() {
        let assets = Arc::new(InMemoryAssetService::with_assets(vec![linux_asset("server-01")]));
        let automation = Arc::new(InMemoryAutomationService::default());
        let handler = CommandHandler::new(assets, automation.clone());

        let execution = execution();
        let inputs = json!({ "command": "systemctl restart nginx", "credentials": "ssh-key" });
        let step = step("server-01", inputs.clone());

        let output = handler
            .invoke(StepInvocation {
                execution: &execution,
                step: &step,
                inputs,
                deadline: Duration::from_secs(5),
            })
            .await
            .expect("invoke");

        assert!(handler.check_success(&output));
        assert_eq!(output.data["connection_type"], "ssh");

        let recorded = automation.recorded_commands();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].hostname, "server-01");
        assert_eq!(recorded[0].connection_type, "ssh");
        assert!(recorded[0].had_credentials);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_not_success() {
        let assets = Arc::new(InMemoryAssetService::with_assets(vec![linux_asset("server-02")]));
        let automation = Arc::new(InMemoryAutomationService::default());
        automation.fail_on("server-02");
        let handler = CommandHandler::new(assets, automation);

        let execution = execution();
        let inputs = json!({ "command": "false" });
        let step = step("server-02", inputs.clone());

        let output = handler
            .invoke(StepInvocation {
                execution: &execution,
                step: &step,
                inputs,
                deadline: Duration::from_secs(5),
            })
            .await
            .expect("invoke");

        assert!(!handler.check_success(&output));
        assert_eq!(output.data["exit_code"], 1);
    }

    #[tokio::test]
    async fn missing_command_input_is_a_validation_error() {
        let assets = Arc::new(InMemoryAssetService::with_assets(vec![linux_asset("server-01")]));
        let automation = Arc::new(InMemoryAutomationService::default());
        let handler = CommandHandler::new(assets, automation);

        let execution = execution();
        let inputs = json!({});
        let step = step("server-01", inputs.clone());

        let error = handler
            .invoke(StepInvocation {
                execution: &execution,
                step: &step,
                inputs,
                deadline: Duration::from_secs(5),
            })
            .await
            .expect_err("missing command");
        assert_eq!(error.error_class(), "ValidationError");
    }
}
