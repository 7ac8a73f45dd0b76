//! In-memory fakes for every upstream service. Tests seed them, point the
//! engine at them, and assert on the recorded calls.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use fleetrun_core::domain::context::{ActorId, TenantId};
use fleetrun_core::errors::{AdapterFamily, EngineError};
use fleetrun_core::rbac::Permission;

use super::{
    Asset, AssetService, AutomationExecution, AutomationService, AutomationStatus, CommandRequest,
    CommandResult, DirectoryUser, RbacDirectory, SecretStore, WorkflowRequest,
};

fn lock_poisoned() -> EngineError {
    EngineError::StoreUnavailable { message: "fake adapter lock poisoned".to_string() }
}

#[derive(Default)]
pub struct InMemoryAssetService {
    assets: Mutex<Vec<Asset>>,
    credentials: Mutex<HashMap<String, String>>,
    calls: Mutex<u64>,
}

impl InMemoryAssetService {
    pub fn with_assets(assets: Vec<Asset>) -> Self {
        Self {
            assets: Mutex::new(assets),
            credentials: Mutex::new(HashMap::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn add_credentials(&self, asset_id: &str, value: &str) {
        if let Ok(mut credentials) = self.credentials.lock() {
            credentials.insert(asset_id.to_string(), value.to_string());
        }
    }

    /// Total service calls, for asserting that idempotency cache hits do not
    /// reach the asset service again.
    pub fn call_count(&self) -> u64 {
        self.calls.lock().map(|calls| *calls).unwrap_or(0)
    }

    fn bump(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
    }
}

#[async_trait]
impl AssetService for InMemoryAssetService {
    async fn get_asset(
        &self,
        tenant_id: &TenantId,
        reference: &str,
    ) -> Result<Asset, EngineError> {
        self.bump();
        let assets = self.assets.lock().map_err(|_| lock_poisoned())?;
        assets
            .iter()
            .find(|asset| {
                asset.tenant_id == *tenant_id
                    && (asset.id == reference || asset.hostname == reference)
            })
            .cloned()
            .ok_or_else(|| EngineError::Adapter {
                family: AdapterFamily::Asset,
                message: format!("asset `{reference}` not found"),
            })
    }

    async fn query_assets(
        &self,
        tenant_id: &TenantId,
        filters: &serde_json::Value,
    ) -> Result<Vec<Asset>, EngineError> {
        self.bump();
        let assets = self.assets.lock().map_err(|_| lock_poisoned())?;
        let needle = filters.get("hostname_contains").and_then(|value| value.as_str());
        Ok(assets
            .iter()
            .filter(|asset| asset.tenant_id == *tenant_id)
            .filter(|asset| needle.map_or(true, |needle| asset.hostname.contains(needle)))
            .cloned()
            .collect())
    }

    async fn get_asset_credentials(
        &self,
        _tenant_id: &TenantId,
        asset_id: &str,
        _reason: &str,
    ) -> Result<SecretString, EngineError> {
        self.bump();
        let credentials = self.credentials.lock().map_err(|_| lock_poisoned())?;
        credentials.get(asset_id).map(|value| SecretString::from(value.clone())).ok_or_else(|| {
            EngineError::Adapter {
                family: AdapterFamily::Asset,
                message: format!("no credentials for asset `{asset_id}`"),
            }
        })
    }
}

/// Recorded remote command, with any credential material reduced to a
/// presence flag so tests cannot accidentally persist a secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCommand {
    pub hostname: String,
    pub command: String,
    pub connection_type: &'static str,
    pub had_credentials: bool,
}

#[derive(Default)]
pub struct InMemoryAutomationService {
    commands: Mutex<Vec<RecordedCommand>>,
    fail_hosts: Mutex<HashSet<String>>,
    hang_hosts: Mutex<HashSet<String>>,
    workflows: Mutex<Vec<Vec<super::WorkflowStep>>>,
}

impl InMemoryAutomationService {
    /// Commands against this host return exit code 1.
    pub fn fail_on(&self, hostname: &str) {
        if let Ok(mut hosts) = self.fail_hosts.lock() {
            hosts.insert(hostname.to_string());
        }
    }

    /// Commands against this host sleep past any reasonable step budget.
    pub fn hang_on(&self, hostname: &str) {
        if let Ok(mut hosts) = self.hang_hosts.lock() {
            hosts.insert(hostname.to_string());
        }
    }

    pub fn recorded_commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().map(|commands| commands.clone()).unwrap_or_default()
    }

    pub fn recorded_workflows(&self) -> Vec<Vec<super::WorkflowStep>> {
        self.workflows.lock().map(|workflows| workflows.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AutomationService for InMemoryAutomationService {
    async fn execute_command(
        &self,
        request: CommandRequest,
    ) -> Result<CommandResult, EngineError> {
        let hang = self
            .hang_hosts
            .lock()
            .map(|hosts| hosts.contains(&request.target.hostname))
            .unwrap_or(false);
        if hang {
            // Sleep far beyond the caller's deadline; the executor's timeout
            // race is expected to win.
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }

        {
            let mut commands = self.commands.lock().map_err(|_| lock_poisoned())?;
            commands.push(RecordedCommand {
                hostname: request.target.hostname.clone(),
                command: request.command.clone(),
                connection_type: request.connection_type.as_str(),
                had_credentials: request.credentials.is_some(),
            });
        }

        let fail = self
            .fail_hosts
            .lock()
            .map(|hosts| hosts.contains(&request.target.hostname))
            .unwrap_or(false);

        if fail {
            Ok(CommandResult {
                stdout: String::new(),
                stderr: format!("command failed on {}", request.target.hostname),
                exit_code: 1,
                duration_ms: 5,
            })
        } else {
            Ok(CommandResult {
                stdout: format!("ok: {}", request.command),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 5,
            })
        }
    }

    async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> Result<AutomationExecution, EngineError> {
        let mut workflows = self.workflows.lock().map_err(|_| lock_poisoned())?;
        workflows.push(request.steps.clone());
        Ok(AutomationExecution {
            id: format!("wf-{}", workflows.len()),
            status: AutomationStatus::Succeeded,
            result: Some(serde_json::json!({ "steps_completed": request.steps.len() })),
        })
    }

    async fn get_execution(&self, id: &str) -> Result<AutomationExecution, EngineError> {
        Ok(AutomationExecution {
            id: id.to_string(),
            status: AutomationStatus::Succeeded,
            result: None,
        })
    }
}

#[derive(Default)]
pub struct InMemorySecretStore {
    values: Mutex<HashMap<String, String>>,
    accessed: Mutex<Vec<String>>,
}

impl InMemorySecretStore {
    pub fn with_secrets(entries: &[(&str, &str)]) -> Self {
        let values = entries
            .iter()
            .map(|(path, value)| (path.to_string(), value.to_string()))
            .collect();
        Self { values: Mutex::new(values), accessed: Mutex::new(Vec::new()) }
    }

    pub fn accessed_paths(&self) -> Vec<String> {
        self.accessed.lock().map(|accessed| accessed.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, _tenant_id: &TenantId, path: &str) -> Result<SecretString, EngineError> {
        if let Ok(mut accessed) = self.accessed.lock() {
            accessed.push(path.to_string());
        }
        let values = self.values.lock().map_err(|_| lock_poisoned())?;
        values.get(path).map(|value| SecretString::from(value.clone())).ok_or_else(|| {
            EngineError::SecretResolution {
                path: path.to_string(),
                message: "unknown secret path".to_string(),
            }
        })
    }
}

#[derive(Default)]
pub struct InMemoryRbacDirectory {
    users: Mutex<HashMap<String, DirectoryUser>>,
    grants: Mutex<HashSet<(String, String, Permission)>>,
}

impl InMemoryRbacDirectory {
    pub fn add_user(&self, user: DirectoryUser) {
        if let Ok(mut users) = self.users.lock() {
            users.insert(user.id.clone(), user);
        }
    }

    pub fn grant(&self, tenant_id: &TenantId, actor_id: &ActorId, permission: Permission) {
        if let Ok(mut grants) = self.grants.lock() {
            grants.insert((tenant_id.0.clone(), actor_id.0.clone(), permission));
        }
    }

    pub fn revoke(&self, tenant_id: &TenantId, actor_id: &ActorId, permission: Permission) {
        if let Ok(mut grants) = self.grants.lock() {
            grants.remove(&(tenant_id.0.clone(), actor_id.0.clone(), permission));
        }
    }
}

#[async_trait]
impl RbacDirectory for InMemoryRbacDirectory {
    async fn get_user(&self, actor_id: &ActorId) -> Result<DirectoryUser, EngineError> {
        let users = self.users.lock().map_err(|_| lock_poisoned())?;
        users.get(&actor_id.0).cloned().ok_or_else(|| EngineError::Permission {
            message: format!("actor `{}` is unknown to the directory", actor_id.0),
        })
    }

    async fn check_permission(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
        permission: Permission,
    ) -> Result<bool, EngineError> {
        let grants = self.grants.lock().map_err(|_| lock_poisoned())?;
        Ok(grants.contains(&(tenant_id.0.clone(), actor_id.0.clone(), permission)))
    }
}
