//! Boundaries to the platform services the engine consumes: asset inventory,
//! automation transport, secret store, and the RBAC directory. Each is a
//! trait with an HTTP implementation for production and an in-memory fake
//! for tests.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use fleetrun_core::domain::context::{ActorId, TenantId};
use fleetrun_core::errors::EngineError;
use fleetrun_core::rbac::Permission;

pub mod asset;
pub mod automation;
pub mod memory;
pub mod rbac;
pub mod secrets;

pub use asset::HttpAssetService;
pub use automation::HttpAutomationService;
pub use memory::{
    InMemoryAssetService, InMemoryAutomationService, InMemoryRbacDirectory, InMemorySecretStore,
};
pub use rbac::HttpRbacDirectory;
pub use secrets::HttpSecretStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOs {
    Linux,
    Windows,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ssh,
    Winrm,
    Local,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Winrm => "winrm",
            Self::Local => "local",
        }
    }
}

impl AssetOs {
    /// How the automation service reaches a host of this OS.
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Linux => ConnectionType::Ssh,
            Self::Windows => ConnectionType::Winrm,
            Self::Other => ConnectionType::Local,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub hostname: String,
    pub os: AssetOs,
    pub tenant_id: TenantId,
}

pub struct CommandRequest {
    pub target: Asset,
    pub command: String,
    pub connection_type: ConnectionType,
    pub credentials: Option<SecretString>,
    pub deadline: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub kind: String,
    pub payload: serde_json::Value,
}

pub struct WorkflowRequest {
    pub target: Option<Asset>,
    pub steps: Vec<WorkflowStep>,
    pub credentials: Option<SecretString>,
    pub deadline: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutomationExecution {
    pub id: String,
    pub status: AutomationStatus,
    pub result: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Running,
    Succeeded,
    Failed,
}

impl AutomationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// The four upstream boundaries, bundled for wiring.
#[derive(Clone)]
pub struct EngineAdapters {
    pub assets: std::sync::Arc<dyn AssetService>,
    pub automation: std::sync::Arc<dyn AutomationService>,
    pub secrets: std::sync::Arc<dyn SecretStore>,
    pub rbac: std::sync::Arc<dyn RbacDirectory>,
}

impl EngineAdapters {
    pub fn http(upstream: &fleetrun_core::config::UpstreamConfig) -> Result<Self, EngineError> {
        Ok(Self {
            assets: std::sync::Arc::new(HttpAssetService::new(upstream)?),
            automation: std::sync::Arc::new(HttpAutomationService::new(upstream)?),
            secrets: std::sync::Arc::new(HttpSecretStore::new(upstream)?),
            rbac: std::sync::Arc::new(HttpRbacDirectory::new(upstream)?),
        })
    }
}

#[async_trait]
pub trait AssetService: Send + Sync {
    /// Resolve an asset by id or hostname, tenant-scoped.
    async fn get_asset(&self, tenant_id: &TenantId, reference: &str)
        -> Result<Asset, EngineError>;

    async fn query_assets(
        &self,
        tenant_id: &TenantId,
        filters: &serde_json::Value,
    ) -> Result<Vec<Asset>, EngineError>;

    /// Gated: callers must supply an explicit reason, which the asset
    /// service records.
    async fn get_asset_credentials(
        &self,
        tenant_id: &TenantId,
        asset_id: &str,
        reason: &str,
    ) -> Result<SecretString, EngineError>;
}

#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn execute_command(&self, request: CommandRequest)
        -> Result<CommandResult, EngineError>;

    /// Kick off a multi-part job (SQL, file transfer); returns a handle that
    /// `get_execution` polls to completion.
    async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> Result<AutomationExecution, EngineError>;

    async fn get_execution(&self, id: &str) -> Result<AutomationExecution, EngineError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, tenant_id: &TenantId, path: &str) -> Result<SecretString, EngineError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: String,
    pub tenant_id: TenantId,
    pub roles: Vec<String>,
}

#[async_trait]
pub trait RbacDirectory: Send + Sync {
    async fn get_user(&self, actor_id: &ActorId) -> Result<DirectoryUser, EngineError>;

    async fn check_permission(
        &self,
        tenant_id: &TenantId,
        actor_id: &ActorId,
        permission: Permission,
    ) -> Result<bool, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::{AssetOs, ConnectionType};

    #[test]
    fn connection_type_follows_target_os() {
        assert_eq!(AssetOs::Linux.connection_type(), ConnectionType::Ssh);
        assert_eq!(AssetOs::Windows.connection_type(), ConnectionType::Winrm);
        assert_eq!(AssetOs::Other.connection_type(), ConnectionType::Local);
    }
}
