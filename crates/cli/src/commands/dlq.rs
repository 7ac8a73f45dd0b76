use chrono::Utc;
use uuid::Uuid;

use fleetrun_core::config::{AppConfig, LoadOptions};
use fleetrun_core::domain::context::TenantId;
use fleetrun_core::domain::queue::{DlqItemId, QueueItem, QueueItemId};
use fleetrun_db::repositories::{
    DlqFilter, DlqRepository, ExecutionRepository, SqlDlqRepository, SqlExecutionRepository,
};
use fleetrun_db::{connect_with_settings, DbPool};

use crate::commands::{block_on, CommandResult};

async fn open_pool(config: &AppConfig) -> Result<DbPool, (&'static str, String, u8)> {
    connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))
}

fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub fn run_list(tenant: Option<String>, include_archived: bool, limit: u32) -> CommandResult {
    let config = match load_config("dlq list") {
        Ok(config) => config,
        Err(result) => return result,
    };

    let result = block_on(async {
        let pool = open_pool(&config).await?;
        let repo = SqlDlqRepository::new(pool.clone());
        let items = repo
            .query(&DlqFilter {
                tenant_id: tenant.map(TenantId),
                include_archived,
                limit: limit.clamp(1, 1_000),
            })
            .await
            .map_err(|error| ("dlq_query", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(items)
    });

    match result {
        Ok(Ok(items)) => {
            let rendered = serde_json::to_string_pretty(&items)
                .unwrap_or_else(|error| format!("[] // serialization failed: {error}"));
            CommandResult { exit_code: 0, output: rendered }
        }
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("dlq list", error_class, message, exit_code)
        }
        Err(message) => CommandResult::failure("dlq list", "runtime_init", message, 3),
    }
}

pub fn run_requeue(id: String) -> CommandResult {
    let config = match load_config("dlq requeue") {
        Ok(config) => config,
        Err(result) => return result,
    };

    let result = block_on(async {
        let pool = open_pool(&config).await?;
        let dlq = SqlDlqRepository::new(pool.clone());
        let executions = SqlExecutionRepository::new(pool.clone());

        let dlq_id = DlqItemId(id.clone());
        let item = dlq
            .find(&dlq_id)
            .await
            .map_err(|error| ("dlq_query", error.to_string(), 6u8))?
            .ok_or_else(|| ("not_found", format!("dead-letter item `{id}` not found"), 7u8))?;

        let execution = executions
            .find_by_id(&item.execution_id)
            .await
            .map_err(|error| ("execution_query", error.to_string(), 6u8))?
            .ok_or_else(|| {
                ("not_found", format!("execution `{}` not found", item.execution_id.0), 7u8)
            })?;

        if execution.status.is_terminal() {
            return Err((
                "illegal_state",
                format!(
                    "execution `{}` already finished as `{}`; submit the plan again instead",
                    execution.id.0,
                    execution.status.as_str()
                ),
                8u8,
            ));
        }

        let now = Utc::now();
        dlq.requeue(
            &dlq_id,
            QueueItem {
                id: QueueItemId(Uuid::new_v4().to_string()),
                execution_id: execution.id.clone(),
                tenant_id: execution.tenant_id.clone(),
                sla_class: execution.sla_class,
                priority: execution.sla_class.priority(),
                available_at: now,
                leased_by: None,
                lease_expires_at: None,
                attempts: 0,
                max_attempts: config.engine.max_attempts_for(execution.sla_class),
                created_at: now,
            },
        )
        .await
        .map_err(|error| ("dlq_requeue", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<String, (&'static str, String, u8)>(execution.id.0)
    });

    match result {
        Ok(Ok(execution_id)) => CommandResult::success(
            "dlq requeue",
            format!("requeued dead-letter item `{id}` for execution `{execution_id}`"),
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("dlq requeue", error_class, message, exit_code)
        }
        Err(message) => CommandResult::failure("dlq requeue", "runtime_init", message, 3),
    }
}

pub fn run_archive(id: String) -> CommandResult {
    let config = match load_config("dlq archive") {
        Ok(config) => config,
        Err(result) => return result,
    };

    let result = block_on(async {
        let pool = open_pool(&config).await?;
        let dlq = SqlDlqRepository::new(pool.clone());
        dlq.archive(&DlqItemId(id.clone()))
            .await
            .map_err(|error| ("dlq_archive", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(Ok(())) => {
            CommandResult::success("dlq archive", format!("archived dead-letter item `{id}`"))
        }
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("dlq archive", error_class, message, exit_code)
        }
        Err(message) => CommandResult::failure("dlq archive", "runtime_init", message, 3),
    }
}
