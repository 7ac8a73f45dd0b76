use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::execution::{ActionClass, SlaClass};
use fleetrun_core::domain::policy::{default_matrix, TimeoutPolicy};

use super::{RepositoryError, TimeoutPolicyRepository};
use crate::DbPool;

pub struct SqlTimeoutPolicyRepository {
    pool: DbPool,
}

impl SqlTimeoutPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TimeoutPolicyRepository for SqlTimeoutPolicyRepository {
    async fn lookup(
        &self,
        sla_class: SlaClass,
        action_class: ActionClass,
    ) -> Result<Option<TimeoutPolicy>, RepositoryError> {
        let row = sqlx::query(
            "SELECT sla_class, action_class, execution_timeout_ms, step_timeout_ms
             FROM timeout_policy
             WHERE sla_class = ? AND action_class = ?",
        )
        .bind(sla_class.as_str())
        .bind(action_class.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(policy_from_row).transpose()
    }

    async fn seed_defaults(&self) -> Result<u64, RepositoryError> {
        let mut inserted = 0;
        for cell in default_matrix() {
            let result = sqlx::query(
                "INSERT INTO timeout_policy
                    (sla_class, action_class, execution_timeout_ms, step_timeout_ms)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(sla_class, action_class) DO NOTHING",
            )
            .bind(cell.sla_class.as_str())
            .bind(cell.action_class.as_str())
            .bind(cell.execution_timeout_ms as i64)
            .bind(cell.step_timeout_ms as i64)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

fn policy_from_row(row: SqliteRow) -> Result<TimeoutPolicy, RepositoryError> {
    let sla_raw = row.try_get::<String, _>("sla_class")?;
    let sla_class = SlaClass::parse(&sla_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sla class `{sla_raw}`")))?;

    let action_raw = row.try_get::<String, _>("action_class")?;
    let action_class = ActionClass::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action class `{action_raw}`")))?;

    let execution_timeout_ms = row.try_get::<i64, _>("execution_timeout_ms")?;
    let step_timeout_ms = row.try_get::<i64, _>("step_timeout_ms")?;

    Ok(TimeoutPolicy {
        sla_class,
        action_class,
        execution_timeout_ms: execution_timeout_ms.max(0) as u64,
        step_timeout_ms: step_timeout_ms.max(0) as u64,
    })
}
