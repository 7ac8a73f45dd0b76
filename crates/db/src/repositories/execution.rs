use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::context::{ActorId, TenantId};
use fleetrun_core::domain::execution::{
    ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
};
use fleetrun_core::domain::step::{Step, StepFamily, StepId, StepStatus};

use super::codec::{
    parse_json, parse_optional_json, parse_optional_timestamp, parse_timestamp, parse_u32,
};
use super::{
    ExecutionFilter, ExecutionRepository, FinishRecord, RepositoryError, StepRepository,
};
use crate::DbPool;

const EXECUTION_COLUMNS: &str = "id, tenant_id, actor_id, idempotency_key, plan_json, status, \
     mode, sla_class, action_class, timed_out, cancelled_by, cancelled_at, ended_at, \
     error_class, error_message, output_json, created_at, updated_at";

pub struct SqlExecutionRepository {
    pool: DbPool,
}

impl SqlExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn current_status(&self, id: &ExecutionId) -> Result<String, RepositoryError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM execution WHERE id = ?")
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;
        status.ok_or_else(|| RepositoryError::NotFound { entity: "execution", id: id.0.clone() })
    }
}

#[async_trait::async_trait]
impl ExecutionRepository for SqlExecutionRepository {
    async fn create(&self, execution: Execution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO execution (
                id, tenant_id, actor_id, idempotency_key, plan_json, status, mode,
                sla_class, action_class, timed_out, cancelled_by, cancelled_at, ended_at,
                error_class, error_message, output_json, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id.0)
        .bind(&execution.tenant_id.0)
        .bind(&execution.actor_id.0)
        .bind(&execution.idempotency_key)
        .bind(execution.plan_snapshot.to_string())
        .bind(execution.status.as_str())
        .bind(execution.mode.as_str())
        .bind(execution.sla_class.as_str())
        .bind(execution.action_class.as_str())
        .bind(i64::from(execution.timed_out))
        .bind(execution.cancelled_by.as_deref())
        .bind(execution.cancelled_at.map(|value| value.to_rfc3339()))
        .bind(execution.ended_at.map(|value| value.to_rfc3339()))
        .bind(execution.error_class.as_deref())
        .bind(execution.error_message.as_deref())
        .bind(execution.output.as_ref().map(|value| value.to_string()))
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                Err(RepositoryError::DuplicateIdempotencyKey {
                    tenant_id: execution.tenant_id.0,
                    idempotency_key: execution.idempotency_key,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM execution WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(execution_from_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &str,
        not_before: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution
             WHERE tenant_id = ? AND idempotency_key = ? AND created_at >= ?
             ORDER BY created_at DESC
             LIMIT 1",
        ))
        .bind(&tenant_id.0)
        .bind(idempotency_key)
        .bind(not_before.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(execution_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(to) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        let result = sqlx::query(
            "UPDATE execution SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.current_status(id).await?;
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: actual,
                to: to.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        cancelled_by: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(ExecutionStatus::Cancelled) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: ExecutionStatus::Cancelled.as_str().to_string(),
            });
        }

        let result = sqlx::query(
            "UPDATE execution
             SET status = 'cancelled', cancelled_by = ?, cancelled_at = ?, ended_at = ?,
                 updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(cancelled_by)
        .bind(cancelled_at.to_rfc3339())
        .bind(cancelled_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.current_status(id).await?;
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: actual,
                to: ExecutionStatus::Cancelled.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn mark_finished(
        &self,
        id: &ExecutionId,
        from: ExecutionStatus,
        record: &FinishRecord,
    ) -> Result<(), RepositoryError> {
        if !from.can_transition_to(record.status) {
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: from.as_str().to_string(),
                to: record.status.as_str().to_string(),
            });
        }

        let result = sqlx::query(
            "UPDATE execution
             SET status = ?, timed_out = ?, error_class = ?, error_message = ?,
                 output_json = ?, ended_at = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(record.status.as_str())
        .bind(i64::from(record.timed_out))
        .bind(record.error_class.as_deref())
        .bind(record.error_message.as_deref())
        .bind(record.output.as_ref().map(|value| value.to_string()))
        .bind(record.ended_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.current_status(id).await?;
            return Err(RepositoryError::IllegalTransition {
                entity: "execution",
                from: actual,
                to: record.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, RepositoryError> {
        let mut sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution WHERE tenant_id = ?"
        );
        if filter.actor_id.is_some() {
            sql.push_str(" AND actor_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.sla_class.is_some() {
            sql.push_str(" AND sla_class = ?");
        }
        if filter.created_after.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.created_before.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(&filter.tenant_id.0);
        if let Some(actor_id) = &filter.actor_id {
            query = query.bind(&actor_id.0);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(sla_class) = filter.sla_class {
            query = query.bind(sla_class.as_str());
        }
        if let Some(created_after) = filter.created_after {
            query = query.bind(created_after.to_rfc3339());
        }
        if let Some(created_before) = filter.created_before {
            query = query.bind(created_before.to_rfc3339());
        }
        query = query.bind(i64::from(filter.limit.clamp(1, 1_000)));

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(execution_from_row).collect()
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution
             WHERE status = ? ORDER BY created_at ASC LIMIT ?",
        ))
        .bind(status.as_str())
        .bind(i64::from(limit.clamp(1, 10_000)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn count_by_status(&self, status: ExecutionStatus) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM execution WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

pub struct SqlStepRepository {
    pool: DbPool,
}

impl SqlStepRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StepRepository for SqlStepRepository {
    async fn insert_all(&self, steps: &[Step]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                "INSERT INTO execution_step (
                    id, execution_id, ordinal, family, step_type, target_ref, action,
                    inputs_json, status, started_at, ended_at, timed_out, attempts,
                    output_json, error_class, error_message
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&step.execution_id.0)
            .bind(i64::from(step.ordinal))
            .bind(step.family.as_str())
            .bind(&step.step_type)
            .bind(step.target_ref.as_deref())
            .bind(step.action.as_deref())
            .bind(step.inputs.to_string())
            .bind(step.status.as_str())
            .bind(step.started_at.map(|value| value.to_rfc3339()))
            .bind(step.ended_at.map(|value| value.to_rfc3339()))
            .bind(i64::from(step.timed_out))
            .bind(i64::from(step.attempts))
            .bind(step.output.as_ref().map(|value| value.to_string()))
            .bind(step.error_class.as_deref())
            .bind(step.error_message.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, execution_id, ordinal, family, step_type, target_ref, action,
                    inputs_json, status, started_at, ended_at, timed_out, attempts,
                    output_json, error_class, error_message
             FROM execution_step
             WHERE execution_id = ?
             ORDER BY ordinal ASC",
        )
        .bind(&execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(step_from_row).collect()
    }

    async fn update(&self, step: &Step) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE execution_step
             SET status = ?, started_at = ?, ended_at = ?, timed_out = ?, attempts = ?,
                 output_json = ?, error_class = ?, error_message = ?
             WHERE id = ?",
        )
        .bind(step.status.as_str())
        .bind(step.started_at.map(|value| value.to_rfc3339()))
        .bind(step.ended_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(step.timed_out))
        .bind(i64::from(step.attempts))
        .bind(step.output.as_ref().map(|value| value.to_string()))
        .bind(step.error_class.as_deref())
        .bind(step.error_message.as_deref())
        .bind(&step.id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_durations(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(StepFamily, i64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT family, started_at, ended_at
             FROM execution_step
             WHERE ended_at IS NOT NULL AND started_at IS NOT NULL AND ended_at >= ?",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut durations = Vec::with_capacity(rows.len());
        for row in rows {
            let family_raw = row.try_get::<String, _>("family")?;
            let family = StepFamily::parse(&family_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown step family `{family_raw}`"))
            })?;
            let started = parse_timestamp("started_at", row.try_get("started_at")?)?;
            let ended = parse_timestamp("ended_at", row.try_get("ended_at")?)?;
            durations.push((family, (ended - started).num_milliseconds()));
        }
        Ok(durations)
    }
}

fn execution_from_row(row: SqliteRow) -> Result<Execution, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ExecutionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown execution status `{status_raw}`"))
    })?;

    let mode_raw = row.try_get::<String, _>("mode")?;
    let mode = ExecutionMode::parse(&mode_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown execution mode `{mode_raw}`")))?;

    let sla_raw = row.try_get::<String, _>("sla_class")?;
    let sla_class = SlaClass::parse(&sla_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sla class `{sla_raw}`")))?;

    let action_raw = row.try_get::<String, _>("action_class")?;
    let action_class = ActionClass::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action class `{action_raw}`")))?;

    Ok(Execution {
        id: ExecutionId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        actor_id: ActorId(row.try_get("actor_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        plan_snapshot: parse_json("plan_json", row.try_get("plan_json")?)?,
        status,
        mode,
        sla_class,
        action_class,
        timed_out: row.try_get::<i64, _>("timed_out")? != 0,
        cancelled_by: row.try_get("cancelled_by")?,
        cancelled_at: parse_optional_timestamp("cancelled_at", row.try_get("cancelled_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
        output: parse_optional_json("output_json", row.try_get("output_json")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn step_from_row(row: SqliteRow) -> Result<Step, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = StepStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status_raw}`")))?;

    let family_raw = row.try_get::<String, _>("family")?;
    let family = StepFamily::parse(&family_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step family `{family_raw}`")))?;

    Ok(Step {
        id: StepId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        ordinal: parse_u32("ordinal", row.try_get("ordinal")?)?,
        family,
        step_type: row.try_get("step_type")?,
        target_ref: row.try_get("target_ref")?,
        action: row.try_get("action")?,
        inputs: parse_json("inputs_json", row.try_get("inputs_json")?)?,
        status,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        ended_at: parse_optional_timestamp("ended_at", row.try_get("ended_at")?)?,
        timed_out: row.try_get::<i64, _>("timed_out")? != 0,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        output: parse_optional_json("output_json", row.try_get("output_json")?)?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
    })
}
