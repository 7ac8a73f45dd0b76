use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
use fleetrun_core::domain::execution::ExecutionId;

use super::codec::{parse_optional_timestamp, parse_timestamp};
use super::{ApprovalRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn create(&self, approval: Approval) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approval (
                id, execution_id, required_role, state, decided_by, decided_at, reason, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&approval.id.0)
        .bind(&approval.execution_id.0)
        .bind(&approval.required_role)
        .bind(approval.state.as_str())
        .bind(approval.decided_by.as_deref())
        .bind(approval.decided_at.map(|value| value.to_rfc3339()))
        .bind(approval.reason.as_deref())
        .bind(approval.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, execution_id, required_role, state, decided_by, decided_at, reason,
                    created_at
             FROM approval
             WHERE execution_id = ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(&execution_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(approval_from_row).transpose()
    }

    async fn decide(
        &self,
        id: &ApprovalId,
        state: ApprovalState,
        decided_by: &str,
        reason: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval
             SET state = ?, decided_by = ?, decided_at = ?, reason = ?
             WHERE id = ? AND state = 'pending'",
        )
        .bind(state.as_str())
        .bind(decided_by)
        .bind(decided_at.to_rfc3339())
        .bind(reason)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT state FROM approval WHERE id = ?")
                    .bind(&id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            return match current {
                None => Err(RepositoryError::NotFound { entity: "approval", id: id.0.clone() }),
                Some(from) => Err(RepositoryError::IllegalTransition {
                    entity: "approval",
                    from,
                    to: state.as_str().to_string(),
                }),
            };
        }
        Ok(())
    }
}

fn approval_from_row(row: SqliteRow) -> Result<Approval, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = ApprovalState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval state `{state_raw}`")))?;

    Ok(Approval {
        id: ApprovalId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        required_role: row.try_get("required_role")?,
        state,
        decided_by: row.try_get("decided_by")?,
        decided_at: parse_optional_timestamp("decided_at", row.try_get("decided_at")?)?,
        reason: row.try_get("reason")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use fleetrun_core::domain::approval::{Approval, ApprovalId, ApprovalState};
    use fleetrun_core::domain::context::{ActorId, TenantId};
    use fleetrun_core::domain::execution::{
        ActionClass, Execution, ExecutionId, ExecutionMode, ExecutionStatus, SlaClass,
    };

    use super::SqlApprovalRepository;
    use crate::repositories::{
        ApprovalRepository, ExecutionRepository, RepositoryError, SqlExecutionRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_execution(pool: &DbPool, id: &str) -> ExecutionId {
        let now = Utc::now();
        let execution = Execution {
            id: ExecutionId(id.to_string()),
            tenant_id: TenantId("t-1".to_string()),
            actor_id: ActorId("u-ops".to_string()),
            idempotency_key: format!("key-{id}"),
            plan_snapshot: json!({ "steps": [] }),
            status: ExecutionStatus::AwaitingApproval,
            mode: ExecutionMode::Background,
            sla_class: SlaClass::Medium,
            action_class: ActionClass::Provisioning,
            timed_out: false,
            cancelled_by: None,
            cancelled_at: None,
            ended_at: None,
            error_class: None,
            error_message: None,
            output: None,
            created_at: now,
            updated_at: now,
        };
        SqlExecutionRepository::new(pool.clone()).create(execution).await.expect("execution");
        ExecutionId(id.to_string())
    }

    fn pending_approval(execution_id: &ExecutionId) -> Approval {
        Approval {
            id: ApprovalId("appr-1".to_string()),
            execution_id: execution_id.clone(),
            required_role: "change-manager".to_string(),
            state: ApprovalState::Pending,
            decided_by: None,
            decided_at: None,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn approval_round_trips_and_decides_once() {
        let pool = setup_pool().await;
        let execution_id = insert_execution(&pool, "exec-1").await;
        let repo = SqlApprovalRepository::new(pool.clone());

        let approval = pending_approval(&execution_id);
        repo.create(approval.clone()).await.expect("create");

        let found =
            repo.find_by_execution(&execution_id).await.expect("find").expect("approval exists");
        assert_eq!(found.state, ApprovalState::Pending);
        assert_eq!(found.required_role, "change-manager");

        repo.decide(&approval.id, ApprovalState::Approved, "u-cm", Some("window open"), Utc::now())
            .await
            .expect("decide");

        let decided = repo.find_by_execution(&execution_id).await.expect("find").expect("exists");
        assert_eq!(decided.state, ApprovalState::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("u-cm"));
        assert!(decided.decided_at.is_some());

        // second decision is rejected
        let error = repo
            .decide(&approval.id, ApprovalState::Rejected, "u-other", None, Utc::now())
            .await
            .expect_err("second decision");
        assert!(matches!(error, RepositoryError::IllegalTransition { .. }));

        pool.close().await;
    }

    #[tokio::test]
    async fn deciding_a_missing_approval_is_not_found() {
        let pool = setup_pool().await;
        let repo = SqlApprovalRepository::new(pool.clone());

        let error = repo
            .decide(
                &ApprovalId("missing".to_string()),
                ApprovalState::Approved,
                "u-cm",
                None,
                Utc::now(),
            )
            .await
            .expect_err("missing approval");
        assert!(matches!(error, RepositoryError::NotFound { .. }));

        pool.close().await;
    }
}
