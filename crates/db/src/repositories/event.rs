use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::event::{EventKind, EventSeverity, ExecutionEvent};
use fleetrun_core::domain::execution::ExecutionId;

use super::codec::{parse_json, parse_timestamp};
use super::{CancellationFlag, CancellationRepository, EventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEventRepository {
    pool: DbPool,
}

impl SqlEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EventRepository for SqlEventRepository {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: EventKind,
        severity: EventSeverity,
        payload: serde_json::Value,
    ) -> Result<ExecutionEvent, RepositoryError> {
        let ts = Utc::now();
        let row = sqlx::query(
            "INSERT INTO execution_event (execution_id, kind, severity, payload_json, ts)
             VALUES (?, ?, ?, ?, ?)
             RETURNING seq",
        )
        .bind(&execution_id.0)
        .bind(kind.as_str())
        .bind(severity.as_str())
        .bind(payload.to_string())
        .bind(ts.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(ExecutionEvent {
            seq: row.try_get("seq")?,
            execution_id: execution_id.clone(),
            kind,
            severity,
            payload,
            ts,
        })
    }

    async fn list_for_execution(
        &self,
        execution_id: &ExecutionId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT seq, execution_id, kind, severity, payload_json, ts
             FROM execution_event
             WHERE execution_id = ? AND seq > ?
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(&execution_id.0)
        .bind(after_seq)
        .bind(i64::from(limit.clamp(1, 1_000)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn list_recent(
        &self,
        kind: Option<EventKind>,
        limit: u32,
    ) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        let rows = if let Some(kind) = kind {
            sqlx::query(
                "SELECT seq, execution_id, kind, severity, payload_json, ts
                 FROM execution_event
                 WHERE kind = ?
                 ORDER BY seq DESC
                 LIMIT ?",
            )
            .bind(kind.as_str())
            .bind(i64::from(limit.clamp(1, 1_000)))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT seq, execution_id, kind, severity, payload_json, ts
                 FROM execution_event
                 ORDER BY seq DESC
                 LIMIT ?",
            )
            .bind(i64::from(limit.clamp(1, 1_000)))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(event_from_row).collect()
    }

    async fn count_since(
        &self,
        kind: EventKind,
        since: DateTime<Utc>,
    ) -> Result<i64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM execution_event WHERE kind = ? AND ts >= ?",
        )
        .bind(kind.as_str())
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn event_from_row(row: SqliteRow) -> Result<ExecutionEvent, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = EventKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event kind `{kind_raw}`")))?;

    let severity_raw = row.try_get::<String, _>("severity")?;
    let severity = EventSeverity::parse(&severity_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown event severity `{severity_raw}`"))
    })?;

    Ok(ExecutionEvent {
        seq: row.try_get("seq")?,
        execution_id: ExecutionId(row.try_get("execution_id")?),
        kind,
        severity,
        payload: parse_json("payload_json", row.try_get("payload_json")?)?,
        ts: parse_timestamp("ts", row.try_get("ts")?)?,
    })
}

pub struct SqlCancellationRepository {
    pool: DbPool,
}

impl SqlCancellationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CancellationRepository for SqlCancellationRepository {
    async fn set(&self, flag: CancellationFlag) -> Result<(), RepositoryError> {
        // First writer wins; a repeated cancel keeps the original requester.
        sqlx::query(
            "INSERT INTO cancellation_flag
                (execution_id, requested_by, reason, requested_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(execution_id) DO NOTHING",
        )
        .bind(&flag.execution_id.0)
        .bind(&flag.requested_by)
        .bind(flag.reason.as_deref())
        .bind(flag.requested_at.to_rfc3339())
        .bind(flag.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(
        &self,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Option<CancellationFlag>, RepositoryError> {
        let row = sqlx::query(
            "SELECT execution_id, requested_by, reason, requested_at, expires_at
             FROM cancellation_flag
             WHERE execution_id = ? AND expires_at > ?",
        )
        .bind(&execution_id.0)
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(flag_from_row).transpose()
    }

    async fn clear(&self, execution_id: &ExecutionId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM cancellation_flag WHERE execution_id = ?")
            .bind(&execution_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM cancellation_flag WHERE expires_at <= ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn flag_from_row(row: SqliteRow) -> Result<CancellationFlag, RepositoryError> {
    Ok(CancellationFlag {
        execution_id: ExecutionId(row.try_get("execution_id")?),
        requested_by: row.try_get("requested_by")?,
        reason: row.try_get("reason")?,
        requested_at: parse_timestamp("requested_at", row.try_get("requested_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}
