use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::context::TenantId;
use fleetrun_core::domain::execution::{ExecutionId, SlaClass};
use fleetrun_core::domain::queue::{DlqItem, DlqItemId, QueueItem, QueueItemId};

use super::codec::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{DlqFilter, DlqRepository, QueueRepository, RepositoryError};
use crate::DbPool;

const QUEUE_COLUMNS: &str = "id, execution_id, tenant_id, sla_class, priority, available_at, \
     leased_by, lease_expires_at, attempts, max_attempts, created_at";

pub struct SqlQueueRepository {
    pool: DbPool,
}

impl SqlQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl QueueRepository for SqlQueueRepository {
    async fn enqueue(&self, item: QueueItem) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO queue_item (
                id, execution_id, tenant_id, sla_class, priority, available_at,
                leased_by, lease_expires_at, attempts, max_attempts, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&item.execution_id.0)
        .bind(&item.tenant_id.0)
        .bind(item.sla_class.as_str())
        .bind(item.priority)
        .bind(item.available_at.to_rfc3339())
        .bind(item.leased_by.as_deref())
        .bind(item.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(item.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dequeue_with_lease(
        &self,
        owner: &str,
        lease_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, RepositoryError> {
        let lease_expires_at = now + Duration::milliseconds(lease_ms as i64);

        // Single-statement claim: selects the best available row and stamps
        // the lease atomically. Rows with a live lease are skipped, which is
        // the SKIP LOCKED behaviour on this backend.
        let row = sqlx::query(&format!(
            "UPDATE queue_item
             SET leased_by = ?, lease_expires_at = ?
             WHERE id = (
                 SELECT id FROM queue_item
                 WHERE available_at <= ?
                   AND (leased_by IS NULL OR lease_expires_at <= ?)
                 ORDER BY priority DESC, available_at ASC
                 LIMIT 1
             )
             RETURNING {QUEUE_COLUMNS}",
        ))
        .bind(owner)
        .bind(lease_expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(queue_item_from_row).transpose()
    }

    async fn renew_lease(
        &self,
        id: &QueueItemId,
        owner: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE queue_item SET lease_expires_at = ? WHERE id = ? AND leased_by = ?",
        )
        .bind(new_expiry.to_rfc3339())
        .bind(&id.0)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            });
        }
        Ok(())
    }

    async fn ack(&self, id: &QueueItemId, owner: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM queue_item WHERE id = ? AND leased_by = ?")
            .bind(&id.0)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            });
        }
        Ok(())
    }

    async fn nack_with_backoff(
        &self,
        id: &QueueItemId,
        owner: &str,
        next_available_at: DateTime<Utc>,
    ) -> Result<u32, RepositoryError> {
        let row = sqlx::query(
            "UPDATE queue_item
             SET leased_by = NULL, lease_expires_at = NULL, attempts = attempts + 1,
                 available_at = ?
             WHERE id = ? AND leased_by = ?
             RETURNING attempts",
        )
        .bind(next_available_at.to_rfc3339())
        .bind(&id.0)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => parse_u32("attempts", row.try_get("attempts")?),
            None => Err(RepositoryError::NotOwner {
                lock_key: id.0.clone(),
                owner_tag: owner.to_string(),
            }),
        }
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE queue_item
             SET leased_by = NULL, lease_expires_at = NULL
             WHERE leased_by IS NOT NULL AND lease_expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find(&self, id: &QueueItemId) -> Result<Option<QueueItem>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM queue_item WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(queue_item_from_row).transpose()
    }

    async fn depth(&self, now: DateTime<Utc>) -> Result<i64, RepositoryError> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_item
             WHERE available_at <= ? AND (leased_by IS NULL OR lease_expires_at <= ?)",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    async fn oldest_available_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT MIN(available_at) FROM queue_item
             WHERE available_at <= ? AND (leased_by IS NULL OR lease_expires_at <= ?)",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        parse_optional_timestamp("available_at", oldest)
    }
}

pub struct SqlDlqRepository {
    pool: DbPool,
}

impl SqlDlqRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DlqRepository for SqlDlqRepository {
    async fn insert(&self, item: DlqItem) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dlq_item (
                id, execution_id, tenant_id, failure_reason, error_class, archived, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&item.execution_id.0)
        .bind(&item.tenant_id.0)
        .bind(&item.failure_reason)
        .bind(item.error_class.as_deref())
        .bind(i64::from(item.archived))
        .bind(item.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, filter: &DlqFilter) -> Result<Vec<DlqItem>, RepositoryError> {
        let mut sql = String::from(
            "SELECT id, execution_id, tenant_id, failure_reason, error_class, archived, created_at
             FROM dlq_item WHERE 1 = 1",
        );
        if filter.tenant_id.is_some() {
            sql.push_str(" AND tenant_id = ?");
        }
        if !filter.include_archived {
            sql.push_str(" AND archived = 0");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(tenant_id) = &filter.tenant_id {
            query = query.bind(&tenant_id.0);
        }
        query = query.bind(i64::from(filter.limit.clamp(1, 1_000)));

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(dlq_item_from_row).collect()
    }

    async fn find(&self, id: &DlqItemId) -> Result<Option<DlqItem>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, execution_id, tenant_id, failure_reason, error_class, archived, created_at
             FROM dlq_item WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(dlq_item_from_row).transpose()
    }

    async fn requeue(&self, id: &DlqItemId, item: QueueItem) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE dlq_item SET archived = 1 WHERE id = ? AND archived = 0")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::NotFound { entity: "dlq_item", id: id.0.clone() });
        }

        sqlx::query(
            "INSERT INTO queue_item (
                id, execution_id, tenant_id, sla_class, priority, available_at,
                leased_by, lease_expires_at, attempts, max_attempts, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&item.execution_id.0)
        .bind(&item.tenant_id.0)
        .bind(item.sla_class.as_str())
        .bind(item.priority)
        .bind(item.available_at.to_rfc3339())
        .bind(i64::from(item.attempts))
        .bind(i64::from(item.max_attempts))
        .bind(item.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn archive(&self, id: &DlqItemId) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE dlq_item SET archived = 1 WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "dlq_item", id: id.0.clone() });
        }
        Ok(())
    }
}

fn queue_item_from_row(row: SqliteRow) -> Result<QueueItem, RepositoryError> {
    let sla_raw = row.try_get::<String, _>("sla_class")?;
    let sla_class = SlaClass::parse(&sla_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sla class `{sla_raw}`")))?;

    Ok(QueueItem {
        id: QueueItemId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        sla_class,
        priority: row.try_get("priority")?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn dlq_item_from_row(row: SqliteRow) -> Result<DlqItem, RepositoryError> {
    Ok(DlqItem {
        id: DlqItemId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        failure_reason: row.try_get("failure_reason")?,
        error_class: row.try_get("error_class")?,
        archived: row.try_get::<i64, _>("archived")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
