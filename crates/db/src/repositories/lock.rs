use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetrun_core::domain::execution::ExecutionId;
use fleetrun_core::domain::lock::{AssetLock, LockKey};

use super::codec::parse_timestamp;
use super::{LockRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLockRepository {
    pool: DbPool,
}

impl SqlLockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LockRepository for SqlLockRepository {
    async fn try_acquire(&self, lock: AssetLock) -> Result<(), RepositoryError> {
        // Insert, or steal the row in place when its lease has lapsed. A live
        // holder makes the upsert a no-op (zero rows), which we surface as
        // LockHeld with the current owner.
        let result = sqlx::query(
            "INSERT INTO asset_lock (lock_key, execution_id, owner_tag, acquired_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET
                execution_id = excluded.execution_id,
                owner_tag = excluded.owner_tag,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE asset_lock.expires_at < excluded.acquired_at",
        )
        .bind(lock.lock_key.as_str())
        .bind(&lock.execution_id.0)
        .bind(&lock.owner_tag)
        .bind(lock.acquired_at.to_rfc3339())
        .bind(lock.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT owner_tag FROM asset_lock WHERE lock_key = ?")
                    .bind(lock.lock_key.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(RepositoryError::LockHeld {
                lock_key: lock.lock_key.0.clone(),
                owner: owner.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(())
    }

    async fn release(&self, lock_key: &LockKey, owner_tag: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM asset_lock WHERE lock_key = ? AND owner_tag = ?")
            .bind(lock_key.as_str())
            .bind(owner_tag)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotOwner {
                lock_key: lock_key.0.clone(),
                owner_tag: owner_tag.to_string(),
            });
        }
        Ok(())
    }

    async fn find(&self, lock_key: &LockKey) -> Result<Option<AssetLock>, RepositoryError> {
        let row = sqlx::query(
            "SELECT lock_key, execution_id, owner_tag, acquired_at, expires_at
             FROM asset_lock WHERE lock_key = ?",
        )
        .bind(lock_key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(lock_from_row).transpose()
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM asset_lock WHERE expires_at < ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn lock_from_row(row: SqliteRow) -> Result<AssetLock, RepositoryError> {
    Ok(AssetLock {
        lock_key: LockKey(row.try_get("lock_key")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        owner_tag: row.try_get("owner_tag")?,
        acquired_at: parse_timestamp("acquired_at", row.try_get("acquired_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}
