//! # Sync State Repository
//!
//! Key-value storage for the opaque tokens the server hands out.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

const UPSERT_SQL: &str = r#"
    INSERT INTO sync_state (key, value, updated_at)
    VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET
        value = excluded.value,
        updated_at = excluded.updated_at
"#;

/// Repository for sync state entries.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Key of the last sync token.
    pub const SYNC_TOKEN: &'static str = "sync_token";

    /// Key of the pagination (cursor) token.
    pub const CURSOR_TOKEN: &'static str = "cursor_token";

    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    /// Reads a value. Missing keys and NULL values both read as `None`.
    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.flatten())
    }

    /// Writes a single value.
    pub async fn set(&self, key: &str, value: Option<&str>) -> DbResult<()> {
        sqlx::query(UPSERT_SQL)
            .bind(key)
            .bind(value)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Writes several values in one transaction.
    pub async fn set_many(&self, entries: &[(&str, Option<&str>)]) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for (key, value) in entries {
            sqlx::query(UPSERT_SQL)
                .bind(*key)
                .bind(*value)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(count = entries.len(), "Sync state saved");
        Ok(())
    }
}
