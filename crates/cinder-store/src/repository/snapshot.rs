//! # Item Snapshot Repository
//!
//! Caches the item store across restarts. The whole snapshot is replaced
//! in one transaction, so a crash mid-write leaves the previous snapshot.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use cinder_core::Item;

use crate::error::DbResult;

/// Repository for item snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: SqlitePool,
}

impl SnapshotRepository {
    /// Creates a new SnapshotRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SnapshotRepository { pool }
    }

    /// Replaces every stored item with `items`.
    pub async fn replace_all(&self, items: &[Item]) -> DbResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM item_snapshots")
            .execute(&mut *tx)
            .await?;

        for item in items {
            let payload = serde_json::to_string(item)?;
            sqlx::query(
                r#"
                INSERT INTO item_snapshots (
                    id, content_type, scope, dirty, deleted, payload, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(item.id.as_str())
            .bind(item.content_type.to_string())
            .bind(item.scope.to_string())
            .bind(item.dirty)
            .bind(item.deleted)
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = items.len(), "Item snapshot saved");
        Ok(())
    }

    /// Loads every stored item, ordered by id.
    pub async fn load_all(&self) -> DbResult<Vec<Item>> {
        let payloads: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM item_snapshots ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(Into::into))
            .collect()
    }

    /// Counts stored dirty items.
    pub async fn count_dirty(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_snapshots WHERE dirty = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
