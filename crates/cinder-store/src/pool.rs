//! # Database Handle
//!
//! Opens the SQLite file that backs [`SyncStateStore`] and hands out the two
//! repositories the engine needs.
//!
//! ```text
//!  DbConfig::new(path) ──► Database::new ──► migrations ──► SqlitePool
//!                                                              │
//!                              ┌───────────────────────────────┤
//!                              ▼                               ▼
//!                     sync_state: tokens + blobs     item_snapshots: items
//! ```
//!
//! File databases run in WAL mode with `synchronous = NORMAL`. The engine
//! writes one snapshot per sync cycle and reads it back once at start-up, so
//! a small pool is enough.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use cinder_core::Item;

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::snapshot::SnapshotRepository;
use crate::repository::sync_state::SyncStateRepository;
use crate::state::{SyncStateStore, SyncTokens};

const IN_MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Where the state database lives and how long to wait on a locked file.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// Upper bound on pooled connections. In-memory databases use one.
    pub max_connections: u32,

    /// How long a writer waits for another process holding the file lock.
    pub busy_timeout: Duration,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 2,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// A private database that disappears with the handle.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            // every connection would get its own empty database
            max_connections: 1,
            busy_timeout: Duration::from_secs(1),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{}", self.database_path.display()))
        }
        .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        .busy_timeout(self.busy_timeout);

        if self.is_in_memory() {
            return Ok(options);
        }
        Ok(options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal))
    }
}

// =============================================================================
// Database
// =============================================================================

/// Persistent sync state: tokens, sealed blobs and item snapshots.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database and applies pending migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        let options = config.connect_options()?;
        debug!(path = %config.database_path.display(), "Opening state database");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        migrations::run_migrations(&pool).await?;
        info!(path = %config.database_path.display(), "State database ready");

        Ok(Database { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn sync_state(&self) -> SyncStateRepository {
        SyncStateRepository::new(self.pool.clone())
    }

    pub fn snapshots(&self) -> SnapshotRepository {
        SnapshotRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// =============================================================================
// SyncStateStore
// =============================================================================

#[async_trait]
impl SyncStateStore for Database {
    async fn load_tokens(&self) -> DbResult<SyncTokens> {
        let repo = self.sync_state();
        Ok(SyncTokens {
            sync_token: repo.get(SyncStateRepository::SYNC_TOKEN).await?,
            cursor_token: repo.get(SyncStateRepository::CURSOR_TOKEN).await?,
        })
    }

    async fn save_tokens(&self, tokens: &SyncTokens) -> DbResult<()> {
        self.sync_state()
            .set_many(&[
                (SyncStateRepository::SYNC_TOKEN, tokens.sync_token.as_deref()),
                (SyncStateRepository::CURSOR_TOKEN, tokens.cursor_token.as_deref()),
            ])
            .await
    }

    async fn load_items(&self) -> DbResult<Vec<Item>> {
        self.snapshots().load_all().await
    }

    async fn save_items(&self, items: &[Item]) -> DbResult<()> {
        self.snapshots().replace_all(items).await
    }

    async fn load_blob(&self, key: &str) -> DbResult<Option<String>> {
        self.sync_state().get(key).await
    }

    async fn save_blob(&self, key: &str, value: &str) -> DbResult<()> {
        self.sync_state().set(key, Some(value)).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cinder_core::{ContentType, ItemId, VaultScope};

    #[test]
    fn test_in_memory_uses_one_connection() {
        let config = DbConfig::in_memory();
        assert!(config.is_in_memory());
        assert_eq!(config.max_connections, 1);
        assert!(!DbConfig::new("/tmp/cinder-test.db").is_in_memory());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let path = std::env::temp_dir().join(format!("cinder-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        db.save_blob("k", "v").await.unwrap();
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(reopened.load_blob("k").await.unwrap().as_deref(), Some("v"));
        reopened.close().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_state_store_roundtrip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert_eq!(db.load_tokens().await.unwrap(), SyncTokens::default());

        let tokens = SyncTokens {
            sync_token: Some("s-2".into()),
            cursor_token: None,
        };
        db.save_tokens(&tokens).await.unwrap();
        assert_eq!(db.load_tokens().await.unwrap(), tokens);

        let item = Item::new(
            ItemId::from("n1"),
            ContentType::Note,
            "hello",
            VaultScope::shared("v1"),
            Utc::now(),
        );
        db.save_items(std::slice::from_ref(&item)).await.unwrap();
        assert_eq!(db.load_items().await.unwrap(), vec![item]);

        db.save_blob("vault_keys", "sealed-1").await.unwrap();
        db.save_blob("vault_keys", "sealed-2").await.unwrap();
        assert_eq!(db.load_blob("vault_keys").await.unwrap().as_deref(), Some("sealed-2"));
    }
}
