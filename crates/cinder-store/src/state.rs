//! # Sync State Persistence
//!
//! The persistence seam of the engine: last-known tokens and cached item
//! snapshots survive process restarts. The engine treats the backend as an
//! opaque blob store.
//!
//! ```text
//!   SyncCoordinator ──save_tokens/save_items──► dyn SyncStateStore
//!                                                 ├── Database (SQLite)
//!                                                 └── MemoryStateStore (tests)
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use cinder_core::Item;

use crate::error::DbResult;

/// Opaque server tokens. Both absent on a fresh account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTokens {
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
}

/// Storage backend for tokens and item snapshots.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load_tokens(&self) -> DbResult<SyncTokens>;

    async fn save_tokens(&self, tokens: &SyncTokens) -> DbResult<()>;

    async fn load_items(&self) -> DbResult<Vec<Item>>;

    /// Replaces the stored snapshot.
    async fn save_items(&self, items: &[Item]) -> DbResult<()>;

    /// Reads an opaque blob (already sealed by the caller).
    async fn load_blob(&self, key: &str) -> DbResult<Option<String>>;

    async fn save_blob(&self, key: &str, value: &str) -> DbResult<()>;
}

/// Volatile state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tokens: RwLock<SyncTokens>,
    items: RwLock<Vec<Item>>,
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn load_tokens(&self) -> DbResult<SyncTokens> {
        Ok(self.tokens.read().await.clone())
    }

    async fn save_tokens(&self, tokens: &SyncTokens) -> DbResult<()> {
        *self.tokens.write().await = tokens.clone();
        Ok(())
    }

    async fn load_items(&self) -> DbResult<Vec<Item>> {
        Ok(self.items.read().await.clone())
    }

    async fn save_items(&self, items: &[Item]) -> DbResult<()> {
        *self.items.write().await = items.to_vec();
        Ok(())
    }

    async fn load_blob(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn save_blob(&self, key: &str, value: &str) -> DbResult<()> {
        self.blobs.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_tokens() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load_tokens().await.unwrap(), SyncTokens::default());

        let tokens = SyncTokens {
            sync_token: Some("t1".into()),
            cursor_token: Some("c1".into()),
        };
        store.save_tokens(&tokens).await.unwrap();
        assert_eq!(store.load_tokens().await.unwrap(), tokens);
    }

    #[tokio::test]
    async fn test_memory_store_blobs() {
        let store = MemoryStateStore::new();
        assert!(store.load_blob("vault_keys").await.unwrap().is_none());
        store.save_blob("vault_keys", "sealed").await.unwrap();
        assert_eq!(store.load_blob("vault_keys").await.unwrap().as_deref(), Some("sealed"));
    }
}
