//! # Item Store
//!
//! In-memory, authoritative mapping of item id to item state. Every other
//! component reads and mutates items through this store.
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Local mutation (create/update/delete/move)                            │
//! │       │   one item, bumps local_revision, sets dirty                   │
//! │       ▼                                                                 │
//! │  ┌───────────────────────────────┐                                     │
//! │  │   RwLock<HashMap<ItemId,Item>>│                                     │
//! │  └───────────────────────────────┘                                     │
//! │       ▲                                                                 │
//! │       │   many items, one write lock, all-or-nothing                   │
//! │  transaction(|txn| ...)  ◄── SyncCoordinator applies a whole response   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A transaction closure is synchronous, so nothing can observe the store
//! between the first and last write of a cycle. The closure returns change
//! sets grouped by [`ChangeSource`] for the event bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use cinder_core::{ContentType, EncryptedPayload, Item, ItemId, VaultScope};

use crate::error::{DbError, DbResult};

// =============================================================================
// Change Sets
// =============================================================================

/// Why items changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    RemoteRetrieved,
    RemoteSaved,
    ConflictResolution,
    LocalChanged,
    VaultRemoved,
}

/// One observer notification: what changed, from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsChanged {
    pub changed: Vec<Item>,
    pub inserted: Vec<Item>,
    pub removed: Vec<ItemId>,
    pub source: ChangeSource,
}

impl ItemsChanged {
    pub fn new(source: ChangeSource) -> Self {
        ItemsChanged {
            changed: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            source,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.inserted.is_empty() && self.removed.is_empty()
    }
}

/// Server acknowledgement of one saved item.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveAck {
    pub id: ItemId,
    /// The local revision that was sent.
    pub revision: u64,
    /// Ciphertext the server now holds.
    pub encrypted: Option<EncryptedPayload>,
    pub updated_at: DateTime<Utc>,
}

/// What an acknowledgement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Dirty flag cleared.
    Cleared,
    /// Acknowledged tombstone erased.
    Erased,
    /// Item was edited again after it was sent; stays dirty.
    Superseded,
    /// Item no longer exists locally.
    Missing,
}

// =============================================================================
// Transaction
// =============================================================================

/// Mutable view of the store inside [`ItemStore::transaction`].
pub struct ItemTxn<'a> {
    items: &'a mut HashMap<ItemId, Item>,
    changes: Vec<ItemsChanged>,
}

impl<'a> ItemTxn<'a> {
    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    /// Ids of every item in `scope`, sorted.
    pub fn ids_in_scope(&self, scope: &VaultScope) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .items
            .values()
            .filter(|item| &item.scope == scope)
            .map(|item| item.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Writes an item. Writing an identical item records nothing.
    pub fn upsert(&mut self, item: Item, source: ChangeSource) {
        match self.items.get(&item.id).map(|existing| existing == &item) {
            Some(true) => {}
            Some(false) => {
                self.changes_for(source).changed.push(item.clone());
                self.items.insert(item.id.clone(), item);
            }
            None => {
                self.changes_for(source).inserted.push(item.clone());
                self.items.insert(item.id.clone(), item);
            }
        }
    }

    /// Erases an item locally.
    pub fn remove(&mut self, id: &ItemId, source: ChangeSource) -> Option<Item> {
        let removed = self.items.remove(id);
        if removed.is_some() {
            self.changes_for(source).removed.push(id.clone());
        }
        removed
    }

    /// Applies a save acknowledgement.
    ///
    /// Only the exact revision that was sent is cleared. Tombstones are
    /// erased once acknowledged.
    pub fn acknowledge(&mut self, ack: SaveAck) -> AckOutcome {
        let Some(current) = self.items.get(&ack.id) else {
            return AckOutcome::Missing;
        };
        if current.local_revision != ack.revision {
            return AckOutcome::Superseded;
        }
        if current.deleted {
            self.remove(&ack.id, ChangeSource::RemoteSaved);
            return AckOutcome::Erased;
        }

        let mut item = current.clone();
        item.dirty = false;
        item.delete_resubmits = 0;
        item.updated_at = ack.updated_at;
        if ack.encrypted.is_some() {
            item.encrypted = ack.encrypted;
        }
        self.upsert(item, ChangeSource::RemoteSaved);
        AckOutcome::Cleared
    }

    fn changes_for(&mut self, source: ChangeSource) -> &mut ItemsChanged {
        let index = match self.changes.iter().position(|c| c.source == source) {
            Some(index) => index,
            None => {
                self.changes.push(ItemsChanged::new(source));
                self.changes.len() - 1
            }
        };
        &mut self.changes[index]
    }
}

// =============================================================================
// Item Store
// =============================================================================

/// The single source of truth for items.
#[derive(Debug, Default)]
pub struct ItemStore {
    items: RwLock<HashMap<ItemId, Item>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from a persisted snapshot.
    pub fn from_items(items: Vec<Item>) -> Self {
        ItemStore {
            items: RwLock::new(items.into_iter().map(|i| (i.id.clone(), i)).collect()),
        }
    }

    pub async fn get(&self, id: &ItemId) -> Option<Item> {
        self.items.read().await.get(id).cloned()
    }

    /// Every item, sorted by id.
    pub async fn all(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Dirty items (including tombstones), sorted by id.
    pub async fn dirty_items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.dirty)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub async fn dirty_count(&self) -> usize {
        self.items.read().await.values().filter(|i| i.dirty).count()
    }

    /// Live (non-tombstone) items in a scope, sorted by id.
    pub async fn items_in_scope(&self, scope: &VaultScope) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| &item.scope == scope && !item.deleted)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    /// Runs `f` under the write lock and returns its result plus the change sets.
    pub async fn transaction<R>(
        &self,
        f: impl FnOnce(&mut ItemTxn<'_>) -> R,
    ) -> (R, Vec<ItemsChanged>) {
        let mut items = self.items.write().await;
        let mut txn = ItemTxn {
            items: &mut *items,
            changes: Vec::new(),
        };
        let result = f(&mut txn);
        let changes: Vec<ItemsChanged> = txn.changes.into_iter().filter(|c| !c.is_empty()).collect();
        debug!(change_sets = changes.len(), "Item store transaction committed");
        (result, changes)
    }

    // =========================================================================
    // Local Mutations
    // =========================================================================

    /// Inserts a brand new dirty item.
    pub async fn create(
        &self,
        id: ItemId,
        content_type: ContentType,
        content: impl Into<String>,
        scope: VaultScope,
    ) -> DbResult<(Item, ItemsChanged)> {
        let item = Item::new(id, content_type, content, scope, Utc::now());
        let mut items = self.items.write().await;
        if items.contains_key(&item.id) {
            return Err(DbError::UniqueViolation {
                field: "item id".into(),
                value: item.id.to_string(),
            });
        }
        items.insert(item.id.clone(), item.clone());

        let mut change = ItemsChanged::new(ChangeSource::LocalChanged);
        change.inserted.push(item.clone());
        Ok((item, change))
    }

    /// Replaces an item's content.
    pub async fn update_content(
        &self,
        id: &ItemId,
        content: impl Into<String>,
    ) -> DbResult<(Item, ItemsChanged)> {
        let content = content.into();
        self.mutate(id, |item| item.content = content).await
    }

    /// Turns an item into a dirty tombstone.
    pub async fn mark_deleted(&self, id: &ItemId) -> DbResult<(Item, ItemsChanged)> {
        self.mutate(id, |item| item.mark_deleted(Utc::now())).await
    }

    /// Moves an item to another vault scope.
    pub async fn move_to_scope(
        &self,
        id: &ItemId,
        scope: VaultScope,
    ) -> DbResult<(Item, ItemsChanged)> {
        self.mutate(id, |item| {
            item.scope = scope;
            item.encrypted = None;
        })
        .await
    }

    async fn mutate(
        &self,
        id: &ItemId,
        f: impl FnOnce(&mut Item),
    ) -> DbResult<(Item, ItemsChanged)> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .filter(|item| !item.deleted)
            .ok_or_else(|| DbError::not_found("Item", id.as_str()))?;

        f(item);
        if !item.deleted {
            item.touch(Utc::now());
        }

        let mut change = ItemsChanged::new(ChangeSource::LocalChanged);
        change.changed.push(item.clone());
        Ok((item.clone(), change))
    }
}
