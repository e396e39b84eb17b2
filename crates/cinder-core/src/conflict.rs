//! # Conflict Resolution
//!
//! Duplicate-on-conflict policy. Pure functions: no I/O, no clocks beyond the
//! `now` the caller passes in.
//!
//! ## Decision Table
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────────┐
//! │ Conflict                     │ Resolution                               │
//! ├──────────────────────────────┼──────────────────────────────────────────┤
//! │ sync_conflict, same content  │ AcceptRemote                             │
//! │ sync_conflict, diff content  │ KeepLocalAndDuplicate(new id)            │
//! │ key_version_mismatch         │ KeepLocalAndRetry                        │
//! │ local delete, remote deleted │ AcceptRemote                             │
//! │ local delete, remote present │ KeepLocalAndRetry once, then AcceptRemote│
//! │ uuid_conflict                │ KeepLocalAndDuplicate(new id)            │
//! │ readonly_error               │ like sync_conflict, clone goes personal  │
//! │ content_error / unknown      │ KeepLocalAndRetry                        │
//! └──────────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Duplicates are never merged back. Once two copies exist they diverge
//! permanently and the user decides what to keep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{IdGenerator, Item, ItemId, VaultScope};

/// Number of times a local delete is resubmitted against a live remote copy.
pub const MAX_DELETE_RESUBMITS: u8 = 1;

// =============================================================================
// Conflict Input
// =============================================================================

/// Why the server refused an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The server holds a newer revision.
    SyncConflict,
    /// The item targets a vault key version this device lacks.
    KeyVersionMismatch,
    /// The id is already taken by an item this account cannot overwrite.
    UuidConflict,
    /// The server rejected the payload.
    ContentError,
    /// The local user may not write to the item's vault.
    ReadonlyError,
    #[serde(untagged)]
    Unknown(String),
}

/// A server conflict with its items already decrypted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub kind: ConflictKind,
    /// The server's authoritative copy, when it sent one.
    pub server_item: Option<Item>,
    /// The item as the server saw it from us.
    pub unsaved_item: Option<Item>,
}

impl ConflictEntry {
    pub fn sync_conflict(server_item: Item) -> Self {
        ConflictEntry {
            kind: ConflictKind::SyncConflict,
            server_item: Some(server_item),
            unsaved_item: None,
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Adopt the server copy under the original id.
    AcceptRemote,
    /// Adopt the server copy and keep the local copy under a new id.
    KeepLocalAndDuplicate(ItemId),
    /// Leave the local copy dirty and try again next cycle.
    KeepLocalAndRetry,
}

/// Item store changes produced by applying a resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedItems {
    /// Items to write, in order.
    pub upserts: Vec<Item>,
    /// Ids to erase locally.
    pub removals: Vec<ItemId>,
    /// `(original, duplicate)` when a clone was created.
    pub duplicate: Option<(ItemId, ItemId)>,
}

/// Decides how to reconcile `local` with the server's view.
pub fn resolve(local: &Item, conflict: &ConflictEntry, ids: &dyn IdGenerator) -> Resolution {
    match &conflict.kind {
        ConflictKind::KeyVersionMismatch
        | ConflictKind::ContentError
        | ConflictKind::Unknown(_) => Resolution::KeepLocalAndRetry,

        ConflictKind::UuidConflict => Resolution::KeepLocalAndDuplicate(ids.duplicate_id(&local.id)),

        ConflictKind::SyncConflict | ConflictKind::ReadonlyError => {
            let Some(server) = &conflict.server_item else {
                return Resolution::KeepLocalAndRetry;
            };
            if local.deleted {
                return resolve_tombstone(local, server);
            }
            if local.content_matches(server) {
                Resolution::AcceptRemote
            } else {
                Resolution::KeepLocalAndDuplicate(ids.duplicate_id(&local.id))
            }
        }
    }
}

fn resolve_tombstone(local: &Item, server: &Item) -> Resolution {
    if server.deleted || local.delete_resubmits >= MAX_DELETE_RESUBMITS {
        Resolution::AcceptRemote
    } else {
        Resolution::KeepLocalAndRetry
    }
}

/// Turns a resolution into concrete item writes.
///
/// AcceptRemote and duplication leave the original id clean. Only the clone
/// is dirty.
pub fn apply_resolution(
    local: &Item,
    conflict: &ConflictEntry,
    resolution: &Resolution,
    now: DateTime<Utc>,
) -> ResolvedItems {
    let mut out = ResolvedItems::default();

    match resolution {
        Resolution::AcceptRemote => match &conflict.server_item {
            Some(server) => out.upserts.push(clean(server)),
            None => {
                let mut item = local.clone();
                item.dirty = false;
                out.upserts.push(item);
            }
        },

        Resolution::KeepLocalAndDuplicate(new_id) => {
            match &conflict.server_item {
                Some(server) => out.upserts.push(clean(server)),
                None => out.removals.push(local.id.clone()),
            }
            let mut duplicate = local.duplicate_as(new_id.clone(), now);
            if conflict.kind == ConflictKind::ReadonlyError {
                duplicate.scope = VaultScope::Personal;
            }
            out.upserts.push(duplicate);
            out.duplicate = Some((local.id.clone(), new_id.clone()));
        }

        Resolution::KeepLocalAndRetry => {
            let mut item = local.clone();
            item.dirty = true;
            if item.deleted {
                item.delete_resubmits = item.delete_resubmits.saturating_add(1);
            }
            out.upserts.push(item);
        }
    }

    out
}

fn clean(server: &Item) -> Item {
    let mut item = server.clone();
    item.dirty = false;
    item.delete_resubmits = 0;
    item
}
