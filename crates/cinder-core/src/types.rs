//! # Domain Types
//!
//! Core domain types used throughout Cinder.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Item       │   │   SharedVault   │   │ TrustedContact  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (client)    │   │  uuid           │   │  contact_uuid   │       │
//! │  │  content_type   │   │  owner_uuid     │   │  enc. pub key   │       │
//! │  │  scope          │   │  key_version    │   │  signing key    │       │
//! │  │  dirty/deleted  │   │  members        │   │  name           │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Invite      │   │  InviteStatus   │   │   VaultScope    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  vault, inviter │   │  Pending        │   │  Personal       │       │
//! │  │  invitee        │   │  Accepted       │   │  Shared(uuid)   │       │
//! │  │  permission     │   │  Declined       │   └─────────────────┘       │
//! │  └─────────────────┘   │  Revoked        │                              │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedPayload;

// =============================================================================
// Identifiers
// =============================================================================

/// Stable, client-generated item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generates a fresh random id (UUID v4).
    pub fn random() -> Self {
        ItemId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        ItemId(value)
    }
}

/// Source of new item ids.
///
/// Conflict duplication asks this for the clone's id, which lets tests pin
/// the id of a duplicate.
pub trait IdGenerator: Send + Sync {
    /// Id for a brand new item.
    fn new_id(&self) -> ItemId;

    /// Id for a duplicate of `original`.
    fn duplicate_id(&self, original: &ItemId) -> ItemId;
}

/// Random UUID v4 ids for everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_id(&self) -> ItemId {
        ItemId::random()
    }

    fn duplicate_id(&self, _original: &ItemId) -> ItemId {
        ItemId::random()
    }
}

/// Deterministic duplicate ids: `"<original>-dup"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuffixIdGenerator;

impl IdGenerator for SuffixIdGenerator {
    fn new_id(&self) -> ItemId {
        ItemId::random()
    }

    fn duplicate_id(&self, original: &ItemId) -> ItemId {
        ItemId(format!("{}-dup", original.as_str()))
    }
}

// =============================================================================
// Content Type
// =============================================================================

/// What an item holds. The body format of each type is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Note,
    Tag,
    #[serde(rename = "SN|Component")]
    Component,
    #[serde(rename = "SN|KeySystemItemsKey")]
    KeySystemItemsKey,
    #[serde(rename = "SN|VaultListing")]
    VaultListing,
    #[serde(rename = "SN|UserPreferences")]
    UserPreferences,
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Note => write!(f, "Note"),
            ContentType::Tag => write!(f, "Tag"),
            ContentType::Component => write!(f, "SN|Component"),
            ContentType::KeySystemItemsKey => write!(f, "SN|KeySystemItemsKey"),
            ContentType::VaultListing => write!(f, "SN|VaultListing"),
            ContentType::UserPreferences => write!(f, "SN|UserPreferences"),
            ContentType::Other(name) => write!(f, "{}", name),
        }
    }
}

// =============================================================================
// Vault Scope
// =============================================================================

/// The encryption scope an item belongs to. Exactly one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "uuid", rename_all = "snake_case")]
pub enum VaultScope {
    /// The account's own items.
    Personal,
    /// A multi-user vault, by its system identifier.
    Shared(String),
}

impl VaultScope {
    pub fn shared(uuid: impl Into<String>) -> Self {
        VaultScope::Shared(uuid.into())
    }

    /// Shared vault uuid, if any.
    pub fn shared_vault_uuid(&self) -> Option<&str> {
        match self {
            VaultScope::Personal => None,
            VaultScope::Shared(uuid) => Some(uuid),
        }
    }
}

impl fmt::Display for VaultScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultScope::Personal => write!(f, "personal"),
            VaultScope::Shared(uuid) => write!(f, "vault:{}", uuid),
        }
    }
}

// =============================================================================
// Item
// =============================================================================

/// Any syncable unit: note, tag, key object, vault metadata.
///
/// ## Lifecycle
/// ```text
/// created locally ──► dirty ──► saved (clean) ──► edited ──► dirty ...
///                                                    │
///                                      mark_deleted  ▼
///                                             tombstone (dirty)
///                                                    │
///                                      server ack    ▼
///                                             erased locally
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Globally unique, immutable once assigned.
    pub id: ItemId,

    pub content_type: ContentType,

    /// Decrypted working copy. Empty for tombstones.
    pub content: String,

    pub scope: VaultScope,

    /// Last ciphertext acknowledged by or received from the server.
    #[serde(default)]
    pub encrypted: Option<EncryptedPayload>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Local modifications not yet acknowledged remotely.
    pub dirty: bool,

    /// Tombstone marker.
    pub deleted: bool,

    /// Bumped on every local mutation. Saves acknowledge a revision.
    #[serde(default)]
    pub local_revision: u64,

    /// How many times a local delete was resubmitted after a conflict.
    #[serde(default)]
    pub delete_resubmits: u8,
}

impl Item {
    /// Creates a new, dirty item.
    pub fn new(
        id: ItemId,
        content_type: ContentType,
        content: impl Into<String>,
        scope: VaultScope,
        now: DateTime<Utc>,
    ) -> Self {
        Item {
            id,
            content_type,
            content: content.into(),
            scope,
            encrypted: None,
            created_at: now,
            updated_at: now,
            dirty: true,
            deleted: false,
            local_revision: 1,
            delete_resubmits: 0,
        }
    }

    /// Records a local mutation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.dirty = true;
        self.local_revision += 1;
    }

    /// Turns the item into a dirty tombstone.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.content.clear();
        self.deleted = true;
        self.touch(now);
    }

    /// True when both copies carry the same bytes and deletion state.
    pub fn content_matches(&self, other: &Item) -> bool {
        self.deleted == other.deleted
            && self.content_type == other.content_type
            && self.content.as_bytes() == other.content.as_bytes()
    }

    /// Clone of this item under a new id, dirty and never synced.
    pub fn duplicate_as(&self, id: ItemId, now: DateTime<Utc>) -> Item {
        Item {
            id,
            content_type: self.content_type.clone(),
            content: self.content.clone(),
            scope: self.scope.clone(),
            encrypted: None,
            created_at: now,
            updated_at: now,
            dirty: true,
            deleted: false,
            local_revision: 1,
            delete_resubmits: 0,
        }
    }
}

// =============================================================================
// Shared Vault
// =============================================================================

/// Permission level of a vault member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedVaultPermission {
    Read,
    Write,
    Admin,
}

impl SharedVaultPermission {
    pub fn can_write(&self) -> bool {
        matches!(self, SharedVaultPermission::Write | SharedVaultPermission::Admin)
    }

    pub fn can_invite(&self) -> bool {
        matches!(self, SharedVaultPermission::Admin)
    }
}

impl fmt::Display for SharedVaultPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedVaultPermission::Read => write!(f, "read"),
            SharedVaultPermission::Write => write!(f, "write"),
            SharedVaultPermission::Admin => write!(f, "admin"),
        }
    }
}

/// A vault member, by contact/user uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMember {
    pub user_uuid: String,
    pub permission: SharedVaultPermission,
}

/// A multi-user encrypted namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedVault {
    /// System identifier.
    pub uuid: String,
    pub name: String,
    pub owner_uuid: String,
    /// Strictly increasing.
    pub key_version: u64,
    /// Members other than the owner.
    pub members: Vec<VaultMember>,
}

impl SharedVault {
    pub fn scope(&self) -> VaultScope {
        VaultScope::Shared(self.uuid.clone())
    }
}

// =============================================================================
// Trusted Contact
// =============================================================================

/// A collaborator whose public keys have been verified and recorded locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedContact {
    pub contact_uuid: String,
    pub name: String,
    /// X25519 public key, base64.
    pub encryption_public_key: String,
    /// Ed25519 public key, base64.
    pub signing_public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Invite
// =============================================================================

/// Invite state. Pending is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
    Revoked,
}

impl InviteStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InviteStatus::Pending)
    }

    /// Whether `self -> next` is allowed for the given actor.
    ///
    /// Accept and decline belong to the invitee; revoke to the inviter.
    pub fn can_transition_to(&self, next: InviteStatus, actor_is_inviter: bool) -> bool {
        match (self, next) {
            (InviteStatus::Pending, InviteStatus::Accepted)
            | (InviteStatus::Pending, InviteStatus::Declined) => !actor_is_inviter,
            (InviteStatus::Pending, InviteStatus::Revoked) => actor_is_inviter,
            _ => false,
        }
    }
}

impl fmt::Display for InviteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InviteStatus::Pending => write!(f, "pending"),
            InviteStatus::Accepted => write!(f, "accepted"),
            InviteStatus::Declined => write!(f, "declined"),
            InviteStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// An offer to join a shared vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub uuid: String,
    pub shared_vault_uuid: String,
    pub inviter_uuid: String,
    pub invitee_uuid: String,
    pub permission: SharedVaultPermission,
    pub status: InviteStatus,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Asymmetric Message Kind
// =============================================================================

/// Routing tag of an asymmetric envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Invite,
    KeyRotation,
    TrustConfirmation,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Invite => "invite",
            MessageKind::KeyRotation => "key-rotation",
            MessageKind::TrustConfirmation => "trust-confirmation",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(content: &str) -> Item {
        Item::new(
            ItemId::from("n1"),
            ContentType::Note,
            content,
            VaultScope::Personal,
            Utc::now(),
        )
    }

    #[test]
    fn test_new_item_is_dirty() {
        let item = note("hello");
        assert!(item.dirty);
        assert!(!item.deleted);
        assert_eq!(item.local_revision, 1);
    }

    #[test]
    fn test_mark_deleted_clears_content() {
        let mut item = note("hello");
        item.dirty = false;
        item.mark_deleted(Utc::now());
        assert!(item.deleted);
        assert!(item.dirty);
        assert!(item.content.is_empty());
        assert_eq!(item.local_revision, 2);
    }

    #[test]
    fn test_duplicate_gets_new_identity() {
        let item = note("draft");
        let dup = item.duplicate_as(SuffixIdGenerator.duplicate_id(&item.id), Utc::now());
        assert_eq!(dup.id.as_str(), "n1-dup");
        assert_eq!(dup.content, "draft");
        assert!(dup.dirty);
        assert!(dup.encrypted.is_none());
    }

    #[test]
    fn test_content_type_serialization() {
        let json = serde_json::to_string(&ContentType::Component).unwrap();
        assert_eq!(json, "\"SN|Component\"");
        let parsed: ContentType = serde_json::from_str("\"Custom\"").unwrap();
        assert_eq!(parsed, ContentType::Other("Custom".into()));
        let note: ContentType = serde_json::from_str("\"Note\"").unwrap();
        assert_eq!(note, ContentType::Note);
    }

    #[test]
    fn test_invite_transitions() {
        use InviteStatus::*;
        assert!(Pending.can_transition_to(Accepted, false));
        assert!(Pending.can_transition_to(Declined, false));
        assert!(Pending.can_transition_to(Revoked, true));

        assert!(!Pending.can_transition_to(Revoked, false));
        assert!(!Pending.can_transition_to(Accepted, true));
        assert!(!Accepted.can_transition_to(Revoked, true));
        assert!(!Declined.can_transition_to(Accepted, false));
        assert!(!Revoked.can_transition_to(Pending, true));
    }

    #[test]
    fn test_permission_capabilities() {
        assert!(!SharedVaultPermission::Read.can_write());
        assert!(SharedVaultPermission::Write.can_write());
        assert!(!SharedVaultPermission::Write.can_invite());
        assert!(SharedVaultPermission::Admin.can_invite());
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(VaultScope::Personal.to_string(), "personal");
        assert_eq!(VaultScope::shared("v1").to_string(), "vault:v1");
    }
}
