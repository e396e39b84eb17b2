//! # Vault Key Manager
//!
//! Owns every symmetric key this device holds: the personal key and, per
//! shared vault, each key version it has ever received.
//!
//! ## Key Slots
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  slots: RwLock<HashMap<vault uuid, Arc<RwLock<VaultSlot>>>>              │
//! │                                                                         │
//! │  VaultSlot "v1"                                                         │
//! │  ┌──────────────────────────────┐                                       │
//! │  │ vault: owner, members,       │  encrypt ──► key[vault.key_version]   │
//! │  │        key_version = 3       │  decrypt ──► key[payload.key_version] │
//! │  │ keys:  {1: k1, 2: k2, 3: k3} │                                       │
//! │  └──────────────────────────────┘                                       │
//! │                                                                         │
//! │  Rotation holds the slot's write lock while it generates the new key,   │
//! │  seals it for every remaining member and installs it. Encryptions for   │
//! │  that vault wait on the read lock until it is done.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Member Removal
//! ```text
//! apply_membership_change(v1, Remove(C))
//!   1. write-lock slot v1
//!   2. drop C from members
//!   3. k(n+1) = random, version n+1
//!   4. key-rotation envelope ──► owner + every member except C and self
//!   5. install k(n+1), queue RemoveMember + UpdateKeyVersion
//! ```
//! C keeps k1..kn. Items already shared under those versions stay readable
//! to C; nothing is re-encrypted.
//!
//! ## Account Copies
//! ```text
//! create / join / rotate / install k(n)
//!   └──► personal item "vault-key:<vault>:<n>" (SN|KeySystemItemsKey, dirty)
//!          encrypted under the personal key, synced like any other item
//!
//! another device of the same account
//!   retrieves the item ──► install_recorded_key ──► slot.keys[n]
//! ```
//! Removing a vault tombstones its key items.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use cinder_core::crypto::item_aad;
use cinder_core::validation::validate_vault_name;
use cinder_core::{
    ContentType, CryptoError, EncryptedPayload, Item, ItemId, MessageKind, SharedVault,
    SharedVaultPermission, SymmetricKey, VaultMember, VaultScope, INITIAL_KEY_VERSION,
};

use cinder_store::{ChangeSource, ItemStore};

use crate::error::{CollaborationError, SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::messages::AsymmetricMessageChannel;
use crate::outbox::OutboundQueue;
use crate::protocol::{KeyRotationPayload, SharedVaultServerHash, VaultOperation};

const KEY_STORE_AAD: &[u8] = b"cinder-vault-keys-v1";

const KEY_ITEM_PREFIX: &str = "vault-key:";

/// Id of the personal item that carries one vault key version.
pub fn key_item_id(vault_uuid: &str, version: u64) -> ItemId {
    ItemId::from(format!("{}{}:{}", KEY_ITEM_PREFIX, vault_uuid, version))
}

// =============================================================================
// Types
// =============================================================================

/// A change to a vault's member list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(VaultMember),
    Remove { user_uuid: String },
}

/// Result of a key rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub vault_uuid: String,
    pub key_version: u64,
    /// Users a key-rotation message was queued for.
    pub recipients: Vec<String>,
    /// Members that could not be reached because they are not trusted contacts.
    pub unreachable: Vec<String>,
}

/// What reconciling a server vault list did to one vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultChange {
    Updated(String),
    /// Deleted, or the local user is no longer a member.
    Removed(String),
}

struct VaultSlot {
    vault: SharedVault,
    keys: BTreeMap<u64, SymmetricKey>,
}

impl VaultSlot {
    fn newest_version(&self) -> Option<u64> {
        self.keys.keys().next_back().copied()
    }

    fn permission_of(&self, user_uuid: &str) -> Option<SharedVaultPermission> {
        if self.vault.owner_uuid == user_uuid {
            return Some(SharedVaultPermission::Admin);
        }
        self.vault
            .members
            .iter()
            .find(|m| m.user_uuid == user_uuid)
            .map(|m| m.permission)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredVault {
    vault: SharedVault,
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    version: u64,
    key: String,
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Content of a `SN|KeySystemItemsKey` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultKeyRecord {
    pub shared_vault_uuid: String,
    pub owner_uuid: String,
    pub key_version: u64,
    pub vault_key: String,
}

impl VaultKeyRecord {
    fn new(vault: &SharedVault, key: &SymmetricKey) -> Self {
        VaultKeyRecord {
            shared_vault_uuid: vault.uuid.clone(),
            owner_uuid: vault.owner_uuid.clone(),
            key_version: key.version(),
            vault_key: key.to_base64().to_string(),
        }
    }
}

impl Drop for VaultKeyRecord {
    fn drop(&mut self) {
        self.vault_key.zeroize();
    }
}

// =============================================================================
// Vault Key Manager
// =============================================================================

pub struct VaultKeyManager {
    user_uuid: String,
    personal: SymmetricKey,
    slots: RwLock<HashMap<String, Arc<RwLock<VaultSlot>>>>,
    store: Arc<ItemStore>,
    channel: Arc<AsymmetricMessageChannel>,
    outbox: Arc<OutboundQueue>,
    events: EventBus,
}

impl VaultKeyManager {
    pub fn new(
        user_uuid: impl Into<String>,
        personal: SymmetricKey,
        store: Arc<ItemStore>,
        channel: Arc<AsymmetricMessageChannel>,
        outbox: Arc<OutboundQueue>,
        events: EventBus,
    ) -> Self {
        VaultKeyManager {
            user_uuid: user_uuid.into(),
            personal,
            slots: RwLock::new(HashMap::new()),
            store,
            channel,
            outbox,
            events,
        }
    }

    pub fn user_uuid(&self) -> &str {
        &self.user_uuid
    }

    async fn slot(&self, vault_uuid: &str) -> Option<Arc<RwLock<VaultSlot>>> {
        self.slots.read().await.get(vault_uuid).cloned()
    }

    async fn require_slot(&self, vault_uuid: &str) -> SyncResult<Arc<RwLock<VaultSlot>>> {
        self.slot(vault_uuid)
            .await
            .ok_or_else(|| CollaborationError::VaultNotFound(vault_uuid.to_string()).into())
    }

    // =========================================================================
    // Key Lookup
    // =========================================================================

    /// Key of `version` for `scope`, current or historical.
    pub async fn key_for(&self, scope: &VaultScope, version: u64) -> SyncResult<SymmetricKey> {
        let unavailable = || SyncError::KeyVersionUnavailable {
            scope: scope.to_string(),
            version,
        };

        match scope {
            VaultScope::Personal if version == self.personal.version() => Ok(self.personal.clone()),
            VaultScope::Personal => Err(unavailable()),
            VaultScope::Shared(uuid) => {
                let slot = self.slot(uuid).await.ok_or_else(unavailable)?;
                let slot = slot.read().await;
                slot.keys.get(&version).cloned().ok_or_else(unavailable)
            }
        }
    }

    /// The key new ciphertext for `scope` must use.
    pub async fn current_key(&self, scope: &VaultScope) -> SyncResult<SymmetricKey> {
        match scope {
            VaultScope::Personal => Ok(self.personal.clone()),
            VaultScope::Shared(uuid) => {
                let slot = self.require_slot(uuid).await?;
                let slot = slot.read().await;
                current_of(&slot, scope)
            }
        }
    }

    /// Encrypts an item's working copy under its scope's current key.
    pub async fn encrypt_item(&self, item: &Item) -> SyncResult<EncryptedPayload> {
        let aad = item_aad(&item.id, &item.content_type);
        match &item.scope {
            VaultScope::Personal => Ok(self.personal.encrypt(item.content.as_bytes(), &aad)?),
            VaultScope::Shared(uuid) => {
                let slot = self.require_slot(uuid).await?;
                let slot = slot.read().await;
                let key = current_of(&slot, &item.scope)?;
                Ok(key.encrypt(item.content.as_bytes(), &aad)?)
            }
        }
    }

    /// Decrypts a payload with whatever version it was written under.
    pub async fn decrypt_item(
        &self,
        id: &ItemId,
        content_type: &ContentType,
        scope: &VaultScope,
        payload: &EncryptedPayload,
    ) -> SyncResult<String> {
        let key = self.key_for(scope, payload.key_version).await?;
        let plaintext = key.decrypt(payload, &item_aad(id, content_type))?;
        String::from_utf8(plaintext)
            .map_err(|e| SyncError::Crypto(CryptoError::Encoding(e.to_string())))
    }

    // =========================================================================
    // Vault Queries
    // =========================================================================

    pub async fn vault(&self, vault_uuid: &str) -> Option<SharedVault> {
        let slot = self.slot(vault_uuid).await?;
        let vault = slot.read().await.vault.clone();
        Some(vault)
    }

    /// Every known vault, sorted by uuid.
    pub async fn vaults(&self) -> Vec<SharedVault> {
        let slots: Vec<Arc<RwLock<VaultSlot>>> = self.slots.read().await.values().cloned().collect();
        let mut vaults = Vec::with_capacity(slots.len());
        for slot in slots {
            vaults.push(slot.read().await.vault.clone());
        }
        vaults.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        vaults
    }

    /// Key versions held for a vault, ascending.
    pub async fn held_versions(&self, vault_uuid: &str) -> Vec<u64> {
        match self.slot(vault_uuid).await {
            Some(slot) => slot.read().await.keys.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn has_key_material(&self, vault_uuid: &str) -> bool {
        !self.held_versions(vault_uuid).await.is_empty()
    }

    /// Permission of `user_uuid` in a vault. The owner counts as Admin.
    pub async fn permission_of(&self, vault_uuid: &str, user_uuid: &str) -> Option<SharedVaultPermission> {
        let slot = self.slot(vault_uuid).await?;
        let permission = slot.read().await.permission_of(user_uuid);
        permission
    }

    pub async fn local_permission(&self, vault_uuid: &str) -> Option<SharedVaultPermission> {
        self.permission_of(vault_uuid, &self.user_uuid).await
    }

    /// Errors unless the local user may write items in `scope`.
    pub async fn ensure_can_write(&self, scope: &VaultScope) -> SyncResult<()> {
        let Some(vault_uuid) = scope.shared_vault_uuid() else {
            return Ok(());
        };
        match self.local_permission(vault_uuid).await {
            Some(permission) if permission.can_write() => Ok(()),
            Some(_) => Err(CollaborationError::PermissionDenied {
                vault: vault_uuid.to_string(),
                reason: "read-only member".into(),
            }
            .into()),
            None => Err(CollaborationError::VaultNotFound(vault_uuid.to_string()).into()),
        }
    }

    // =========================================================================
    // Vault Lifecycle
    // =========================================================================

    /// Creates a vault owned by the local user, at key version 1.
    pub async fn create_shared_vault(&self, name: &str) -> SyncResult<SharedVault> {
        validate_vault_name(name)?;

        let vault = SharedVault {
            uuid: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            owner_uuid: self.user_uuid.clone(),
            key_version: INITIAL_KEY_VERSION,
            members: Vec::new(),
        };
        self.join_vault(vault.clone(), SymmetricKey::generate(INITIAL_KEY_VERSION))
            .await;

        self.outbox
            .push_vault_operation(VaultOperation::Create {
                vault: SharedVaultServerHash {
                    uuid: vault.uuid.clone(),
                    name: vault.name.clone(),
                    owner_uuid: vault.owner_uuid.clone(),
                    key_version: vault.key_version,
                    members: Vec::new(),
                    deleted: false,
                },
            })
            .await;

        info!(vault = %vault.uuid, "Shared vault created");
        Ok(vault)
    }

    /// Installs a vault together with its first known key.
    pub async fn join_vault(&self, mut vault: SharedVault, key: SymmetricKey) {
        let version = key.version();
        vault.key_version = vault.key_version.max(version);
        let vault_uuid = vault.uuid.clone();
        self.record_key_item(&vault, &key).await;

        let existing = self.slot(&vault_uuid).await;
        match existing {
            Some(slot) => {
                let mut slot = slot.write().await;
                slot.keys.entry(version).or_insert(key);
                vault.key_version = vault.key_version.max(slot.vault.key_version);
                slot.vault = vault;
            }
            None => {
                let mut keys = BTreeMap::new();
                keys.insert(version, key);
                self.slots
                    .write()
                    .await
                    .insert(vault_uuid.clone(), Arc::new(RwLock::new(VaultSlot { vault, keys })));
            }
        }

        self.events.publish(EngineEvent::VaultKeyInstalled {
            vault: vault_uuid,
            version,
        });
    }

    /// Forgets a vault and every key of it, tombstoning the account copies.
    pub async fn remove_vault(&self, vault_uuid: &str) -> Option<SharedVault> {
        let slot = self.slots.write().await.remove(vault_uuid)?;
        let vault = slot.read().await.vault.clone();

        let prefix = format!("{}{}:", KEY_ITEM_PREFIX, vault_uuid);
        let now = Utc::now();
        let ((), changes) = self
            .store
            .transaction(|txn| {
                for id in txn.ids_in_scope(&VaultScope::Personal) {
                    if !id.as_str().starts_with(&prefix) {
                        continue;
                    }
                    if let Some(mut item) = txn.get(&id).filter(|i| !i.deleted).cloned() {
                        item.mark_deleted(now);
                        txn.upsert(item, ChangeSource::LocalChanged);
                    }
                }
            })
            .await;
        self.events
            .publish_all(changes.into_iter().map(EngineEvent::ItemsChanged));

        info!(vault = %vault_uuid, "Vault keys discarded");
        Some(vault)
    }

    /// Writes a key version into the account's personal items so the
    /// user's other devices receive it on their next sync.
    async fn record_key_item(&self, vault: &SharedVault, key: &SymmetricKey) {
        let record = VaultKeyRecord::new(vault, key);
        let content = match serde_json::to_string(&record) {
            Ok(json) => Zeroizing::new(json),
            Err(e) => {
                warn!(vault = %vault.uuid, error = %e, "Cannot record vault key item");
                return;
            }
        };
        let id = key_item_id(&vault.uuid, key.version());
        let now = Utc::now();

        let ((), changes) = self
            .store
            .transaction(|txn| {
                if txn.get(&id).is_some_and(|existing| !existing.deleted) {
                    return;
                }
                let item = Item::new(
                    id.clone(),
                    ContentType::KeySystemItemsKey,
                    content.as_str(),
                    VaultScope::Personal,
                    now,
                );
                txn.upsert(item, ChangeSource::LocalChanged);
            })
            .await;

        if !changes.is_empty() {
            debug!(vault = %vault.uuid, version = key.version(), "Vault key item recorded");
        }
        self.events
            .publish_all(changes.into_iter().map(EngineEvent::ItemsChanged));
    }

    // =========================================================================
    // Rotation
    // =========================================================================

    /// Explicit re-key. Owner or Admin only.
    pub async fn rotate_key(&self, vault_uuid: &str) -> SyncResult<RotationReport> {
        let slot = self.require_slot(vault_uuid).await?;
        let mut slot = slot.write().await;
        self.ensure_can_manage(&slot)?;
        self.rotate_locked(&mut slot, None).await
    }

    /// Adds or removes a member. Removal rotates the key before the lock is
    /// released, so nothing is encrypted under the old version afterwards.
    pub async fn apply_membership_change(
        &self,
        vault_uuid: &str,
        change: MembershipChange,
    ) -> SyncResult<Option<RotationReport>> {
        let slot = self.require_slot(vault_uuid).await?;
        let mut slot = slot.write().await;

        match change {
            MembershipChange::Add(member) => {
                match slot.vault.members.iter_mut().find(|m| m.user_uuid == member.user_uuid) {
                    Some(existing) => existing.permission = member.permission,
                    None => slot.vault.members.push(member),
                }
                debug!(vault = %vault_uuid, members = slot.vault.members.len(), "Member added");
                Ok(None)
            }
            MembershipChange::Remove { user_uuid } => {
                self.ensure_can_manage(&slot)?;
                if user_uuid == slot.vault.owner_uuid {
                    return Err(CollaborationError::PermissionDenied {
                        vault: vault_uuid.to_string(),
                        reason: "the owner cannot be removed".into(),
                    }
                    .into());
                }
                slot.vault.members.retain(|m| m.user_uuid != user_uuid);
                self.outbox
                    .push_vault_operation(VaultOperation::RemoveMember {
                        vault_uuid: vault_uuid.to_string(),
                        user_uuid: user_uuid.clone(),
                    })
                    .await;
                info!(vault = %vault_uuid, removed = %user_uuid, "Member removed, rotating key");

                let report = self.rotate_locked(&mut slot, Some(&user_uuid)).await?;
                Ok(Some(report))
            }
        }
    }

    fn ensure_can_manage(&self, slot: &VaultSlot) -> SyncResult<()> {
        match slot.permission_of(&self.user_uuid) {
            Some(permission) if permission.can_invite() => Ok(()),
            _ => Err(CollaborationError::PermissionDenied {
                vault: slot.vault.uuid.clone(),
                reason: "only the owner or an admin can manage members".into(),
            }
            .into()),
        }
    }

    async fn rotate_locked(
        &self,
        slot: &mut VaultSlot,
        removed: Option<&str>,
    ) -> SyncResult<RotationReport> {
        let vault_uuid = slot.vault.uuid.clone();
        let version = slot
            .newest_version()
            .unwrap_or(0)
            .max(slot.vault.key_version)
            + 1;
        let key = SymmetricKey::generate(version);

        let mut recipients: Vec<String> = std::iter::once(slot.vault.owner_uuid.clone())
            .chain(slot.vault.members.iter().map(|m| m.user_uuid.clone()))
            .filter(|uuid| uuid != &self.user_uuid && Some(uuid.as_str()) != removed)
            .collect();
        recipients.sort();
        recipients.dedup();

        let payload = KeyRotationPayload {
            shared_vault_uuid: vault_uuid.clone(),
            key_version: version,
            vault_key: key.to_base64().to_string(),
        };
        let body = Zeroizing::new(serde_json::to_vec(&payload)?);

        let mut report = RotationReport {
            vault_uuid: vault_uuid.clone(),
            key_version: version,
            recipients: Vec::new(),
            unreachable: Vec::new(),
        };
        for recipient in recipients {
            match self
                .channel
                .send_to_contact(&recipient, MessageKind::KeyRotation, &body)
                .await
            {
                Ok(_) => report.recipients.push(recipient),
                Err(e) => {
                    warn!(vault = %vault_uuid, member = %recipient, error = %e, "Cannot deliver rotated key");
                    report.unreachable.push(recipient);
                }
            }
        }

        self.record_key_item(&slot.vault, &key).await;
        slot.keys.insert(version, key);
        slot.vault.key_version = version;
        self.outbox
            .push_vault_operation(VaultOperation::UpdateKeyVersion {
                vault_uuid: vault_uuid.clone(),
                key_version: version,
            })
            .await;

        info!(
            vault = %vault_uuid,
            version,
            recipients = report.recipients.len(),
            "Vault key rotated"
        );
        self.events.publish(EngineEvent::VaultKeyRotated {
            vault: vault_uuid,
            version,
        });
        Ok(report)
    }

    // =========================================================================
    // Inbound Keys
    // =========================================================================

    /// Installs a key received in a key-rotation message.
    ///
    /// The sender must be the owner or an admin of the vault. Returns false
    /// when the version was already held.
    pub async fn install_key(&self, sender_uuid: &str, payload: &KeyRotationPayload) -> SyncResult<bool> {
        let vault_uuid = payload.shared_vault_uuid.as_str();
        let slot = self.require_slot(vault_uuid).await?;
        let mut slot = slot.write().await;

        if !slot.permission_of(sender_uuid).is_some_and(|p| p.can_invite()) {
            return Err(CollaborationError::PermissionDenied {
                vault: vault_uuid.to_string(),
                reason: format!("{} may not rotate this vault's key", sender_uuid),
            }
            .into());
        }
        if slot.keys.contains_key(&payload.key_version) {
            return Ok(false);
        }

        let key = SymmetricKey::from_base64(&payload.vault_key, payload.key_version)?;
        self.record_key_item(&slot.vault, &key).await;
        slot.keys.insert(payload.key_version, key);
        slot.vault.key_version = slot.vault.key_version.max(payload.key_version);
        drop(slot);

        info!(vault = %vault_uuid, version = payload.key_version, "Rotated vault key installed");
        self.events.publish(EngineEvent::VaultKeyInstalled {
            vault: vault_uuid.to_string(),
            version: payload.key_version,
        });
        Ok(true)
    }

    /// Installs a key version another device of this account recorded.
    ///
    /// Only vaults already known from the server's vault list are filled,
    /// so a stale record cannot bring back a vault the user has left.
    /// Returns false when nothing was installed.
    pub async fn install_recorded_key(&self, record: &VaultKeyRecord) -> SyncResult<bool> {
        let vault_uuid = record.shared_vault_uuid.as_str();
        let Some(slot) = self.slot(vault_uuid).await else {
            debug!(vault = %vault_uuid, "Key item for an unknown vault, ignored");
            return Ok(false);
        };
        let mut slot = slot.write().await;
        if slot.vault.owner_uuid != record.owner_uuid {
            return Err(SyncError::InvalidMessage(format!(
                "key item for vault {} names a different owner",
                vault_uuid
            )));
        }
        if slot.keys.contains_key(&record.key_version) {
            return Ok(false);
        }

        let key = SymmetricKey::from_base64(&record.vault_key, record.key_version)?;
        slot.keys.insert(record.key_version, key);
        slot.vault.key_version = slot.vault.key_version.max(record.key_version);
        drop(slot);

        info!(vault = %vault_uuid, version = record.key_version, "Vault key installed from account");
        self.events.publish(EngineEvent::VaultKeyInstalled {
            vault: vault_uuid.to_string(),
            version: record.key_version,
        });
        Ok(true)
    }

    /// Applies the server's vault list.
    ///
    /// Vaults the server lists that this device has no slot for get an empty
    /// slot, filled once the account's key items arrive.
    pub async fn reconcile(&self, vaults: &[SharedVaultServerHash]) -> Vec<VaultChange> {
        let mut changes = Vec::new();

        for hash in vaults {
            let is_member = hash.owner_uuid == self.user_uuid
                || hash.members.iter().any(|m| m.user_uuid == self.user_uuid);

            if hash.deleted || !is_member {
                if self.remove_vault(&hash.uuid).await.is_some() {
                    changes.push(VaultChange::Removed(hash.uuid.clone()));
                }
                continue;
            }

            let existing = self.slot(&hash.uuid).await;
            match existing {
                Some(slot) => {
                    let mut slot = slot.write().await;
                    slot.vault.name = hash.name.clone();
                    slot.vault.owner_uuid = hash.owner_uuid.clone();
                    slot.vault.members = hash.members.clone();
                    if hash.key_version > slot.vault.key_version {
                        debug!(
                            vault = %hash.uuid,
                            server_version = hash.key_version,
                            "Server reports a newer key version"
                        );
                        slot.vault.key_version = hash.key_version;
                    }
                }
                None => {
                    warn!(vault = %hash.uuid, "Member of a vault with no local key material");
                    let vault = SharedVault {
                        uuid: hash.uuid.clone(),
                        name: hash.name.clone(),
                        owner_uuid: hash.owner_uuid.clone(),
                        key_version: hash.key_version,
                        members: hash.members.clone(),
                    };
                    self.slots.write().await.insert(
                        hash.uuid.clone(),
                        Arc::new(RwLock::new(VaultSlot {
                            vault,
                            keys: BTreeMap::new(),
                        })),
                    );
                }
            }
            changes.push(VaultChange::Updated(hash.uuid.clone()));
        }

        changes
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serializes every slot, sealed under the personal key.
    pub async fn export_sealed(&self) -> SyncResult<EncryptedPayload> {
        let slots: Vec<Arc<RwLock<VaultSlot>>> = self.slots.read().await.values().cloned().collect();
        let mut stored = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.read().await;
            stored.push(StoredVault {
                vault: slot.vault.clone(),
                keys: slot
                    .keys
                    .iter()
                    .map(|(version, key)| StoredKey {
                        version: *version,
                        key: key.to_base64().to_string(),
                    })
                    .collect(),
            });
        }
        let json = Zeroizing::new(serde_json::to_vec(&stored)?);
        Ok(self.personal.encrypt(&json, KEY_STORE_AAD)?)
    }

    /// Restores slots written by [`Self::export_sealed`].
    pub async fn import_sealed(&self, sealed: &EncryptedPayload) -> SyncResult<usize> {
        let json = Zeroizing::new(self.personal.decrypt(sealed, KEY_STORE_AAD)?);
        let stored: Vec<StoredVault> = serde_json::from_slice(&json)?;

        let mut slots = self.slots.write().await;
        for entry in &stored {
            let mut keys = BTreeMap::new();
            for stored_key in &entry.keys {
                let key = SymmetricKey::from_base64(&stored_key.key, stored_key.version).map_err(|_| {
                    SyncError::KeyStoreCorrupted {
                        vault: entry.vault.uuid.clone(),
                    }
                })?;
                keys.insert(stored_key.version, key);
            }
            slots.insert(
                entry.vault.uuid.clone(),
                Arc::new(RwLock::new(VaultSlot {
                    vault: entry.vault.clone(),
                    keys,
                })),
            );
        }

        info!(vaults = stored.len(), "Vault key store restored");
        Ok(stored.len())
    }
}

fn current_of(slot: &VaultSlot, scope: &VaultScope) -> SyncResult<SymmetricKey> {
    if slot.keys.is_empty() {
        return Err(SyncError::KeyStoreCorrupted {
            vault: slot.vault.uuid.clone(),
        });
    }
    slot.keys
        .get(&slot.vault.key_version)
        .cloned()
        .ok_or_else(|| SyncError::KeyVersionUnavailable {
            scope: scope.to_string(),
            version: slot.vault.key_version,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{ContactDraft, TrustedContactRegistry};
    use cinder_core::IdentityKeyPair;

    struct Fixture {
        manager: VaultKeyManager,
        store: Arc<ItemStore>,
        contacts: Arc<TrustedContactRegistry>,
        outbox: Arc<OutboundQueue>,
    }

    fn fixture(user_uuid: &str) -> Fixture {
        fixture_with_key(user_uuid, SymmetricKey::generate(INITIAL_KEY_VERSION))
    }

    fn fixture_with_key(user_uuid: &str, personal: SymmetricKey) -> Fixture {
        let events = EventBus::new();
        let store = Arc::new(ItemStore::new());
        let contacts = Arc::new(TrustedContactRegistry::new(events.clone()));
        let outbox = Arc::new(OutboundQueue::new());
        let channel = Arc::new(AsymmetricMessageChannel::new(
            Arc::new(IdentityKeyPair::generate()),
            contacts.clone(),
            outbox.clone(),
            events.clone(),
        ));
        let manager = VaultKeyManager::new(
            user_uuid,
            personal,
            store.clone(),
            channel,
            outbox.clone(),
            events,
        );
        Fixture {
            manager,
            store,
            contacts,
            outbox,
        }
    }

    fn server_hash(vault: &SharedVault) -> SharedVaultServerHash {
        SharedVaultServerHash {
            uuid: vault.uuid.clone(),
            name: vault.name.clone(),
            owner_uuid: vault.owner_uuid.clone(),
            key_version: vault.key_version,
            members: vault.members.clone(),
            deleted: false,
        }
    }

    async fn add_member(f: &Fixture, vault: &str, permission: SharedVaultPermission) -> (String, String) {
        let uuid = Uuid::new_v4().to_string();
        let keys = IdentityKeyPair::generate().public();
        f.contacts
            .create_or_edit_trusted_contact(ContactDraft::new(uuid.clone(), "member", &keys))
            .await
            .unwrap();
        f.manager
            .apply_membership_change(
                vault,
                MembershipChange::Add(VaultMember {
                    user_uuid: uuid.clone(),
                    permission,
                }),
            )
            .await
            .unwrap();
        (uuid, keys.encryption_public_key)
    }

    fn note(scope: VaultScope) -> Item {
        Item::new(ItemId::from("n1"), ContentType::Note, "secret", scope, chrono::Utc::now())
    }

    #[tokio::test]
    async fn test_old_versions_still_decrypt_after_rotation() {
        let owner = Uuid::new_v4().to_string();
        let f = fixture(&owner);
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        let item = note(vault.scope());

        let v1_payload = f.manager.encrypt_item(&item).await.unwrap();
        let report = f.manager.rotate_key(&vault.uuid).await.unwrap();
        assert_eq!(report.key_version, 2);

        let v2_payload = f.manager.encrypt_item(&item).await.unwrap();
        assert_eq!(v1_payload.key_version, 1);
        assert_eq!(v2_payload.key_version, 2);

        for payload in [&v1_payload, &v2_payload] {
            let plaintext = f
                .manager
                .decrypt_item(&item.id, &item.content_type, &item.scope, payload)
                .await
                .unwrap();
            assert_eq!(plaintext, "secret");
        }
    }

    #[tokio::test]
    async fn test_removal_rotates_and_excludes_removed_member() {
        let owner = Uuid::new_v4().to_string();
        let f = fixture(&owner);
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        let (bob, bob_key) = add_member(&f, &vault.uuid, SharedVaultPermission::Write).await;
        let (carol, carol_key) = add_member(&f, &vault.uuid, SharedVaultPermission::Read).await;

        let report = f
            .manager
            .apply_membership_change(&vault.uuid, MembershipChange::Remove { user_uuid: carol.clone() })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.key_version, 2);
        assert_eq!(report.recipients, vec![bob]);

        let queued = f.outbox.snapshot().await;
        let rotation_targets: Vec<&str> = queued
            .messages
            .iter()
            .filter(|m| m.envelope.kind == MessageKind::KeyRotation)
            .map(|m| m.envelope.recipient_public_key.as_str())
            .collect();
        assert_eq!(rotation_targets, vec![bob_key.as_str()]);
        assert!(!rotation_targets.contains(&carol_key.as_str()));
        assert!(queued.vault_operations.contains(&VaultOperation::UpdateKeyVersion {
            vault_uuid: vault.uuid.clone(),
            key_version: 2,
        }));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_rotate() {
        let me = Uuid::new_v4().to_string();
        let f = fixture(&me);
        let vault = SharedVault {
            uuid: "v1".into(),
            name: "Shared".into(),
            owner_uuid: Uuid::new_v4().to_string(),
            key_version: 1,
            members: vec![VaultMember {
                user_uuid: me.clone(),
                permission: SharedVaultPermission::Write,
            }],
        };
        f.manager.join_vault(vault, SymmetricKey::generate(1)).await;

        let err = f.manager.rotate_key("v1").await.unwrap_err();
        assert!(err.is_user_actionable());
        assert!(f.manager.ensure_can_write(&VaultScope::shared("v1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_version_is_unavailable_not_fatal() {
        let f = fixture(&Uuid::new_v4().to_string());
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        let err = f.manager.key_for(&vault.scope(), 7).await.unwrap_err();
        assert!(matches!(err, SyncError::KeyVersionUnavailable { version: 7, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_vault_without_keys_is_corrupted() {
        let me = Uuid::new_v4().to_string();
        let f = fixture(&me);
        f.manager
            .reconcile(&[SharedVaultServerHash {
                uuid: "v9".into(),
                name: "Lost".into(),
                owner_uuid: me.clone(),
                key_version: 4,
                members: vec![],
                deleted: false,
            }])
            .await;

        let err = f.manager.encrypt_item(&note(VaultScope::shared("v9"))).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_deleted_vault_is_removed_on_reconcile() {
        let f = fixture(&Uuid::new_v4().to_string());
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        let changes = f
            .manager
            .reconcile(&[SharedVaultServerHash {
                uuid: vault.uuid.clone(),
                name: vault.name.clone(),
                owner_uuid: vault.owner_uuid.clone(),
                key_version: 1,
                members: vec![],
                deleted: true,
            }])
            .await;
        assert_eq!(changes, vec![VaultChange::Removed(vault.uuid.clone())]);
        assert!(f.manager.vault(&vault.uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_key_store_export_import() {
        let owner = Uuid::new_v4().to_string();
        let f = fixture(&owner);
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        f.manager.rotate_key(&vault.uuid).await.unwrap();
        let sealed = f.manager.export_sealed().await.unwrap();

        let restored = VaultKeyManager::new(
            owner,
            f.manager.personal.clone(),
            Arc::new(ItemStore::new()),
            f.manager.channel.clone(),
            f.outbox.clone(),
            EventBus::new(),
        );
        assert_eq!(restored.import_sealed(&sealed).await.unwrap(), 1);
        assert_eq!(restored.held_versions(&vault.uuid).await, vec![1, 2]);

        // a different personal key cannot open it
        let stranger = fixture(&Uuid::new_v4().to_string());
        assert!(stranger.manager.import_sealed(&sealed).await.is_err());
    }

    #[tokio::test]
    async fn test_every_key_version_becomes_a_personal_item() {
        let owner = Uuid::new_v4().to_string();
        let f = fixture(&owner);
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        f.manager.rotate_key(&vault.uuid).await.unwrap();

        let items = f.store.items_in_scope(&VaultScope::Personal).await;
        let ids: Vec<ItemId> = items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![key_item_id(&vault.uuid, 1), key_item_id(&vault.uuid, 2)]);
        assert!(items
            .iter()
            .all(|i| i.dirty && i.content_type == ContentType::KeySystemItemsKey));

        let record: VaultKeyRecord = serde_json::from_str(&items[1].content).unwrap();
        assert_eq!(record.key_version, 2);
        assert_eq!(record.shared_vault_uuid, vault.uuid);
    }

    #[tokio::test]
    async fn test_second_device_installs_recorded_key() {
        let owner = Uuid::new_v4().to_string();
        let personal = SymmetricKey::generate(INITIAL_KEY_VERSION);
        let first = fixture_with_key(&owner, personal.clone());
        let second = fixture_with_key(&owner, personal);

        let vault = first.manager.create_shared_vault("Team").await.unwrap();
        let item = note(vault.scope());
        let payload = first.manager.encrypt_item(&item).await.unwrap();
        let key_item = first.store.get(&key_item_id(&vault.uuid, 1)).await.unwrap();
        let record: VaultKeyRecord = serde_json::from_str(&key_item.content).unwrap();

        // before the vault list arrives the record has nowhere to go
        assert!(!second.manager.install_recorded_key(&record).await.unwrap());

        second.manager.reconcile(&[server_hash(&vault)]).await;
        assert!(second.manager.install_recorded_key(&record).await.unwrap());
        assert!(!second.manager.install_recorded_key(&record).await.unwrap());

        let plaintext = second
            .manager
            .decrypt_item(&item.id, &item.content_type, &item.scope, &payload)
            .await
            .unwrap();
        assert_eq!(plaintext, "secret");
        assert!(second.manager.encrypt_item(&item).await.is_ok());
        // installing from the account does not record the key again
        assert!(second.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_removing_vault_tombstones_key_items() {
        let f = fixture(&Uuid::new_v4().to_string());
        let vault = f.manager.create_shared_vault("Team").await.unwrap();
        let other = f.manager.create_shared_vault("Other").await.unwrap();

        f.manager.remove_vault(&vault.uuid).await.unwrap();

        let removed = f.store.get(&key_item_id(&vault.uuid, 1)).await.unwrap();
        assert!(removed.deleted && removed.dirty);
        let kept = f.store.get(&key_item_id(&other.uuid, 1)).await.unwrap();
        assert!(!kept.deleted);
    }
}
