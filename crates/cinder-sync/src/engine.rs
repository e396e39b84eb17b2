//! # Engine
//!
//! The embedding application's single entry point. Wires the item store,
//! key manager, invite protocol, message channel and contact registry to one
//! [`SyncCoordinator`], restores persisted state, and checks permissions on
//! every local write.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Engine                                     │
//! │                                                                         │
//! │   items ────────► ensure_can_write ──► ItemStore ──► ItemsChanged      │
//! │   vaults ───────► VaultKeyManager ───► OutboundQueue                   │
//! │   invites ──────► InviteProtocol ────► OutboundQueue                   │
//! │   contacts ─────► TrustedContactRegistry                               │
//! │   sync() ───────► SyncCoordinator (coalesced)                          │
//! │                                                                         │
//! │   every component publishes on one EventBus ──► subscribe()            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cinder_core::{
    ContentType, IdGenerator, IdentityKeyPair, Invite, Item, ItemId, MessageKind, PublicIdentity,
    SharedVault, SharedVaultPermission, SymmetricKey, TrustedContact, UuidGenerator, VaultScope,
};
use cinder_store::{
    Database, DbConfig, ItemStore, ItemsChanged, MemoryStateStore, SyncStateStore,
};

use crate::config::SyncConfig;
use crate::contacts::{ContactDraft, TrustRequest, TrustedContactRegistry};
use crate::coordinator::{CoordinatorParts, CoordinatorSettings, SyncCoordinator, SyncOutcome};
use crate::error::{CollaborationError, SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus, EventKind, Subscription};
use crate::invites::{AcceptedInvite, InviteProtocol, PendingInvite};
use crate::messages::AsymmetricMessageChannel;
use crate::outbox::OutboundQueue;
use crate::protocol::{TrustConfirmationPayload, VaultOperation};
use crate::transport::{SyncEndpoint, TransportConfig, WsEndpoint};
use crate::vault_keys::{MembershipChange, RotationReport, VaultKeyManager};

// =============================================================================
// Builder
// =============================================================================

/// Builds an [`Engine`].
///
/// ## Usage
/// ```rust,ignore
/// let engine = EngineBuilder::new(config, identity, personal_key)
///     .with_state_store(Arc::new(db))
///     .build()
///     .await?;
/// engine.sync().await?;
/// ```
pub struct EngineBuilder {
    config: SyncConfig,
    identity: IdentityKeyPair,
    personal_key: SymmetricKey,
    endpoint: Option<Arc<dyn SyncEndpoint>>,
    state: Option<Arc<dyn SyncStateStore>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl EngineBuilder {
    /// `personal_key` encrypts personal items and the sealed key store.
    pub fn new(config: SyncConfig, identity: IdentityKeyPair, personal_key: SymmetricKey) -> Self {
        EngineBuilder {
            config,
            identity,
            personal_key,
            endpoint: None,
            state: None,
            ids: None,
        }
    }

    /// Replaces the WebSocket endpoint built from `server.url`.
    pub fn with_endpoint(mut self, endpoint: Arc<dyn SyncEndpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Replaces the SQLite store at `storage.database_path`.
    pub fn with_state_store(mut self, state: Arc<dyn SyncStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub async fn build(self) -> SyncResult<Engine> {
        self.config.validate()?;

        let endpoint: Arc<dyn SyncEndpoint> = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(WsEndpoint::new(TransportConfig::from_sync_config(&self.config)?)),
        };
        let state: Arc<dyn SyncStateStore> = match self.state {
            Some(state) => state,
            None => match self.config.database_path() {
                Some(path) => Arc::new(Database::new(DbConfig::new(path)).await?),
                None => {
                    warn!("No database path available, state will not survive restarts");
                    Arc::new(MemoryStateStore::new())
                }
            },
        };
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));

        Engine::assemble(self.config, self.identity, self.personal_key, endpoint, state, ids).await
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    config: SyncConfig,
    identity: Arc<IdentityKeyPair>,
    store: Arc<ItemStore>,
    keys: Arc<VaultKeyManager>,
    invites: Arc<InviteProtocol>,
    channel: Arc<AsymmetricMessageChannel>,
    contacts: Arc<TrustedContactRegistry>,
    outbox: Arc<OutboundQueue>,
    coordinator: Arc<SyncCoordinator>,
    events: EventBus,
    ids: Arc<dyn IdGenerator>,
    /// Accepted vaults whose initial download has not completed yet.
    pending_from_scratch: Mutex<BTreeSet<String>>,
}

impl Engine {
    async fn assemble(
        config: SyncConfig,
        identity: IdentityKeyPair,
        personal_key: SymmetricKey,
        endpoint: Arc<dyn SyncEndpoint>,
        state: Arc<dyn SyncStateStore>,
        ids: Arc<dyn IdGenerator>,
    ) -> SyncResult<Self> {
        let user_uuid = config.user_uuid().to_string();
        let events = EventBus::new();
        let identity = Arc::new(identity);

        let store = Arc::new(ItemStore::from_items(state.load_items().await?));
        let contacts = Arc::new(TrustedContactRegistry::new(events.clone()));
        let outbox = Arc::new(OutboundQueue::new());
        let channel = Arc::new(AsymmetricMessageChannel::new(
            identity.clone(),
            contacts.clone(),
            outbox.clone(),
            events.clone(),
        ));
        let keys = Arc::new(VaultKeyManager::new(
            user_uuid.clone(),
            personal_key,
            store.clone(),
            channel.clone(),
            outbox.clone(),
            events.clone(),
        ));
        let invites = Arc::new(InviteProtocol::new(
            user_uuid.clone(),
            contacts.clone(),
            channel.clone(),
            keys.clone(),
            outbox.clone(),
            events.clone(),
        ));

        let coordinator = Arc::new(SyncCoordinator::new(
            CoordinatorSettings::from(&config),
            CoordinatorParts {
                store: store.clone(),
                state,
                endpoint,
                keys: keys.clone(),
                invites: invites.clone(),
                channel: channel.clone(),
                contacts: contacts.clone(),
                outbox: outbox.clone(),
                events: events.clone(),
                ids: ids.clone(),
            },
        ));
        coordinator.restore().await?;

        info!(
            user_uuid = %user_uuid,
            items = store.len().await,
            vaults = keys.vaults().await.len(),
            "Engine started"
        );

        Ok(Engine {
            config,
            identity,
            store,
            keys,
            invites,
            channel,
            contacts,
            outbox,
            coordinator,
            events,
            ids,
            pending_from_scratch: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn user_uuid(&self) -> &str {
        self.config.user_uuid()
    }

    /// This device's public keys, to hand to collaborators out of band.
    pub fn public_identity(&self) -> PublicIdentity {
        self.identity.public()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Runs a sync cycle, or joins the one in flight. Vaults accepted while
    /// offline get their initial download afterwards.
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        let outcome = self.coordinator.sync().await?;

        let pending: Vec<String> = self.pending_from_scratch.lock().await.iter().cloned().collect();
        for vault in pending {
            match self.coordinator.sync_vault_from_scratch(&vault).await {
                Ok(_) => {
                    self.pending_from_scratch.lock().await.remove(&vault);
                }
                Err(e) => warn!(vault = %vault, error = %e, "Vault download still pending"),
            }
        }
        Ok(outcome)
    }

    pub fn is_syncing(&self) -> bool {
        self.coordinator.is_syncing()
    }

    pub async fn dirty_count(&self) -> usize {
        self.store.dirty_count().await
    }

    pub async fn pending_outbound(&self) -> usize {
        self.outbox.len().await
    }

    /// Stops syncing. An in-flight cycle is abandoned before commit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.coordinator.cancel();
        self.coordinator.persist_key_store().await?;
        info!("Engine stopped");
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.events.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.events.subscribe_all()
    }

    // =========================================================================
    // Items
    // =========================================================================

    pub async fn item(&self, id: &ItemId) -> Option<Item> {
        self.store.get(id).await
    }

    pub async fn items_in_scope(&self, scope: &VaultScope) -> Vec<Item> {
        self.store.items_in_scope(scope).await
    }

    pub async fn create_item(
        &self,
        content_type: ContentType,
        content: impl Into<String>,
        scope: VaultScope,
    ) -> SyncResult<Item> {
        self.keys.ensure_can_write(&scope).await?;
        let (item, change) = self
            .store
            .create(self.ids.new_id(), content_type, content, scope)
            .await?;
        debug!(item_id = %item.id, scope = %item.scope, "Item created");
        self.publish_change(change);
        Ok(item)
    }

    pub async fn update_item(&self, id: &ItemId, content: impl Into<String>) -> SyncResult<Item> {
        let scope = self.scope_of(id).await?;
        self.keys.ensure_can_write(&scope).await?;
        let (item, change) = self.store.update_content(id, content).await?;
        self.publish_change(change);
        Ok(item)
    }

    /// Tombstones an item. It is erased once the server acknowledges.
    pub async fn delete_item(&self, id: &ItemId) -> SyncResult<Item> {
        let scope = self.scope_of(id).await?;
        self.keys.ensure_can_write(&scope).await?;
        let (item, change) = self.store.mark_deleted(id).await?;
        self.publish_change(change);
        Ok(item)
    }

    /// Moves an item between scopes. Write access to both is required.
    pub async fn move_item_to_vault(&self, id: &ItemId, target: VaultScope) -> SyncResult<Item> {
        let source = self.scope_of(id).await?;
        if source == target {
            return self.store.get(id).await.ok_or_else(|| not_found(id));
        }
        self.keys.ensure_can_write(&source).await?;
        self.keys.ensure_can_write(&target).await?;

        let (item, change) = self.store.move_to_scope(id, target).await?;
        info!(item_id = %id, from = %source, to = %item.scope, "Item moved");
        self.publish_change(change);
        Ok(item)
    }

    async fn scope_of(&self, id: &ItemId) -> SyncResult<VaultScope> {
        self.store
            .get(id)
            .await
            .filter(|item| !item.deleted)
            .map(|item| item.scope)
            .ok_or_else(|| not_found(id))
    }

    fn publish_change(&self, change: ItemsChanged) {
        if !change.is_empty() {
            self.events.publish(EngineEvent::ItemsChanged(change));
        }
    }

    // =========================================================================
    // Shared Vaults
    // =========================================================================

    pub async fn vaults(&self) -> Vec<SharedVault> {
        self.keys.vaults().await
    }

    pub async fn create_shared_vault(&self, name: &str) -> SyncResult<SharedVault> {
        let vault = self.keys.create_shared_vault(name).await?;
        self.persist_keys().await;
        Ok(vault)
    }

    /// Deletes a vault this user owns. Its items are tombstoned locally and
    /// the vault keys discarded.
    pub async fn delete_shared_vault(&self, vault_uuid: &str) -> SyncResult<()> {
        let vault = self
            .keys
            .vault(vault_uuid)
            .await
            .ok_or_else(|| CollaborationError::VaultNotFound(vault_uuid.to_string()))?;
        if vault.owner_uuid != self.user_uuid() {
            return Err(CollaborationError::PermissionDenied {
                vault: vault_uuid.to_string(),
                reason: "only the owner can delete a vault".into(),
            }
            .into());
        }

        for item in self.store.items_in_scope(&vault.scope()).await {
            let (_, change) = self.store.mark_deleted(&item.id).await?;
            self.publish_change(change);
        }
        self.keys.remove_vault(vault_uuid).await;
        self.outbox
            .push_vault_operation(VaultOperation::Delete {
                vault_uuid: vault_uuid.to_string(),
            })
            .await;

        info!(vault = %vault_uuid, "Shared vault deleted");
        self.events.publish(EngineEvent::SharedVaultRemoved {
            vault: vault_uuid.to_string(),
        });
        self.persist_keys().await;
        Ok(())
    }

    /// Removes a member and rotates the vault key.
    pub async fn remove_member(&self, vault_uuid: &str, user_uuid: &str) -> SyncResult<Option<RotationReport>> {
        let report = self
            .keys
            .apply_membership_change(
                vault_uuid,
                MembershipChange::Remove {
                    user_uuid: user_uuid.to_string(),
                },
            )
            .await?;
        self.persist_keys().await;
        Ok(report)
    }

    pub async fn rotate_vault_key(&self, vault_uuid: &str) -> SyncResult<RotationReport> {
        let report = self.keys.rotate_key(vault_uuid).await?;
        self.persist_keys().await;
        Ok(report)
    }

    /// Downloads every item of a vault regardless of the sync token.
    pub async fn sync_vault_from_scratch(&self, vault_uuid: &str) -> SyncResult<SyncOutcome> {
        self.coordinator.sync_vault_from_scratch(vault_uuid).await
    }

    async fn persist_keys(&self) {
        if let Err(e) = self.coordinator.persist_key_store().await {
            warn!(error = %e, "Failed to persist vault key store");
        }
    }

    // =========================================================================
    // Invites
    // =========================================================================

    pub async fn invite(
        &self,
        vault_uuid: &str,
        contact_uuid: &str,
        permission: SharedVaultPermission,
    ) -> SyncResult<Invite> {
        self.invites.create(vault_uuid, contact_uuid, permission).await
    }

    pub async fn pending_invites(&self) -> Vec<PendingInvite> {
        self.invites.pending_invites().await
    }

    pub async fn outbound_invites(&self) -> Vec<Invite> {
        self.invites.outbound_invites().await
    }

    /// Accepts an invite, then downloads the vault's existing items.
    ///
    /// If the download fails the invite stays accepted; the next
    /// [`Engine::sync`] retries it.
    pub async fn accept_invite(&self, invite_uuid: &str) -> SyncResult<AcceptedInvite> {
        let accepted = self.invites.accept(invite_uuid).await?;
        self.persist_keys().await;

        let vault = accepted.vault.uuid.clone();
        if let Err(e) = self.coordinator.sync_vault_from_scratch(&vault).await {
            warn!(vault = %vault, error = %e, "Initial vault download deferred");
            self.pending_from_scratch.lock().await.insert(vault);
        }
        Ok(accepted)
    }

    pub async fn decline_invite(&self, invite_uuid: &str) -> SyncResult<Invite> {
        self.invites.decline(invite_uuid).await
    }

    pub async fn revoke_invite(&self, invite_uuid: &str) -> SyncResult<Invite> {
        let invite = self.invites.revoke(invite_uuid).await?;
        self.persist_keys().await;
        Ok(invite)
    }

    pub async fn establish_trust_for_invite(
        &self,
        invite_uuid: &str,
        contact_name: &str,
    ) -> SyncResult<TrustedContact> {
        self.invites
            .establish_trust_for_invite(invite_uuid, contact_name)
            .await
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    pub async fn trusted_contacts(&self) -> Vec<TrustedContact> {
        self.contacts.all().await
    }

    pub async fn create_or_edit_trusted_contact(&self, draft: ContactDraft) -> SyncResult<TrustedContact> {
        Ok(self.contacts.create_or_edit_trusted_contact(draft).await?)
    }

    pub async fn re_trust(&self, draft: ContactDraft) -> SyncResult<TrustedContact> {
        Ok(self.contacts.re_trust(draft).await?)
    }

    pub async fn remove_contact(&self, contact_uuid: &str) -> SyncResult<TrustedContact> {
        Ok(self.contacts.remove(contact_uuid).await?)
    }

    pub async fn pending_trust_requests(&self) -> Vec<TrustRequest> {
        self.contacts.pending_trust_requests().await
    }

    pub async fn accept_trust_request(&self, contact_uuid: &str) -> SyncResult<TrustedContact> {
        Ok(self.contacts.accept_trust_request(contact_uuid).await?)
    }

    pub async fn dismiss_trust_request(&self, contact_uuid: &str) -> bool {
        self.contacts.dismiss_trust_request(contact_uuid).await
    }

    /// Sends this user's keys to a trusted contact, who sees it as a trust
    /// request.
    pub async fn send_trust_confirmation(&self, contact_uuid: &str, my_name: &str) -> SyncResult<String> {
        let keys = self.identity.public();
        let payload = TrustConfirmationPayload {
            contact_uuid: self.user_uuid().to_string(),
            name: my_name.to_string(),
            encryption_public_key: keys.encryption_public_key,
            signing_public_key: keys.signing_public_key,
        };
        let body = serde_json::to_vec(&payload)?;
        let message_id = self
            .channel
            .send_to_contact(contact_uuid, MessageKind::TrustConfirmation, &body)
            .await?;
        debug!(contact = %contact_uuid, message_id = %message_id, "Trust confirmation queued");
        Ok(message_id)
    }
}

fn not_found(id: &ItemId) -> SyncError {
    SyncError::Storage(format!("item {} not found", id))
}
