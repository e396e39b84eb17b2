//! # Sync Coordinator
//!
//! Runs sync cycles: drains dirty items, talks to the endpoint, and commits
//! the server's answer to the item store in one transaction.
//!
//! ## One Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Cycle                                      │
//! │                                                                         │
//! │  1. FLUSH     outbound queue ──► post_outbound (failure aborts cycle)  │
//! │                                                                         │
//! │  2. ENCRYPT   dirty items ──► current vault key                         │
//! │               (no key yet: item stays dirty, skipped this cycle)       │
//! │                                                                         │
//! │  3. FETCH     SyncRequest ──► SyncResponse                              │
//! │               stale token? replay with the fresh one (bounded)          │
//! │               cursor_token non-empty? request the next page             │
//! │                                                                         │
//! │   ── nothing below runs if 1-3 failed or the cycle was cancelled ──    │
//! │                                                                         │
//! │  4. ROUTE     shared_vaults ──► VaultKeyManager::reconcile              │
//! │               asymmetric_messages ──► channel ──► keys / contacts       │
//! │               shared_vault_invites ──► InviteProtocol::ingest           │
//! │               user_events ──► roles, vault removal                      │
//! │               SN|KeySystemItemsKey items ──► VaultKeyManager            │
//! │                                                                         │
//! │  5. DECRYPT   retrieved / conflicts / parked items                      │
//! │               unknown key version ──► parked for backfill               │
//! │                                                                         │
//! │  6. COMMIT    ItemStore::transaction (single write lock)                │
//! │               vault removals, save acks, retrieved, conflicts           │
//! │                                                                         │
//! │  7. PERSIST   tokens, item snapshot, sealed key store, parked items     │
//! │  8. PUBLISH   ItemsChanged, DuplicateOnConflict, SyncCompleted, ...     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Coalescing
//! ```text
//! caller A ── sync() ──► no cycle in flight ──► spawn cycle, share its future
//! caller B ── sync() ──► cycle in flight    ──► await the same future
//!                                   both receive the same SyncResult
//! ```
//! The spawned cycle runs to completion even if every caller goes away;
//! only [`SyncCoordinator::cancel`] stops it, and only before commit. An
//! outbound flush or sync request already on the wire is dropped as soon
//! as the cancel flag flips.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use cinder_core::conflict::{apply_resolution, resolve};
use cinder_core::{
    ConflictEntry, ConflictKind, ContentType, IdGenerator, Item, ItemId, MessageKind, VaultScope,
};
use cinder_store::{
    ChangeSource, ItemStore, ItemTxn, ItemsChanged, SaveAck, SyncStateStore, SyncTokens,
};

use crate::config::SyncConfig;
use crate::contacts::{ContactDraft, TrustRequest, TrustedContactRegistry};
use crate::error::{CollaborationError, SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::invites::InviteProtocol;
use crate::messages::{AsymmetricMessageChannel, InboundMessage};
use crate::outbox::OutboundQueue;
use crate::protocol::{
    ConflictParams, KeyRotationPayload, ServerItem, SyncRequest, SyncResponse,
    TrustConfirmationPayload, UserEventPayload, PROTOCOL_VERSION,
};
use crate::transport::SyncEndpoint;
use crate::vault_keys::{VaultChange, VaultKeyManager, VaultKeyRecord};

/// Blob key of the sealed vault key store.
pub const KEY_STORE_BLOB: &str = "vault_key_store";

/// Blob key of items waiting for a key version.
pub const PARKED_ITEMS_BLOB: &str = "parked_items";

// =============================================================================
// Settings & Outcome
// =============================================================================

/// Cycle limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub page_limit: u32,
    pub max_stale_token_replays: u32,
    pub max_backfill_attempts: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings {
            page_limit: 150,
            max_stale_token_replays: 3,
            max_backfill_attempts: 5,
        }
    }
}

impl From<&SyncConfig> for CoordinatorSettings {
    fn from(config: &SyncConfig) -> Self {
        CoordinatorSettings {
            page_limit: config.server.page_limit,
            max_stale_token_replays: config.sync.max_stale_token_replays,
            max_backfill_attempts: config.sync.max_backfill_attempts,
        }
    }
}

/// Summary of one committed cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Vault of a scoped sync from scratch, `None` for the account cycle.
    pub vault: Option<String>,
    pub pages: u32,
    pub outbound_sent: usize,
    pub items_sent: usize,
    pub saved: usize,
    pub retrieved: usize,
    pub conflicts: usize,
    /// `(original, duplicate)` pairs created by conflict resolution.
    pub duplicates: Vec<(ItemId, ItemId)>,
    /// Items waiting for a key version after this cycle.
    pub parked: usize,
    pub integrity_failures: usize,
    /// Per-item and per-message problems that did not abort the cycle.
    pub warnings: Vec<SyncError>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncOutcome {
    /// The first warning that needs the user (key store corruption).
    pub fn fatal_warning(&self) -> Option<&SyncError> {
        self.warnings.iter().find(|w| w.is_fatal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CycleMode {
    Account,
    VaultFromScratch(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParkedItem {
    server: ServerItem,
    attempts: u32,
    warned: bool,
}

enum Decoded {
    Ready(Item),
    Parked(SyncError),
    Quarantined(SyncError),
}

/// Everything decrypted and ready for the commit transaction.
#[derive(Default)]
struct Prepared {
    removed_vaults: Vec<String>,
    acks: Vec<SaveAck>,
    retrieved: Vec<Item>,
    conflicts: Vec<(ItemId, ConflictEntry)>,
    unparked: Vec<Item>,
    parked: HashMap<ItemId, ParkedItem>,
    events: Vec<EngineEvent>,
}

#[derive(Default)]
struct Applied {
    duplicates: Vec<(ItemId, ItemId)>,
    saved: usize,
}

type SharedCycle = Shared<BoxFuture<'static, SyncResult<SyncOutcome>>>;

// =============================================================================
// Sync Coordinator
// =============================================================================

pub struct SyncCoordinator {
    settings: CoordinatorSettings,
    store: Arc<ItemStore>,
    state: Arc<dyn SyncStateStore>,
    endpoint: Arc<dyn SyncEndpoint>,
    keys: Arc<VaultKeyManager>,
    invites: Arc<InviteProtocol>,
    channel: Arc<AsymmetricMessageChannel>,
    contacts: Arc<TrustedContactRegistry>,
    outbox: Arc<OutboundQueue>,
    events: EventBus,
    ids: Arc<dyn IdGenerator>,
    tokens: Mutex<SyncTokens>,
    parked: Mutex<HashMap<ItemId, ParkedItem>>,
    /// Held for the network and commit part of every cycle.
    cycle_lock: Mutex<()>,
    in_flight: StdMutex<Option<SharedCycle>>,
    cancel_tx: watch::Sender<bool>,
}

/// Collaborators the coordinator routes into.
pub struct CoordinatorParts {
    pub store: Arc<ItemStore>,
    pub state: Arc<dyn SyncStateStore>,
    pub endpoint: Arc<dyn SyncEndpoint>,
    pub keys: Arc<VaultKeyManager>,
    pub invites: Arc<InviteProtocol>,
    pub channel: Arc<AsymmetricMessageChannel>,
    pub contacts: Arc<TrustedContactRegistry>,
    pub outbox: Arc<OutboundQueue>,
    pub events: EventBus,
    pub ids: Arc<dyn IdGenerator>,
}

impl SyncCoordinator {
    pub fn new(settings: CoordinatorSettings, parts: CoordinatorParts) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        SyncCoordinator {
            settings,
            store: parts.store,
            state: parts.state,
            endpoint: parts.endpoint,
            keys: parts.keys,
            invites: parts.invites,
            channel: parts.channel,
            contacts: parts.contacts,
            outbox: parts.outbox,
            events: parts.events,
            ids: parts.ids,
            tokens: Mutex::new(SyncTokens::default()),
            parked: Mutex::new(HashMap::new()),
            cycle_lock: Mutex::new(()),
            in_flight: StdMutex::new(None),
            cancel_tx,
        }
    }

    /// Loads tokens, the sealed key store and parked items from persistence.
    pub async fn restore(&self) -> SyncResult<()> {
        *self.tokens.lock().await = self.state.load_tokens().await?;

        if let Some(sealed) = self.state.load_blob(KEY_STORE_BLOB).await? {
            let sealed = serde_json::from_str(&sealed)?;
            self.keys.import_sealed(&sealed).await?;
        }
        if let Some(parked) = self.state.load_blob(PARKED_ITEMS_BLOB).await? {
            let parked: Vec<ParkedItem> = serde_json::from_str(&parked)?;
            *self.parked.lock().await = parked
                .into_iter()
                .map(|p| (ItemId::from(p.server.uuid.clone()), p))
                .collect();
        }
        Ok(())
    }

    pub async fn tokens(&self) -> SyncTokens {
        self.tokens.lock().await.clone()
    }

    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }

    /// Aborts the in-flight cycle (before commit) and refuses new ones.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
        info!("Sync coordinator cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Runs one account cycle, or joins the one already in flight.
    pub async fn sync(self: &Arc<Self>) -> SyncResult<SyncOutcome> {
        if self.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        let cycle = {
            let mut slot = self
                .in_flight
                .lock()
                .map_err(|_| SyncError::Internal("sync slot poisoned".into()))?;
            match slot.as_ref() {
                Some(cycle) => {
                    debug!("Joining in-flight sync cycle");
                    cycle.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let result = this.run_cycle(CycleMode::Account).await;
                        if let Ok(mut slot) = this.in_flight.lock() {
                            *slot = None;
                        }
                        result
                    });
                    let cycle: SharedCycle = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(SyncError::Internal(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(cycle.clone());
                    cycle
                }
            }
        };

        cycle.await
    }

    /// Retrieves every item of one vault, ignoring the account sync token.
    pub async fn sync_vault_from_scratch(&self, vault_uuid: &str) -> SyncResult<SyncOutcome> {
        if self.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        let outcome = self
            .run_cycle(CycleMode::VaultFromScratch(vault_uuid.to_string()))
            .await?;
        self.events.publish(EngineEvent::SyncSharedVaultFromScratchCompleted {
            vault: vault_uuid.to_string(),
        });
        Ok(outcome)
    }

    /// Persists the sealed vault key store.
    pub async fn persist_key_store(&self) -> SyncResult<()> {
        let sealed = self.keys.export_sealed().await?;
        self.state
            .save_blob(KEY_STORE_BLOB, &serde_json::to_string(&sealed)?)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    async fn run_cycle(&self, mode: CycleMode) -> SyncResult<SyncOutcome> {
        let result = self.cycle(&mode).await;
        match &result {
            Ok(outcome) => {
                info!(
                    pages = outcome.pages,
                    saved = outcome.saved,
                    retrieved = outcome.retrieved,
                    conflicts = outcome.conflicts,
                    parked = outcome.parked,
                    "Sync cycle completed"
                );
                self.events.publish(EngineEvent::SyncCompleted(outcome.clone()));
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "Sync cycle failed");
                self.events.publish(EngineEvent::SyncFailed { error: e.clone() });
            }
        }
        result
    }

    async fn cycle(&self, mode: &CycleMode) -> SyncResult<SyncOutcome> {
        let _guard = self.cycle_lock.lock().await;
        let mut outcome = SyncOutcome {
            vault: match mode {
                CycleMode::Account => None,
                CycleMode::VaultFromScratch(uuid) => Some(uuid.clone()),
            },
            ..Default::default()
        };

        outcome.outbound_sent = self
            .until_cancelled(self.outbox.flush(self.endpoint.as_ref()))
            .await?;

        let (items, sent_revisions) = match mode {
            CycleMode::Account => self.encrypt_dirty_items(&mut outcome).await,
            CycleMode::VaultFromScratch(_) => (Vec::new(), HashMap::new()),
        };
        outcome.items_sent = items.len();

        let pages = self.fetch_pages(mode, items, &mut outcome).await?;

        // past this point the response is applied in full
        self.check_cancelled()?;

        let mut prepared = Prepared::default();
        for page in &pages {
            self.route_side_channels(page, &mut prepared, &mut outcome).await;
        }
        self.install_recorded_keys(&pages, &prepared, &mut outcome).await;
        self.decrypt_pages(&pages, &sent_revisions, &mut prepared, &mut outcome)
            .await;
        self.retry_parked(&mut prepared, &mut outcome).await;

        let ids = Arc::clone(&self.ids);
        let commit = std::mem::take(&mut prepared.retrieved);
        let acks = std::mem::take(&mut prepared.acks);
        let conflicts = std::mem::take(&mut prepared.conflicts);
        let unparked = std::mem::take(&mut prepared.unparked);
        let removed_vaults = prepared.removed_vaults.clone();

        let (applied, changes) = self
            .store
            .transaction(|txn| {
                let mut applied = Applied::default();
                for vault in &removed_vaults {
                    for id in txn.ids_in_scope(&VaultScope::shared(vault.clone())) {
                        txn.remove(&id, ChangeSource::VaultRemoved);
                    }
                }
                for ack in acks {
                    txn.acknowledge(ack);
                    applied.saved += 1;
                }
                for item in commit {
                    apply_retrieved(txn, item, ids.as_ref(), &mut applied);
                }
                for (id, entry) in conflicts {
                    apply_conflict(txn, &id, entry, ids.as_ref(), &mut applied);
                }
                for item in unparked {
                    apply_retrieved(txn, item, ids.as_ref(), &mut applied);
                }
                applied
            })
            .await;

        outcome.saved = applied.saved;
        outcome.duplicates = applied.duplicates;
        outcome.parked = prepared.parked.len();
        *self.parked.lock().await = prepared.parked;

        if *mode == CycleMode::Account {
            if let Some(last) = pages.last() {
                let mut tokens = self.tokens.lock().await;
                if last.sync_token.is_some() {
                    tokens.sync_token = last.sync_token.clone();
                }
                tokens.cursor_token = None;
            }
        }

        self.persist(&mut outcome).await;
        self.publish(changes, prepared.events, &outcome);
        outcome.completed_at = Some(Utc::now());
        Ok(outcome)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            warn!("Sync cycle aborted before commit");
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Drives a network step, dropping it the moment the cycle is cancelled.
    async fn until_cancelled<T>(&self, step: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let cancelled = async move {
            loop {
                let flagged = *cancel_rx.borrow_and_update();
                if flagged {
                    return;
                }
                if cancel_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => {
                warn!("Sync cycle aborted in flight");
                Err(SyncError::Cancelled)
            }
            result = step => result,
        }
    }

    // =========================================================================
    // Step 2: Encrypt
    // =========================================================================

    async fn encrypt_dirty_items(
        &self,
        outcome: &mut SyncOutcome,
    ) -> (Vec<ServerItem>, HashMap<ItemId, u64>) {
        let mut items = Vec::new();
        let mut revisions = HashMap::new();

        for item in self.store.dirty_items().await {
            let content = if item.deleted {
                None
            } else {
                match self.keys.encrypt_item(&item).await {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(item_id = %item.id, scope = %item.scope, error = %e, "Item left dirty, cannot encrypt");
                        outcome.warnings.push(e);
                        continue;
                    }
                }
            };

            revisions.insert(item.id.clone(), item.local_revision);
            items.push(ServerItem {
                uuid: item.id.to_string(),
                content_type: item.content_type.clone(),
                content,
                shared_vault_uuid: item.scope.shared_vault_uuid().map(str::to_string),
                deleted: item.deleted,
                created_at: item.created_at,
                updated_at: item.updated_at,
            });
        }

        debug!(count = items.len(), "Dirty items encrypted");
        (items, revisions)
    }

    // =========================================================================
    // Step 3: Fetch
    // =========================================================================

    async fn fetch_pages(
        &self,
        mode: &CycleMode,
        items: Vec<ServerItem>,
        outcome: &mut SyncOutcome,
    ) -> SyncResult<Vec<SyncResponse>> {
        let mut request = match mode {
            CycleMode::Account => {
                let tokens = self.tokens.lock().await;
                SyncRequest {
                    api: PROTOCOL_VERSION,
                    sync_token: tokens.sync_token.clone(),
                    cursor_token: tokens.cursor_token.clone(),
                    limit: self.settings.page_limit,
                    items,
                    shared_vault_uuids: None,
                }
            }
            CycleMode::VaultFromScratch(uuid) => SyncRequest {
                api: PROTOCOL_VERSION,
                sync_token: None,
                cursor_token: None,
                limit: self.settings.page_limit,
                items,
                shared_vault_uuids: Some(vec![uuid.clone()]),
            },
        };

        let mut pages = Vec::new();
        let mut replays = 0u32;

        loop {
            let response = self
                .until_cancelled(self.endpoint.sync(request.clone()))
                .await?;

            if response.is_stale_token() {
                replays += 1;
                if replays > self.settings.max_stale_token_replays {
                    return Err(SyncError::TokenStale { attempts: replays - 1 });
                }
                debug!(replays, "Sync token stale, replaying with fresh token");
                request.sync_token = response.sync_token.clone();
                continue;
            }
            if !response.is_success() {
                return Err(SyncError::Server {
                    status: response.status,
                    message: response
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "request failed".into()),
                });
            }

            outcome.pages += 1;
            let more = response.has_more_pages();
            let cursor = response.cursor_token.clone();
            pages.push(response);

            if !more {
                break;
            }
            debug!(page = outcome.pages, "Fetching next page");
            request.items = Vec::new();
            request.cursor_token = cursor;
        }

        Ok(pages)
    }

    // =========================================================================
    // Step 4: Route Side Channels
    // =========================================================================

    async fn route_side_channels(
        &self,
        page: &SyncResponse,
        prepared: &mut Prepared,
        outcome: &mut SyncOutcome,
    ) {
        for change in self.keys.reconcile(&page.shared_vaults).await {
            if let VaultChange::Removed(vault) = change {
                self.remove_vault_locally(vault, prepared);
            }
        }

        let failures = self.channel.ingest(page.asymmetric_messages.clone()).await;
        outcome.integrity_failures += failures.len();
        for message in self.channel.drain().await {
            if let Err(err) = self.route_message(&message).await {
                if let SyncError::Collaboration(inner) = &err {
                    self.channel.report(inner);
                }
                if matches!(err, SyncError::Collaboration(CollaborationError::IntegrityFailure { .. })) {
                    outcome.integrity_failures += 1;
                }
                outcome.warnings.push(err);
            }
        }

        for err in self.invites.ingest(page.shared_vault_invites.clone()).await {
            if matches!(err, SyncError::Collaboration(CollaborationError::IntegrityFailure { .. })) {
                outcome.integrity_failures += 1;
            }
            outcome.warnings.push(err);
        }

        for event in &page.user_events {
            match &event.event {
                UserEventPayload::UserRolesChanged { current_roles } => {
                    prepared.events.push(EngineEvent::UserRolesChanged {
                        roles: current_roles.clone(),
                    });
                    prepared.events.push(EngineEvent::FeaturesAvailabilityChanged);
                }
                UserEventPayload::RemovedFromSharedVault { shared_vault_uuid } => {
                    if self.keys.remove_vault(shared_vault_uuid).await.is_some() {
                        self.remove_vault_locally(shared_vault_uuid.clone(), prepared);
                    }
                }
                UserEventPayload::Unknown => {
                    debug!(event = %event.uuid, "Ignoring unknown user event");
                }
            }
        }
    }

    /// Installs vault keys recorded by the account's other devices, so the
    /// vault items of this same cycle can be decrypted.
    ///
    /// Key items already in the store are retried too: their vault may only
    /// have appeared in this cycle's vault list.
    async fn install_recorded_keys(
        &self,
        pages: &[SyncResponse],
        prepared: &Prepared,
        outcome: &mut SyncOutcome,
    ) {
        let mut contents: Vec<(ItemId, String)> = self
            .store
            .items_in_scope(&VaultScope::Personal)
            .await
            .into_iter()
            .filter(|item| item.content_type == ContentType::KeySystemItemsKey)
            .map(|item| (item.id, item.content))
            .collect();

        let retrieved = pages.iter().flat_map(|page| page.retrieved_items.iter()).filter(|server| {
            server.content_type == ContentType::KeySystemItemsKey
                && server.shared_vault_uuid.is_none()
                && !server.deleted
        });
        for server in retrieved {
            // failures are reported when the item itself is decrypted
            if let Decoded::Ready(item) = self.decode(server).await {
                contents.push((item.id, item.content));
            }
        }

        for (id, content) in contents {
            let record: VaultKeyRecord = match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Unreadable vault key item");
                    continue;
                }
            };
            if prepared.removed_vaults.contains(&record.shared_vault_uuid) {
                continue;
            }
            if let Err(e) = self.keys.install_recorded_key(&record).await {
                warn!(item_id = %id, error = %e, "Vault key item rejected");
                outcome.warnings.push(e);
            }
        }
    }

    fn remove_vault_locally(&self, vault: String, prepared: &mut Prepared) {
        info!(vault = %vault, "Shared vault removed, dropping its items");
        prepared.events.push(EngineEvent::SharedVaultRemoved {
            vault: vault.clone(),
        });
        prepared.removed_vaults.push(vault);
    }

    async fn route_message(&self, message: &InboundMessage) -> SyncResult<()> {
        match message.kind {
            MessageKind::KeyRotation => {
                let payload: KeyRotationPayload = message.parse()?;
                self.keys.install_key(&message.sender_uuid, &payload).await?;
            }
            MessageKind::TrustConfirmation => {
                let payload: TrustConfirmationPayload = message.parse()?;
                if payload.contact_uuid != message.sender_uuid {
                    return Err(message
                        .integrity_failure("trust confirmation names a different sender")
                        .into());
                }
                self.contacts
                    .record_trust_request(TrustRequest {
                        message_id: message.message_id.clone(),
                        draft: ContactDraft {
                            contact_uuid: payload.contact_uuid.clone(),
                            name: payload.name.clone(),
                            encryption_public_key: payload.encryption_public_key.clone(),
                            signing_public_key: payload.signing_public_key.clone(),
                        },
                        received_at: message.received_at,
                    })
                    .await;
            }
            MessageKind::Invite => {
                warn!(message_id = %message.message_id, "Invite envelope outside the invite list, ignored");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Step 5: Decrypt
    // =========================================================================

    async fn decrypt_pages(
        &self,
        pages: &[SyncResponse],
        sent_revisions: &HashMap<ItemId, u64>,
        prepared: &mut Prepared,
        outcome: &mut SyncOutcome,
    ) {
        for page in pages {
            for server in &page.saved_items {
                let id = ItemId::from(server.uuid.clone());
                let Some(revision) = sent_revisions.get(&id) else {
                    debug!(item_id = %id, "Save ack for an item not sent this cycle");
                    continue;
                };
                prepared.acks.push(SaveAck {
                    id,
                    revision: *revision,
                    encrypted: server.content.clone(),
                    updated_at: server.updated_at,
                });
            }

            for server in &page.retrieved_items {
                outcome.retrieved += 1;
                match self.decode(server).await {
                    Decoded::Ready(item) => prepared.retrieved.push(item),
                    Decoded::Parked(e) => self.park(server, e, prepared),
                    Decoded::Quarantined(e) => outcome.warnings.push(e),
                }
            }

            for params in page.conflicts.iter().chain(page.unsaved.iter()) {
                outcome.conflicts += 1;
                if let Some(entry) = self.decode_conflict(params, outcome).await {
                    prepared.conflicts.push(entry);
                }
            }
        }
    }

    async fn decode_conflict(
        &self,
        params: &ConflictParams,
        outcome: &mut SyncOutcome,
    ) -> Option<(ItemId, ConflictEntry)> {
        let Some(uuid) = params.item_uuid() else {
            warn!(kind = ?params.kind, "Conflict without an item, ignored");
            return None;
        };
        let id = ItemId::from(uuid);

        let mut kind = params.kind.clone();
        let server_item = match &params.server_item {
            None => None,
            Some(server) => match self.decode(server).await {
                Decoded::Ready(item) => Some(item),
                Decoded::Parked(_) => {
                    kind = ConflictKind::KeyVersionMismatch;
                    None
                }
                Decoded::Quarantined(e) => {
                    outcome.warnings.push(e);
                    kind = ConflictKind::ContentError;
                    None
                }
            },
        };

        Some((
            id,
            ConflictEntry {
                kind,
                server_item,
                unsaved_item: None,
            },
        ))
    }

    async fn decode(&self, server: &ServerItem) -> Decoded {
        let id = ItemId::from(server.uuid.clone());
        let scope = server
            .shared_vault_uuid
            .clone()
            .map_or(VaultScope::Personal, VaultScope::Shared);

        let content = if server.deleted {
            String::new()
        } else {
            let Some(payload) = &server.content else {
                warn!(item_id = %id, "Live item without content");
                return Decoded::Quarantined(SyncError::InvalidMessage(format!(
                    "item {} has no content",
                    id
                )));
            };
            match self
                .keys
                .decrypt_item(&id, &server.content_type, &scope, payload)
                .await
            {
                Ok(content) => content,
                Err(e @ SyncError::KeyVersionUnavailable { .. }) => return Decoded::Parked(e),
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Item failed to decrypt, quarantined");
                    return Decoded::Quarantined(e);
                }
            }
        };

        Decoded::Ready(Item {
            id,
            content_type: server.content_type.clone(),
            content,
            scope,
            encrypted: server.content.clone(),
            created_at: server.created_at,
            updated_at: server.updated_at,
            dirty: false,
            deleted: server.deleted,
            local_revision: 0,
            delete_resubmits: 0,
        })
    }

    fn park(&self, server: &ServerItem, reason: SyncError, prepared: &mut Prepared) {
        debug!(item_id = %server.uuid, reason = %reason, "Item parked for key backfill");
        prepared.parked.insert(
            ItemId::from(server.uuid.clone()),
            ParkedItem {
                server: server.clone(),
                attempts: 0,
                warned: false,
            },
        );
    }

    /// Retries items parked by earlier cycles with the keys now held.
    async fn retry_parked(&self, prepared: &mut Prepared, outcome: &mut SyncOutcome) {
        let previously: Vec<(ItemId, ParkedItem)> = self
            .parked
            .lock()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();

        for (id, mut parked) in previously {
            // a newer copy arrived this cycle
            if prepared.parked.contains_key(&id) || prepared.retrieved.iter().any(|i| i.id == id) {
                continue;
            }
            let vault_removed = parked
                .server
                .shared_vault_uuid
                .as_ref()
                .is_some_and(|v| prepared.removed_vaults.contains(v));
            if vault_removed {
                continue;
            }

            match self.decode(&parked.server).await {
                Decoded::Ready(item) => {
                    debug!(item_id = %id, "Parked item decrypted");
                    prepared.unparked.push(item);
                }
                Decoded::Parked(SyncError::KeyVersionUnavailable { scope, version }) => {
                    parked.attempts += 1;
                    if parked.attempts >= self.settings.max_backfill_attempts && !parked.warned {
                        parked.warned = true;
                        warn!(item_id = %id, scope = %scope, version, "Key version still unavailable");
                        prepared.events.push(EngineEvent::KeyVersionUnavailable {
                            item_id: id.clone(),
                            scope: scope.clone(),
                            version,
                        });
                        outcome
                            .warnings
                            .push(SyncError::KeyVersionUnavailable { scope, version });
                    }
                    prepared.parked.insert(id, parked);
                }
                Decoded::Parked(_) => {
                    prepared.parked.insert(id, parked);
                }
                Decoded::Quarantined(e) => outcome.warnings.push(e),
            }
        }
    }

    // =========================================================================
    // Steps 7-8: Persist & Publish
    // =========================================================================

    async fn persist(&self, outcome: &mut SyncOutcome) {
        let tokens = self.tokens.lock().await.clone();
        let parked: Vec<ParkedItem> = self.parked.lock().await.values().cloned().collect();
        let items = self.store.all().await;

        let result: SyncResult<()> = async {
            self.state.save_tokens(&tokens).await?;
            self.state.save_items(&items).await?;
            self.state
                .save_blob(PARKED_ITEMS_BLOB, &serde_json::to_string(&parked)?)
                .await?;
            self.persist_key_store().await
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "Failed to persist sync state");
            outcome.warnings.push(e);
        }
    }

    fn publish(&self, changes: Vec<ItemsChanged>, events: Vec<EngineEvent>, outcome: &SyncOutcome) {
        self.events
            .publish_all(changes.into_iter().map(EngineEvent::ItemsChanged));
        for (original, duplicate) in &outcome.duplicates {
            info!(original = %original, duplicate = %duplicate, "Conflict kept both copies");
            self.events.publish(EngineEvent::DuplicateOnConflict {
                original: original.clone(),
                duplicate: duplicate.clone(),
            });
        }
        self.events.publish_all(events);
    }
}

// =============================================================================
// Commit Helpers
// =============================================================================

/// Writes a server-side item. A clean tombstone is erased.
fn write_item(txn: &mut ItemTxn<'_>, mut item: Item, source: ChangeSource) {
    if item.deleted && !item.dirty {
        txn.remove(&item.id, source);
        return;
    }
    if item.local_revision == 0 {
        item.local_revision = txn.get(&item.id).map_or(0, |existing| existing.local_revision);
    }
    txn.upsert(item, source);
}

/// A retrieved item replaces the local copy unless that copy has unsent
/// edits that differ, in which case it is a conflict.
fn apply_retrieved(txn: &mut ItemTxn<'_>, item: Item, ids: &dyn IdGenerator, applied: &mut Applied) {
    let local_edit = txn
        .get(&item.id)
        .filter(|local| local.dirty && !local.content_matches(&item))
        .is_some();

    if local_edit {
        let id = item.id.clone();
        apply_conflict(txn, &id, ConflictEntry::sync_conflict(item), ids, applied);
    } else {
        write_item(txn, item, ChangeSource::RemoteRetrieved);
    }
}

fn apply_conflict(
    txn: &mut ItemTxn<'_>,
    id: &ItemId,
    entry: ConflictEntry,
    ids: &dyn IdGenerator,
    applied: &mut Applied,
) {
    let Some(local) = txn.get(id).cloned() else {
        if let Some(server) = entry.server_item {
            write_item(txn, server, ChangeSource::RemoteRetrieved);
        }
        return;
    };

    let resolution = resolve(&local, &entry, ids);
    debug!(item_id = %id, kind = ?entry.kind, ?resolution, "Conflict resolved");
    let resolved = apply_resolution(&local, &entry, &resolution, Utc::now());

    for removal in &resolved.removals {
        txn.remove(removal, ChangeSource::ConflictResolution);
    }
    for item in resolved.upserts {
        write_item(txn, item, ChangeSource::ConflictResolution);
    }
    if let Some(pair) = resolved.duplicate {
        applied.duplicates.push(pair);
    }
}
