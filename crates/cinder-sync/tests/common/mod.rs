//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use cinder_core::crypto::item_aad;
use cinder_core::{
    ContentType, IdGenerator, IdentityKeyPair, ItemId, SymmetricKey, VaultMember,
    INITIAL_KEY_VERSION,
};
use cinder_store::{MemoryStateStore, SyncStateStore};
use cinder_sync::protocol::{
    AsymmetricMessageServerHash, OutboundBatch, ServerItem, SharedVaultInviteServerHash,
    SharedVaultServerHash, SyncRequest, SyncResponse, UserEventPayload, UserEventServerHash,
    VaultOperation,
};
use cinder_sync::{ContactDraft, Engine, EngineBuilder, SyncConfig, SyncEndpoint, SyncError, SyncResult};

// =============================================================================
// Engine Fixture
// =============================================================================

pub struct TestEngine {
    pub engine: Engine,
    pub user_uuid: String,
    pub personal_key: SymmetricKey,
    pub state: Arc<MemoryStateStore>,
}

pub struct EngineOptions {
    pub user_uuid: String,
    pub personal_key: SymmetricKey,
    pub identity: IdentityKeyPair,
    pub state: Arc<MemoryStateStore>,
    pub ids: Option<Arc<dyn IdGenerator>>,
    pub config: Option<SyncConfig>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            user_uuid: Uuid::new_v4().to_string(),
            personal_key: SymmetricKey::generate(INITIAL_KEY_VERSION),
            identity: IdentityKeyPair::generate(),
            state: Arc::new(MemoryStateStore::new()),
            ids: None,
            config: None,
        }
    }
}

pub async fn start_engine(endpoint: Arc<dyn SyncEndpoint>, options: EngineOptions) -> TestEngine {
    let config = options
        .config
        .unwrap_or_else(|| SyncConfig::for_user(options.user_uuid.clone()));
    let state: Arc<dyn SyncStateStore> = options.state.clone();

    let mut builder = EngineBuilder::new(config, options.identity, options.personal_key.clone())
        .with_endpoint(endpoint)
        .with_state_store(state);
    if let Some(ids) = options.ids {
        builder = builder.with_id_generator(ids);
    }

    TestEngine {
        engine: builder.build().await.unwrap(),
        user_uuid: options.user_uuid,
        personal_key: options.personal_key,
        state: options.state,
    }
}

/// Makes `who` trust `whom`.
pub async fn trust(who: &TestEngine, whom: &TestEngine, name: &str) {
    who.engine
        .create_or_edit_trusted_contact(ContactDraft::new(
            whom.user_uuid.clone(),
            name,
            &whom.engine.public_identity(),
        ))
        .await
        .unwrap();
}

/// A server-side copy of an item written by another device.
pub fn remote_item(
    id: &str,
    content: &str,
    key: &SymmetricKey,
    vault: Option<&str>,
) -> ServerItem {
    let item_id = ItemId::from(id);
    let payload = key
        .encrypt(content.as_bytes(), &item_aad(&item_id, &ContentType::Note))
        .unwrap();
    let now = Utc::now();
    ServerItem {
        uuid: id.to_string(),
        content_type: ContentType::Note,
        content: Some(payload),
        shared_vault_uuid: vault.map(str::to_string),
        deleted: false,
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Scripted Endpoint
// =============================================================================

/// Replays queued responses. With the queue empty it saves every item sent.
#[derive(Default)]
pub struct ScriptedEndpoint {
    responses: Mutex<VecDeque<SyncResult<SyncResponse>>>,
    requests: Mutex<Vec<SyncRequest>>,
    posted: Mutex<Vec<OutboundBatch>>,
    delay: Option<Duration>,
}

impl ScriptedEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedEndpoint {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn push(&self, response: SyncResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn posted(&self) -> Vec<OutboundBatch> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncEndpoint for ScriptedEndpoint {
    async fn sync(&self, request: SyncRequest) -> SyncResult<SyncResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(request.clone());

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => Ok(SyncResponse {
                sync_token: Some(format!("t{}", self.requests.lock().unwrap().len())),
                saved_items: request.items,
                ..Default::default()
            }),
        }
    }

    async fn post_outbound(&self, batch: OutboundBatch) -> SyncResult<()> {
        self.posted.lock().unwrap().push(batch);
        Ok(())
    }
}

// =============================================================================
// Fake Server
// =============================================================================

#[derive(Default)]
struct ServerState {
    seq: u64,
    /// uuid -> (sequence, writer, item)
    items: HashMap<String, (u64, String, ServerItem)>,
    vaults: HashMap<String, SharedVaultServerHash>,
    invites: HashMap<String, SharedVaultInviteServerHash>,
    inbox: HashMap<String, Vec<AsymmetricMessageServerHash>>,
    user_events: HashMap<String, Vec<UserEventServerHash>>,
}

impl ServerState {
    fn is_member(&self, vault_uuid: &str, user_uuid: &str) -> bool {
        self.vaults.get(vault_uuid).is_some_and(|v| {
            !v.deleted
                && (v.owner_uuid == user_uuid || v.members.iter().any(|m| m.user_uuid == user_uuid))
        })
    }

    fn can_see(&self, writer: &str, item: &ServerItem, user_uuid: &str) -> bool {
        match &item.shared_vault_uuid {
            None => writer == user_uuid,
            Some(vault) => self.is_member(vault, user_uuid),
        }
    }
}

/// In-memory relay server shared by several engines.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, user_uuid: &str) -> Arc<FakeClient> {
        Arc::new(FakeClient {
            server: Arc::clone(self),
            user_uuid: user_uuid.to_string(),
        })
    }

    /// Messages waiting for `user_uuid`.
    pub fn inbox_len(&self, user_uuid: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .inbox
            .get(user_uuid)
            .map_or(0, Vec::len)
    }

    pub fn vault(&self, vault_uuid: &str) -> Option<SharedVaultServerHash> {
        self.state.lock().unwrap().vaults.get(vault_uuid).cloned()
    }

    /// Delivers a message as if `sender_uuid` had sent it.
    pub fn inject_message(&self, recipient_uuid: &str, message: AsymmetricMessageServerHash) {
        self.state
            .lock()
            .unwrap()
            .inbox
            .entry(recipient_uuid.to_string())
            .or_default()
            .push(message);
    }
}

pub struct FakeClient {
    server: Arc<FakeServer>,
    user_uuid: String,
}

#[async_trait]
impl SyncEndpoint for FakeClient {
    async fn sync(&self, request: SyncRequest) -> SyncResult<SyncResponse> {
        let mut state = self.server.state.lock().unwrap();
        let user = self.user_uuid.as_str();
        let since = request
            .sync_token
            .as_deref()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);

        let mut saved = Vec::new();
        for item in request.items {
            state.seq += 1;
            let seq = state.seq;
            state
                .items
                .insert(item.uuid.clone(), (seq, user.to_string(), item.clone()));
            saved.push(item);
        }

        let retrieved: Vec<ServerItem> = match &request.shared_vault_uuids {
            Some(vaults) => state
                .items
                .values()
                .filter(|(_, _, item)| {
                    item.shared_vault_uuid
                        .as_ref()
                        .is_some_and(|v| vaults.contains(v) && state.is_member(v, user))
                })
                .map(|(_, _, item)| item.clone())
                .collect(),
            None => state
                .items
                .values()
                .filter(|(seq, writer, item)| {
                    *seq > since
                        && state.can_see(writer, item, user)
                        && !saved.iter().any(|s: &ServerItem| s.uuid == item.uuid)
                })
                .map(|(_, _, item)| item.clone())
                .collect(),
        };

        let shared_vaults = state
            .vaults
            .values()
            .filter(|v| state.is_member(&v.uuid, user))
            .cloned()
            .collect();
        let shared_vault_invites = state
            .invites
            .values()
            .filter(|i| i.sender_uuid == user || i.recipient_uuid == user)
            .cloned()
            .collect();
        let asymmetric_messages = state.inbox.remove(user).unwrap_or_default();
        let user_events = state.user_events.remove(user).unwrap_or_default();

        Ok(SyncResponse {
            sync_token: Some(state.seq.to_string()),
            retrieved_items: retrieved,
            saved_items: saved,
            shared_vaults,
            shared_vault_invites,
            user_events,
            asymmetric_messages,
            ..Default::default()
        })
    }

    async fn post_outbound(&self, batch: OutboundBatch) -> SyncResult<()> {
        let mut state = self.server.state.lock().unwrap();
        let user = self.user_uuid.clone();

        for operation in batch.vault_operations {
            match operation {
                VaultOperation::Create { vault } => {
                    state.vaults.insert(vault.uuid.clone(), vault);
                }
                VaultOperation::RemoveMember {
                    vault_uuid,
                    user_uuid,
                } => {
                    if let Some(vault) = state.vaults.get_mut(&vault_uuid) {
                        vault.members.retain(|m| m.user_uuid != user_uuid);
                    }
                    state
                        .user_events
                        .entry(user_uuid)
                        .or_default()
                        .push(UserEventServerHash {
                            uuid: Uuid::new_v4().to_string(),
                            event: UserEventPayload::RemovedFromSharedVault {
                                shared_vault_uuid: vault_uuid,
                            },
                        });
                }
                VaultOperation::UpdateKeyVersion {
                    vault_uuid,
                    key_version,
                } => {
                    if let Some(vault) = state.vaults.get_mut(&vault_uuid) {
                        vault.key_version = key_version;
                    }
                }
                VaultOperation::Delete { vault_uuid } => {
                    if let Some(vault) = state.vaults.get_mut(&vault_uuid) {
                        vault.deleted = true;
                    }
                }
            }
        }

        for invite in batch.invites {
            state.invites.insert(invite.uuid.clone(), invite);
        }

        for update in batch.invite_updates {
            let Some(invite) = state.invites.get_mut(&update.invite_uuid) else {
                continue;
            };
            invite.status = update.status;
            let accepted = update.status == cinder_core::InviteStatus::Accepted;
            let member = VaultMember {
                user_uuid: invite.recipient_uuid.clone(),
                permission: invite.permission,
            };
            let vault_uuid = invite.shared_vault_uuid.clone();
            if accepted {
                if let Some(vault) = state.vaults.get_mut(&vault_uuid) {
                    vault.members.push(member);
                }
            }
        }

        for message in batch.messages {
            state
                .inbox
                .entry(message.recipient_uuid.clone())
                .or_default()
                .push(AsymmetricMessageServerHash {
                    uuid: message.uuid,
                    sender_uuid: user.clone(),
                    envelope: message.envelope,
                    created_at: Utc::now(),
                });
        }

        Ok(())
    }
}
