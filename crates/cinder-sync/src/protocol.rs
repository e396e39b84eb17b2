//! # Sync Protocol Messages
//!
//! Wire types exchanged with the sync endpoint, and the plaintext bodies
//! carried inside asymmetric envelopes.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  OUTBOUND QUEUE (start of every cycle)                                 │
//! │  ─────────────────────────────────────                                 │
//! │  client ───► PostOutbound { invites, messages, invite_updates,         │
//! │                             vault_operations }                          │
//! │  server ◄─── OutboundAck                                               │
//! │                                                                         │
//! │  ITEM SYNC (repeated while cursor_token is non-empty)                  │
//! │  ─────────────────────────────────────────────────                     │
//! │  client ───► SyncRequest  { sync_token, cursor_token, limit, items }   │
//! │  server ◄─── SyncResponse { retrieved_items, saved_items, conflicts,   │
//! │                             unsaved, shared_vaults,                     │
//! │                             shared_vault_invites, user_events,          │
//! │                             asymmetric_messages, sync_token,            │
//! │                             cursor_token, status, error }               │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  Both      ◄──► Ping / Pong                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "SyncRequest", "payload": { "sync_token": "...", ... } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use cinder_core::{
    ConflictKind, ContentType, EncryptedPayload, Envelope, InviteStatus, SharedVaultPermission,
    VaultMember,
};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error tag the server uses for an expired sync token.
pub const INVALID_SYNC_TOKEN_TAG: &str = "invalid-sync-token";

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// Every message on the endpoint connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    PostOutbound(OutboundBatch),
    OutboundAck { accepted: usize },
    Ping { timestamp: String },
    Pong { ping_timestamp: String, pong_timestamp: String },
    Error { code: String, message: String },
}

impl WireMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::SyncRequest(_) => "SyncRequest",
            WireMessage::SyncResponse(_) => "SyncResponse",
            WireMessage::PostOutbound(_) => "PostOutbound",
            WireMessage::OutboundAck { .. } => "OutboundAck",
            WireMessage::Ping { .. } => "Ping",
            WireMessage::Pong { .. } => "Pong",
            WireMessage::Error { .. } => "Error",
        }
    }

    pub fn pong(ping_timestamp: &str) -> Self {
        WireMessage::Pong {
            ping_timestamp: ping_timestamp.to_string(),
            pong_timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Items
// =============================================================================

/// An item as the server stores it. Content is always ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerItem {
    pub uuid: String,
    pub content_type: ContentType,
    /// Absent for tombstones.
    #[serde(default)]
    pub content: Option<EncryptedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_vault_uuid: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Request / Response
// =============================================================================

/// One page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default = "default_api")]
    pub api: u32,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    pub limit: u32,
    pub items: Vec<ServerItem>,
    /// Set only by a vault-scoped sync from scratch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_vault_uuids: Option<Vec<String>>,
}

fn default_api() -> u32 {
    PROTOCOL_VERSION
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub tag: Option<String>,
    pub message: String,
}

/// The server's reconciliation result for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub sync_token: Option<String>,
    #[serde(default)]
    pub cursor_token: Option<String>,
    #[serde(default)]
    pub retrieved_items: Vec<ServerItem>,
    #[serde(default)]
    pub saved_items: Vec<ServerItem>,
    #[serde(default)]
    pub conflicts: Vec<ConflictParams>,
    #[serde(default)]
    pub unsaved: Vec<ConflictParams>,
    #[serde(default)]
    pub shared_vaults: Vec<SharedVaultServerHash>,
    #[serde(default)]
    pub shared_vault_invites: Vec<SharedVaultInviteServerHash>,
    #[serde(default)]
    pub user_events: Vec<UserEventServerHash>,
    #[serde(default)]
    pub asymmetric_messages: Vec<AsymmetricMessageServerHash>,
}

fn default_status() -> u16 {
    200
}

impl Default for SyncResponse {
    fn default() -> Self {
        SyncResponse {
            status: default_status(),
            error: None,
            sync_token: None,
            cursor_token: None,
            retrieved_items: Vec::new(),
            saved_items: Vec::new(),
            conflicts: Vec::new(),
            unsaved: Vec::new(),
            shared_vaults: Vec::new(),
            shared_vault_invites: Vec::new(),
            user_events: Vec::new(),
            asymmetric_messages: Vec::new(),
        }
    }
}

impl SyncResponse {
    /// 2xx status and no error body.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }

    /// The server rejected the token and handed out a fresh one.
    pub fn is_stale_token(&self) -> bool {
        self.error
            .as_ref()
            .and_then(|e| e.tag.as_deref())
            .is_some_and(|tag| tag == INVALID_SYNC_TOKEN_TAG)
            && self.sync_token.is_some()
    }

    /// A non-empty cursor token means another page is waiting.
    pub fn has_more_pages(&self) -> bool {
        self.cursor_token.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// One conflict or unsaved entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictParams {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    #[serde(default)]
    pub server_item: Option<ServerItem>,
    #[serde(default)]
    pub unsaved_item: Option<ServerItem>,
}

impl ConflictParams {
    /// Id of the local item this entry refers to.
    pub fn item_uuid(&self) -> Option<&str> {
        self.unsaved_item
            .as_ref()
            .or(self.server_item.as_ref())
            .map(|item| item.uuid.as_str())
    }
}

// =============================================================================
// Side-Channel Entities
// =============================================================================

/// Server view of a shared vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedVaultServerHash {
    pub uuid: String,
    pub name: String,
    pub owner_uuid: String,
    pub key_version: u64,
    #[serde(default)]
    pub members: Vec<VaultMember>,
    #[serde(default)]
    pub deleted: bool,
}

/// Server view of an invite. The envelope carries the vault key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedVaultInviteServerHash {
    pub uuid: String,
    pub shared_vault_uuid: String,
    pub sender_uuid: String,
    pub recipient_uuid: String,
    pub permission: SharedVaultPermission,
    pub status: InviteStatus,
    pub encrypted_message: Envelope,
    pub created_at: DateTime<Utc>,
}

/// Account-level notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEventServerHash {
    pub uuid: String,
    #[serde(flatten)]
    pub event: UserEventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "event_payload", rename_all = "snake_case")]
pub enum UserEventPayload {
    UserRolesChanged { current_roles: Vec<String> },
    RemovedFromSharedVault { shared_vault_uuid: String },
    #[serde(other)]
    Unknown,
}

/// A point-to-point envelope addressed to this user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsymmetricMessageServerHash {
    pub uuid: String,
    pub sender_uuid: String,
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Outbound Batch
// =============================================================================

/// Everything queued for the server outside the item stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundBatch {
    #[serde(default)]
    pub invites: Vec<SharedVaultInviteServerHash>,
    #[serde(default)]
    pub messages: Vec<OutboundMessage>,
    #[serde(default)]
    pub invite_updates: Vec<InviteStatusUpdate>,
    #[serde(default)]
    pub vault_operations: Vec<VaultOperation>,
}

impl OutboundBatch {
    pub fn is_empty(&self) -> bool {
        self.invites.is_empty()
            && self.messages.is_empty()
            && self.invite_updates.is_empty()
            && self.vault_operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.invites.len() + self.messages.len() + self.invite_updates.len() + self.vault_operations.len()
    }
}

/// An envelope addressed to another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub uuid: String,
    pub recipient_uuid: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteStatusUpdate {
    pub invite_uuid: String,
    pub status: InviteStatus,
}

/// Vault membership and lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VaultOperation {
    Create { vault: SharedVaultServerHash },
    RemoveMember { vault_uuid: String, user_uuid: String },
    UpdateKeyVersion { vault_uuid: String, key_version: u64 },
    Delete { vault_uuid: String },
}

// =============================================================================
// Envelope Bodies
// =============================================================================

/// Plaintext of an invite envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePayload {
    pub shared_vault_uuid: String,
    pub vault_name: String,
    pub owner_uuid: String,
    pub key_version: u64,
    /// Base64 vault key.
    pub vault_key: String,
    pub permission: SharedVaultPermission,
}

/// Plaintext of a key-rotation envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationPayload {
    pub shared_vault_uuid: String,
    pub key_version: u64,
    /// Base64 vault key.
    pub vault_key: String,
}

/// Plaintext of a trust-confirmation envelope: the sender's own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustConfirmationPayload {
    pub contact_uuid: String,
    pub name: String,
    pub encryption_public_key: String,
    pub signing_public_key: String,
}

impl Drop for InvitePayload {
    fn drop(&mut self) {
        self.vault_key.zeroize();
    }
}

impl Drop for KeyRotationPayload {
    fn drop(&mut self) {
        self.vault_key.zeroize();
    }
}

impl std::fmt::Debug for InvitePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitePayload")
            .field("shared_vault_uuid", &self.shared_vault_uuid)
            .field("key_version", &self.key_version)
            .field("permission", &self.permission)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for KeyRotationPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotationPayload")
            .field("shared_vault_uuid", &self.shared_vault_uuid)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = WireMessage::SyncRequest(SyncRequest {
            api: PROTOCOL_VERSION,
            sync_token: Some("t1".into()),
            cursor_token: None,
            limit: 150,
            items: vec![],
            shared_vault_uuids: None,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"SyncRequest\""));
        assert!(!json.contains("shared_vault_uuids"));

        let parsed = WireMessage::from_json(&json).unwrap();
        assert_eq!(parsed.type_name(), "SyncRequest");
    }

    #[test]
    fn test_minimal_response_defaults() {
        let response: SyncResponse = serde_json::from_str("{}").unwrap();
        assert!(response.is_success());
        assert!(!response.has_more_pages());
        assert!(!response.is_stale_token());
    }

    #[test]
    fn test_stale_token_detection() {
        let response: SyncResponse = serde_json::from_str(
            r#"{
                "status": 400,
                "error": { "tag": "invalid-sync-token", "message": "expired" },
                "sync_token": "fresh"
            }"#,
        )
        .unwrap();
        assert!(!response.is_success());
        assert!(response.is_stale_token());
    }

    #[test]
    fn test_empty_cursor_is_last_page() {
        let response = SyncResponse {
            cursor_token: Some(String::new()),
            ..Default::default()
        };
        assert!(!response.has_more_pages());

        let response = SyncResponse {
            cursor_token: Some("next".into()),
            ..Default::default()
        };
        assert!(response.has_more_pages());
    }

    #[test]
    fn test_conflict_type_field() {
        let conflict: ConflictParams = serde_json::from_str(
            r#"{ "type": "key_version_mismatch" }"#,
        )
        .unwrap();
        assert_eq!(conflict.kind, ConflictKind::KeyVersionMismatch);
        assert!(conflict.item_uuid().is_none());
    }

    #[test]
    fn test_user_event_parsing() {
        let event: UserEventServerHash = serde_json::from_str(
            r#"{
                "uuid": "e1",
                "event_type": "user_roles_changed",
                "event_payload": { "current_roles": ["PRO_USER"] }
            }"#,
        )
        .unwrap();
        assert_eq!(
            event.event,
            UserEventPayload::UserRolesChanged {
                current_roles: vec!["PRO_USER".into()]
            }
        );
    }

    #[test]
    fn test_vault_operation_tagging() {
        let op = VaultOperation::Delete {
            vault_uuid: "v1".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"delete","vault_uuid":"v1"}"#);
    }
}
