//! # Sync Error Types
//!
//! Error types for sync cycles and vault collaboration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │  (retryable)    │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  Server { status }      │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │  TokenStale             │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │     Keys        │  │   Collaboration         │ │
//! │  │                 │  │                 │  │   (user actionable)     │ │
//! │  │  Storage        │  │  KeyVersion-    │  │  UntrustedRecipient     │ │
//! │  │  Crypto         │  │   Unavailable   │  │  UntrustedSender        │ │
//! │  │                 │  │  KeyStore-      │  │  IntegrityFailure       │ │
//! │  │                 │  │   Corrupted (!) │  │  PermissionDenied       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `SyncError` is `Clone`: a coalesced cycle hands the same result to every
//! caller waiting on it.

use thiserror::Error;

use cinder_core::{CryptoError, InviteStatus, ValidationError};
use cinder_store::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias for collaboration operations.
pub type CollaborationResult<T> = Result<T, CollaborationError>;

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering every way a cycle or engine call can fail.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped mid round trip.
    #[error("Disconnected from sync server")]
    Disconnected,

    /// Round trip timed out.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed or unexpected message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The server answered with a non-2xx status or an error body.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The server kept rejecting the sync token.
    #[error("Sync token still stale after {attempts} replays")]
    TokenStale { attempts: u32 },

    /// Failed to serialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Storage & Crypto Errors
    // =========================================================================
    /// Persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The state database was locked by another writer.
    #[error("Storage busy: {0}")]
    StorageBusy(String),

    /// Encryption or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    // =========================================================================
    // Key Errors
    // =========================================================================
    /// No key of this version has been received yet.
    #[error("Key version {version} unavailable for {scope}")]
    KeyVersionUnavailable { scope: String, version: u64 },

    /// The local key store for an active vault is unusable. Requires re-invite.
    #[error("Key store corrupted for vault {vault}; ask the owner to re-invite you")]
    KeyStoreCorrupted { vault: String },

    // =========================================================================
    // Collaboration Errors
    // =========================================================================
    /// Trust, invite or vault operation failed.
    #[error(transparent)]
    Collaboration(#[from] CollaborationError),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The cycle was aborted before commit.
    #[error("Sync cycle cancelled")]
    Cancelled,

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Collaboration Error
// =============================================================================

/// Failures of trust, invite, message and vault membership operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaborationError {
    /// Invite target is not a trusted contact.
    #[error("Recipient {contact} is not a trusted contact")]
    UntrustedRecipient { contact: String },

    /// Sender's signature did not verify against a trusted contact.
    #[error("Sender {contact} could not be verified")]
    UntrustedSender { contact: String },

    /// An inbound message failed decryption or verification and was discarded.
    #[error("Integrity failure on message {message_id}: {reason}")]
    IntegrityFailure { message_id: String, reason: String },

    #[error("Invite not found: {0}")]
    InviteNotFound(String),

    #[error("Invite {invite} cannot move from {from} to {to}")]
    InvalidInviteTransition {
        invite: String,
        from: InviteStatus,
        to: InviteStatus,
    },

    #[error("Permission denied in vault {vault}: {reason}")]
    PermissionDenied { vault: String, reason: String },

    #[error("Shared vault not found: {0}")]
    VaultNotFound(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    /// Public keys of a trusted contact change only through re-trust.
    #[error("Keys of contact {contact} are immutable; re-trust to change them")]
    ContactKeysImmutable { contact: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl CollaborationError {
    /// Errors the user can act on (verify a contact, ask for permission).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            CollaborationError::UntrustedRecipient { .. }
                | CollaborationError::UntrustedSender { .. }
                | CollaborationError::PermissionDenied { .. }
                | CollaborationError::ContactKeysImmutable { .. }
                | CollaborationError::Validation(_)
        )
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        if err.is_transient() {
            SyncError::StorageBusy(err.to_string())
        } else {
            SyncError::Storage(err.to_string())
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Collaboration(CollaborationError::Validation(err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the caller should retry with backoff.
    ///
    /// ## Retryable Errors
    /// - Connection failures, disconnections, timeouts
    /// - Server 5xx and 429 responses
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_)
            | SyncError::StorageBusy(_) => true,
            SyncError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the user should see this and can do something about it.
    pub fn is_user_actionable(&self) -> bool {
        match self {
            SyncError::Collaboration(err) => err.is_user_actionable(),
            SyncError::KeyStoreCorrupted { .. } => true,
            _ => false,
        }
    }

    /// Returns true for the one hard failure: a corrupted key store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::KeyStoreCorrupted { .. })
    }
}
