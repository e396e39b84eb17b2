//! # cinder-sync: Sync Engine and Vault Collaboration for Cinder
//!
//! Keeps the local item store consistent with an untrusted server that only
//! ever sees ciphertext, and runs the shared-vault protocol: key rotation,
//! invites, signed messages between users, and trusted contacts.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Engine Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │   SyncAgent (interval + trigger + backoff)                       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               ▼                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │   Engine (facade, permission checks)                             │  │
//! │  └──────┬───────────────────┬────────────────────┬──────────────────┘  │
//! │         ▼                   ▼                    ▼                      │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────────────┐    │
//! │  │SyncCoordinator│ │ InviteProtocol   │  │ TrustedContactRegistry │    │
//! │  │ one cycle at │  │ Pending ──►      │  │ only writer of         │    │
//! │  │ a time, one  │  │ Accepted/...     │  │ collaborator keys      │    │
//! │  │ commit       │  └────────┬─────────┘  └────────────────────────┘    │
//! │  └──────┬───────┘           ▼                                           │
//! │         │          ┌──────────────────┐  ┌────────────────────────┐    │
//! │         │          │ VaultKeyManager  │─►│ AsymmetricMessageChannel│   │
//! │         │          │ versions, rotate │  │ sealed + signed        │    │
//! │         │          └──────────────────┘  └───────────┬────────────┘    │
//! │         ▼                                            ▼                  │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │   SyncEndpoint (WebSocket)  ◄──── OutboundQueue                   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  EVENTS (EventBus): ItemsChanged, DuplicateOnConflict, SyncCompleted,  │
//! │  IntegrityFailure, KeyVersionUnavailable, InvitesChanged, ...          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - Background `SyncAgent`
//! - [`engine`] - `Engine` facade and builder
//! - [`coordinator`] - One sync cycle, coalescing, conflict application
//! - [`vault_keys`] - Per-vault key versions, rotation, sealed key store
//! - [`invites`] - Invite state machine
//! - [`messages`] - Signed, sealed messages between users
//! - [`contacts`] - Trusted contacts and trust requests
//! - [`outbox`] - Queued invites, messages and vault operations
//! - [`events`] - Engine event bus
//! - [`protocol`] - Wire types
//! - [`transport`] - `SyncEndpoint` trait and WebSocket endpoint
//! - [`config`] - TOML configuration
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cinder_sync::{EngineBuilder, SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = Arc::new(EngineBuilder::new(config, identity, personal_key).build().await?);
//!
//! let mut agent = SyncAgent::new(engine.clone());
//! agent.start().await?;
//!
//! let note = engine.create_item(ContentType::Note, "hello", VaultScope::Personal).await?;
//! agent.trigger();
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod contacts;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod invites;
pub mod messages;
pub mod outbox;
pub mod protocol;
pub mod transport;
pub mod vault_keys;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentState, SyncAgent, SyncStatus};
pub use config::SyncConfig;
pub use contacts::{ContactDraft, TrustRequest, TrustedContactRegistry};
pub use coordinator::{CoordinatorSettings, SyncCoordinator, SyncOutcome};
pub use engine::{Engine, EngineBuilder};
pub use error::{CollaborationError, CollaborationResult, SyncError, SyncResult};
pub use events::{EngineEvent, EventBus, EventKind, Subscription};
pub use invites::{AcceptedInvite, InviteProtocol, PendingInvite};
pub use messages::{AsymmetricMessageChannel, InboundMessage};
pub use outbox::OutboundQueue;
pub use protocol::{SyncRequest, SyncResponse, WireMessage};
pub use transport::{SyncEndpoint, TransportConfig, WsEndpoint};
pub use vault_keys::{MembershipChange, RotationReport, VaultKeyManager};
