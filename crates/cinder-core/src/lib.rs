//! # cinder-core: Pure Domain Logic for Cinder
//!
//! Items, the conflict policy and the cryptographic primitives of the
//! sync engine, as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cinder Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Embedding application (UI, entitlements)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ Engine API + event bus                 │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    cinder-sync                                  │   │
//! │  │    SyncCoordinator, VaultKeyManager, InviteProtocol, ...        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ cinder-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ conflict  │  │  crypto   │  │ validation│  │   │
//! │  │   │   Item    │  │ resolve   │  │ SymKey    │  │   rules   │  │   │
//! │  │   │  Invite   │  │ apply     │  │ Envelope  │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    cinder-store                                 │   │
//! │  │              ItemStore, SQLite tokens and snapshots             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Item, SharedVault, Invite, etc.)
//! - [`conflict`] - Duplicate-on-conflict resolution
//! - [`crypto`] - Item encryption and signed envelopes
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use cinder_core::conflict::{resolve, ConflictEntry, Resolution};
//! use cinder_core::{ContentType, Item, ItemId, SuffixIdGenerator, VaultScope};
//!
//! let now = chrono::Utc::now();
//! let local = Item::new(ItemId::from("n1"), ContentType::Note, "draft", VaultScope::Personal, now);
//! let server = Item::new(ItemId::from("n1"), ContentType::Note, "final", VaultScope::Personal, now);
//!
//! let resolution = resolve(&local, &ConflictEntry::sync_conflict(server), &SuffixIdGenerator);
//! assert_eq!(resolution, Resolution::KeepLocalAndDuplicate(ItemId::from("n1-dup")));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod crypto;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{ConflictEntry, ConflictKind, Resolution};
pub use crypto::{EncryptedPayload, Envelope, IdentityKeyPair, PublicIdentity, SymmetricKey};
pub use error::{CoreError, CoreResult, CryptoError, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// First key version of every vault (and of the personal scope).
pub const INITIAL_KEY_VERSION: u64 = 1;

/// Maximum length of a trusted contact's display name.
pub const MAX_DISPLAY_NAME_LEN: usize = 100;

/// Maximum length of a shared vault name.
pub const MAX_VAULT_NAME_LEN: usize = 200;
