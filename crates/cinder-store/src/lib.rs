//! # cinder-store: Item Store and Persistence for Cinder
//!
//! The in-memory item store every engine component reads and mutates, and
//! the SQLite layer that carries tokens and item snapshots across restarts.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cinder Data Flow                                 │
//! │                                                                         │
//! │  SyncCoordinator / Engine entry points                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   cinder-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   ItemStore   │    │   Database    │    │  Migrations  │  │   │
//! │  │   │ (item_store)  │    │   (pool.rs)   │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ transactions  │    │ SyncStateRepo │    │ 001_init.sql │  │   │
//! │  │   │ change sets   │    │ SnapshotRepo  │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <platform data dir>/cinder.db                                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`item_store`] - ItemStore, transactions, change sets
//! - [`state`] - `SyncStateStore` trait and the in-memory implementation
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - Token and snapshot repositories
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cinder_store::{Database, DbConfig, SyncStateStore};
//!
//! let db = Database::new(DbConfig::new("cinder.db")).await?;
//! let tokens = db.load_tokens().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod item_store;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod state;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use item_store::{AckOutcome, ChangeSource, ItemStore, ItemTxn, ItemsChanged, SaveAck};
pub use pool::{Database, DbConfig};
pub use state::{MemoryStateStore, SyncStateStore, SyncTokens};

pub use repository::snapshot::SnapshotRepository;
pub use repository::sync_state::SyncStateRepository;
