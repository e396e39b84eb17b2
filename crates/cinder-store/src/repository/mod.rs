//! # Repository Module
//!
//! Database repositories for Cinder.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SyncCoordinator (after a committed cycle)                             │
//! │       │                                                                 │
//! │       │  db.sync_state().set_many(...)                                 │
//! │       │  db.snapshots().replace_all(&items)                            │
//! │       ▼                                                                 │
//! │  SyncStateRepository            SnapshotRepository                     │
//! │  ├── get(key)                   ├── replace_all(items)                 │
//! │  ├── set(key, value)            ├── load_all()                         │
//! │  └── set_many(pairs)            └── count()                            │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`SyncStateRepository`](sync_state::SyncStateRepository) - Opaque sync tokens
//! - [`SnapshotRepository`](snapshot::SnapshotRepository) - Cached item snapshots

pub mod snapshot;
pub mod sync_state;
