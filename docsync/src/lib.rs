//! # docsync — Real-time collaborative editing over an ordered change log
//!
//! Every participant holds a full document replica and synchronizes it
//! through three shared stores. Concurrent edits are serialized by an
//! atomic claim-if-empty write per log key; the losing writer rebases
//! onto the winner through an operational-transform engine and retries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   try_claim(k)    ┌──────────────┐
//! │ SyncClient  │ ────────────────► │ ChangeLog    │
//! │  (actor)    │ ◄──────────────── │ (ordered)    │
//! └──┬───────┬──┘   entries > k     └──────────────┘
//!    │       │
//!    │       │   snapshot @ key     ┌──────────────┐
//!    │       └────────────────────► │ Checkpoints  │
//!    │                              └──────────────┘
//!    ▼                              ┌──────────────┐
//! ┌─────────────┐  records/events   │ Presence     │
//! │ Transform   │   ◄─────────────► │ (ephemeral)  │
//! │ Engine      │                   └──────────────┘
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Log entries, checkpoints, presence records
//! - [`engine`] — Transform-engine contract and a plain-text engine
//! - [`store`] — Store traits plus in-memory and RocksDB backends
//! - [`replay`] — Bootstrap from checkpoint + log
//! - [`publish`] — Outgoing claim/resend state machine
//! - [`presence`] — Selection publishing, validation and staleness
//! - [`client`] — The per-document sync client
//! - [`config`] — Tunables
//! - [`error`] — Error types

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod publish;
pub mod replay;
pub mod store;

// Re-exports for convenience
pub use client::{
    ConnectionStatus, Stores, SyncClient, SyncEvent, SyncStatus, Transaction,
};
pub use config::{CheckpointTrigger, MetaFilter, PresenceConfig, SyncConfig};
pub use engine::text::{TextEngine, TextState, TextStep};
pub use engine::{Merge, TransformEngine};
pub use error::{EngineError, StoreError, StoreResult, SyncError};
pub use presence::{PresenceTracker, RemoteUpdate};
pub use protocol::{
    Checkpoint, ClientData, ClientId, LogEntry, LogKey, MetaValue, Metadata, NewEntry,
    PresenceRecord, Selection,
};
pub use store::{
    ChangeLog, CheckpointStore, ClaimOutcome, MemoryChangeLog, MemoryCheckpointStore,
    MemoryPresenceHub, PresenceConnection, PresenceEvent, PresenceStore, RocksDocument,
    RocksStore, StoreConfig, Subscription,
};
