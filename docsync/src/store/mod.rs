//! Backing store interfaces.
//!
//! ```text
//! ┌────────────┐ try_claim(k)  ┌──────────────┐
//! │ SyncClient │ ────────────► │ ChangeLog    │  ordered, append-only,
//! │  (actor)   │ ◄──────────── │              │  claim-if-empty per key
//! └─────┬──────┘  entries > k  └──────────────┘
//!       │        read_latest/write ┌──────────────┐
//!       ├─────────────────────────►│ Checkpoint   │  latest snapshot + key
//!       │                          └──────────────┘
//!       │        write/remove      ┌──────────────┐
//!       └─────────────────────────►│ Presence     │  ephemeral, auto-removed
//!                 events           └──────────────┘  on disconnect
//! ```
//!
//! Live notifications arrive on one ordered [`Subscription`] per store,
//! which the client's actor drains in a single loop.
//!
//! Backends:
//! - [`memory`] — in-process stores with fault hooks, for tests and
//!   single-process embedding
//! - [`rocks`] — durable change log and checkpoints on RocksDB

pub mod fanout;
pub mod memory;
pub mod rocks;

use std::future::Future;
use tokio::sync::{mpsc, watch};

use crate::error::StoreResult;
use crate::protocol::{Checkpoint, ClientId, LogEntry, LogKey, NewEntry, PresenceRecord};

pub use fanout::{Fanout, FanoutStats};
pub use memory::{MemoryChangeLog, MemoryCheckpointStore, MemoryPresenceHub, PresenceConnection};
pub use rocks::{DocumentMetadata, RocksDocument, RocksStore, StoreConfig};

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The slot was empty and now holds this entry.
    Committed(LogEntry),
    /// Another writer already owns the slot; nothing was written.
    AlreadyOccupied,
}

impl ClaimOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, ClaimOutcome::Committed(_))
    }
}

/// Presence store notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Added(PresenceRecord),
    Changed(PresenceRecord),
    Removed(ClientId),
}

/// Ordered stream of store notifications. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// A subscription that is already closed.
    pub fn empty() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx }
    }

    /// Next notification, or `None` once the store side has closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Append-only change log with an atomic claim-if-empty write per key.
pub trait ChangeLog: Send + Sync + 'static {
    /// Every entry with key > `after`, ascending.
    fn read_range(&self, after: LogKey) -> impl Future<Output = StoreResult<Vec<LogEntry>>> + Send;

    /// Deliver every entry with key > `after` already stored, in key order,
    /// then every entry committed afterwards.
    fn subscribe_added(
        &self,
        after: LogKey,
    ) -> impl Future<Output = StoreResult<Subscription<LogEntry>>> + Send;

    /// Write `entry` at `key` only if no entry exists there. At most one
    /// writer ever observes `Committed` for a key.
    fn try_claim(
        &self,
        key: LogKey,
        entry: NewEntry,
    ) -> impl Future<Output = StoreResult<ClaimOutcome>> + Send;

    /// Connectivity of the backend. Stores without a notion of
    /// connectivity report a constant `true`.
    fn connection(&self) -> watch::Receiver<bool> {
        watch::channel(true).1
    }
}

/// Holder of the most recent full-document snapshot.
pub trait CheckpointStore: Send + Sync + 'static {
    fn read_latest(&self) -> impl Future<Output = StoreResult<Option<Checkpoint>>> + Send;

    /// Best-effort overwrite; no conditional semantics.
    fn write(&self, checkpoint: Checkpoint) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Per-client ephemeral records.
pub trait PresenceStore: Send + Sync + 'static {
    fn write(
        &self,
        client: &ClientId,
        record: PresenceRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn remove(&self, client: &ClientId) -> impl Future<Output = StoreResult<()>> + Send;

    /// Ask the store to delete `client`'s record when this connection drops.
    fn register_auto_remove_on_disconnect(
        &self,
        client: &ClientId,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Existing records arrive first as `Added`, then live events.
    fn subscribe(&self) -> impl Future<Output = StoreResult<Subscription<PresenceEvent>>> + Send;
}
