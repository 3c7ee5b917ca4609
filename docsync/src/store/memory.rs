//! In-process store backends.
//!
//! Every operation takes one async mutex, so claims are atomic and
//! notifications are delivered in commit order. Fault hooks let tests
//! simulate outages, contention windows, and failing checkpoint writes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::{
    ChangeLog, CheckpointStore, ClaimOutcome, Fanout, PresenceEvent, PresenceStore, Subscription,
};
use crate::error::{StoreError, StoreResult};
use crate::protocol::{
    now_millis, Checkpoint, ClientId, LogEntry, LogKey, NewEntry, PresenceRecord,
};

// ─── Change Log ───────────────────────────────────────────────────

struct LogInner {
    entries: BTreeMap<LogKey, LogEntry>,
    fanout: Fanout<LogEntry>,
    /// Committed entries not yet delivered while delivery is held
    held: Option<Vec<LogEntry>>,
    failing_claims: usize,
    /// Claims that commit but report a transient error to the caller
    lost_acks: usize,
}

/// In-memory [`ChangeLog`].
pub struct MemoryChangeLog {
    inner: Mutex<LogInner>,
    online: watch::Sender<bool>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Mutex::new(LogInner {
                entries: BTreeMap::new(),
                fanout: Fanout::new(),
                held: None,
                failing_claims: 0,
                lost_acks: 0,
            }),
            online,
        }
    }

    /// Log pre-populated with `entries` (keys taken from the entries).
    pub fn with_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let mut log = Self::new();
        log.inner
            .get_mut()
            .entries
            .extend(entries.into_iter().map(|e| (e.key, e)));
        log
    }

    /// Toggle connectivity. While offline every request fails with
    /// [`StoreError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Keep committing claims but stop notifying subscribers.
    pub async fn hold_delivery(&self) {
        let mut inner = self.inner.lock().await;
        inner.held.get_or_insert_with(Vec::new);
    }

    /// Deliver everything committed while held, in key order.
    pub async fn release_delivery(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut held) = inner.held.take() {
            held.sort_by_key(|e| e.key);
            for entry in held {
                inner.fanout.send(entry);
            }
        }
    }

    /// Make the next `n` claims fail with a transient error.
    pub async fn fail_next_claims(&self, n: usize) {
        self.inner.lock().await.failing_claims = n;
    }

    /// Make the next `n` claims commit their entry and then fail with a
    /// transient error, as a write that lands before its response times out.
    pub async fn lose_next_acks(&self, n: usize) {
        self.inner.lock().await.lost_acks = n;
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entry(&self, key: LogKey) -> Option<LogEntry> {
        self.inner.lock().await.entries.get(&key).cloned()
    }

    pub async fn latest_key(&self) -> Option<LogKey> {
        self.inner.lock().await.entries.keys().next_back().copied()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.fanout.subscriber_count()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("change log offline".into()))
        }
    }
}

impl Default for MemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeLog for MemoryChangeLog {
    async fn read_range(&self, after: LogKey) -> StoreResult<Vec<LogEntry>> {
        self.check_online()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(after.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn subscribe_added(&self, after: LogKey) -> StoreResult<Subscription<LogEntry>> {
        self.check_online()?;
        let mut inner = self.inner.lock().await;
        let held: BTreeSet<LogKey> = inner
            .held
            .iter()
            .flatten()
            .map(|e| e.key)
            .collect();
        let backlog: Vec<LogEntry> = inner
            .entries
            .range(after.saturating_add(1)..)
            .filter(|(key, _)| !held.contains(key))
            .map(|(_, e)| e.clone())
            .collect();
        Ok(inner.fanout.subscribe_with(backlog))
    }

    async fn try_claim(&self, key: LogKey, entry: NewEntry) -> StoreResult<ClaimOutcome> {
        self.check_online()?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.failing_claims > 0 {
            inner.failing_claims -= 1;
            return Err(StoreError::Unavailable("injected claim failure".into()));
        }
        if inner.entries.contains_key(&key) {
            return Ok(ClaimOutcome::AlreadyOccupied);
        }

        let committed = entry.commit(key, now_millis());
        inner.entries.insert(key, committed.clone());
        match inner.held.as_mut() {
            Some(held) => held.push(committed.clone()),
            None => {
                inner.fanout.send(committed.clone());
            }
        }
        if inner.lost_acks > 0 {
            inner.lost_acks -= 1;
            return Err(StoreError::Unavailable("claim response lost".into()));
        }
        Ok(ClaimOutcome::Committed(committed))
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

// ─── Checkpoints ──────────────────────────────────────────────────

/// In-memory [`CheckpointStore`] that keeps the checkpoint with the
/// highest key.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    latest: Mutex<Option<Checkpoint>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            latest: Mutex::new(Some(checkpoint)),
            ..Self::default()
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn latest(&self) -> Option<Checkpoint> {
        self.latest.lock().await.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn read_latest(&self) -> StoreResult<Option<Checkpoint>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("checkpoint store offline".into()));
        }
        Ok(self.latest.lock().await.clone())
    }

    async fn write(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("checkpoint store offline".into()));
        }
        let mut latest = self.latest.lock().await;
        if latest.as_ref().map_or(true, |current| current.key <= checkpoint.key) {
            *latest = Some(checkpoint);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Presence ─────────────────────────────────────────────────────

#[derive(Default)]
struct HubInner {
    records: BTreeMap<ClientId, PresenceRecord>,
    fanout: Fanout<PresenceEvent>,
    /// Records to drop when a connection goes away
    auto_remove: HashMap<u64, BTreeSet<ClientId>>,
    next_connection: u64,
    online: bool,
}

impl HubInner {
    fn remove(&mut self, client: &ClientId) -> bool {
        if self.records.remove(client).is_some() {
            self.fanout.send(PresenceEvent::Removed(client.clone()));
            true
        } else {
            false
        }
    }
}

/// Shared in-memory presence room. Each participant talks to it through
/// its own [`PresenceConnection`].
#[derive(Clone)]
pub struct MemoryPresenceHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryPresenceHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                online: true,
                ..HubInner::default()
            })),
        }
    }

    /// Open a new connection to the room.
    pub async fn connect(&self) -> PresenceConnection {
        let mut inner = self.inner.lock().await;
        inner.next_connection += 1;
        PresenceConnection {
            hub: Arc::clone(&self.inner),
            id: inner.next_connection,
        }
    }

    /// Fail every request while offline.
    pub async fn set_online(&self, online: bool) {
        self.inner.lock().await.online = online;
    }

    pub async fn records(&self) -> BTreeMap<ClientId, PresenceRecord> {
        self.inner.lock().await.records.clone()
    }

    pub async fn record(&self, client: &ClientId) -> Option<PresenceRecord> {
        self.inner.lock().await.records.get(client).cloned()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.fanout.subscriber_count()
    }
}

impl Default for MemoryPresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's connection to a [`MemoryPresenceHub`].
pub struct PresenceConnection {
    hub: Arc<Mutex<HubInner>>,
    id: u64,
}

impl PresenceConnection {
    /// Drop the connection: the hub removes every record registered for
    /// auto-removal on it.
    pub async fn disconnect(&self) {
        let mut inner = self.hub.lock().await;
        let clients = inner.auto_remove.remove(&self.id).unwrap_or_default();
        for client in &clients {
            inner.remove(client);
        }
        log::debug!(
            "presence connection {} dropped, removed {} record(s)",
            self.id,
            clients.len()
        );
    }

    async fn lock_online(&self) -> StoreResult<tokio::sync::MutexGuard<'_, HubInner>> {
        let inner = self.hub.lock().await;
        if inner.online {
            Ok(inner)
        } else {
            Err(StoreError::Unavailable("presence store offline".into()))
        }
    }
}

impl PresenceStore for PresenceConnection {
    async fn write(&self, client: &ClientId, record: PresenceRecord) -> StoreResult<()> {
        let mut inner = self.lock_online().await?;
        let event = match inner.records.insert(client.clone(), record.clone()) {
            Some(_) => PresenceEvent::Changed(record),
            None => PresenceEvent::Added(record),
        };
        inner.fanout.send(event);
        Ok(())
    }

    async fn remove(&self, client: &ClientId) -> StoreResult<()> {
        let mut inner = self.lock_online().await?;
        inner.remove(client);
        Ok(())
    }

    async fn register_auto_remove_on_disconnect(&self, client: &ClientId) -> StoreResult<()> {
        let mut inner = self.lock_online().await?;
        inner
            .auto_remove
            .entry(self.id)
            .or_default()
            .insert(client.clone());
        Ok(())
    }

    async fn subscribe(&self) -> StoreResult<Subscription<PresenceEvent>> {
        let mut inner = self.lock_online().await?;
        let existing: Vec<PresenceEvent> = inner
            .records
            .values()
            .cloned()
            .map(PresenceEvent::Added)
            .collect();
        Ok(inner.fanout.subscribe_with(existing))
    }
}
