//! Presence tracking: who is looking at what.
//!
//! ## Flow
//!
//! ```text
//! local transaction
//!       │
//!       ▼
//! PresenceTracker::evaluate_local()   publish only when the selection moved
//!       │                             (or on join / forced)
//!       ▼
//! PresenceStore::write()  ──────────► other clients
//!                                          │
//!                                          ▼
//!                          PresenceTracker::apply_remote()
//!                          (dropped if it points past our document)
//! ```
//!
//! Known selections are remapped whenever our document changes, and
//! records whose `last_active` falls outside the staleness window are
//! handed back to the caller for deletion from the store.

use std::collections::BTreeMap;

use crate::config::PresenceConfig;
use crate::protocol::{ClientData, ClientId, PresenceRecord, Selection};

/// What happened to a remote presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// Stored (new or replaced)
    Updated,
    /// Out of range for the local document; any previous record was forgotten
    Dropped,
    /// Our own record echoed back
    Ignored,
}

/// Presence state for one client: what it last published and what it
/// knows about everyone else.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    client_id: ClientId,
    config: PresenceConfig,
    local_data: ClientData,
    /// Last published local selection, kept in current document positions
    published: Option<Selection>,
    peers: BTreeMap<ClientId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(client_id: ClientId, local_data: ClientData, config: PresenceConfig) -> Self {
        Self {
            client_id,
            config,
            local_data,
            published: None,
            peers: BTreeMap::new(),
        }
    }

    /// Decide whether the local selection must be published.
    ///
    /// A publish happens on the first evaluation, when `forced`, or when
    /// the selection moved without the document changing; in every case
    /// only if it differs from what was last published.
    pub fn evaluate_local(
        &mut self,
        selection: Selection,
        doc_changed: bool,
        forced: bool,
        now: i64,
    ) -> Option<PresenceRecord> {
        let is_initial = self.published.is_none();
        if !(is_initial || forced || !doc_changed) {
            return None;
        }
        if self.published == Some(selection) {
            return None;
        }

        self.published = Some(selection);
        let mut data = self.local_data.clone();
        data.last_active = Some(self.round_activity(now));
        Some(PresenceRecord {
            client_id: self.client_id.clone(),
            selection,
            is_initial,
            data,
        })
    }

    /// Store another client's record if its selection fits in a document
    /// whose largest position is `max_position`.
    pub fn apply_remote(&mut self, record: PresenceRecord, max_position: usize) -> RemoteUpdate {
        if record.client_id == self.client_id {
            return RemoteUpdate::Ignored;
        }
        if record.selection.to() > max_position {
            log::debug!(
                "dropping presence of {}: selection {:?} past document end {max_position}",
                record.client_id,
                record.selection
            );
            self.peers.remove(&record.client_id);
            return RemoteUpdate::Dropped;
        }
        log::trace!("presence of {} at {:?}", record.client_id, record.selection);
        self.peers.insert(record.client_id.clone(), record);
        RemoteUpdate::Updated
    }

    pub fn remove(&mut self, client: &ClientId) -> bool {
        self.peers.remove(client).is_some()
    }

    /// Carry every known selection (and the last published local one)
    /// through a document change.
    pub fn remap(&mut self, mut map: impl FnMut(Selection) -> Selection) {
        for record in self.peers.values_mut() {
            record.selection = map(record.selection);
        }
        self.published = self.published.map(&mut map);
    }

    /// Forget and return every peer whose activity is unknown or older
    /// than the staleness window at `now`.
    pub fn take_stale(&mut self, now: i64) -> Vec<ClientId> {
        let window = i64::try_from(self.config.staleness_window.as_millis()).unwrap_or(i64::MAX);
        let stale: Vec<ClientId> = self
            .peers
            .values()
            .filter(|record| match record.data.last_active {
                Some(last_active) => last_active.saturating_add(window) < now,
                None => true,
            })
            .map(|record| record.client_id.clone())
            .collect();
        for client in &stale {
            self.peers.remove(client);
        }
        stale
    }

    /// Round `now` down to the activity granularity.
    pub fn round_activity(&self, now: i64) -> i64 {
        let granularity = self.config.activity_granularity.as_millis() as i64;
        if granularity <= 0 {
            return now;
        }
        now - now.rem_euclid(granularity)
    }

    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn peer(&self, client: &ClientId) -> Option<&PresenceRecord> {
        self.peers.get(client)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn published(&self) -> Option<Selection> {
        self.published
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.published = None;
    }
}
