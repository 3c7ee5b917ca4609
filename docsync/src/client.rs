//! Sync client: one per open document per participant.
//!
//! Provides:
//! - Bootstrap from checkpoint + log, exactly once
//! - Incoming-change listener with acknowledgement of own entries
//! - Outgoing publish through claim-if-empty at the next key
//! - Best-effort checkpoint compaction
//! - Presence publishing, validation, remapping and stale cleanup
//! - Deterministic teardown
//!
//! All protocol state lives in a single actor task. Local transactions,
//! log entries, presence events, claim outcomes and timers are all
//! serialized onto its `select!` loop, so no two handlers ever run at the
//! same time.
//!
//! ```text
//!  on_local_change ─┐
//!  log entries ─────┤
//!  presence events ─┼──► Actor ──► try_claim task ──► outcome ──┐
//!  claim outcomes ──┤      │                                    │
//!  resend / sweep ──┘      └──► presence writer (sequential)    │
//!        ▲                                                      │
//!        └──────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::engine::TransformEngine;
use crate::error::{EngineError, SyncError};
use crate::presence::{PresenceTracker, RemoteUpdate};
use crate::protocol::{
    now_millis, Checkpoint, ClientData, ClientId, LogEntry, LogKey, MetaValue, Metadata,
    NewEntry, PresenceRecord, Selection,
};
use crate::publish::{ClaimResult, PublishDecision, Publisher};
use crate::replay;
use crate::store::{
    ChangeLog, CheckpointStore, ClaimOutcome, PresenceEvent, PresenceStore, Subscription,
};

/// Status reported to the editing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// A claim is being written
    Saving,
    /// The last claim committed
    Saved,
}

/// Callback receiving every known remote presence record.
pub type PresenceCallback = Box<dyn Fn(&[PresenceRecord]) + Send + 'static>;

/// Callback receiving status transitions.
pub type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + 'static>;

/// A local edit dispatched by the editing surface.
#[derive(Debug, Clone)]
pub struct Transaction<Op> {
    pub operations: Vec<Op>,
    /// New local selection; `None` maps the current one through `operations`
    pub selection: Option<Selection>,
    pub meta: Metadata,
}

impl<Op> Transaction<Op> {
    pub fn new(operations: Vec<Op>) -> Self {
        Self {
            operations,
            selection: None,
            meta: Metadata::new(),
        }
    }

    /// Selection change without document change.
    pub fn select(selection: Selection) -> Self {
        Self {
            operations: Vec::new(),
            selection: Some(selection),
            meta: Metadata::new(),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn changes_document(&self) -> bool {
        !self.operations.is_empty()
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent<S> {
    /// A local transaction was applied
    LocalApplied { state: S },
    /// A committed entry was merged (including our own acknowledgements)
    RemoteApplied {
        key: LogKey,
        origin: ClientId,
        metadata: Metadata,
        state: S,
    },
    /// A committed entry could not be merged; the client has shut down
    Desynchronized { key: LogKey, error: EngineError },
}

/// Snapshot of the client's protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub most_recent_key: LogKey,
    pub outgoing_in_flight: bool,
    pub resend_pending: bool,
    pub known_presence: usize,
    pub connection: ConnectionStatus,
}

/// Connected store handles a client is built from.
pub struct Stores<L, C, P> {
    pub log: Arc<L>,
    pub checkpoints: Arc<C>,
    pub presence: Arc<P>,
}

impl<L, C, P> Stores<L, C, P> {
    pub fn new(log: Arc<L>, checkpoints: Arc<C>, presence: Arc<P>) -> Self {
        Self { log, checkpoints, presence }
    }
}

impl<L, C, P> Clone for Stores<L, C, P> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            checkpoints: Arc::clone(&self.checkpoints),
            presence: Arc::clone(&self.presence),
        }
    }
}

enum Command<E: TransformEngine> {
    Local(Transaction<E::Operation>),
    State(oneshot::Sender<E::State>),
    Status(oneshot::Sender<SyncStatus>),
    Peers(oneshot::Sender<Vec<PresenceRecord>>),
    OnPresence(PresenceCallback),
    OnStatus(StatusCallback),
    Shutdown,
}

/// The sync client.
///
/// Built with already-connected stores, attached once, detached once.
pub struct SyncClient<E: TransformEngine, L, C, P> {
    config: SyncConfig,
    engine: Arc<E>,
    stores: Stores<L, C, P>,
    local_data: ClientData,
    /// Bootstrap guard
    attached: bool,
    commands: Option<mpsc::UnboundedSender<Command<E>>>,
    actor: Option<JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<SyncEvent<E::State>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent<E::State>>>,
    on_presence: Option<PresenceCallback>,
    on_status: Option<StatusCallback>,
}

impl<E, L, C, P> SyncClient<E, L, C, P>
where
    E: TransformEngine,
    L: ChangeLog,
    C: CheckpointStore,
    P: PresenceStore,
{
    pub fn new(config: SyncConfig, engine: E, stores: Stores<L, C, P>, local_data: ClientData) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            engine: Arc::new(engine),
            stores,
            local_data,
            attached: false,
            commands: None,
            actor: None,
            event_tx,
            event_rx: Some(event_rx),
            on_presence: None,
            on_status: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        self.engine.client_id()
    }

    /// Take the event receiver. Must be called before [`attach`](Self::attach);
    /// events are discarded otherwise.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent<E::State>>> {
        self.event_rx.take()
    }

    pub fn on_presence_change(&mut self, callback: impl Fn(&[PresenceRecord]) + Send + 'static) {
        let callback: PresenceCallback = Box::new(callback);
        match &self.commands {
            Some(commands) => {
                let _ = commands.send(Command::OnPresence(callback));
            }
            None => self.on_presence = Some(callback),
        }
    }

    pub fn on_connection_status_change(
        &mut self,
        callback: impl Fn(ConnectionStatus) + Send + 'static,
    ) {
        let callback: StatusCallback = Box::new(callback);
        match &self.commands {
            Some(commands) => {
                let _ = commands.send(Command::OnStatus(callback));
            }
            None => self.on_status = Some(callback),
        }
    }

    /// Bootstrap and start listening. Returns the bootstrapped state; no
    /// state is exposed before the whole history has been replayed.
    pub async fn attach(&mut self) -> Result<E::State, SyncError> {
        if self.attached {
            return Err(SyncError::AlreadyAttached);
        }
        self.attached = true;

        let client_id = self.engine.client_id().clone();
        let booted =
            replay::bootstrap(&*self.engine, &*self.stores.log, &*self.stores.checkpoints).await?;

        let presence = &self.stores.presence;
        if let Err(error) = presence.register_auto_remove_on_disconnect(&client_id).await {
            log::warn!("could not register presence auto-removal for {client_id}: {error}");
        }
        let presence_events = presence.subscribe().await.unwrap_or_else(|error| {
            log::warn!("presence subscription failed: {error}");
            Subscription::empty()
        });
        let entries = self
            .stores
            .log
            .subscribe_added(booted.key)
            .await
            .map_err(|source| SyncError::Bootstrap { stage: "subscription", source })?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (writes, writer) = spawn_presence_writer(Arc::clone(presence));

        let actor = Actor {
            publisher: Publisher::new(self.config.resend_delay, self.config.checkpoint),
            presence: PresenceTracker::new(
                client_id.clone(),
                self.local_data.clone(),
                self.config.presence.clone(),
            ),
            config: self.config.clone(),
            engine: Arc::clone(&self.engine),
            client_id: client_id.clone(),
            log: Arc::clone(&self.stores.log),
            checkpoints: Arc::clone(&self.stores.checkpoints),
            state: booted.state.clone(),
            most_recent: booted.key,
            pending_checkpoint: None,
            outcomes: outcome_tx,
            presence_writes: writes,
            events: self.event_tx.clone(),
            on_presence: self.on_presence.take(),
            on_status: self.on_status.take(),
            status: ConnectionStatus::Disconnected,
        };
        let inbox = Inbox {
            commands: command_rx,
            entries,
            presence: presence_events,
            outcomes: outcome_rx,
            connection: self.stores.log.connection(),
        };

        // nobody listens; don't buffer events forever
        self.event_rx = None;
        self.actor = Some(tokio::spawn(actor.run(inbox, writer)));
        self.commands = Some(command_tx);

        log::info!("client {client_id} attached at key {}", booted.key);
        Ok(booted.state)
    }

    /// Apply a local transaction and publish what became sendable.
    pub fn on_local_change(&self, transaction: Transaction<E::Operation>) -> Result<(), SyncError> {
        self.send(Command::Local(transaction))
    }

    /// Current editor state.
    pub async fn state(&self) -> Result<E::State, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx))?;
        rx.await.map_err(|_| SyncError::Detached)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| SyncError::Detached)
    }

    /// Known remote presence records.
    pub async fn peers(&self) -> Result<Vec<PresenceRecord>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Peers(tx))?;
        rx.await.map_err(|_| SyncError::Detached)
    }

    /// Unsubscribe, drop timers and remove our presence record. Returns
    /// once teardown has finished.
    pub async fn detach(&mut self) -> Result<(), SyncError> {
        let commands = self.commands.take().ok_or(SyncError::NotAttached)?;
        // the actor may already be gone after a desync
        let _ = commands.send(Command::Shutdown);
        if let Some(actor) = self.actor.take() {
            if let Err(error) = actor.await {
                log::warn!("sync actor for {} ended abnormally: {error}", self.client_id());
            }
        }
        log::info!("client {} detached", self.client_id());
        Ok(())
    }

    fn send(&self, command: Command<E>) -> Result<(), SyncError> {
        let commands = self.commands.as_ref().ok_or(SyncError::NotAttached)?;
        commands.send(command).map_err(|_| SyncError::Detached)
    }
}

impl<E: TransformEngine, L, C, P> Drop for SyncClient<E, L, C, P> {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            // teardown continues on the runtime
            let _ = commands.send(Command::Shutdown);
        }
    }
}

// ─── Presence writer ──────────────────────────────────────────────

#[derive(Debug)]
enum PresenceWrite {
    Write(PresenceRecord),
    Remove(ClientId),
}

/// Presence writes run one at a time, in the order the actor issued them.
fn spawn_presence_writer<P: PresenceStore>(
    store: Arc<P>,
) -> (mpsc::UnboundedSender<PresenceWrite>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PresenceWrite>();
    let handle = tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            let result = match &write {
                PresenceWrite::Write(record) => store.write(&record.client_id, record.clone()).await,
                PresenceWrite::Remove(client) => store.remove(client).await,
            };
            if let Err(error) = result {
                log::warn!("presence {write:?} failed: {error}");
            }
        }
    });
    (tx, handle)
}

// ─── Actor ────────────────────────────────────────────────────────

struct Inbox<E: TransformEngine> {
    commands: mpsc::UnboundedReceiver<Command<E>>,
    entries: Subscription<LogEntry>,
    presence: Subscription<PresenceEvent>,
    outcomes: mpsc::UnboundedReceiver<(LogKey, ClaimResult)>,
    connection: watch::Receiver<bool>,
}

enum Exit {
    Detached,
    Desynchronized { key: LogKey, error: EngineError },
}

struct Actor<E: TransformEngine, L, C> {
    config: SyncConfig,
    engine: Arc<E>,
    client_id: ClientId,
    log: Arc<L>,
    checkpoints: Arc<C>,
    state: E::State,
    most_recent: LogKey,
    publisher: Publisher<E::Operation>,
    presence: PresenceTracker,
    /// Snapshot captured when a claim that will trigger compaction started
    pending_checkpoint: Option<(LogKey, Vec<u8>)>,
    outcomes: mpsc::UnboundedSender<(LogKey, ClaimResult)>,
    presence_writes: mpsc::UnboundedSender<PresenceWrite>,
    events: mpsc::UnboundedSender<SyncEvent<E::State>>,
    on_presence: Option<PresenceCallback>,
    on_status: Option<StatusCallback>,
    status: ConnectionStatus,
}

impl<E, L, C> Actor<E, L, C>
where
    E: TransformEngine,
    L: ChangeLog,
    C: CheckpointStore,
{
    async fn run(mut self, mut inbox: Inbox<E>, writer: JoinHandle<()>) {
        let online = *inbox.connection.borrow_and_update();
        self.set_status(if online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        });
        self.publish_presence(false, false);

        let period = self.config.presence.sweep_interval;
        let mut sweep = time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut entries_open = true;
        let mut presence_open = true;
        let mut connection_open = true;

        let exit = loop {
            let resend_at = self.publisher.resend_deadline();
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break Exit::Detached,
                    Some(command) => self.handle_command(command),
                },
                entry = inbox.entries.recv(), if entries_open => match entry {
                    Some(entry) => {
                        if let Err((key, error)) = self.handle_entry(entry) {
                            break Exit::Desynchronized { key, error };
                        }
                    }
                    None => {
                        log::warn!("change log subscription closed for {}", self.client_id);
                        entries_open = false;
                    }
                },
                event = inbox.presence.recv(), if presence_open => match event {
                    Some(event) => self.handle_presence_event(event),
                    None => {
                        log::debug!("presence subscription closed for {}", self.client_id);
                        presence_open = false;
                    }
                },
                Some((key, result)) = inbox.outcomes.recv() => self.handle_outcome(key, result),
                _ = time::sleep_until(resend_at.unwrap_or_else(Instant::now)), if resend_at.is_some() => {
                    self.handle_resend();
                }
                _ = sweep.tick() => self.sweep_presence(),
                changed = inbox.connection.changed(), if connection_open => match changed {
                    Ok(()) => {
                        let online = *inbox.connection.borrow_and_update();
                        self.handle_connection(online);
                    }
                    Err(_) => connection_open = false,
                },
            }
        };

        if let Exit::Desynchronized { key, error } = exit {
            log::error!(
                "{} cannot merge committed entry {key}: {error}; stopping sync",
                self.client_id
            );
            let _ = self.events.send(SyncEvent::Desynchronized { key, error });
        }

        // dropping the inbox unsubscribes from the log and presence store
        drop(inbox);
        self.teardown(writer).await;
    }

    fn handle_command(&mut self, command: Command<E>) {
        match command {
            Command::Local(transaction) => self.handle_local(transaction),
            Command::State(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Command::Status(reply) => {
                let _ = reply.send(SyncStatus {
                    most_recent_key: self.most_recent,
                    outgoing_in_flight: self.publisher.in_flight().is_some(),
                    resend_pending: self.publisher.resend_deadline().is_some(),
                    known_presence: self.presence.peer_count(),
                    connection: self.status,
                });
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.presence.peers());
            }
            Command::OnPresence(callback) => self.on_presence = Some(callback),
            Command::OnStatus(callback) => self.on_status = Some(callback),
            Command::Shutdown => {}
        }
    }

    // ─── Local changes & publishing ───────────────────────────────

    fn handle_local(&mut self, transaction: Transaction<E::Operation>) {
        let next = match self.engine.apply_local(
            &self.state,
            &transaction.operations,
            transaction.selection,
        ) {
            Ok(next) => next,
            Err(error) => {
                log::warn!("rejected local transaction: {error}");
                return;
            }
        };
        self.state = next;

        let doc_changed = transaction.changes_document();
        if doc_changed {
            let engine = &self.engine;
            self.presence
                .remap(|selection| engine.map_selection(selection, &transaction.operations));
            if self.presence.peer_count() > 0 {
                self.notify_presence();
            }
        }
        let _ = self.events.send(SyncEvent::LocalApplied { state: self.state.clone() });

        let forced = transaction
            .meta
            .contains_key(&self.config.presence.force_publish_key);
        self.publish_presence(doc_changed, forced);
        self.sweep_presence();

        if self.config.meta_filter.skips(&transaction.meta) {
            log::trace!("transaction kept local by its metadata");
            return;
        }
        let metadata = self.config.meta_filter.publishable(&transaction.meta);
        self.try_publish(metadata);
    }

    fn try_publish(&mut self, metadata: Metadata) {
        let sendable = self.engine.compute_sendable(&self.state);
        match self.publisher.decide(sendable, self.most_recent, Instant::now()) {
            PublishDecision::Nothing => {}
            PublishDecision::Deferred => {
                log::debug!("{} has a claim outstanding, deferring publish", self.client_id);
            }
            PublishDecision::Claim { key, operations } => self.start_claim(key, &operations, metadata),
        }
    }

    fn start_claim(&mut self, key: LogKey, operations: &[E::Operation], metadata: Metadata) {
        let encoded = match operations
            .iter()
            .map(|op| self.engine.encode_operation(op))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(encoded) => encoded,
            Err(error) => {
                log::warn!("could not encode operations for key {key}: {error}");
                self.publisher.complete(key, ClaimResult::Failed, Instant::now());
                return;
            }
        };

        self.pending_checkpoint = self
            .publisher
            .checkpoint_due(key)
            .then(|| (key, self.engine.snapshot(&self.state)));
        if self.status != ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Saving);
        }

        let entry = NewEntry {
            operations: encoded,
            origin: self.client_id.clone(),
            metadata,
        };
        let change_log = Arc::clone(&self.log);
        let outcomes = self.outcomes.clone();
        log::debug!("{} claiming key {key}", self.client_id);
        tokio::spawn(async move {
            let result = match change_log.try_claim(key, entry).await {
                Ok(ClaimOutcome::Committed(_)) => ClaimResult::Committed,
                Ok(ClaimOutcome::AlreadyOccupied) => ClaimResult::Contended,
                Err(error) => {
                    log::warn!("claim at key {key} failed: {error}");
                    ClaimResult::Failed
                }
            };
            let _ = outcomes.send((key, result));
        });
    }

    fn handle_outcome(&mut self, key: LogKey, result: ClaimResult) {
        self.publisher.complete(key, result, Instant::now());
        let checkpoint = if self
            .pending_checkpoint
            .as_ref()
            .is_some_and(|(pending, _)| *pending == key)
        {
            self.pending_checkpoint.take()
        } else {
            None
        };

        match result {
            ClaimResult::Committed => {
                if self.status != ConnectionStatus::Disconnected {
                    self.set_status(ConnectionStatus::Saved);
                }
                if let Some((key, snapshot)) = checkpoint {
                    self.write_checkpoint(key, snapshot);
                }
                if self.publisher.take_ready_resend() {
                    self.try_publish(Metadata::new());
                }
            }
            ClaimResult::Contended => {
                log::debug!("key {key} already claimed; waiting for the winning entry");
                // the winner may already have been merged
                if self.most_recent >= key && self.publisher.take_ready_resend() {
                    self.try_publish(Metadata::new());
                }
            }
            ClaimResult::Failed => {}
        }
    }

    fn handle_resend(&mut self) {
        if self.publisher.fire_resend(Instant::now()) {
            log::debug!("{} resending pending operations", self.client_id);
            self.try_publish(Metadata::new());
        }
    }

    fn write_checkpoint(&mut self, key: LogKey, snapshot: Vec<u8>) {
        self.publisher.checkpoint_written();
        let checkpoints = Arc::clone(&self.checkpoints);
        tokio::spawn(async move {
            let checkpoint = Checkpoint {
                snapshot,
                key,
                write_timestamp: now_millis(),
            };
            match checkpoints.write(checkpoint).await {
                Ok(()) => log::info!("checkpoint written at key {key}"),
                Err(error) => log::warn!("checkpoint at key {key} failed: {error}"),
            }
        });
    }

    // ─── Incoming entries ─────────────────────────────────────────

    fn handle_entry(&mut self, entry: LogEntry) -> Result<(), (LogKey, EngineError)> {
        let key = entry.key;
        if key <= self.most_recent {
            log::debug!("ignoring entry {key}, already applied through {}", self.most_recent);
            return Ok(());
        }

        // an own entry whose claim reported failure still confirms the
        // pending prefix, so it is merged under its real origin as well
        let held = if entry.origin == self.client_id {
            self.publisher.take_acknowledged(key)
        } else {
            None
        };
        let ops = match held {
            Some(ops) => ops,
            None => self.decode(&entry)?,
        };
        self.publisher.prune_through(key);

        let origins = vec![entry.origin.clone(); ops.len()];
        let merge = self
            .engine
            .apply_remote(&self.state, &ops, &origins)
            .map_err(|error| (key, error))?;
        self.state = merge.state;
        self.most_recent = key;
        self.publisher.note_applied();

        if !merge.mapping.is_empty() {
            let engine = &self.engine;
            self.presence
                .remap(|selection| engine.map_selection(selection, &merge.mapping));
            if self.presence.peer_count() > 0 {
                self.notify_presence();
            }
        }

        let _ = self.events.send(SyncEvent::RemoteApplied {
            key,
            origin: entry.origin,
            metadata: entry.metadata,
            state: self.state.clone(),
        });

        if self.publisher.take_ready_resend() {
            self.try_publish(Metadata::new());
        }
        Ok(())
    }

    fn decode(&self, entry: &LogEntry) -> Result<Vec<E::Operation>, (LogKey, EngineError)> {
        entry
            .operations
            .iter()
            .map(|bytes| self.engine.decode_operation(bytes))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| (entry.key, error))
    }

    // ─── Presence ─────────────────────────────────────────────────

    fn publish_presence(&mut self, doc_changed: bool, forced: bool) {
        let selection = self.engine.selection(&self.state);
        if let Some(record) = self
            .presence
            .evaluate_local(selection, doc_changed, forced, now_millis())
        {
            log::trace!("publishing selection {:?}", record.selection);
            let _ = self.presence_writes.send(PresenceWrite::Write(record));
        }
    }

    fn handle_presence_event(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Added(record) | PresenceEvent::Changed(record) => {
                let max_position = self.engine.max_position(&self.state);
                match self.presence.apply_remote(record, max_position) {
                    RemoteUpdate::Updated | RemoteUpdate::Dropped => self.notify_presence(),
                    RemoteUpdate::Ignored => {}
                }
            }
            PresenceEvent::Removed(client) => {
                if self.presence.remove(&client) {
                    self.notify_presence();
                }
            }
        }
    }

    fn sweep_presence(&mut self) {
        let stale = self.presence.take_stale(now_millis());
        if stale.is_empty() {
            return;
        }
        for client in stale {
            log::debug!("removing stale presence of {client}");
            let _ = self.presence_writes.send(PresenceWrite::Remove(client));
        }
        self.notify_presence();
    }

    fn notify_presence(&self) {
        if let Some(callback) = &self.on_presence {
            callback(&self.presence.peers());
        }
    }

    // ─── Status & teardown ────────────────────────────────────────

    fn handle_connection(&mut self, online: bool) {
        if online {
            log::info!("{} reconnected", self.client_id);
            self.set_status(ConnectionStatus::Connected);
            if self.publisher.take_ready_resend() {
                self.try_publish(Metadata::new());
            }
        } else {
            log::warn!("{} lost its connection to the change log", self.client_id);
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        if let Some(callback) = &self.on_status {
            callback(status);
        }
    }

    async fn teardown(mut self, writer: JoinHandle<()>) {
        self.publisher.clear();
        self.pending_checkpoint = None;
        self.presence.clear();

        let Actor { client_id, presence_writes, .. } = self;
        let _ = presence_writes.send(PresenceWrite::Remove(client_id.clone()));
        // closing the queue lets the writer drain and exit
        drop(presence_writes);
        if let Err(error) = writer.await {
            log::warn!("presence writer for {client_id} ended abnormally: {error}");
        }
        log::debug!("{client_id} torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::text::{TextEngine, TextStep};
    use crate::store::{MemoryChangeLog, MemoryCheckpointStore, MemoryPresenceHub, PresenceConnection};
    use std::time::Duration;

    type TestClient =
        SyncClient<TextEngine, MemoryChangeLog, MemoryCheckpointStore, PresenceConnection>;

    async fn client(
        id: &str,
        log: &Arc<MemoryChangeLog>,
        checkpoints: &Arc<MemoryCheckpointStore>,
        hub: &MemoryPresenceHub,
    ) -> TestClient {
        let stores = Stores::new(
            Arc::clone(log),
            Arc::clone(checkpoints),
            Arc::new(hub.connect().await),
        );
        SyncClient::new(
            SyncConfig::for_testing(),
            TextEngine::new(ClientId::new(id)),
            stores,
            ClientData::named(id),
        )
    }

    async fn wait_for_key(client: &TestClient, key: LogKey) {
        for _ in 0..200 {
            if client.status().await.unwrap().most_recent_key >= key {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never reached key {key}");
    }

    #[tokio::test]
    async fn test_attach_twice_rejected() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;

        c.attach().await.unwrap();
        assert!(matches!(c.attach().await, Err(SyncError::AlreadyAttached)));
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_before_attach() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;

        assert!(matches!(
            c.on_local_change(Transaction::new(vec![TextStep::insert(0, "x")])),
            Err(SyncError::NotAttached)
        ));
        assert!(matches!(c.detach().await, Err(SyncError::NotAttached)));
    }

    #[tokio::test]
    async fn test_local_edit_is_published_and_acknowledged() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;
        c.attach().await.unwrap();

        c.on_local_change(
            Transaction::new(vec![TextStep::insert(0, "hello")]).with_meta("addToHistory", false),
        )
        .unwrap();
        wait_for_key(&c, 1).await;

        let entry = log.entry(1).await.unwrap();
        assert_eq!(entry.origin, ClientId::new("a"));
        assert!(entry.metadata.is_empty());

        let state = c.state().await.unwrap();
        assert_eq!(state.text(), "hello");
        assert!(state.unconfirmed().is_empty());

        let status = c.status().await.unwrap();
        assert!(!status.outgoing_in_flight);
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_skipped_metadata_not_published() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;
        c.attach().await.unwrap();

        c.on_local_change(Transaction::new(vec![TextStep::insert(0, "x")]).with_meta("rebase", true))
            .unwrap();
        let state = c.state().await.unwrap();
        assert_eq!(state.text(), "x");
        assert!(log.is_empty().await);

        // the next publishable transaction carries the pending step too
        c.on_local_change(Transaction::new(vec![TextStep::insert(1, "y")])).unwrap();
        wait_for_key(&c, 1).await;
        assert_eq!(log.entry(1).await.unwrap().operations.len(), 2);
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_callback_reports_saving_and_saved() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.on_connection_status_change(move |status| sink.lock().unwrap().push(status));
        c.attach().await.unwrap();

        c.on_local_change(Transaction::new(vec![TextStep::insert(0, "x")])).unwrap();
        wait_for_key(&c, 1).await;
        // the claim outcome may land after the entry itself
        time::sleep(Duration::from_millis(50)).await;
        log.set_online(false);
        time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Saving,
                ConnectionStatus::Saved,
                ConnectionStatus::Disconnected,
            ]
        );
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_claim_retried_by_timer() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;
        c.attach().await.unwrap();

        log.fail_next_claims(2).await;
        c.on_local_change(Transaction::new(vec![TextStep::insert(0, "retry")])).unwrap();
        wait_for_key(&c, 1).await;
        assert_eq!(log.len().await, 1);
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_entry_after_failed_claim_is_not_duplicated() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;
        c.attach().await.unwrap();

        log.hold_delivery().await;
        log.lose_next_acks(1).await;
        c.on_local_change(Transaction::new(vec![TextStep::insert(0, "hello")])).unwrap();
        for _ in 0..100 {
            if !log.is_empty().await {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(log.len().await, 1);
        // let the failed outcome reach the client before its entry does
        time::sleep(Duration::from_millis(20)).await;
        log.release_delivery().await;
        wait_for_key(&c, 1).await;

        // past the resend delay: nothing left to send
        time::sleep(Duration::from_millis(150)).await;
        let state = c.state().await.unwrap();
        assert_eq!(state.text(), "hello");
        assert!(state.unconfirmed().is_empty());
        assert_eq!(log.len().await, 1);
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_written_on_interval() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let stores = Stores::new(
            Arc::clone(&log),
            Arc::clone(&checkpoints),
            Arc::new(hub.connect().await),
        );
        let config = SyncConfig {
            checkpoint: crate::config::CheckpointTrigger::KeyMultiple(2),
            ..SyncConfig::for_testing()
        };
        let mut c = SyncClient::new(config, TextEngine::new(ClientId::new("a")), stores, ClientData::default());
        c.attach().await.unwrap();

        c.on_local_change(Transaction::new(vec![TextStep::insert(0, "a")])).unwrap();
        wait_for_key(&c, 1).await;
        c.on_local_change(Transaction::new(vec![TextStep::insert(1, "b")])).unwrap();
        wait_for_key(&c, 2).await;

        for _ in 0..100 {
            if checkpoints.latest().await.is_some() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let checkpoint = checkpoints.latest().await.unwrap();
        assert_eq!(checkpoint.key, 2);
        assert_eq!(checkpoint.snapshot, b"ab".to_vec());
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_failure_does_not_block_publishing() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.set_fail_writes(true);
        let hub = MemoryPresenceHub::new();
        let stores = Stores::new(
            Arc::clone(&log),
            Arc::clone(&checkpoints),
            Arc::new(hub.connect().await),
        );
        let config = SyncConfig {
            checkpoint: crate::config::CheckpointTrigger::KeyMultiple(1),
            ..SyncConfig::for_testing()
        };
        let mut c = SyncClient::new(config, TextEngine::new(ClientId::new("a")), stores, ClientData::default());
        c.attach().await.unwrap();

        for (i, ch) in ["a", "b", "c"].iter().enumerate() {
            c.on_local_change(Transaction::new(vec![TextStep::insert(i, *ch)])).unwrap();
            wait_for_key(&c, i as LogKey + 1).await;
        }
        assert_eq!(c.state().await.unwrap().text(), "abc");
        assert!(checkpoints.latest().await.is_none());
        c.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_entry_desynchronizes() {
        let log = Arc::new(MemoryChangeLog::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let hub = MemoryPresenceHub::new();
        let mut c = client("a", &log, &checkpoints, &hub).await;
        let mut events = c.take_event_rx().unwrap();
        c.attach().await.unwrap();

        log.try_claim(
            1,
            NewEntry {
                operations: vec![vec![0xFF, 0xFF, 0xFF]],
                origin: ClientId::new("corrupt"),
                metadata: Metadata::new(),
            },
        )
        .await
        .unwrap();

        let event = time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(SyncEvent::Desynchronized { key, .. }) = events.recv().await {
                    return key;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, 1);
        assert!(matches!(c.state().await, Err(SyncError::Detached)));
        c.detach().await.unwrap();
        assert!(hub.record(&ClientId::new("a")).await.is_none());
    }
}
