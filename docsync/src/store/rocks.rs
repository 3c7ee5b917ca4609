//! RocksDB-backed change log and checkpoint store.
//!
//! Column families:
//! - `entries`     — committed log entries (bincode + LZ4, keyed by doc_id:key)
//! - `checkpoints` — latest snapshot per document (bincode + LZ4, keyed by doc_id)
//! - `metadata`    — per-document counters (bincode, keyed by doc_id)
//!
//! Entry keys are `<doc_id:16 bytes><key:8 bytes big-endian>`, so a prefix
//! scan from `doc_id:after+1` yields entries in key order.
//!
//! Claims for every document go through one async lock: the existence
//! check, the write batch, and the fan-out to live subscribers happen
//! together, which makes `try_claim` atomic and keeps notifications in
//! commit order. Database calls run on tokio's blocking pool while that
//! lock is held, so a slow write delays other claims but no runtime worker.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChangeLog, CheckpointStore, ClaimOutcome, Fanout, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::protocol::{self, now_millis, Checkpoint, LogEntry, LogKey, NewEntry};

/// Column family names.
const CF_ENTRIES: &str = "entries";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_CHECKPOINTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document counters stored alongside the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Highest committed key
    pub latest_key: LogKey,
    /// Entries currently stored (pruning lowers it)
    pub entry_count: u64,
    /// Key of the stored checkpoint, if any
    pub checkpoint_key: Option<LogKey>,
    /// Milliseconds since epoch
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_millis();
        Self {
            doc_id,
            latest_key: 0,
            entry_count: 0,
            checkpoint_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// RocksDB-backed store for many documents.
///
/// Open once per process and hand out [`RocksDocument`] handles.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Claim lock and live subscribers, per document
    live: Mutex<HashMap<Uuid, Fanout<LogEntry>>>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("opened document store at {}", config.path.display());

        Ok(Arc::new(Self {
            db,
            config,
            live: Mutex::new(HashMap::new()),
        }))
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ENTRIES => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
                // values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_CHECKPOINTS => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Handle for one document's log and checkpoint.
    pub fn document(self: &Arc<Self>, doc_id: Uuid) -> RocksDocument {
        RocksDocument {
            store: Arc::clone(self),
            doc_id,
        }
    }

    /// List all document IDs that have metadata.
    pub fn list_documents(&self) -> StoreResult<Vec<Uuid>> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid document key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }
        Ok(doc_ids)
    }

    pub fn metadata(&self, doc_id: Uuid) -> StoreResult<Option<DocumentMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, doc_id.as_bytes())?
            .map(|bytes| protocol::decode(&bytes))
            .transpose()
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn read_entries(&self, doc_id: Uuid, after: LogKey) -> StoreResult<Vec<LogEntry>> {
        let cf = self.cf(CF_ENTRIES)?;
        let start = entry_key(doc_id, after.saturating_add(1));
        let mut entries = Vec::new();

        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            entries.push(decode_compressed::<LogEntry>(&value)?);
        }
        Ok(entries)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }
}

/// Build entry key: doc_id (16 bytes) + key (8 bytes BE).
fn entry_key(doc_id: Uuid, key: LogKey) -> Vec<u8> {
    let mut k = Vec::with_capacity(24);
    k.extend_from_slice(doc_id.as_bytes());
    k.extend_from_slice(&key.to_be_bytes());
    k
}

fn encode_compressed<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(&protocol::encode(value)?))
}

fn decode_compressed<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    protocol::decode(&raw)
}

/// One document inside a [`RocksStore`].
#[derive(Clone)]
pub struct RocksDocument {
    store: Arc<RocksStore>,
    doc_id: Uuid,
}

impl RocksDocument {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn metadata(&self) -> StoreResult<Option<DocumentMetadata>> {
        self.store.metadata(self.doc_id)
    }

    /// Delete entries up to and including `key`, never past the stored
    /// checkpoint. Returns how many entries were removed.
    pub async fn prune_through(&self, key: LogKey) -> StoreResult<u64> {
        let _claims = self.store.live.lock().await;
        self.blocking(move |store, doc_id| store.prune_entries(doc_id, key))
            .await
    }

    /// Run `f` on the blocking pool so RocksDB I/O never stalls a runtime
    /// worker. Callers that need claim ordering hold `live` across the call.
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RocksStore, Uuid) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let doc_id = self.doc_id;
        tokio::task::spawn_blocking(move || f(&store, doc_id))
            .await
            .map_err(|e| StoreError::Database(format!("storage task failed: {e}")))?
    }
}

impl RocksStore {
    fn prune_entries(&self, doc_id: Uuid, key: LogKey) -> StoreResult<u64> {
        let mut meta = match self.metadata(doc_id)? {
            Some(meta) => meta,
            None => return Ok(0),
        };
        let limit = match meta.checkpoint_key {
            Some(checkpoint_key) => key.min(checkpoint_key),
            None => return Ok(0),
        };

        let cf = self.cf(CF_ENTRIES)?;
        let start = entry_key(doc_id, 0);
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (k, _) = item?;
            if k.len() != 24 || &k[..16] != doc_id.as_bytes() {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&k[16..24]);
            if u64::from_be_bytes(buf) > limit {
                break;
            }
            batch.delete_cf(cf, &k);
            count += 1;
        }

        if count > 0 {
            meta.entry_count = meta.entry_count.saturating_sub(count);
            meta.updated_at = now_millis();
            batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), protocol::encode(&meta)?);
            self.db.write_opt(batch, &self.write_opts())?;
            log::debug!("pruned {count} entries of {doc_id} through key {limit}");
        }
        Ok(count)
    }

    /// Write `entry` at `key` unless the slot is taken. `None` when occupied.
    fn claim_entry(
        &self,
        doc_id: Uuid,
        key: LogKey,
        entry: NewEntry,
    ) -> StoreResult<Option<LogEntry>> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let db_key = entry_key(doc_id, key);
        if self.db.get_cf(cf_entries, &db_key)?.is_some() {
            return Ok(None);
        }

        let committed = entry.commit(key, now_millis());
        let mut meta = self
            .metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.latest_key = meta.latest_key.max(key);
        meta.entry_count += 1;
        meta.updated_at = committed.write_timestamp;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_entries, &db_key, encode_compressed(&committed)?);
        batch.put_cf(cf_meta, doc_id.as_bytes(), protocol::encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(Some(committed))
    }

    fn read_checkpoint(&self, doc_id: Uuid) -> StoreResult<Option<Checkpoint>> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db
            .get_cf(cf, doc_id.as_bytes())?
            .map(|bytes| decode_compressed(&bytes))
            .transpose()
    }

    fn store_checkpoint(&self, doc_id: Uuid, checkpoint: Checkpoint) -> StoreResult<()> {
        let mut meta = self
            .metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        if meta.checkpoint_key.is_some_and(|current| current > checkpoint.key) {
            log::debug!(
                "ignoring checkpoint at {} older than stored {:?}",
                checkpoint.key,
                meta.checkpoint_key
            );
            return Ok(());
        }
        meta.checkpoint_key = Some(checkpoint.key);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_CHECKPOINTS)?,
            doc_id.as_bytes(),
            encode_compressed(&checkpoint)?,
        );
        batch.put_cf(self.cf(CF_METADATA)?, doc_id.as_bytes(), protocol::encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

impl ChangeLog for RocksDocument {
    async fn read_range(&self, after: LogKey) -> StoreResult<Vec<LogEntry>> {
        self.blocking(move |store, doc_id| store.read_entries(doc_id, after))
            .await
    }

    async fn subscribe_added(&self, after: LogKey) -> StoreResult<Subscription<LogEntry>> {
        let mut live = self.store.live.lock().await;
        let backlog = self
            .blocking(move |store, doc_id| store.read_entries(doc_id, after))
            .await?;
        Ok(live.entry(self.doc_id).or_default().subscribe_with(backlog))
    }

    async fn try_claim(&self, key: LogKey, entry: NewEntry) -> StoreResult<ClaimOutcome> {
        let mut live = self.store.live.lock().await;
        let committed = self
            .blocking(move |store, doc_id| store.claim_entry(doc_id, key, entry))
            .await?;
        let Some(committed) = committed else {
            return Ok(ClaimOutcome::AlreadyOccupied);
        };
        if let Some(fanout) = live.get_mut(&self.doc_id) {
            fanout.send(committed.clone());
        }
        Ok(ClaimOutcome::Committed(committed))
    }
}

impl CheckpointStore for RocksDocument {
    async fn read_latest(&self) -> StoreResult<Option<Checkpoint>> {
        self.blocking(|store, doc_id| store.read_checkpoint(doc_id))
            .await
    }

    async fn write(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        let _claims = self.store.live.lock().await;
        self.blocking(move |store, doc_id| store.store_checkpoint(doc_id, checkpoint))
            .await
    }
}
