//! Bootstrap: checkpoint plus every later log entry, in key order.
//!
//! Replay is a left fold over entries sorted by key, so feeding the same
//! entries in one batch or one at a time yields the same state.

use crate::engine::TransformEngine;
use crate::error::SyncError;
use crate::protocol::{ClientId, LogEntry, LogKey};
use crate::store::{ChangeLog, CheckpointStore};

/// State reconstructed from history.
#[derive(Debug, Clone)]
pub struct Bootstrapped<S> {
    pub state: S,
    /// Highest key applied (the checkpoint key if no entries followed it)
    pub key: LogKey,
    /// Entries applied on top of the base
    pub replayed: usize,
}

/// Read the latest checkpoint and every entry after it, and replay them.
///
/// Any read failure is fatal; nothing is returned until the whole history
/// has been applied.
pub async fn bootstrap<E, L, C>(
    engine: &E,
    log: &L,
    checkpoints: &C,
) -> Result<Bootstrapped<E::State>, SyncError>
where
    E: TransformEngine,
    L: ChangeLog,
    C: CheckpointStore,
{
    let checkpoint = checkpoints
        .read_latest()
        .await
        .map_err(|source| SyncError::Bootstrap { stage: "checkpoint", source })?;

    let (state, base) = match checkpoint {
        Some(checkpoint) => {
            let state = engine
                .restore(&checkpoint.snapshot)
                .map_err(|source| SyncError::Replay { key: checkpoint.key, source })?;
            (state, checkpoint.key)
        }
        None => (engine.empty_state(), 0),
    };

    let entries = log
        .read_range(base)
        .await
        .map_err(|source| SyncError::Bootstrap { stage: "change log", source })?;

    let booted = replay(engine, state, base, entries)?;
    log::info!(
        "bootstrapped at key {} ({} entries replayed over base {base})",
        booted.key,
        booted.replayed
    );
    Ok(booted)
}

/// Apply `entries` with key > `after` on top of `state`, in key order.
///
/// Entries are merged with a neutral origin so the engine never mistakes
/// historical operations for this client's pending ones.
pub fn replay<E: TransformEngine>(
    engine: &E,
    state: E::State,
    after: LogKey,
    mut entries: Vec<LogEntry>,
) -> Result<Bootstrapped<E::State>, SyncError> {
    entries.sort_by_key(|entry| entry.key);

    let mut booted = Bootstrapped { state, key: after, replayed: 0 };
    for entry in entries {
        if entry.key <= booted.key {
            continue;
        }
        let ops = entry
            .operations
            .iter()
            .map(|bytes| engine.decode_operation(bytes))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SyncError::Replay { key: entry.key, source })?;
        let origins = vec![ClientId::replay(); ops.len()];
        let merge = engine
            .apply_remote(&booted.state, &ops, &origins)
            .map_err(|source| SyncError::Replay { key: entry.key, source })?;

        booted.state = merge.state;
        booted.key = entry.key;
        booted.replayed += 1;
    }
    Ok(booted)
}
