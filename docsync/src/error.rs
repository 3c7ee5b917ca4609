//! Error types for stores, the transform engine, and the sync client.
//!
//! Only bootstrap failures are fatal to a client. Everything else is
//! recovered inside the actor loop (retry, wait-and-merge) and logged.

use thiserror::Error;

use crate::protocol::LogKey;

/// Errors reported by change log, checkpoint and presence backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend unreachable (network drop, simulated outage)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// The store or subscription was shut down
    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Whether a retry of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Errors reported by a [`TransformEngine`](crate::engine::TransformEngine).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Operation does not fit the document it is applied to
    #[error("Invalid step: {0}")]
    InvalidStep(String),
    /// Operation or snapshot bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Errors surfaced by [`SyncClient`](crate::client::SyncClient).
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Bootstrap failed while reading {stage}: {source}")]
    Bootstrap {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("Replay failed at key {key}: {source}")]
    Replay {
        key: LogKey,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Client already attached")]
    AlreadyAttached,
    #[error("Client not attached")]
    NotAttached,
    /// The actor loop has stopped (detached or desynchronized)
    #[error("Client detached")]
    Detached,
}

impl SyncError {
    /// Fatal errors leave the client without a usable document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Bootstrap { .. } | SyncError::Replay { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
