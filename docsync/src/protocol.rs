//! Shared data model for the change log, checkpoints, and presence.
//!
//! Records are bincode-encoded when a backend needs bytes:
//! ```text
//! LogEntry   ┌─────┬────────────┬────────┬──────────┬───────────┐
//!            │ key │ operations │ origin │ metadata │ timestamp │
//!            └─────┴────────────┴────────┴──────────┴───────────┘
//! Checkpoint ┌──────────┬─────┬───────────┐
//!            │ snapshot │ key │ timestamp │
//!            └──────────┴─────┴───────────┘
//! ```
//!
//! Operations travel as opaque byte strings; only the
//! [`TransformEngine`](crate::engine::TransformEngine) knows their shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::StoreError;

/// Position of an entry in the change log. Key 0 is never claimed; it
/// stands for "empty document".
pub type LogKey = u64;

/// Identity of one participant editing one document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Origin attached to operations replayed from history.
    const REPLAY: &'static str = "_replay";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Neutral origin used when replaying entries that must not be matched
    /// against any client's pending operations.
    pub fn replay() -> Self {
        Self(Self::REPLAY.to_string())
    }

    pub fn is_replay(&self) -> bool {
        self.0 == Self::REPLAY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cursor or range selection, in engine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn cursor(pos: usize) -> Self {
        Self { anchor: pos, head: pos }
    }

    pub fn from(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn to(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// A single transaction metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

/// Transaction metadata (e.g. `addToHistory = false`).
pub type Metadata = BTreeMap<String, MetaValue>;

/// An immutable, committed change log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: LogKey,
    /// Engine-encoded operations, in application order
    pub operations: Vec<Vec<u8>>,
    pub origin: ClientId,
    pub metadata: Metadata,
    /// Milliseconds since epoch, assigned by the store on commit
    pub write_timestamp: i64,
}

/// The payload of a claim; the store turns it into a [`LogEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub operations: Vec<Vec<u8>>,
    pub origin: ClientId,
    pub metadata: Metadata,
}

impl NewEntry {
    pub fn commit(self, key: LogKey, write_timestamp: i64) -> LogEntry {
        LogEntry {
            key,
            operations: self.operations,
            origin: self.origin,
            metadata: self.metadata,
            write_timestamp,
        }
    }
}

/// Document state after every entry up to and including `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub snapshot: Vec<u8>,
    pub key: LogKey,
    pub write_timestamp: i64,
}

/// Display data a client publishes alongside its selection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientData {
    pub name: String,
    pub initials: String,
    pub image: Option<String>,
    pub cursor_color: String,
    pub background_color: String,
    /// Milliseconds since epoch, rounded to the activity granularity
    pub last_active: Option<i64>,
}

impl ClientData {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let initials = name
            .split_whitespace()
            .filter_map(|part| part.chars().next())
            .flat_map(char::to_uppercase)
            .take(2)
            .collect();
        Self {
            name,
            initials,
            ..Self::default()
        }
    }
}

/// One client's ephemeral presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub selection: Selection,
    /// Set on the first publish after joining
    pub is_initial: bool,
    pub data: ClientData,
}

/// Encode any protocol value with bincode's standard config.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a protocol value produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> LogEntry {
        let mut metadata = Metadata::new();
        metadata.insert("addToHistory".into(), MetaValue::Bool(false));
        metadata.insert("source".into(), "paste".into());
        LogEntry {
            key: 7,
            operations: vec![vec![1, 2, 3], vec![]],
            origin: ClientId::new("alice"),
            metadata,
            write_timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = sample_entry();
        let bytes = encode(&entry).unwrap();
        let decoded: LogEntry = decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_presence_record_roundtrip() {
        let record = PresenceRecord {
            client_id: ClientId::new("bob"),
            selection: Selection::new(4, 9),
            is_initial: true,
            data: ClientData::named("Bob Stone"),
        };
        let decoded: PresenceRecord = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let result: Result<LogEntry, _> = decode(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(StoreError::Deserialization(_))));
    }

    #[test]
    fn test_new_entry_commit() {
        let entry = NewEntry {
            operations: vec![vec![9]],
            origin: ClientId::new("c"),
            metadata: Metadata::new(),
        }
        .commit(3, 55);
        assert_eq!(entry.key, 3);
        assert_eq!(entry.write_timestamp, 55);
        assert_eq!(entry.operations, vec![vec![9]]);
    }

    #[test]
    fn test_replay_client_id() {
        assert!(ClientId::replay().is_replay());
        assert!(!ClientId::random().is_replay());
        assert_ne!(ClientId::random(), ClientId::random());
    }

    #[test]
    fn test_selection_bounds() {
        let sel = Selection::new(15, 10);
        assert_eq!(sel.from(), 10);
        assert_eq!(sel.to(), 15);
        assert_eq!(Selection::cursor(3), Selection::new(3, 3));
    }

    #[test]
    fn test_client_data_initials() {
        assert_eq!(ClientData::named("ada lovelace").initials, "AL");
        assert_eq!(ClientData::named("Plato").initials, "P");
        assert_eq!(ClientData::named("").initials, "");
    }
}
