//! Sync client configuration.
//!
//! Behaviour that differed between deployments (presence data shape,
//! metadata filtering, compaction cadence) is expressed here rather than
//! as separate code paths.

use std::time::Duration;

use crate::protocol::{LogKey, Metadata};

/// When a client writes a checkpoint after one of its claims commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// After committing a key that is a non-zero multiple of `n`.
    /// Assumes the log never skips keys.
    KeyMultiple(u64),
    /// After committing, once `n` entries have been observed since this
    /// client's last checkpoint. Safe for backends that may skip keys.
    EveryCommits(u64),
    Disabled,
}

impl CheckpointTrigger {
    /// Decide for a committed `key`, given how many entries were applied
    /// since the last checkpoint this client wrote.
    pub fn should_checkpoint(&self, key: LogKey, applied_since_last: u64) -> bool {
        match *self {
            CheckpointTrigger::KeyMultiple(n) => n > 0 && key > 0 && key % n == 0,
            CheckpointTrigger::EveryCommits(n) => n > 0 && applied_since_last >= n,
            CheckpointTrigger::Disabled => false,
        }
    }
}

impl Default for CheckpointTrigger {
    fn default() -> Self {
        CheckpointTrigger::KeyMultiple(100)
    }
}

/// Presence timing policy.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Records idle longer than this are removed (default: 10 min)
    pub staleness_window: Duration,
    /// `last_active` rounding (default: 60 s)
    pub activity_granularity: Duration,
    /// Idle sweep for stale peers (default: 30 s)
    pub sweep_interval: Duration,
    /// Transaction meta key that forces a selection publish
    pub force_publish_key: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(10 * 60),
            activity_granularity: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            force_publish_key: "pointer".to_string(),
        }
    }
}

/// Which transaction metadata is published, and which transactions are
/// kept local.
#[derive(Debug, Clone)]
pub struct MetaFilter {
    /// Transactions carrying any of these keys are never published
    pub skip_publish: Vec<String>,
    /// Keys removed before publishing
    pub strip_exact: Vec<String>,
    /// Keys containing any of these substrings are removed before publishing
    pub strip_containing: Vec<String>,
}

impl MetaFilter {
    pub fn skips(&self, meta: &Metadata) -> bool {
        self.skip_publish.iter().any(|k| meta.contains_key(k))
    }

    /// Metadata as it should appear in a published entry.
    pub fn publishable(&self, meta: &Metadata) -> Metadata {
        meta.iter()
            .filter(|(k, _)| {
                !self.strip_exact.iter().any(|s| s == *k)
                    && !self.strip_containing.iter().any(|s| k.contains(s.as_str()))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for MetaFilter {
    fn default() -> Self {
        Self {
            skip_publish: ["collab$", "rebase", "footnote", "newSelection", "clearTempSelection"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            strip_exact: vec!["addToHistory".to_string(), "pointer".to_string()],
            strip_containing: vec!["$".to_string()],
        }
    }
}

/// Sync client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub checkpoint: CheckpointTrigger,
    /// Backoff before retrying a deferred or failed publish (default: 5 s)
    pub resend_delay: Duration,
    pub presence: PresenceConfig,
    pub meta_filter: MetaFilter,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointTrigger::default(),
            resend_delay: Duration::from_secs(5),
            presence: PresenceConfig::default(),
            meta_filter: MetaFilter::default(),
        }
    }
}

impl SyncConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            resend_delay: Duration::from_millis(50),
            presence: PresenceConfig {
                sweep_interval: Duration::from_millis(100),
                ..PresenceConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MetaValue;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.checkpoint, CheckpointTrigger::KeyMultiple(100));
        assert_eq!(config.resend_delay, Duration::from_secs(5));
        assert_eq!(config.presence.staleness_window, Duration::from_secs(600));
        assert_eq!(config.presence.activity_granularity, Duration::from_secs(60));
    }

    #[test]
    fn test_key_multiple_trigger() {
        let trigger = CheckpointTrigger::KeyMultiple(100);
        assert!(!trigger.should_checkpoint(0, 0));
        assert!(!trigger.should_checkpoint(99, 99));
        assert!(trigger.should_checkpoint(100, 1));
        assert!(trigger.should_checkpoint(300, 0));
    }

    #[test]
    fn test_every_commits_trigger() {
        let trigger = CheckpointTrigger::EveryCommits(10);
        assert!(!trigger.should_checkpoint(57, 9));
        assert!(trigger.should_checkpoint(57, 10));
        assert!(!CheckpointTrigger::Disabled.should_checkpoint(100, 100));
    }

    #[test]
    fn test_meta_filter_strips_keys() {
        let filter = MetaFilter::default();
        let mut meta = Metadata::new();
        meta.insert("addToHistory".into(), MetaValue::Bool(false));
        meta.insert("pointer".into(), MetaValue::Bool(true));
        meta.insert("history$".into(), MetaValue::Int(1));
        meta.insert("inputType".into(), "insertText".into());

        let published = filter.publishable(&meta);
        assert_eq!(published.len(), 1);
        assert!(published.contains_key("inputType"));
    }

    #[test]
    fn test_meta_filter_skips_rebase() {
        let filter = MetaFilter::default();
        let mut meta = Metadata::new();
        assert!(!filter.skips(&meta));
        meta.insert("rebase".into(), MetaValue::Bool(true));
        assert!(filter.skips(&meta));
    }
}
