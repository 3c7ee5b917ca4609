//! Outgoing-publish state machine.
//!
//! ```text
//!           decide()              complete(Committed)     own entry delivered
//!   idle ─────────────► publishing ──────────────────► awaiting ack ──────────► idle
//!                           │
//!                           │ complete(Contended | Failed)
//!                           ▼
//!                          idle  (resend armed)
//! ```
//!
//! While publishing or awaiting an acknowledgement, new sendable
//! operations are not claimed; the resend deadline is armed instead, so a
//! burst of edits coalesces into the next attempt.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CheckpointTrigger;
use crate::protocol::LogKey;

/// Next step for the actor after asking the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishDecision<Op> {
    /// Nothing to send.
    Nothing,
    /// Another claim is outstanding; resend deadline armed.
    Deferred,
    /// Claim `key` with `operations`.
    Claim { key: LogKey, operations: Vec<Op> },
}

/// How a claim attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    Committed,
    /// The slot was already taken by another writer
    Contended,
    /// The store could not be reached
    Failed,
}

/// Publish bookkeeping for one client.
#[derive(Debug)]
pub struct Publisher<Op> {
    resend_delay: Duration,
    trigger: CheckpointTrigger,
    in_flight: Option<LogKey>,
    /// Operations claimed but not yet seen in the log, by key
    held: BTreeMap<LogKey, Vec<Op>>,
    resend_at: Option<Instant>,
    applied_since_checkpoint: u64,
}

impl<Op: Clone> Publisher<Op> {
    pub fn new(resend_delay: Duration, trigger: CheckpointTrigger) -> Self {
        Self {
            resend_delay,
            trigger,
            in_flight: None,
            held: BTreeMap::new(),
            resend_at: None,
            applied_since_checkpoint: 0,
        }
    }

    /// Decide what to do with the current sendable operations.
    pub fn decide(
        &mut self,
        sendable: Option<Vec<Op>>,
        most_recent: LogKey,
        now: Instant,
    ) -> PublishDecision<Op> {
        let Some(operations) = sendable else {
            return PublishDecision::Nothing;
        };
        if self.is_blocked() {
            self.arm_resend(now);
            return PublishDecision::Deferred;
        }

        let key = most_recent + 1;
        self.in_flight = Some(key);
        self.held.insert(key, operations.clone());
        self.resend_at = None;
        PublishDecision::Claim { key, operations }
    }

    /// Record the outcome of the claim at `key`.
    pub fn complete(&mut self, key: LogKey, result: ClaimResult, now: Instant) {
        if self.in_flight == Some(key) {
            self.in_flight = None;
        }
        match result {
            ClaimResult::Committed => {}
            ClaimResult::Contended | ClaimResult::Failed => {
                self.held.remove(&key);
                self.arm_resend(now);
            }
        }
    }

    /// Whether a commit at `key` should be followed by a checkpoint.
    pub fn checkpoint_due(&self, key: LogKey) -> bool {
        self.trigger.should_checkpoint(key, self.applied_since_checkpoint + 1)
    }

    pub fn checkpoint_written(&mut self) {
        self.applied_since_checkpoint = 0;
    }

    /// Operations this client claimed at `key`, if it still holds them.
    pub fn take_acknowledged(&mut self, key: LogKey) -> Option<Vec<Op>> {
        self.held.remove(&key)
    }

    /// Forget claims at or below `key`; they can no longer be acknowledged.
    pub fn prune_through(&mut self, key: LogKey) {
        self.held = self.held.split_off(&(key + 1));
    }

    pub fn note_applied(&mut self) {
        self.applied_since_checkpoint += 1;
    }

    /// Waiting for a claim outcome or for a committed claim to come back.
    pub fn is_blocked(&self) -> bool {
        self.in_flight.is_some() || !self.held.is_empty()
    }

    pub fn in_flight(&self) -> Option<LogKey> {
        self.in_flight
    }

    pub fn resend_deadline(&self) -> Option<Instant> {
        self.resend_at
    }

    /// Disarm the resend deadline if it has passed.
    pub fn fire_resend(&mut self, now: Instant) -> bool {
        match self.resend_at {
            Some(at) if at <= now => {
                self.resend_at = None;
                true
            }
            _ => false,
        }
    }

    /// Disarm the resend deadline early once the blocker is gone.
    pub fn take_ready_resend(&mut self) -> bool {
        if self.resend_at.is_some() && !self.is_blocked() {
            self.resend_at = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.resend_at = None;
        self.in_flight = None;
        self.held.clear();
    }

    /// Arm without pushing back an earlier deadline, so steady typing
    /// cannot postpone a resend forever.
    fn arm_resend(&mut self, now: Instant) {
        if self.resend_at.is_none() {
            self.resend_at = Some(now + self.resend_delay);
        }
    }
}
