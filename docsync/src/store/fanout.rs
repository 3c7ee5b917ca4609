//! Ordered fan-out of store notifications to N subscribers.
//!
//! Each subscriber gets its own unbounded channel so a slow consumer never
//! loses an entry; change log consumers cannot tolerate gaps the way
//! cursor broadcasts can. Closed subscribers are pruned on send.
//!
//! A `Fanout` carries no lock of its own. Stores keep it behind the same
//! lock that serializes their writes, so delivery order equals commit order.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::Subscription;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub subscribers_pruned: u64,
    pub active_subscribers: usize,
}

/// Fan-out group for one stream (one document's entries, one presence room).
pub struct Fanout<T> {
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    messages_sent: AtomicU64,
    subscribers_pruned: AtomicU64,
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            messages_sent: AtomicU64::new(0),
            subscribers_pruned: AtomicU64::new(0),
        }
    }

    /// Add a subscriber that receives only future messages.
    pub fn subscribe(&mut self) -> Subscription<T> {
        self.subscribe_with(std::iter::empty())
    }

    /// Add a subscriber that first receives `backlog`, then future messages.
    pub fn subscribe_with(&mut self, backlog: impl IntoIterator<Item = T>) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        for item in backlog {
            // receiver is alive until this function returns
            let _ = tx.send(item);
        }
        self.subscribers.push(tx);
        Subscription::new(rx)
    }

    /// Deliver `item` to every live subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn send(&mut self, item: T) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        let delivered = self.subscribers.len();

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let pruned = (before - delivered) as u64;
        if pruned > 0 {
            self.subscribers_pruned.fetch_add(pruned, Ordering::Relaxed);
            log::debug!("fanout pruned {pruned} closed subscriber(s)");
        }
        delivered
    }

    /// Live subscribers (closed receivers are not counted).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            subscribers_pruned: self.subscribers_pruned.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self::new()
    }
}
