//! Path-scoped snapshot fan-out with DashMap
//!
//! Each subscriber registers interest in one collection path. When a write lands
//! anywhere that overlaps that path (the path itself, an ancestor or a
//! descendant) the store rebuilds the collection snapshot and hands it to
//! `deliver`, which pushes it to that subscriber only.
//!
//! Disconnected receivers are pruned on the next delivery attempt.

use super::Snapshot;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Subscription identifier type.
pub type SubscriptionId = u64;

struct Subscriber {
    path: String,
    tx: UnboundedSender<Snapshot>,
}

pub struct SnapshotBroadcaster {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    failed_sends: AtomicU64,
}

impl SnapshotBroadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed_sends: AtomicU64::new(0),
        }
    }

    /// Register interest in `path`.
    ///
    /// Returns a subscription ID (for unsubscribing) and a receiver channel.
    pub fn subscribe(&self, path: &str) -> (SubscriptionId, UnboundedReceiver<Snapshot>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                path: normalize(path),
                tx,
            },
        );
        (id, rx)
    }

    /// Safe to call multiple times.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(&id);
    }

    /// Subscriptions whose path overlaps `written`, with the path they watch.
    pub fn affected_by(&self, written: &str) -> Vec<(SubscriptionId, String)> {
        let written = normalize(written);
        self.subscribers
            .iter()
            .filter(|entry| overlaps(&entry.value().path, &written))
            .map(|entry| (*entry.key(), entry.value().path.clone()))
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(SubscriptionId, String)> {
        self.subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().path.clone()))
            .collect()
    }

    /// Push a snapshot to one subscriber, dropping it if the receiver is gone.
    pub fn deliver(&self, id: SubscriptionId, snapshot: Snapshot) {
        let failed = match self.subscribers.get(&id) {
            Some(subscriber) => subscriber.tx.send(snapshot).is_err(),
            None => return,
        };

        if failed {
            self.subscribers.remove(&id);
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[cfg(test)]
    pub(crate) fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn failed_sends(&self) -> u64 {
        self.failed_sends.load(Ordering::Relaxed)
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.starts_with(ancestor) && path[ancestor.len()..].starts_with('/'))
}

fn overlaps(watched: &str, written: &str) -> bool {
    is_within(written, watched) || is_within(watched, written)
}
