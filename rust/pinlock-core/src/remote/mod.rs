//! Remote store adapter.
//!
//! The controller and the controlled endpoint share a tree-structured key/value
//! store. This module defines the contract the engine consumes from it:
//!
//! - `subscribe(path)` yields full snapshots of the children under `path`
//! - `read_value` / `write_value` address a single node
//! - `remove_matching` deletes every child whose field equals a value
//!
//! A snapshot is always the complete current set of children, never a delta.
//! Consumers replace whatever they derived from the previous one.

mod broadcaster;
mod memory;
mod rest;

pub use broadcaster::{SnapshotBroadcaster, SubscriptionId};
pub use memory::{MemoryStore, RemovalCall};
pub use rest::RestStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: transport error - {0}")]
    Transport(String),

    #[error("store: unexpected status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("store: decode error - {0}")]
    Decode(String),

    #[error("store: invalid path '{0}'")]
    InvalidPath(String),

    #[error("store: unavailable - {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Complete view of a collection's children at one point in time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub path: String,
    pub children: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            children: BTreeMap::new(),
        }
    }

    /// Build a snapshot from the JSON value stored at `path`.
    ///
    /// Anything other than an object (including null, which is what an absent
    /// node reads as) yields an empty snapshot.
    pub fn from_value(path: impl Into<String>, value: Option<&Value>) -> Self {
        let children = match value {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => BTreeMap::new(),
        };
        Self {
            path: path.into(),
            children,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Child objects only; scalar siblings such as flags are skipped.
    pub fn records(&self) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
        self.children
            .iter()
            .filter_map(|(k, v)| v.as_object().map(|obj| (k, obj)))
    }
}

/// Cancellable handle over a stream of full snapshots.
///
/// Dropping the handle detaches the listener.
pub struct Subscription {
    rx: UnboundedReceiver<Snapshot>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        rx: UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Wait for the next snapshot. `None` once the listener is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Latest snapshot already delivered, skipping older queued ones.
    #[cfg(test)]
    pub(crate) fn try_latest(&mut self) -> Option<Snapshot> {
        let mut latest = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            latest = Some(snapshot);
        }
        latest
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening for changes under `path`. The current snapshot is
    /// delivered first.
    async fn subscribe(&self, path: &str) -> Result<Subscription>;

    /// Read the value at `path`; `None` when the node does not exist.
    async fn read_value(&self, path: &str) -> Result<Option<Value>>;

    async fn write_value(&self, path: &str, value: Value) -> Result<()>;

    /// Remove every child of `path` whose `field` equals `value`.
    /// Returns how many children were removed.
    async fn remove_matching(&self, path: &str, field: &str, value: &str) -> Result<usize>;
}

pub type StoreHandle = Arc<dyn RemoteStore>;

/// Split a slash-separated path into its non-empty segments.
pub fn path_segments(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    if segments
        .iter()
        .any(|s| s.contains(&['.', '#', '$', '[', ']'][..]))
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

pub fn join_path(parent: &str, child: &str) -> String {
    format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}
