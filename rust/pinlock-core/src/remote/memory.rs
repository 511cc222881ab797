use super::{
    join_path, path_segments, RemoteStore, Result, Snapshot, SnapshotBroadcaster, StoreError,
    Subscription,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A `remove_matching` call as seen by the store, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalCall {
    pub path: String,
    pub field: String,
    pub value: String,
}

/// In-process store holding the whole tree as JSON.
///
/// Behaves like the hosted database from the engine's point of view: the
/// current snapshot is delivered on subscribe and after every overlapping
/// write. Going offline makes every call fail with `Transport` and suspends
/// deliveries; coming back online re-delivers to every subscriber.
pub struct MemoryStore {
    root: RwLock<Value>,
    broadcaster: Arc<SnapshotBroadcaster>,
    offline: AtomicBool,
    failing_removals: Mutex<HashSet<String>>,
    removals: Mutex<Vec<RemovalCall>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tree(Value::Object(Map::new()))
    }

    pub fn with_tree(tree: Value) -> Self {
        let root = match tree {
            Value::Object(_) => tree,
            _ => Value::Object(Map::new()),
        };
        Self {
            root: RwLock::new(root),
            broadcaster: Arc::new(SnapshotBroadcaster::new()),
            offline: AtomicBool::new(false),
            failing_removals: Mutex::new(HashSet::new()),
            removals: Mutex::new(Vec::new()),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        let was_offline = self.offline.swap(offline, Ordering::SeqCst);
        if was_offline && !offline {
            log::debug!("memory store: reconnected, re-delivering snapshots");
            for (id, path) in self.broadcaster.subscriptions() {
                self.broadcaster.deliver(id, self.snapshot(&path));
            }
        }
    }

    /// Make every `remove_matching` against `path` fail with a transport error.
    pub fn fail_removals_on(&self, path: &str) {
        self.failing_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.trim_matches('/').to_string());
    }

    pub fn removal_calls(&self) -> Vec<RemovalCall> {
        self.removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    /// Insert `value` under a freshly generated child key of `path`.
    pub fn push_child(&self, path: &str, value: Value) -> Result<String> {
        self.ensure_online()?;
        let key = uuid::Uuid::new_v4().simple().to_string();
        self.set(&join_path(path, &key), value)?;
        Ok(key)
    }

    /// Current snapshot of `path`, regardless of connectivity.
    pub fn snapshot(&self, path: &str) -> Snapshot {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        let value = path_segments(path)
            .ok()
            .and_then(|segments| lookup(&root, &segments).cloned());
        Snapshot::from_value(path.trim_matches('/'), value.as_ref())
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("memory store is offline".into()));
        }
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = path_segments(path)?;
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        Ok(lookup(&root, &segments).cloned())
    }

    fn set(&self, path: &str, value: Value) -> Result<()> {
        let segments = path_segments(path)?;
        {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            if value.is_null() {
                remove(&mut root, &segments);
            } else {
                insert(&mut root, &segments, value);
            }
        }
        self.notify(path);
        Ok(())
    }

    fn notify(&self, written: &str) {
        if self.offline.load(Ordering::SeqCst) {
            return;
        }
        for (id, watched) in self.broadcaster.affected_by(written) {
            self.broadcaster.deliver(id, self.snapshot(&watched));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription> {
        path_segments(path)?;
        let (id, rx) = self.broadcaster.subscribe(path);
        if !self.offline.load(Ordering::SeqCst) {
            self.broadcaster.deliver(id, self.snapshot(path));
        }
        let broadcaster = Arc::clone(&self.broadcaster);
        Ok(Subscription::new(rx, move || broadcaster.unsubscribe(id)))
    }

    async fn read_value(&self, path: &str) -> Result<Option<Value>> {
        self.ensure_online()?;
        self.get(path)
    }

    async fn write_value(&self, path: &str, value: Value) -> Result<()> {
        self.ensure_online()?;
        self.set(path, value)
    }

    async fn remove_matching(&self, path: &str, field: &str, value: &str) -> Result<usize> {
        self.removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RemovalCall {
                path: path.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            });

        self.ensure_online()?;
        let failing = self
            .failing_removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path.trim_matches('/'));
        if failing {
            return Err(StoreError::Transport(format!(
                "removal rejected for {path}"
            )));
        }

        let segments = path_segments(path)?;
        let removed = {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            match lookup_mut(&mut root, &segments) {
                Some(Value::Object(children)) => {
                    let before = children.len();
                    children.retain(|_, child| {
                        child.get(field).and_then(Value::as_str) != Some(value)
                    });
                    before - children.len()
                }
                _ => 0,
            }
        };

        if removed > 0 {
            self.notify(path);
        }
        Ok(removed)
    }
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(*segment))
}

fn lookup_mut<'a>(root: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object_mut()?.get_mut(*segment))
}

fn insert(root: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

fn remove(root: &mut Value, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    if let Some(Value::Object(map)) = lookup_mut(root, parents) {
        map.remove(*last);
    }
}
