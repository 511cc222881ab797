//! Policy cache: restricted target → passcode.
//!
//! The cache is rebuilt from scratch on every snapshot of the active-policy
//! collection and swapped in as a whole. Readers take a cheap `Arc` clone of
//! the current map and never see a partially built one.

use crate::remote::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub const TARGET_FIELD: &str = "package_name";
pub const PASSCODE_FIELD: &str = "pin_code";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub target_id: String,
    pub passcode: String,
}

impl PolicyEntry {
    /// Extract an entry from a remote record. Records missing either field,
    /// or carrying an empty one, yield `None`.
    pub fn from_record(record: &Map<String, Value>) -> Option<Self> {
        let target_id = record.get(TARGET_FIELD)?.as_str()?;
        let passcode = record.get(PASSCODE_FIELD)?.as_str()?;
        if target_id.is_empty() || passcode.is_empty() {
            return None;
        }
        Some(Self {
            target_id: target_id.to_string(),
            passcode: passcode.to_string(),
        })
    }
}

impl std::fmt::Debug for PolicyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEntry")
            .field("target_id", &self.target_id)
            .field("passcode", &"<redacted>")
            .finish()
    }
}

/// Immutable mapping target → passcode.
pub type Policy = Arc<HashMap<String, String>>;

/// Build a policy from a full snapshot.
///
/// Children are visited in key order, so when several records name the same
/// target the last one wins deterministically.
pub fn ingest(snapshot: &Snapshot) -> HashMap<String, String> {
    let mut policy = HashMap::new();
    let mut dropped = 0usize;

    for (key, child) in &snapshot.children {
        match child.as_object().and_then(PolicyEntry::from_record) {
            Some(entry) => {
                policy.insert(entry.target_id, entry.passcode);
            }
            None => {
                dropped += 1;
                log::debug!("policy: dropping malformed record {}/{key}", snapshot.path);
            }
        }
    }

    log::debug!(
        "policy: rebuilt from {} ({} targets, {} dropped)",
        snapshot.path,
        policy.len(),
        dropped
    );
    policy
}

/// Single-writer, multi-reader swap of the current policy.
pub struct PolicyCache {
    current: RwLock<Policy>,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// The policy in force right now.
    pub fn snapshot(&self) -> Policy {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, policy: HashMap<String, String>) {
        let policy = Arc::new(policy);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Rebuild from a snapshot and swap it in. Returns the new size.
    pub fn rebuild(&self, snapshot: &Snapshot) -> usize {
        let policy = ingest(snapshot);
        let size = policy.len();
        self.replace(policy);
        size
    }

    /// Swap in a copy of the current policy without `target_id`.
    ///
    /// Used after a grant so the target stops matching before the store's
    /// next snapshot arrives.
    pub fn forget(&self, target_id: &str) -> bool {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.contains_key(target_id) {
            return false;
        }
        let mut next: HashMap<String, String> = (**guard).clone();
        next.remove(target_id);
        *guard = Arc::new(next);
        true
    }

    pub fn passcode_for(&self, target_id: &str) -> Option<String> {
        self.snapshot().get(target_id).cloned()
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.snapshot().contains_key(target_id)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}
