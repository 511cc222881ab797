//! Out-of-band signal channel.
//!
//! The controller sets a single flag in the staging collection to
//! `"new data"`. Each poll that observes it re-enables the launcher entry and
//! writes `"old data"` back. The engine never writes `"new data"`.

use crate::platform::LauncherHandle;
use crate::remote::{Result, StoreHandle};
use serde_json::Value;

pub const FLAG_NEW: &str = "new data";
pub const FLAG_OLD: &str = "old data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFlag {
    New,
    Old,
}

impl SignalFlag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            FLAG_NEW => Some(SignalFlag::New),
            FLAG_OLD => Some(SignalFlag::Old),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalFlag::New => FLAG_NEW,
            SignalFlag::Old => FLAG_OLD,
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Flag was new: launcher shown and flag acknowledged.
    Consumed,
    /// Flag was already old.
    Idle,
    /// Flag missing or holding an unrecognized value.
    Absent,
}

pub struct SignalChannel {
    store: StoreHandle,
    launcher: LauncherHandle,
    flag_path: String,
    component: String,
}

impl SignalChannel {
    pub fn new(
        store: StoreHandle,
        launcher: LauncherHandle,
        flag_path: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            store,
            launcher,
            flag_path: flag_path.into(),
            component: component.into(),
        }
    }

    pub async fn poll(&self) -> Result<SignalOutcome> {
        let raw = self.store.read_value(&self.flag_path).await?;
        let flag = raw.as_ref().and_then(Value::as_str).and_then(SignalFlag::parse);

        match flag {
            Some(SignalFlag::New) => {
                log::info!("signal: {} is new, showing {}", self.flag_path, self.component);
                self.launcher.set_launcher_visible(&self.component, true);
                if let Err(e) = self
                    .store
                    .write_value(&self.flag_path, Value::from(FLAG_OLD))
                    .await
                {
                    // The launcher action is idempotent; the next poll repeats it.
                    log::warn!("signal: failed to acknowledge {}: {e}", self.flag_path);
                    return Err(e);
                }
                Ok(SignalOutcome::Consumed)
            }
            Some(SignalFlag::Old) => Ok(SignalOutcome::Idle),
            None => Ok(SignalOutcome::Absent),
        }
    }
}
