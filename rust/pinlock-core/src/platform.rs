//! Platform collaborators.
//!
//! The engine never reads OS focus state or draws anything itself. These
//! traits are the primitives it invokes:
//!
//! - recent usage history within a look-back window
//! - a blocking full-screen surface
//! - enabling/disabling a launcher entry
//! - a persistent background status indicator

use crate::config::StatusNotice;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// One application's entry in the usage history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub target_id: String,
    pub last_used: SystemTime,
}

impl UsageRecord {
    pub fn new(target_id: impl Into<String>, last_used: SystemTime) -> Self {
        Self {
            target_id: target_id.into(),
            last_used,
        }
    }
}

/// Provider for recent foreground usage (platform-specific).
pub trait FocusProvider: Send + Sync {
    /// Usage records for applications used within `window`. Order is not
    /// significant; the sampler sorts by recency.
    fn recent_usage(&self, window: Duration) -> Vec<UsageRecord>;

    /// Whether the primitive can be used (permission granted, platform
    /// supported), with a human-readable reason.
    fn available(&self) -> (bool, String) {
        (true, "usage history available".to_string())
    }
}

/// Blocking surface drawn over a restricted target.
pub trait LockSurface: Send + Sync {
    fn present(&self, target_id: &str);

    /// Mirror the entered digits (the surface decides how to mask them).
    fn update_entry(&self, entered: &str);

    /// Tell the user the passcode was wrong.
    fn notify_mismatch(&self, target_id: &str);

    fn dismiss(&self);
}

pub trait LauncherControl: Send + Sync {
    fn set_launcher_visible(&self, component: &str, visible: bool);
}

/// Persistent indicator required while periodic sampling runs unattended.
pub trait StatusIndicator: Send + Sync {
    fn start(&self, notice: &StatusNotice);
    fn stop(&self);
}

pub type FocusHandle = Arc<dyn FocusProvider>;
pub type SurfaceHandle = Arc<dyn LockSurface>;
pub type LauncherHandle = Arc<dyn LauncherControl>;
pub type IndicatorHandle = Arc<dyn StatusIndicator>;

/// Focus provider for platforms without a usage-history primitive.
pub struct StubFocusProvider;

impl FocusProvider for StubFocusProvider {
    fn recent_usage(&self, _window: Duration) -> Vec<UsageRecord> {
        Vec::new()
    }

    fn available(&self) -> (bool, String) {
        (
            false,
            "Usage history not available on this platform".to_string(),
        )
    }
}

/// Indicator that shows nothing, for hosts with no status area.
pub struct NoopIndicator;

impl StatusIndicator for NoopIndicator {
    fn start(&self, notice: &StatusNotice) {
        log::debug!("status indicator suppressed: {}", notice.title);
    }

    fn stop(&self) {}
}
