use crate::platform::{FocusHandle, UsageRecord};
use std::time::Duration;

/// Pick the current foreground target from a usage history.
///
/// The most recently used record wins. Records sharing the latest timestamp
/// are broken by the lexicographically smallest target id. Records with an
/// empty id are ignored.
pub fn select_current(records: &[UsageRecord]) -> Option<&str> {
    records
        .iter()
        .filter(|r| !r.target_id.is_empty())
        .max_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then_with(|| b.target_id.cmp(&a.target_id))
        })
        .map(|r| r.target_id.as_str())
}

/// Queries the focus primitive once per tick.
pub struct ForegroundSampler {
    provider: FocusHandle,
    lookback: Duration,
}

impl ForegroundSampler {
    pub fn new(provider: FocusHandle, lookback: Duration) -> Self {
        Self { provider, lookback }
    }

    /// Current foreground target, or `None` when the look-back window holds
    /// no usage data.
    pub fn sample(&self) -> Option<String> {
        let records = self.provider.recent_usage(self.lookback);
        if records.is_empty() {
            log::debug!("sampler: no usage data in the last {:?}", self.lookback);
            return None;
        }
        let current = select_current(&records).map(str::to_string);
        log::debug!("sampler: current top target {current:?}");
        current
    }

    pub fn available(&self) -> (bool, String) {
        self.provider.available()
    }
}
