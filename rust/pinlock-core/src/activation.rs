//! Staging list and activation.
//!
//! A controller fills the staging collection with apps to restrict. Activating
//! copies each one into the active-policy collection, keyed by display name,
//! and hides the launcher entry.

use crate::config::PinlockConfig;
use crate::platform::LauncherHandle;
use crate::policy::{PASSCODE_FIELD, TARGET_FIELD};
use crate::remote::{join_path, RemoteStore, Snapshot};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{json, Map, Value};

const NAME_FIELD: &str = "name";
const ICON_FIELD: &str = "icon";
const INTERVAL_FIELD: &str = "interval";

/// An app awaiting activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedApp {
    pub key: String,
    pub package_name: String,
    pub name: String,
    #[serde(skip)]
    pub icon: Vec<u8>,
    /// Raw base64 as stored, written through unchanged on activation.
    #[serde(skip)]
    pub icon_base64: String,
    pub interval: String,
    pub pin_code: String,
}

impl StagedApp {
    /// `interval` is minutes stored as a string; `None` if it does not parse.
    pub fn interval_minutes(&self) -> Option<u32> {
        self.interval.trim().parse().ok()
    }

    fn from_record(key: &str, record: &Map<String, Value>) -> Option<Self> {
        let text = |field: &str| {
            record
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let icon_base64 = text(ICON_FIELD);
        let icon = decode_icon(&icon_base64)?;

        Some(Self {
            key: key.to_string(),
            package_name: text(TARGET_FIELD),
            name: text(NAME_FIELD),
            icon,
            icon_base64,
            interval: text(INTERVAL_FIELD),
            pin_code: text(PASSCODE_FIELD),
        })
    }

    fn active_record(&self) -> Value {
        json!({
            TARGET_FIELD: self.package_name,
            ICON_FIELD: self.icon_base64,
            INTERVAL_FIELD: self.interval,
            PASSCODE_FIELD: self.pin_code,
        })
    }
}

fn decode_icon(raw: &str) -> Option<Vec<u8>> {
    // Stored icons may carry line breaks from MIME-style encoders.
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    match STANDARD.decode(compact) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        _ => None,
    }
}

/// Staged apps in a snapshot of the staging collection.
///
/// Scalar siblings (the signal flag) are skipped, as are records whose icon
/// does not decode.
pub fn staged_apps(snapshot: &Snapshot) -> Vec<StagedApp> {
    snapshot
        .records()
        .filter_map(|(key, record)| {
            let app = StagedApp::from_record(key, record);
            if app.is_none() {
                log::debug!("activation: skipping staged record {key} with unreadable icon");
            }
            app
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub written: usize,
    pub failed: usize,
}

/// Copy staged apps into the active-policy collection and hide the launcher
/// entry. Each write is independent; failures are logged and counted.
pub async fn activate(
    store: &dyn RemoteStore,
    config: &PinlockConfig,
    launcher: &LauncherHandle,
    apps: &[StagedApp],
) -> ActivationReport {
    let mut report = ActivationReport::default();

    for app in apps {
        let path = join_path(&config.store.locked_collection, &app.name);
        match store.write_value(&path, app.active_record()).await {
            Ok(()) => {
                log::info!("activation: {} restricted under {path}", app.package_name);
                report.written += 1;
            }
            Err(e) => {
                log::warn!("activation: failed to write {path}: {e}");
                report.failed += 1;
            }
        }
    }

    launcher.set_launcher_visible(&config.launcher_component, false);
    report
}

/// Read the staging collection once and activate everything in it.
pub async fn activate_staged(
    store: &dyn RemoteStore,
    config: &PinlockConfig,
    launcher: &LauncherHandle,
) -> crate::remote::Result<ActivationReport> {
    let path = &config.store.staging_collection;
    let snapshot = Snapshot::from_value(path.as_str(), store.read_value(path).await?.as_ref());
    let apps = staged_apps(&snapshot);
    Ok(activate(store, config, launcher, &apps).await)
}
