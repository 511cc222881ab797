use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinlockConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub signal: SignalConfig,

    /// Launcher entry toggled by the signal channel and by activation.
    #[serde(default = "default_launcher_component")]
    pub launcher_component: String,

    #[serde(default)]
    pub status_notice: StatusNotice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_refresh")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_locked_collection")]
    pub locked_collection: String,
    #[serde(default = "default_staging_collection")]
    pub staging_collection: String,
    #[serde(default = "default_signal_field")]
    pub signal_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            refresh_interval_ms: default_refresh(),
            request_timeout_secs: default_request_timeout(),
            locked_collection: default_locked_collection(),
            staging_collection: default_staging_collection(),
            signal_field: default_signal_field(),
        }
    }
}

impl StoreConfig {
    /// Path of the signal flag, a sibling field inside the staging collection.
    pub fn signal_path(&self) -> String {
        format!(
            "{}/{}",
            self.staging_collection.trim_end_matches('/'),
            self.signal_field
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_sampler_poll")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lookback")]
    pub lookback_secs: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_sampler_poll(),
            lookback_secs: default_lookback(),
        }
    }
}

impl SamplerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_signal_poll")]
    pub poll_interval_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_signal_poll(),
        }
    }
}

impl SignalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Text of the persistent indicator shown while sampling runs unattended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusNotice {
    #[serde(default = "default_notice_title")]
    pub title: String,
    #[serde(default = "default_notice_text")]
    pub text: String,
}

impl Default for StatusNotice {
    fn default() -> Self {
        Self {
            title: default_notice_title(),
            text: default_notice_text(),
        }
    }
}

impl Default for PinlockConfig {
    fn default() -> Self {
        Self::default_with_dir(&default_data_dir())
    }
}

// Defaults
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".pinlock"))
        .unwrap_or_else(|| PathBuf::from(".pinlock"))
}
fn default_refresh() -> u64 {
    2000
}
fn default_request_timeout() -> u64 {
    15
}
fn default_locked_collection() -> String {
    "childApp".to_string()
}
fn default_staging_collection() -> String {
    "Apps".to_string()
}
fn default_signal_field() -> String {
    "type".to_string()
}
fn default_sampler_poll() -> u64 {
    1000
}
fn default_lookback() -> u64 {
    1000
}
fn default_signal_poll() -> u64 {
    5000
}
fn default_launcher_component() -> String {
    "com.app.lockcomposeChild.MainActivity".to_string()
}
fn default_notice_title() -> String {
    "App Lock Service".to_string()
}
fn default_notice_text() -> String {
    "Running...".to_string()
}

impl PinlockConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("pinlock.json");

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            let mut config: PinlockConfig = serde_json::from_str(&raw)?;
            config.data_dir = data_dir.to_path_buf();
            config.validate()?;
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            store: StoreConfig::default(),
            sampler: SamplerConfig::default(),
            signal: SignalConfig::default(),
            launcher_component: default_launcher_component(),
            status_notice: StatusNotice::default(),
        }
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join("pinlock.json");
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampler.poll_interval_ms == 0 {
            return Err(anyhow!("sampler.poll_interval_ms must be greater than zero"));
        }
        if self.signal.poll_interval_ms == 0 {
            return Err(anyhow!("signal.poll_interval_ms must be greater than zero"));
        }
        if self.store.refresh_interval_ms == 0 {
            return Err(anyhow!("store.refresh_interval_ms must be greater than zero"));
        }
        for (name, value) in [
            ("store.locked_collection", &self.store.locked_collection),
            ("store.staging_collection", &self.store.staging_collection),
            ("store.signal_field", &self.store.signal_field),
        ] {
            if value.trim_matches('/').is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        Ok(())
    }
}
