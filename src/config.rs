//! Layered configuration.
//!
//! Sources, highest priority last:
//! 1. Built-in defaults
//! 2. TOML file (`~/.config/geotrail/config.toml` unless overridden)
//! 3. Environment variables, `GEOTRAIL_` prefix with `__` between sections
//!    (`GEOTRAIL_TRACKER__GPS_TIMEOUT_SECS=30` sets `tracker.gps_timeout_secs`)
//!
//! ```toml
//! [tracker]
//! gps_retry_interval_secs = 1800
//!
//! [[delivery.accounts]]
//! name = "gmail"
//! smtp_server = "smtp.gmail.com"
//! smtp_port = 587
//! sender_email = "me@gmail.com"
//! app_password = "abcd efgh ijkl mnop"
//! recipient_email = "me@gmail.com"
//! ```

use crate::delivery::Account;
use crate::provider::{CommandProviderConfig, PROVIDER_PLACEHOLDER};
use crate::tracker::TrackerConfig;
use crate::wakelock::WakeLockConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "GEOTRAIL_";
pub const DEFAULT_LEDGER_FILE: &str = "gps_log.csv";
const APP_DIR: &str = "geotrail";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("Tracker setting {0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Figment(Box::new(e))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub wake_lock: WakeLockSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub gps_timeout_secs: u64,
    pub long_network_timeout_secs: u64,
    pub short_network_timeout_secs: u64,
    pub gps_retry_interval_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        let defaults = TrackerConfig::default();
        Self {
            gps_timeout_secs: defaults.gps_timeout.as_secs(),
            long_network_timeout_secs: defaults.long_network_timeout.as_secs(),
            short_network_timeout_secs: defaults.short_network_timeout.as_secs(),
            gps_retry_interval_secs: defaults.gps_retry_interval.as_secs(),
            poll_interval_secs: defaults.poll_interval.as_secs(),
        }
    }
}

impl TrackerSettings {
    pub fn to_tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        let secs = |value: u64, name: &'static str| {
            if value == 0 {
                Err(ConfigError::ZeroDuration(name))
            } else {
                Ok(Duration::from_secs(value))
            }
        };

        Ok(TrackerConfig {
            gps_timeout: secs(self.gps_timeout_secs, "gps_timeout_secs")?,
            long_network_timeout: secs(self.long_network_timeout_secs, "long_network_timeout_secs")?,
            short_network_timeout: secs(
                self.short_network_timeout_secs,
                "short_network_timeout_secs",
            )?,
            gps_retry_interval: secs(self.gps_retry_interval_secs, "gps_retry_interval_secs")?,
            poll_interval: secs(self.poll_interval_secs, "poll_interval_secs")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        let defaults = CommandProviderConfig::default();
        Self {
            command: defaults.command,
            args: defaults.args,
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> CommandProviderConfig {
        if !self.args.iter().any(|a| a.contains(PROVIDER_PLACEHOLDER)) {
            tracing::warn!(
                "Provider args have no {} placeholder, gps and network queries will be identical",
                PROVIDER_PLACEHOLDER
            );
        }
        CommandProviderConfig::new(self.command.clone()).with_args(self.args.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WakeLockSettings {
    pub enabled: bool,
    pub acquire_command: String,
    pub release_command: String,
}

impl Default for WakeLockSettings {
    fn default() -> Self {
        let defaults = WakeLockConfig::default();
        Self {
            enabled: defaults.enabled,
            acquire_command: defaults.acquire_command,
            release_command: defaults.release_command,
        }
    }
}

impl WakeLockSettings {
    pub fn to_wake_lock_config(&self) -> WakeLockConfig {
        WakeLockConfig {
            enabled: self.enabled,
            acquire_command: self.acquire_command.clone(),
            release_command: self.release_command.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub ledger_file: String,
    /// Where export files are staged before delivery. Defaults to `data_dir`.
    pub export_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .map(|d| d.join(APP_DIR))
                .unwrap_or_else(|| PathBuf::from(".")),
            ledger_file: DEFAULT_LEDGER_FILE.to_string(),
            export_dir: None,
        }
    }
}

impl StorageSettings {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("geotrail.pid")
    }

    pub fn daemon_log_path(&self) -> PathBuf {
        self.data_dir.join("geotrail.log")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Deadline for each account attempt
    pub timeout_secs: u64,
    /// Tried in order until one succeeds
    pub accounts: Vec<Account>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            accounts: Vec::new(),
        }
    }
}

impl DeliverySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Load from defaults, the TOML file at `path` (or the default location), and env.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    /// Build the provider chain.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        let file = path.map(Path::to_path_buf).or_else(Self::default_path);
        if let Some(file) = file {
            if file.exists() {
                tracing::debug!("Loading config from {}", file.display());
                figment = figment.merge(Toml::file(file));
            }
        }

        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// `<config_dir>/geotrail/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
    }
}
