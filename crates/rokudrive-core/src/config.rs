//! Device configuration for rokudrive.
//!
//! A [`DeviceConfig`] describes one target device: where its on-device
//! component listens, how long requests may take, and whether the device
//! registry is snapshotted for the session. Configuration is normally kept in
//! `~/.rokudrive/config.json`.
//!
//! # Example
//!
//! ```no_run
//! use rokudrive_core::config::DeviceConfig;
//!
//! let config = DeviceConfig::load_default().expect("no device configured");
//! println!("device: {}:{}", config.host, config.port);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Port the on-device component listens on.
pub const DEFAULT_DEVICE_PORT: u16 = 9000;

/// Request timeout used when neither the request nor the device sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Log verbosity requested from the on-device component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            other => Err(ConfigError::Invalid(format!("unknown log level: {other}"))),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

/// Connection and session settings for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Hostname or IP address of the device.
    pub host: String,

    /// TCP port of the on-device component.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Device-specific default request timeout, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,

    /// Scales every request timeout; slow devices use values above 1.
    #[serde(default = "default_multiplier")]
    pub timeout_multiplier: f64,

    /// Snapshot the device registry on first use and restore it on shutdown.
    #[serde(default)]
    pub restore_registry: bool,

    /// Log level forwarded to the device with each request.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Delay between connect attempts while the device refuses connections.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl DeviceConfig {
    /// Creates a configuration for `host` with every other setting defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_DEVICE_PORT,
            default_timeout_ms: None,
            timeout_multiplier: default_multiplier(),
            restore_registry: false,
            log_level: LogLevel::default(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DeviceConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `~/.rokudrive/config.json`.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(default_config_path())
    }

    /// Save the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Rejects settings the client cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if !self.timeout_multiplier.is_finite() || self.timeout_multiplier <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeoutMultiplier must be a positive number, got {}",
                self.timeout_multiplier
            )));
        }
        Ok(())
    }

    /// Device-specific default timeout, if configured.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Returns the rokudrive directory path (`~/.rokudrive/`).
///
/// Falls back to the working directory when no home directory is known.
pub fn rokudrive_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rokudrive")
}

/// Path of the default configuration file.
pub fn default_config_path() -> PathBuf {
    rokudrive_dir().join(CONFIG_FILENAME)
}
