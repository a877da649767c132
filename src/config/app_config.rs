use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bluetooth::uuid::canonicalize_uuid;
use crate::bluetooth::ManagerConfig;

/// Errors raised while loading, saving or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Service UUIDs a scan is restricted to (empty scans for everything)
    pub scan_services: Vec<String>,

    /// Report every advertisement instead of once per device and scan
    pub allow_duplicates: bool,

    /// How long the CLI scans, in seconds
    pub scan_duration_secs: u64,

    /// Upper bound for one GATT operation, in milliseconds
    pub operation_timeout_ms: Option<u64>,

    pub log_level: LogLevel,

    /// Append log output to this file as well
    pub log_file: Option<PathBuf>,

    /// Capacity of each event subscriber channel
    pub event_channel_capacity: usize,

    /// Where this configuration is saved
    #[serde(skip)]
    pub settings_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scan_services: Vec::new(),
            allow_duplicates: false,
            scan_duration_secs: 10,
            operation_timeout_ms: None,
            log_level: LogLevel::default(),
            log_file: None,
            event_channel_capacity: 100,
            settings_path: default_settings_path(),
        }
    }
}

impl AppConfig {
    /// Convert to the manager's runtime settings
    pub fn to_manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            operation_timeout: self.operation_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Load configuration from the default settings path, falling back to
    /// defaults when no file exists yet
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_settings_path();
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate configuration from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&json)?;
        config.settings_path = path.to_path_buf();
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to its settings path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&self.settings_path)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for uuid in &self.scan_services {
            canonicalize_uuid(uuid)
                .map_err(|_| ConfigError::Validation(format!("scan service {:?} is not a UUID", uuid)))?;
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Validation("event channel capacity must be positive".to_string()));
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(ConfigError::Validation("operation timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Get the default settings path
fn default_settings_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|config_dir| config_dir.join("gatt_central").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}
