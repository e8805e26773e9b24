//! Configuration module for msgbridge-rs
//!
//! Two files drive the bridge:
//! - `msgbridge.toml` - application settings (queue sizes, logging)
//! - `pipelines.json` - the pipeline document, keyed by pipeline id
//!
//! # Config Location
//!
//! Both live in the platform config directory unless overridden:
//! - **Linux**: `~/.config/msgbridge-rs/`
//! - **macOS**: `~/Library/Application Support/msgbridge-rs/`
//! - **Windows**: `%APPDATA%\msgbridge-rs\`
//!
//! # Example
//!
//! ```ignore
//! use msgbridge_rs::config::{BridgeConfig, PipelinesDocument};
//!
//! let config = BridgeConfig::load_or_default(None);
//! let pipelines = PipelinesDocument::load_or_default(config.pipelines_path());
//! ```

pub mod pipelines;

pub use pipelines::*;

use crate::error::{BridgeError, Result, ResultExt};
use crate::pipeline::chain::DEFAULT_MAX_HOPS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "msgbridge-rs";

/// Settings filename
pub const CONFIG_FILE: &str = "msgbridge.toml";

/// Default pipeline document filename
pub const PIPELINES_FILE: &str = "pipelines.json";

/// Default capacity of the per-pipeline worker queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of each fan-out subscriber buffer
pub const DEFAULT_FANOUT_CAPACITY: usize = 1024;

/// Get the application config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default settings file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Runtime Settings ====================

/// Sizing of the queues every pipeline allocates.
///
/// A capacity of `0` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Receive thread → process thread
    pub inbound_capacity: usize,

    /// Process thread → send thread
    pub outbound_capacity: usize,

    /// Timer events waiting for the process thread
    pub event_capacity: usize,

    /// Pending control requests per pipeline
    pub control_capacity: usize,

    /// Default buffer size for `queue` connector subscriptions
    pub fanout_capacity: usize,

    /// Stage visits allowed per message before it is dropped
    pub max_hops: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: 256,
            control_capacity: 16,
            fanout_capacity: DEFAULT_FANOUT_CAPACITY,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

// ==================== Logging Settings ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,

    /// Write a daily rolling log file here in addition to stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info,msgbridge_rs=debug".to_string(),
            directory: None,
            json: false,
        }
    }
}

// ==================== Bridge Config ====================

/// Top-level application settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub runtime: RuntimeSettings,

    pub logging: LoggingSettings,

    /// Pipeline document; relative paths resolve against the config directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipelines_file: Option<PathBuf>,

    /// Directory the settings were loaded from
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl BridgeConfig {
    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| BridgeError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Load settings from `path`, or the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path().ok_or_else(|| {
                BridgeError::Config("Could not determine config directory".to_string())
            })?,
        };

        if !path.exists() {
            let mut config = Self::default();
            config.base_dir = path.parent().map(Path::to_path_buf);
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| BridgeError::Config(format!("Failed to read settings: {}", e)))?;
        let mut config =
            Self::from_toml(&content).with_context(|| format!("loading {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Load settings, returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save settings as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Serialization(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| BridgeError::Config(format!("Failed to write settings: {}", e)))
    }

    /// Resolved location of the pipeline document
    pub fn pipelines_path(&self) -> PathBuf {
        let base = self
            .base_dir
            .clone()
            .or_else(config_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        match &self.pipelines_file {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => base.join(p),
            None => base.join(PIPELINES_FILE),
        }
    }
}
