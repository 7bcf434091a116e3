//! Archiver configuration
//!
//! A single JSON file. Every field has a default, so an empty object (or no file
//! at all) is a valid configuration.
//!
//! ```json
//! {
//!   "serial": { "port": "/dev/ttyUSB0", "baud_rate": 19200 },
//!   "archive": { "path": "/home/me/sleep/archive.jsonl", "backup_exports": true },
//!   "capture_dir": "/home/me/sleep/captures"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::archive::JOURNAL_FILE_NAME;
use crate::protocol::ProtocolDescription;
use crate::transport::{TransportConfig, DEFAULT_BAUD_RATE, PROBE_BYTE};

/// Directory name used under the platform config and data directories
const APP_DIR: &str = "SleepArchiver";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not determine a {0} directory for this platform")]
    NoConfigDir(&'static str),
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to use; every discovered port is probed when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Poll timeout of a single port read in milliseconds
    pub poll_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub read_retries: u32,
    pub probe_request: Vec<u8>,
    pub probe_response: Vec<u8>,
    pub probe_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            poll_timeout_ms: 100,
            read_timeout_ms: transport.read_timeout_ms,
            read_retries: transport.read_retries,
            probe_request: vec![PROBE_BYTE],
            probe_response: vec![PROBE_BYTE],
            probe_timeout_ms: transport.probe_timeout_ms,
        }
    }
}

impl SerialConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            probe_request: self.probe_request.clone(),
            probe_response: self.probe_response.clone(),
            probe_timeout_ms: self.probe_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            read_retries: self.read_retries,
        }
    }
}

/// Archive storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Journal file; defaults to the platform data directory
    pub path: Option<PathBuf>,
    /// Keep a `.bak` of export files that get replaced
    pub backup_exports: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: None,
            backup_exports: true,
        }
    }
}

impl ArchiveConfig {
    /// The configured journal path, or the platform default
    pub fn resolve_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => default_archive_path(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub serial: SerialConfig,
    pub protocol: ProtocolDescription,
    pub archive: ArchiveConfig,
    /// Where raw session blocks are saved during import; disabled when unset
    pub capture_dir: Option<PathBuf>,
}

impl ArchiverConfig {
    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` (or the default config file when `None`); a missing file
    /// yields the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(io_err)
    }
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or(ConfigError::NoConfigDir("config"))?;
    Ok(base.join(APP_DIR).join(CONFIG_FILE_NAME))
}

/// Default archive journal location
pub fn default_archive_path() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .ok_or(ConfigError::NoConfigDir("data"))?;
    Ok(base.join(APP_DIR).join(JOURNAL_FILE_NAME))
}
