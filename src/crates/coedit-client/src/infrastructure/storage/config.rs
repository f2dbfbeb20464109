//! TOML-based configuration for the client.
//!
//! The default location is the platform config directory:
//! - Windows:  `%APPDATA%\coedit\client.toml`
//! - Linux:    `~/.config/coedit/client.toml`
//! - macOS:    `~/Library/Application Support/coedit/client.toml`
//!
//! ```toml
//! [client]
//! name = "alice"
//! server = "192.168.1.20:55555"   # omit to browse the LAN instead
//! password = "secret123"
//! poll_interval_ms = 250
//!
//! [network]
//! discovery_port = 55556
//! staleness_ms = 5000
//!
//! [logging]
//! log_level = "info"
//! ```
//!
//! Every field has a serde default, so an empty or missing file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use coedit_core::protocol::messages::{MAX_METADATA_SIZE, MAX_PASSWORD_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Announce interval the staleness window must exceed.
const MIN_STALENESS_MS: u64 = 1000;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    /// Display name, sent to peers as this client's initial metadata.
    #[serde(default = "default_name")]
    pub name: String,
    /// `host:port` of the server to join.  Without it the client lists
    /// servers found on the LAN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Time between two polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSettings {
    /// UDP port servers announce on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Silence after which a discovered server is dropped.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `tracing` level; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "coedit client".to_string()
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_discovery_port() -> u16 {
    55556
}
fn default_staleness_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            server: None,
            password: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            staleness_ms: default_staleness_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Checks the values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.name.len() >= MAX_METADATA_SIZE {
            return Err(invalid(
                "client.name",
                format!("must be shorter than {MAX_METADATA_SIZE} bytes"),
            ));
        }
        if let Some(password) = &self.client.password {
            if password.len() > MAX_PASSWORD_SIZE {
                return Err(invalid(
                    "client.password",
                    format!("must be at most {MAX_PASSWORD_SIZE} bytes"),
                ));
            }
        }
        if self.client.poll_interval_ms == 0 {
            return Err(invalid("client.poll_interval_ms", "must be positive"));
        }
        if self.network.staleness_ms <= MIN_STALENESS_MS {
            return Err(invalid(
                "network.staleness_ms",
                format!("must exceed the {MIN_STALENESS_MS} ms announce interval"),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.client.poll_interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.network.staleness_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("client.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning `ClientConfig::default()` if the file
/// does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
pub fn save_config(path: &Path, config: &ClientConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("coedit"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("coedit"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("coedit")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}
