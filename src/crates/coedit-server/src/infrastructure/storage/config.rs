//! TOML-based configuration for the server.
//!
//! The default location is the platform config directory:
//! - Windows:  `%APPDATA%\coedit\server.toml`
//! - Linux:    `~/.config/coedit/server.toml`
//! - macOS:    `~/Library/Application Support/coedit/server.toml`
//!
//! ```toml
//! [server]
//! name = "Design notes"
//! file_path = "notes.md"
//! password = "secret123"
//! max_clients = 8
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 55555
//! discovery_port = 55556
//! announce_interval_ms = 1000
//!
//! [logging]
//! log_level = "info"
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]` and every section
//! `#[serde(default)]`, so an empty file, or one written by an older version,
//! still yields a complete configuration.  Values are range-checked by
//! [`ServerConfig::validate`] when the server starts, not while parsing.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

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

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: SessionSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// The shared document session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    /// Name shown in clients' server lists.
    #[serde(default = "default_name")]
    pub name: String,
    /// Path of the shared document sent to approved clients.
    #[serde(default = "default_file_path")]
    pub file_path: String,
    /// Password clients must present.  Omit for an open session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_max_clients")]
    pub max_clients: u16,
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkSettings {
    /// IP address to bind the TCP listener to.  `"0.0.0.0"` binds all
    /// interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// UDP port announces are broadcast to.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
}

/// `tracing` settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `"error"`, `"warn"`, `"info"`, `"debug"` or `"trace"`.  `RUST_LOG`
    /// takes precedence when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "coedit session".to_string()
}
fn default_file_path() -> String {
    "untitled.txt".to_string()
}
fn default_max_clients() -> u16 {
    8
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    55555
}
fn default_discovery_port() -> u16 {
    55556
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            file_path: default_file_path(),
            password: None,
            max_clients: default_max_clients(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            announce_interval_ms: default_announce_interval_ms(),
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

impl ServerConfig {
    /// Checks the values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.file_path.trim().is_empty() {
            return Err(invalid("server.file_path", "must not be blank"));
        }
        if self.server.max_clients == 0 {
            return Err(invalid("server.max_clients", "must be at least 1"));
        }
        if self.network.port < 1024 {
            return Err(invalid(
                "network.port",
                format!("{} is a privileged port", self.network.port),
            ));
        }
        if self.network.announce_interval_ms == 0 {
            return Err(invalid("network.announce_interval_ms", "must be positive"));
        }
        self.bind_addr()?;
        Ok(())
    }

    /// The TCP listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `bind_address` is not an IP.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .network
            .bind_address
            .parse()
            .map_err(|e| invalid("network.bind_address", format!("{e}")))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.network.announce_interval_ms)
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
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("server.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning `ServerConfig::default()` if the file
/// does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
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

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("coedit_server_test_{}", Uuid::new_v4()))
            .join("server.toml")
    }

    #[test]
    fn test_default_config_has_expected_ports() {
        // Arrange / Act
        let cfg = ServerConfig::default();

        // Assert
        assert_eq!(cfg.network.port, 55555);
        assert_eq!(cfg.network.discovery_port, 55556);
        assert_eq!(cfg.network.announce_interval_ms, 1000);
        assert_eq!(cfg.logging.log_level, "info");
        assert!(cfg.server.password.is_none());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: ServerConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_given_fields() {
        // Arrange
        let toml_str = r#"
[server]
password = "secret123"
[network]
port = 6000
"#;

        // Act
        let cfg: ServerConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.server.password.as_deref(), Some("secret123"));
        assert_eq!(cfg.network.port, 6000);
        assert_eq!(cfg.network.discovery_port, 55556);
        assert_eq!(cfg.server.max_clients, 8);
    }

    #[test]
    fn test_password_none_is_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        assert!(!toml_str.contains("password"));
    }

    #[test]
    fn test_validate_rejects_privileged_port() {
        let mut cfg = ServerConfig::default();
        cfg.network.port = 80;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "network.port", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_bind_address() {
        let mut cfg = ServerConfig::default();
        cfg.network.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "network.bind_address", .. })
        ));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let cfg = load_config(&temp_path()).unwrap();
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        // Arrange
        let path = temp_path();
        let mut cfg = ServerConfig::default();
        cfg.server.name = "Doc A".to_string();
        cfg.server.password = Some("pw".to_string());
        cfg.logging.log_level = "debug".to_string();

        // Act
        save_config(&path, &cfg).unwrap();
        let loaded = load_config(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_load_config_reports_parse_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
