//! Configuration management for the XXMP client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/xxmp/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxmp_protocol::{
    Dictionary, DictionaryTables, HandshakeConfig, KeyPair, BUILTIN_VERSION,
    DEFAULT_VERSION_MAJOR, DEFAULT_VERSION_MINOR,
};

use crate::session::SessionConfig;
use crate::transport;

/// Default server address.
pub const DEFAULT_ADDRESS: &str = "gateway.xxmp.net:443";

/// Valid log levels.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("address must be host:port, got {0}")]
    InvalidAddress(String),

    #[error("proxy must be an http:// URL, got {0}")]
    InvalidProxy(String),

    #[error("{field} is not valid base64: {reason}")]
    InvalidBase64 { field: &'static str, reason: String },

    #[error("dictionary version {0} is not built in; set tables_path to load it")]
    UnsupportedDictionary(u8),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// Where to connect.
    pub connection: ConnectionConfig,
    /// Handshake inputs.
    pub handshake: HandshakeSection,
    /// Token dictionary selection.
    pub dictionary: DictionarySection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address as `host:port`.
    pub address: String,
    /// Optional HTTP CONNECT proxy.
    pub proxy: Option<String>,
    /// Base64 routing info sent ahead of the handshake header.
    pub routing_info: Option<String>,
}

/// Handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeSection {
    pub version_major: u8,
    pub version_minor: u8,
    /// File holding the hex-encoded static private key.
    pub static_key_path: PathBuf,
    /// Base64 authentication payload.
    pub payload: Option<String>,
}

/// Dictionary settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DictionarySection {
    /// Dictionary version to select from the built-in tables.
    pub version: u8,
    /// TOML tables file, used instead of the built-in tables when set.
    pub tables_path: Option<PathBuf>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            proxy: None,
            routing_info: None,
        }
    }
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            version_major: DEFAULT_VERSION_MAJOR,
            version_minor: DEFAULT_VERSION_MINOR,
            static_key_path: default_key_path(),
            payload: None,
        }
    }
}

impl Default for DictionarySection {
    fn default() -> Self {
        Self {
            version: BUILTIN_VERSION,
            tables_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the default static key path.
pub fn default_key_path() -> PathBuf {
    config_dir().join("static.key")
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xxmp")
}

impl Config {
    /// Apply environment variable overrides.
    ///
    /// - `XXMP_ADDRESS` overrides `connection.address`
    /// - `XXMP_PROXY` overrides `connection.proxy`
    /// - `XXMP_LOG_LEVEL` overrides `logging.log_level`
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(address) = env_override("XXMP_ADDRESS") {
            tracing::info!("Overriding address from environment: {}", address);
            self.connection.address = address;
        }

        if let Some(proxy) = env_override("XXMP_PROXY") {
            tracing::info!("Overriding proxy from environment");
            self.connection.proxy = Some(proxy);
        }

        if let Some(level) = env_override("XXMP_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.logging.log_level = level;
        }
    }

    /// Validate the configuration without touching the filesystem or network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if transport::validate_address(&self.connection.address).is_err() {
            return Err(ConfigError::InvalidAddress(self.connection.address.clone()));
        }

        if let Some(proxy) = &self.connection.proxy {
            if transport::parse_proxy(proxy).is_err() {
                return Err(ConfigError::InvalidProxy(proxy.clone()));
            }
        }

        decode_base64("connection.routing_info", self.connection.routing_info.as_deref())?;
        decode_base64("handshake.payload", self.handshake.payload.as_deref())?;

        if self.dictionary.tables_path.is_none() && self.dictionary.version != BUILTIN_VERSION {
            return Err(ConfigError::UnsupportedDictionary(self.dictionary.version));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Load the dictionary this configuration selects.
    pub fn load_dictionary(&self) -> Result<Dictionary> {
        let Some(path) = &self.dictionary.tables_path else {
            return Dictionary::select(self.dictionary.version)
                .context("Failed to select dictionary");
        };

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read dictionary tables: {}", path.display()))?;
        let tables: DictionaryTables = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!(
                "Invalid dictionary tables {}: {}",
                path.display(),
                format_toml_error(&e)
            )
        })?;
        if tables.version != self.dictionary.version {
            anyhow::bail!(
                "Dictionary tables {} are version {}, expected {}",
                path.display(),
                tables.version,
                self.dictionary.version
            );
        }
        Dictionary::from_tables(tables)
            .with_context(|| format!("Invalid dictionary tables: {}", path.display()))
    }

    /// Build the runtime session configuration.
    ///
    /// Reads the static key and dictionary tables from disk.
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.validate()?;

        let static_key = load_key(&self.handshake.static_key_path)?;
        let payload =
            decode_base64("handshake.payload", self.handshake.payload.as_deref())?.unwrap_or_default();
        let routing_info =
            decode_base64("connection.routing_info", self.connection.routing_info.as_deref())?;

        let handshake = HandshakeConfig {
            version_major: self.handshake.version_major,
            version_minor: self.handshake.version_minor,
            static_key: Some(static_key),
            routing_info,
            payload,
            ..Default::default()
        };

        Ok(SessionConfig {
            address: self.connection.address.clone(),
            proxy: self.connection.proxy.clone(),
            handshake,
            dictionary: Arc::new(self.load_dictionary()?),
        })
    }
}

/// Read a hex-encoded static private key.
pub fn load_key<P: AsRef<Path>>(path: P) -> Result<KeyPair> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read static key: {}", path.display()))?;
    let bytes = hex::decode(contents.trim())
        .with_context(|| format!("Static key is not valid hex: {}", path.display()))?;
    KeyPair::from_private_slice(&bytes)
        .with_context(|| format!("Invalid static key: {}", path.display()))
}

/// Write a static private key as hex, creating parent directories.
pub fn save_key<P: AsRef<Path>>(key: &KeyPair, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", hex::encode(key.private_bytes())))
        .with_context(|| format!("Failed to write static key: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict key permissions: {}", path.display()))?;
    }

    Ok(())
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn decode_base64(field: &'static str, value: Option<&str>) -> Result<Option<Vec<u8>>, ConfigError> {
    value
        .map(|v| {
            base64::engine::general_purpose::STANDARD
                .decode(v)
                .map_err(|e| ConfigError::InvalidBase64 {
                    field,
                    reason: e.to_string(),
                })
        })
        .transpose()
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
