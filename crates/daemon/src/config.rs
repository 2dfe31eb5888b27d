//! Configuration management for the Filekeep daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/filekeep/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{Permissions, ViewMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("address must be a socket address such as 127.0.0.1:8080, got {0}")]
    InvalidAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("defaults.scope must be an absolute path, got {0}")]
    RelativeScope(PathBuf),

    #[error("max_upload_size must be greater than 0, got {0}")]
    InvalidMaxUploadSize(u64),

    #[error("chunk_size must be between 1 KiB and 16 MiB, got {0}")]
    InvalidChunkSize(usize),

    #[error("auth.header must not be empty when method is proxy")]
    EmptyProxyHeader,

    #[error("auth.host_user must not be empty when method is none")]
    EmptyHostUser,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Filekeep daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener, storage and logging.
    pub server: ServerConfig,

    /// Credential backend and signup policy.
    pub auth: AuthConfig,

    /// Settings applied to users created by signup or the admin API.
    pub defaults: UserDefaults,

    /// Upload and streaming limits.
    pub files: FilesConfig,
}

/// Listener, storage and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub address: String,

    /// Directory for daemon state (user database, signing key).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

/// How `POST /api/login` establishes who the caller is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Username and password checked against the stored hash.
    #[default]
    Password,
    /// A reverse proxy authenticates and passes the username in a header.
    Proxy,
    /// No credentials; every login is the configured host user.
    #[serde(rename = "none")]
    HostTrust,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub method: AuthMethod,

    /// Header carrying the username for the proxy method.
    pub header: String,

    /// Username every login resolves to for the `none` method.
    pub host_user: String,

    /// Allow self-registration through `POST /api/signup`.
    pub signup: bool,

    /// Token signing key file. Defaults to `<data_dir>/signing.key`.
    pub key_file: Option<PathBuf>,
}

/// Defaults for newly created users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserDefaults {
    /// Scope root for new users. Must be absolute.
    pub scope: PathBuf,

    pub locale: String,

    pub view_mode: ViewMode,

    /// Scope signed-up users to `<scope>/<username>` and create that
    /// directory.
    pub create_user_dir: bool,

    pub permissions: Permissions,
}

/// Upload and streaming limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Maximum size of a single upload in bytes (default: 10 GiB).
    pub max_upload_size: u64,

    /// Buffer size for streamed reads in bytes (default: 64 KiB).
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: AuthMethod::Password,
            header: "X-Forwarded-User".to_string(),
            host_user: "admin".to_string(),
            signup: false,
            key_file: None,
        }
    }
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            scope: default_data_dir().join("files"),
            locale: "en".to_string(),
            view_mode: ViewMode::List,
            create_user_dir: false,
            permissions: Permissions {
                admin: false,
                create: true,
                rename: true,
                modify: true,
                delete: true,
                share: true,
                download: true,
                execute: false,
            },
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            chunk_size: 64 * 1024,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filekeep")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("filekeep")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FILEKEEP_ADDRESS: Override the listen address
    /// - FILEKEEP_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - FILEKEEP_SIGNUP: Enable (`true`/`1`) or disable signup
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("FILEKEEP_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding address from environment: {}", address);
                self.server.address = address;
            }
        }

        if let Ok(level) = std::env::var("FILEKEEP_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(signup) = std::env::var("FILEKEEP_SIGNUP") {
            match signup.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.auth.signup = true,
                "false" | "0" | "no" => self.auth.signup = false,
                "" => {}
                other => tracing::warn!("Ignoring unrecognized FILEKEEP_SIGNUP value: {}", other),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidAddress(self.server.address.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if !self.defaults.scope.is_absolute() {
            return Err(ConfigError::RelativeScope(self.defaults.scope.clone()));
        }

        if self.files.max_upload_size == 0 {
            return Err(ConfigError::InvalidMaxUploadSize(self.files.max_upload_size));
        }

        if !(1024..=16 * 1024 * 1024).contains(&self.files.chunk_size) {
            return Err(ConfigError::InvalidChunkSize(self.files.chunk_size));
        }

        match self.auth.method {
            AuthMethod::Proxy if self.auth.header.trim().is_empty() => {
                return Err(ConfigError::EmptyProxyHeader);
            }
            AuthMethod::HostTrust if self.auth.host_user.trim().is_empty() => {
                return Err(ConfigError::EmptyHostUser);
            }
            _ => {}
        }

        Ok(())
    }

    /// The parsed listen address. Call after [`Config::validate`].
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.address))
    }

    /// Path of the token signing key.
    pub fn key_path(&self) -> PathBuf {
        self.auth
            .key_file
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("signing.key"))
    }

    /// Path of the JSON user database.
    pub fn users_path(&self) -> PathBuf {
        self.server.data_dir.join("users.json")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
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
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
