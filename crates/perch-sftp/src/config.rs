//! Configuration for the SFTP server
//!
//! Loaded once at startup from a TOML file. Nothing in here is reloaded while
//! the server runs.

use crate::permissions::PermissionMode;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and storage settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Static user list
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Listener and storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base directory; each user is confined to `root_path/<username>`
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,

    /// Host key location, generated on first start when missing
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,

    /// How per-user permission rules are resolved
    #[serde(default)]
    pub permission_mode: PermissionMode,

    /// Idle connections are dropped after this many seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Authentication attempts allowed on a single connection
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,

    /// Delay before answering a rejected authentication
    #[serde(default = "default_auth_rejection_delay")]
    pub auth_rejection_delay_secs: u64,

    /// Create `root_path/<username>` when a session starts
    #[serde(default = "default_true")]
    pub create_user_roots: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            root_path: default_root_path(),
            host_key_path: default_host_key_path(),
            permission_mode: PermissionMode::default(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
            auth_rejection_delay_secs: default_auth_rejection_delay(),
            create_user_roots: true,
        }
    }
}

/// Per-IP lockout after repeated authentication failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Failed attempts tolerated inside one window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Lockout length in seconds once the limit is hit
    pub lockout_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 300,
            lockout_secs: 900,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error or an `EnvFilter` directive)
    pub level: String,
    /// Log format
    pub format: LogFormat,
    /// Optional log file (stderr when absent)
    pub file: Option<PathBuf>,
    /// Emit structured audit events
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text for humans
    #[default]
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

/// A configured user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Login name, also the name of the user's directory under `root_path`
    pub username: String,
    /// Argon2 PHC hash (`$argon2id$...`) or plaintext password
    pub password: String,
    /// Ordered permission rules
    #[serde(default)]
    pub permissions: Vec<PermissionConfig>,
}

/// A single permission rule as written in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Directory this rule applies to, relative to the user root
    #[serde(default = "default_rule_path")]
    pub path: String,
    /// Open files for reading
    #[serde(default)]
    pub read: bool,
    /// Open files for writing
    #[serde(default)]
    pub write: bool,
    /// Remove, rename, mkdir, stat, lstat, readlink
    #[serde(default)]
    pub cmd: bool,
    /// List directories
    #[serde(default)]
    pub list: bool,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] on malformed TOML.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.root_path.as_os_str().is_empty() {
            return Err(crate::Error::Config("server.root_path must be set".into()));
        }

        if self.server.root_path.exists() && !self.server.root_path.is_dir() {
            return Err(crate::Error::Config(format!(
                "Root path is not a directory: {}",
                self.server.root_path.display()
            )));
        }

        if self.server.max_auth_attempts == 0 {
            return Err(crate::Error::Config(
                "server.max_auth_attempts must be at least 1".into(),
            ));
        }

        for (name, secs) in [
            ("rate_limit.window_secs", self.rate_limit.window_secs),
            ("rate_limit.lockout_secs", self.rate_limit.lockout_secs),
        ] {
            if secs > crate::rate_limit::MAX_PERIOD_SECS {
                return Err(crate::Error::Config(format!(
                    "{name} must not exceed {} seconds",
                    crate::rate_limit::MAX_PERIOD_SECS
                )));
            }
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate username: {}",
                    user.username
                )));
            }
        }

        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    2222
}

fn default_root_path() -> PathBuf {
    PathBuf::from("/srv/sftp")
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("id_rsa")
}

const fn default_inactivity_timeout() -> u64 {
    300
}

const fn default_max_auth_attempts() -> usize {
    3
}

const fn default_auth_rejection_delay() -> u64 {
    1
}

const fn default_true() -> bool {
    true
}

fn default_rule_path() -> String {
    "/".to_string()
}
