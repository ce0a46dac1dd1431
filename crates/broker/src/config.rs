//! Configuration management for the PtyBroker server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptybroker/config.toml`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::auth::Role;

/// Default listen address for the HTTP/WebSocket server.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7681";

/// Default `PATH` handed to spawned shells.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions_per_user must be between 1 and 1000, got {0}")]
    InvalidMaxSessionsPerUser(usize),

    #[error("max_total_sessions must be 0 (unlimited) or at least max_sessions_per_user, got {0}")]
    InvalidMaxTotalSessions(usize),

    #[error("idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("reap_interval_secs must be greater than 0")]
    InvalidReapInterval,

    #[error("output_queue_capacity must be greater than 0")]
    InvalidOutputQueueCapacity,

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("listen_addr is not a valid socket address: {0}")]
    InvalidListenAddr(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("auth token configured more than once for users {0} and {1}")]
    DuplicateToken(String, String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Server and logging configuration.
    pub broker: BrokerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Identity provider configuration.
    pub auth: AuthConfig,
}

/// Server and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub listen_addr: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn for new sessions.
    pub shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Working directory used when a create request does not name one.
    pub default_cwd: PathBuf,

    /// Maximum number of concurrent sessions per owner.
    pub max_sessions_per_user: usize,

    /// Maximum number of concurrent sessions overall (0 = unlimited).
    pub max_total_sessions: usize,

    /// Seconds without activity after which a session is reclaimed.
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps.
    pub reap_interval_secs: u64,

    /// Output chunks buffered between the PTY reader and the session forwarder.
    pub output_queue_capacity: usize,

    /// Bytes of recent output replayed to a reattaching client (0 = disabled).
    pub replay_buffer_bytes: usize,

    /// Whether process output refreshes the idle clock.
    pub output_counts_as_activity: bool,

    /// Milliseconds between SIGHUP and SIGKILL when destroying a session.
    pub kill_grace_ms: u64,

    /// Environment handed to spawned shells.
    pub environment: EnvironmentConfig,
}

/// The explicit environment of spawned shells. Nothing is inherited from the
/// broker process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// `TERM` value.
    pub term: String,

    /// `PATH` value.
    pub path: String,

    /// `LANG` and `LC_ALL` value.
    pub lang: String,

    /// `USER` value.
    pub user: String,

    /// `HOME` value.
    pub home: PathBuf,

    /// Additional variables.
    pub extra: BTreeMap<String, String>,
}

/// Identity provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer tokens accepted by the static identity provider.
    pub tokens: Vec<TokenConfig>,
}

/// A bearer token and the identity it resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    /// Opaque bearer credential.
    pub token: String,
    /// User the token belongs to.
    pub user_id: String,
    /// Role of the user.
    #[serde(default)]
    pub role: Role,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            default_cwd: default_home(),
            max_sessions_per_user: 5,
            max_total_sessions: 0,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 5 * 60,
            output_queue_capacity: 256,
            replay_buffer_bytes: 64 * 1024,
            output_counts_as_activity: true,
            kill_grace_ms: 2000,
            environment: EnvironmentConfig::default(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            path: DEFAULT_PATH.to_string(),
            lang: "en_US.UTF-8".to_string(),
            user: std::env::var("USER").unwrap_or_else(|_| "ptybroker".to_string()),
            home: default_home(),
            extra: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a duration.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Grace period between SIGHUP and SIGKILL.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptybroker")
        .join("config.toml")
}

/// Returns the default home directory for shells.
fn default_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYBROKER_LISTEN_ADDR: Override the listen address
    /// - PTYBROKER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYBROKER_SHELL: Override the shell
    /// - PTYBROKER_MAX_SESSIONS_PER_USER: Override the per-owner cap
    /// - PTYBROKER_IDLE_TIMEOUT_SECS: Override the idle timeout
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = non_empty_var("PTYBROKER_LISTEN_ADDR") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.broker.listen_addr = addr;
        }

        if let Some(level) = non_empty_var("PTYBROKER_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.broker.log_level = level;
        }

        if let Some(shell) = non_empty_var("PTYBROKER_SHELL") {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(value) = non_empty_var("PTYBROKER_MAX_SESSIONS_PER_USER") {
            match value.parse() {
                Ok(max) => self.session.max_sessions_per_user = max,
                Err(_) => tracing::warn!(
                    "Ignoring non-numeric PTYBROKER_MAX_SESSIONS_PER_USER: {}",
                    value
                ),
            }
        }

        if let Some(value) = non_empty_var("PTYBROKER_IDLE_TIMEOUT_SECS") {
            match value.parse() {
                Ok(secs) => self.session.idle_timeout_secs = secs,
                Err(_) => tracing::warn!(
                    "Ignoring non-numeric PTYBROKER_IDLE_TIMEOUT_SECS: {}",
                    value
                ),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions_per_user < 1 || session.max_sessions_per_user > 1000 {
            return Err(ConfigError::InvalidMaxSessionsPerUser(
                session.max_sessions_per_user,
            ));
        }

        if session.max_total_sessions != 0
            && session.max_total_sessions < session.max_sessions_per_user
        {
            return Err(ConfigError::InvalidMaxTotalSessions(session.max_total_sessions));
        }

        if session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }

        if session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }

        if session.output_queue_capacity == 0 {
            return Err(ConfigError::InvalidOutputQueueCapacity);
        }

        let shell_path = Path::new(&session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.shell.clone()));
            }
        } else if which::which(&session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(session.shell.clone()));
        }

        if self.broker.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(self.broker.listen_addr.clone()));
        }

        let level = self.broker.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.broker.log_level.clone()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for entry in &self.auth.tokens {
            if !seen.insert(entry.token.as_str()) {
                let first = self
                    .auth
                    .tokens
                    .iter()
                    .find(|t| t.token == entry.token)
                    .map(|t| t.user_id.clone())
                    .unwrap_or_default();
                return Err(ConfigError::DuplicateToken(first, entry.user_id.clone()));
            }
        }

        Ok(())
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

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
