//! TOML Configuration File Support
//!
//! Centralized configuration loading, supporting a TOML file at
//! `~/.config/chatstream/chatstream.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`CHATSTREAM_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! base_url = "https://api.openai.com/v1/"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! request_timeout_secs = 30
//!
//! [streaming]
//! session_timeout_secs = 300
//! reap_interval_secs = 60
//! channel_capacity = 100
//!
//! [limits]
//! max_message_chars = 10000
//! max_history_messages = 100
//!
//! [daemon]
//! socket_path = "/run/user/1000/chatstream/chatstream.sock"
//! max_connections = 64
//! log_format = "json"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendConfig;
use crate::registry::DEFAULT_SESSION_TIMEOUT;
use crate::security::ChatLimits;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Chat completions base URL
    pub base_url: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// System prompt
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Synchronous request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Age in seconds after which running sessions are reaped
    pub session_timeout_secs: Option<u64>,
    /// Seconds between reaper sweeps
    pub reap_interval_secs: Option<u64>,
    /// Delta channel capacity between runner and orchestrator
    pub channel_capacity: Option<usize>,
}

/// Limits section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsToml {
    /// Maximum message length in characters
    pub max_message_chars: Option<usize>,
    /// Maximum messages kept per conversation
    pub max_history_messages: Option<usize>,
}

/// Daemon section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Unix socket path
    pub socket_path: Option<String>,
    /// Maximum simultaneous client connections
    pub max_connections: Option<usize>,
    /// `text` or `json`
    pub log_format: Option<LogFormat>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatstreamToml {
    /// Model backend
    pub backend: BackendToml,
    /// Streaming sessions
    pub streaming: StreamingToml,
    /// Request limits
    pub limits: LimitsToml,
    /// Daemon process
    pub daemon: DaemonToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ValidationError(format!(
                "unknown log format '{other}' (expected 'text' or 'json')"
            ))),
        }
    }
}

/// Streaming session settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingSettings {
    /// Age after which running sessions are reaped
    pub session_timeout: Duration,
    /// Time between reaper sweeps
    pub reap_interval: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Daemon process settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Maximum simultaneous client connections
    pub max_connections: usize,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: 64,
            log_format: LogFormat::Text,
        }
    }
}

/// Fully resolved configuration
#[derive(Clone, Debug)]
pub struct ChatstreamConfig {
    /// Model backend connection
    pub backend: BackendConfig,
    /// Streaming session settings
    pub streaming: StreamingSettings,
    /// Request limits
    pub limits: ChatLimits,
    /// Daemon settings
    pub daemon: DaemonSettings,
    /// Path of the file that was loaded, if any
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for ChatstreamConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            streaming: StreamingSettings::default(),
            limits: ChatLimits::default(),
            daemon: DaemonSettings::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ChatstreamConfig {
    /// Where the highest-priority values came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check values that would make the service misbehave
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("backend.base_url is empty".to_string()));
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("backend.model is empty".to_string()));
        }
        if self.backend.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.streaming.reap_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "streaming.reap_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.limits.max_message_chars == 0 {
            return Err(ConfigError::ValidationError(
                "limits.max_message_chars must be at least 1".to_string(),
            ));
        }
        if self.daemon.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "daemon.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chatstream/chatstream.toml` or
/// `~/.config/chatstream/chatstream.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chatstream").join("chatstream.toml"))
}

/// Get the default socket path
///
/// Uses `$XDG_RUNTIME_DIR/chatstream/chatstream.sock`, falling back to the
/// system temp directory.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chatstream")
        .join("chatstream.sock")
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ChatstreamConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then apply the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ChatstreamConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a specific path with a custom environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ChatstreamConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ChatstreamConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ChatstreamToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ChatstreamConfig, toml: &ChatstreamToml) {
    // Backend settings
    if let Some(ref url) = toml.backend.base_url {
        config.backend.base_url.clone_from(url);
    }
    if let Some(ref model) = toml.backend.model {
        config.backend.model.clone_from(model);
    }
    if let Some(ref env) = toml.backend.api_key_env {
        config.backend.api_key_env.clone_from(env);
    }
    if toml.backend.system_prompt.is_some() {
        config.backend.system_prompt.clone_from(&toml.backend.system_prompt);
    }
    if toml.backend.temperature.is_some() {
        config.backend.temperature = toml.backend.temperature;
    }
    if let Some(max_tokens) = toml.backend.max_tokens {
        config.backend.max_tokens = max_tokens;
    }
    if let Some(timeout) = toml.backend.request_timeout_secs {
        config.backend.request_timeout_secs = timeout;
    }

    // Streaming settings
    if let Some(timeout) = toml.streaming.session_timeout_secs {
        config.streaming.session_timeout = Duration::from_secs(timeout);
    }
    if let Some(interval) = toml.streaming.reap_interval_secs {
        config.streaming.reap_interval = Duration::from_secs(interval);
    }
    if let Some(capacity) = toml.streaming.channel_capacity {
        config.backend.channel_capacity = capacity;
    }

    // Limits
    if let Some(max) = toml.limits.max_message_chars {
        config.limits.max_message_chars = max;
    }
    if let Some(max) = toml.limits.max_history_messages {
        config.limits.max_history_messages = max;
    }

    // Daemon settings
    if let Some(ref path) = toml.daemon.socket_path {
        config.daemon.socket_path = PathBuf::from(path);
    }
    if let Some(max) = toml.daemon.max_connections {
        config.daemon.max_connections = max;
    }
    if let Some(format) = toml.daemon.log_format {
        config.daemon.log_format = format;
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let value = env(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ChatstreamConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(url) = env("CHATSTREAM_BASE_URL") {
        config.backend.base_url = url;
        touched = true;
    }
    if let Some(model) = env("CHATSTREAM_MODEL") {
        config.backend.model = model;
        touched = true;
    }
    if let Some(timeout) = parse_env(&env, "CHATSTREAM_REQUEST_TIMEOUT") {
        config.backend.request_timeout_secs = timeout;
        touched = true;
    }
    if let Some(secs) = parse_env(&env, "CHATSTREAM_SESSION_TIMEOUT") {
        config.streaming.session_timeout = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(secs) = parse_env(&env, "CHATSTREAM_REAP_INTERVAL") {
        config.streaming.reap_interval = Duration::from_secs(secs);
        touched = true;
    }
    if let Some(max) = parse_env(&env, "CHATSTREAM_MAX_MESSAGE_CHARS") {
        config.limits.max_message_chars = max;
        touched = true;
    }
    if let Some(max) = parse_env(&env, "CHATSTREAM_MAX_HISTORY_MESSAGES") {
        config.limits.max_history_messages = max;
        touched = true;
    }
    if let Some(path) = env("CHATSTREAM_SOCKET") {
        config.daemon.socket_path = PathBuf::from(path);
        touched = true;
    }
    if let Some(format) = env("CHATSTREAM_LOG_FORMAT") {
        config.daemon.log_format = format.parse()?;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    socket_path: Option<PathBuf>,
    model: Option<String>,
    base_url: Option<String>,
    log_format: Option<LogFormat>,
    session_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the socket path
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Override the model
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Override the backend base URL
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Override the log format
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Override the session timeout
    #[must_use]
    pub fn with_session_timeout_secs(mut self, secs: u64) -> Self {
        self.session_timeout_secs = Some(secs);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.socket_path.is_none()
            && self.model.is_none()
            && self.base_url.is_none()
            && self.log_format.is_none()
            && self.session_timeout_secs.is_none()
    }

    /// Apply the overrides to a loaded configuration
    pub fn apply(&self, config: &mut ChatstreamConfig) {
        if self.is_empty() {
            return;
        }
        if let Some(ref path) = self.socket_path {
            config.daemon.socket_path.clone_from(path);
        }
        if let Some(ref model) = self.model {
            config.backend.model.clone_from(model);
        }
        if let Some(ref url) = self.base_url {
            config.backend.base_url.clone_from(url);
        }
        if let Some(format) = self.log_format {
            config.daemon.log_format = format;
        }
        if let Some(secs) = self.session_timeout_secs {
            config.streaming.session_timeout = Duration::from_secs(secs);
        }
        config.source = ConfigSource::Cli;
    }
}

// =============================================================================
// Tests
// =============================================================================
