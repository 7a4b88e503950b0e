//! Configuration loading, validation, and management for Colloquy.
//!
//! Loads configuration from `~/.colloquy/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.colloquy/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider name reported in usage records
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per reply
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Chat lifecycle settings
    #[serde(default)]
    pub chat: ChatConfig,

    /// Scroll-follow timing and geometry
    #[serde(default)]
    pub scroll: ScrollConfig,

    /// Message list loading
    #[serde(default)]
    pub messages: MessagesConfig,

    /// Analytics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("chat", &self.chat)
            .field("scroll", &self.scroll)
            .field("messages", &self.messages)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Characters of the prompt kept as the chat summary
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// SQLite database file; relative paths resolve against the config dir
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_summary_max_chars() -> usize {
    50
}
fn default_database_path() -> String {
    "colloquy.db".into()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: default_summary_max_chars(),
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollConfig {
    /// Distance from the end of content still treated as "at bottom"
    #[serde(default = "default_bottom_threshold")]
    pub bottom_threshold: f64,

    /// Coalescing of raw scroll events
    #[serde(default = "default_scroll_wait_ms")]
    pub scroll_wait_ms: u64,
    #[serde(default = "default_scroll_max_wait_ms")]
    pub scroll_max_wait_ms: u64,

    /// Coalescing of auto-scroll-to-bottom requests
    #[serde(default = "default_follow_wait_ms")]
    pub follow_wait_ms: u64,
    #[serde(default = "default_follow_max_wait_ms")]
    pub follow_max_wait_ms: u64,
}

fn default_bottom_threshold() -> f64 {
    50.0
}
fn default_scroll_wait_ms() -> u64 {
    300
}
fn default_scroll_max_wait_ms() -> u64 {
    500
}
fn default_follow_wait_ms() -> u64 {
    100
}
fn default_follow_max_wait_ms() -> u64 {
    300
}

impl ScrollConfig {
    pub fn scroll_wait(&self) -> Duration {
        Duration::from_millis(self.scroll_wait_ms)
    }
    pub fn scroll_max_wait(&self) -> Duration {
        Duration::from_millis(self.scroll_max_wait_ms)
    }
    pub fn follow_wait(&self) -> Duration {
        Duration::from_millis(self.follow_wait_ms)
    }
    pub fn follow_max_wait(&self) -> Duration {
        Duration::from_millis(self.follow_max_wait_ms)
    }
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            bottom_threshold: default_bottom_threshold(),
            scroll_wait_ms: default_scroll_wait_ms(),
            scroll_max_wait_ms: default_scroll_max_wait_ms(),
            follow_wait_ms: default_follow_wait_ms(),
            follow_max_wait_ms: default_follow_max_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesConfig {
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: u64,
}

fn default_fetch_wait_ms() -> u64 {
    400
}
fn default_fetch_max_wait_ms() -> u64 {
    2000
}

impl MessagesConfig {
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_wait_ms)
    }
    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            fetch_wait_ms: default_fetch_wait_ms(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether analytics events are emitted at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.colloquy/config.toml).
    ///
    /// Also checks environment variables:
    /// - `COLLOQUY_API_KEY`, then `OPENAI_API_KEY`
    /// - `COLLOQUY_PROVIDER`
    /// - `COLLOQUY_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("COLLOQUY_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }
        if let Ok(provider) = std::env::var("COLLOQUY_PROVIDER") {
            self.default_provider = provider;
        }
        if let Ok(model) = std::env::var("COLLOQUY_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".colloquy")
    }

    /// Absolute path of the chat database.
    pub fn database_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.chat.database_path);
        if path.is_absolute() {
            path
        } else {
            Self::config_dir().join(path)
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.chat.summary_max_chars == 0 {
            return Err(ConfigError::ValidationError(
                "chat.summary_max_chars must be > 0".into(),
            ));
        }

        if self.scroll.scroll_max_wait_ms < self.scroll.scroll_wait_ms
            || self.scroll.follow_max_wait_ms < self.scroll.follow_wait_ms
            || self.messages.fetch_max_wait_ms < self.messages.fetch_wait_ms
        {
            return Err(ConfigError::ValidationError(
                "max wait must not be shorter than its wait".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            api_url: default_api_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            chat: ChatConfig::default(),
            scroll: ScrollConfig::default(),
            messages: MessagesConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
