//! Configuration management for gh-pulse
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! Precedence, lowest first: defaults, YAML file, `GH_PULSE_*` variables,
//! command-line flags.

use crate::cli::{Cli, Commands};
use crate::error::{PulseError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::source::BackoffPolicy;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "gh-pulse.yaml";

const MIB: u64 = 1024 * 1024;

/// Main configuration structure for gh-pulse
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Upstream connection behavior
    #[serde(default)]
    pub source: SourceConfig,
    /// Broadcast hub sizing
    #[serde(default)]
    pub hub: HubConfig,
    /// Capture mode limits
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Webhook relay settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Diagnostics output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reconnect and buffering settings for `stream`/`capture`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// First reconnect delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Events buffered between the network task and the session
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_event_channel_capacity() -> usize {
    64
}

impl SourceConfig {
    /// Backoff bounds as durations.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Broadcast hub sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Pending messages per subscriber before it is evicted
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pending broadcasts before new webhooks are dropped
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_queue_capacity() -> usize {
    16
}

fn default_inbox_capacity() -> usize {
    16
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Capture mode limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Buffered bytes that trigger a one-time warning
    #[serde(default = "default_warn_bytes")]
    pub warn_bytes: u64,

    /// Buffered bytes that end the session
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_warn_bytes() -> u64 {
    100 * MIB
}

fn default_max_bytes() -> u64 {
    500 * MIB
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            warn_bytes: default_warn_bytes(),
            max_bytes: default_max_bytes(),
        }
    }
}

/// Webhook relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bodies larger than this have their long arrays truncated
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Length truncated arrays are cut to
    #[serde(default = "default_max_array_elements")]
    pub max_array_elements: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_max_payload_bytes() -> usize {
    512 * 1024
}

fn default_max_array_elements() -> usize {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_payload_bytes: default_max_payload_bytes(),
            max_array_elements: default_max_array_elements(),
        }
    }
}

/// Diagnostics output
///
/// Diagnostics always go to stderr; stdout is reserved for event lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON instead of human-readable lines
    #[serde(default)]
    pub json_format: bool,

    /// Also append diagnostics to this file
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and CLI arguments
    ///
    /// A missing file is not an error: defaults are used, with a warning
    /// unless `path` is the default location.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &str, cli: &Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            if path == DEFAULT_CONFIG_PATH {
                tracing::debug!("No config file at {}, using defaults", path);
            } else {
                tracing::warn!("Config file not found at {}, using defaults", path);
            }
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PulseError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| PulseError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(level) = std::env::var("GH_PULSE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("GH_PULSE_JSON_LOGS") {
            match json.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.logging.json_format = true,
                "0" | "false" | "no" => self.logging.json_format = false,
                _ => tracing::warn!("Invalid GH_PULSE_JSON_LOGS: {}", json),
            }
        }

        if let Ok(file) = std::env::var("GH_PULSE_LOG_FILE") {
            self.logging.file_path = Some(file).filter(|f| !f.is_empty());
        }

        env_parse("GH_PULSE_PORT", &mut self.server.port);
        env_parse("GH_PULSE_QUEUE_CAPACITY", &mut self.hub.queue_capacity);
        env_parse("GH_PULSE_CAPTURE_WARN_BYTES", &mut self.capture.warn_bytes);
        env_parse("GH_PULSE_CAPTURE_MAX_BYTES", &mut self.capture.max_bytes);
        env_parse("GH_PULSE_BACKOFF_INITIAL_MS", &mut self.source.backoff_initial_ms);
        env_parse("GH_PULSE_BACKOFF_MAX_MS", &mut self.source.backoff_max_ms);
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if cli.json_logs {
            self.logging.json_format = true;
        }
        if let Commands::Serve { port: Some(port) } = cli.command {
            self.server.port = port;
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.source.backoff_initial_ms == 0 {
            return Err(PulseError::Config(
                "source.backoff_initial_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.source.backoff_max_ms < self.source.backoff_initial_ms {
            return Err(PulseError::Config(
                "source.backoff_max_ms must be at least source.backoff_initial_ms".to_string(),
            )
            .into());
        }

        if self.source.event_channel_capacity == 0 {
            return Err(PulseError::Config(
                "source.event_channel_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.hub.queue_capacity == 0 || self.hub.inbox_capacity == 0 {
            return Err(PulseError::Config(
                "hub.queue_capacity and hub.inbox_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.capture.max_bytes == 0 {
            return Err(
                PulseError::Config("capture.max_bytes must be greater than 0".to_string()).into(),
            );
        }

        if self.capture.warn_bytes > self.capture.max_bytes {
            return Err(PulseError::Config(
                "capture.warn_bytes must not exceed capture.max_bytes".to_string(),
            )
            .into());
        }

        if self.server.max_array_elements == 0 {
            return Err(PulseError::Config(
                "server.max_array_elements must be greater than 0".to_string(),
            )
            .into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(PulseError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ))
            .into());
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Invalid {}: {}", name, raw),
        }
    }
}
