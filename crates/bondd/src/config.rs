//! Configuration file parsing and structures.
//!
//! bondd uses TOML. Every section except `[api]` has defaults, so an empty
//! file is a valid configuration.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;

use crate::manager::ManagerOptions;

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    /// HTTP API for the display layer; disabled when absent
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"bondd::pairing" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter directives in `EnvFilter` syntax, overrides sorted by target
    pub fn directives(&self) -> String {
        let mut overrides: Vec<_> = self.overrides.iter().collect();
        overrides.sort();

        let mut directives = vec![LevelFilter::from(self.level).to_string().to_lowercase()];
        directives.extend(overrides.into_iter().map(|(target, level)| {
            format!(
                "{}={}",
                target,
                LevelFilter::from(*level).to_string().to_lowercase()
            )
        }));
        directives.join(",")
    }
}

fn default_resubscribe_attempts() -> u32 {
    3
}

fn default_resubscribe_backoff_secs() -> u64 {
    1
}

/// Transport backend configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    /// Adapter to use, e.g. "hci0"; the system default when absent
    #[serde(default)]
    pub adapter: Option<String>,

    /// Consecutive resubscriptions after the change stream drops
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,

    #[serde(default = "default_resubscribe_backoff_secs")]
    pub resubscribe_backoff_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            resubscribe_attempts: default_resubscribe_attempts(),
            resubscribe_backoff_secs: default_resubscribe_backoff_secs(),
        }
    }
}

impl From<&TransportConfig> for ManagerOptions {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            resubscribe_attempts: cfg.resubscribe_attempts,
            resubscribe_backoff: Duration::from_secs(cfg.resubscribe_backoff_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationMode {
    /// Ask on the terminal
    #[default]
    Console,
    /// Accept every pairing request
    Accept,
    /// Reject every pairing request
    Reject,
}

/// How pairing requests are confirmed
#[derive(Debug, Default, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default)]
    pub mode: ConfirmationMode,

    /// Unanswered prompts are rejected after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Prompt for one device at a time instead of in parallel
    #[serde(default)]
    pub serialize: bool,
}

/// Native HTTP API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.transport.resubscribe_attempts, 3);
        assert_eq!(config.transport.resubscribe_backoff_secs, 1);
        assert_eq!(config.confirmation.mode, ConfirmationMode::Console);
        assert!(!config.confirmation.serialize);
        assert!(config.api.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"

            [logging.overrides]
            "bondd::registry" = "warn"

            [transport]
            adapter = "hci1"
            resubscribe_attempts = 5
            resubscribe_backoff_secs = 2

            [confirmation]
            mode = "reject"
            timeout_secs = 30
            serialize = true

            [api]
            listen = "127.0.0.1"
            port = 8565
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.transport.adapter.as_deref(), Some("hci1"));
        assert_eq!(config.confirmation.mode, ConfirmationMode::Reject);
        assert_eq!(config.confirmation.timeout_secs, Some(30));
        assert!(config.confirmation.serialize);

        let api = config.api.unwrap();
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 8565);

        let options = ManagerOptions::from(&config.transport);
        assert_eq!(options.resubscribe_attempts, 5);
        assert_eq!(options.resubscribe_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_logging_directives() {
        let mut logging = LoggingConfig {
            level: LogLevel::Warn,
            overrides: HashMap::new(),
        };
        assert_eq!(logging.directives(), "warn");

        logging
            .overrides
            .insert("bondd::pairing".to_string(), LogLevel::Trace);
        logging
            .overrides
            .insert("bondd::dispatcher".to_string(), LogLevel::Debug);
        assert_eq!(
            logging.directives(),
            "warn,bondd::dispatcher=debug,bondd::pairing=trace"
        );
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let toml = r#"
            [confirmation]
            mode = "maybe"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bondd.toml");
        std::fs::write(
            &path,
            r#"
            [confirmation]
            mode = "accept"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.confirmation.mode, ConfirmationMode::Accept);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }
}
