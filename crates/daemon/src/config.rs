//! Configuration management for the termhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("flush_delay_ms must be between 1 and 1000, got {0}")]
    InvalidFlushDelay(u64),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidDefaultSize { cols: u16, rows: u16 },

    #[error("http host must not be empty")]
    EmptyHost,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8000;

/// Main configuration structure for the termhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub http: HttpConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Output relay configuration.
    pub bridge: BridgeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to listen on.
    pub host: String,

    /// Port to listen on. Zero picks an ephemeral port.
    pub port: u16,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to run in new sessions.
    pub default_shell: String,

    /// Terminal type label exported to the shell as `TERM`.
    pub term_name: String,

    /// Columns used when a create request does not give a usable value.
    pub default_cols: u16,

    /// Rows used when a create request does not give a usable value.
    pub default_rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

/// Output relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Milliseconds between the first buffered output byte and its flush.
    pub flush_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            term_name: "xterm-color".to_string(),
            default_cols: 80,
            default_rows: 24,
            max_sessions: 64,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { flush_delay_ms: 5 }
    }
}

impl HttpConfig {
    /// Returns the `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BridgeConfig {
    /// Returns the flush delay as a duration.
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// Returns the default listen address for the current platform.
fn default_host() -> String {
    if cfg!(windows) {
        "127.0.0.1".to_string()
    } else {
        "0.0.0.0".to_string()
    }
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        which::which("bash")
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - TERMHUB_LOG_LEVEL: Override log level
    /// - TERMHUB_HOST: Override listen address
    /// - PORT: Override listen port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(host) = std::env::var("TERMHUB_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding http host from environment: {}", host);
                self.http.host = host;
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding http port from environment: {}", port);
                    self.http.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring invalid PORT {:?}: {}", port, e),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.bridge.flush_delay_ms < 1 || self.bridge.flush_delay_ms > 1000 {
            return Err(ConfigError::InvalidFlushDelay(self.bridge.flush_delay_ms));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidDefaultSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.http.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("TERMHUB_LOG_LEVEL");
        std::env::remove_var("TERMHUB_HOST");
        std::env::remove_var("PORT");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.http.port, 8000);
        assert_eq!(config.session.term_name, "xterm-color");
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.default_rows, 24);
        assert_eq!(config.session.max_sessions, 64);
        assert_eq!(config.bridge.flush_delay_ms, 5);
        assert_eq!(config.bridge.flush_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_default_host() {
        let config = HttpConfig::default();
        if cfg!(windows) {
            assert_eq!(config.host, "127.0.0.1");
        } else {
            assert_eq!(config.host, "0.0.0.0");
        }
        assert_eq!(config.bind_addr(), format!("{}:8000", config.host));
    }

    #[test]
    fn test_default_shell() {
        let shell = default_shell();
        assert!(!shell.is_empty());
        if cfg!(windows) {
            assert_eq!(shell, "cmd.exe");
        } else {
            assert!(shell.ends_with("bash") || shell == "/bin/sh");
        }
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[bridge]
flush_delay_ms = 20
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.bridge.flush_delay_ms, 20);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[http]
host = "127.0.0.1"
port = 9000

[session]
default_shell = "/bin/sh"
term_name = "xterm-256color"
default_cols = 132
default_rows = 43
max_sessions = 20

[bridge]
flush_delay_ms = 10
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.http.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.session.default_shell, "/bin/sh");
        assert_eq!(config.session.term_name, "xterm-256color");
        assert_eq!(config.session.default_cols, 132);
        assert_eq!(config.session.default_rows, 43);
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.bridge.flush_delay_ms, 10);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
        assert!(err.contains("at position"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "info"
unknown_field = "should be ignored"

[unknown_section]
foo = "bar"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.http.port = 0;
        original.session.max_sessions = 42;
        original.bridge.flush_delay_ms = 50;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[bridge]"));
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.max_sessions = 15;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termhub"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_port_and_host() {
        clear_env();
        std::env::set_var("PORT", "9123");
        std::env::set_var("TERMHUB_HOST", "127.0.0.1");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.http.bind_addr(), "127.0.0.1:9123");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_ignored() {
        clear_env();
        std::env::set_var("TERMHUB_LOG_LEVEL", "");
        std::env::set_var("PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));

        config.session.max_sessions = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(1001)));

        config.session.max_sessions = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_flush_delay() {
        let mut config = Config::default();
        config.bridge.flush_delay_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidFlushDelay(0)));

        config.bridge.flush_delay_ms = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidFlushDelay(1001)));

        config.bridge.flush_delay_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_default_size() {
        let mut config = Config::default();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDefaultSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_empty_host() {
        let mut config = Config::default();
        config.http.host = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    #[cfg(unix)]
    fn test_validate_shell_path() {
        let mut config = Config::default();

        config.session.default_shell = "/bin/sh".to_string();
        assert!(config.validate().is_ok());

        config.session.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.default_shell = "/nonexistent/path/to/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(
                "/nonexistent/path/to/shell".to_string()
            ))
        );

        config.session.default_shell = "nonexistent_shell_xyz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();

        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "warning".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("warning".to_string()))
        );
    }
}
