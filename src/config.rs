//! # Configuration Module
//!
//! Handles loading and validating gateway configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::operation::OperationRegistry;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub link: LinkConfig,
    pub buffer: BufferConfig,
    pub health: HealthConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,

    /// Operation name → registered implementation kind
    #[serde(default = "default_operations")]
    pub operations: BTreeMap<String, String>,
}

/// Dashboard server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,

    #[serde(default = "default_server_token")]
    pub token: String,
}

/// Flight link (protocol decoder sidecar) configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_link_bind")]
    pub bind: String,

    #[serde(default = "default_link_peer")]
    pub peer: String,

    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    #[serde(default = "default_max_recv_errors")]
    pub max_recv_errors: u32,

    #[serde(default = "default_mission_timeout_ms")]
    pub mission_timeout_ms: u64,
}

/// Outbound telemetry buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_size")]
    pub size: usize,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

/// Transport health monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_max_disconnect_ms")]
    pub max_disconnect_ms: u64,
}

/// Relay loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_loop_sleep_ms")]
    pub loop_sleep_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path; empty disables file logging
    #[serde(default)]
    pub file: String,
}

// Default value functions
fn default_server_url() -> String { "ws://localhost:3000".to_string() }
fn default_server_token() -> String { "bridge".to_string() }

fn default_link_bind() -> String { "0.0.0.0:14551".to_string() }
fn default_link_peer() -> String { "127.0.0.1:14550".to_string() }
fn default_ready_timeout_ms() -> u64 { 5000 }
fn default_max_recv_errors() -> u32 { 10 }
fn default_mission_timeout_ms() -> u64 { 3000 }

fn default_buffer_size() -> usize { 50 }
fn default_flush_timeout_ms() -> u64 { 1000 }

fn default_check_interval_ms() -> u64 { 5000 }
fn default_max_disconnect_ms() -> u64 { 30000 }

fn default_loop_sleep_ms() -> u64 { 10 }
fn default_stop_timeout_ms() -> u64 { 2000 }

fn default_log_level() -> String { "info".to_string() }

fn default_operations() -> BTreeMap<String, String> {
    OperationRegistry::builtin()
        .kinds()
        .map(|kind| (kind.to_string(), kind.to_string()))
        .collect()
}

impl LinkConfig {
    /// Maximum age of the last inbound record for the link to count as ready
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// How long a mission download waits for the decoder's reply
    pub fn mission_timeout(&self) -> Duration {
        Duration::from_millis(self.mission_timeout_ms)
    }
}

impl BufferConfig {
    /// Inactivity period after which a non-empty buffer is flushed
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn max_disconnect(&self) -> Duration {
        Duration::from_millis(self.max_disconnect_ms)
    }
}

impl RelayConfig {
    pub fn loop_sleep(&self) -> Duration {
        Duration::from_millis(self.loop_sleep_ms)
    }

    /// Bounded join applied when stopping an operation
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails (including unknown operation kinds)
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_gateway::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Dashboard URL including the bridge token query parameter
    pub fn server_url(&self) -> String {
        if self.server.token.is_empty() {
            self.server.url.clone()
        } else {
            format!("{}?user={}", self.server.url, self.server.token)
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            return Err(invalid("server url cannot be empty"));
        }

        if !self.server.url.starts_with("ws://") && !self.server.url.starts_with("wss://") {
            return Err(invalid("server url must use ws:// or wss://"));
        }

        if self.link.bind.is_empty() || self.link.peer.is_empty() {
            return Err(invalid("link bind and peer addresses cannot be empty"));
        }

        if self.link.ready_timeout_ms == 0 || self.link.ready_timeout_ms > 60000 {
            return Err(invalid("ready_timeout_ms must be between 1 and 60000"));
        }

        if self.link.max_recv_errors == 0 {
            return Err(invalid("max_recv_errors must be greater than 0"));
        }

        if self.link.mission_timeout_ms == 0 || self.link.mission_timeout_ms > 60000 {
            return Err(invalid("mission_timeout_ms must be between 1 and 60000"));
        }

        if self.buffer.size == 0 || self.buffer.size > 10000 {
            return Err(invalid("buffer size must be between 1 and 10000"));
        }

        if self.buffer.flush_timeout_ms == 0 || self.buffer.flush_timeout_ms > 60000 {
            return Err(invalid("flush_timeout_ms must be between 1 and 60000"));
        }

        if self.health.check_interval_ms == 0 || self.health.check_interval_ms > 60000 {
            return Err(invalid("check_interval_ms must be between 1 and 60000"));
        }

        if self.health.max_disconnect_ms < self.health.check_interval_ms {
            return Err(invalid("max_disconnect_ms must be at least check_interval_ms"));
        }

        if self.relay.loop_sleep_ms == 0 || self.relay.loop_sleep_ms > 1000 {
            return Err(invalid("loop_sleep_ms must be between 1 and 1000"));
        }

        if self.relay.stop_timeout_ms == 0 || self.relay.stop_timeout_ms > 60000 {
            return Err(invalid("stop_timeout_ms must be between 1 and 60000"));
        }

        if !["trace", "debug", "info", "warn", "error"]
            .contains(&self.logging.level.to_ascii_lowercase().as_str())
        {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        // Unknown kinds are fatal here; unknown names at request time are not.
        let registry = OperationRegistry::builtin();
        for (name, kind) in &self.operations {
            if !registry.contains(kind) {
                return Err(invalid(format!(
                    "operation '{}' refers to unknown implementation '{}'",
                    name, kind
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl std::fmt::Display) -> GatewayError {
    GatewayError::Config(toml::de::Error::custom(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config {
            server: ServerConfig {
                url: default_server_url(),
                token: default_server_token(),
            },
            link: LinkConfig {
                bind: default_link_bind(),
                peer: default_link_peer(),
                ready_timeout_ms: default_ready_timeout_ms(),
                max_recv_errors: default_max_recv_errors(),
                mission_timeout_ms: default_mission_timeout_ms(),
            },
            buffer: BufferConfig {
                size: default_buffer_size(),
                flush_timeout_ms: default_flush_timeout_ms(),
            },
            health: HealthConfig {
                check_interval_ms: default_check_interval_ms(),
                max_disconnect_ms: default_max_disconnect_ms(),
            },
            relay: RelayConfig {
                loop_sleep_ms: default_loop_sleep_ms(),
                stop_timeout_ms: default_stop_timeout_ms(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                file: String::new(),
            },
            operations: default_operations(),
        }
    }

    #[test]
    fn test_default_config() {
        assert!(create_valid_config().validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[server]
url = "ws://10.0.0.2:3000"

[link]

[buffer]
size = 25

[health]

[relay]

[logging]

[operations]
tracker = "color_tracker"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.buffer.size, 25);
        assert_eq!(config.buffer.flush_timeout(), Duration::from_secs(1));
        assert_eq!(config.operations.len(), 1);
        assert_eq!(config.operations["tracker"], "color_tracker");
    }

    #[test]
    fn test_missing_operations_table_uses_builtins() {
        let toml_content = r#"
[server]
[link]
[buffer]
[health]
[relay]
[logging]
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.operations.contains_key("color_tracker"));
        assert!(config.operations.contains_key("serial_listener"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_operation_kind_is_fatal() {
        let mut config = create_valid_config();
        config.operations.insert("thermal".to_string(), "thermal_camera".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("thermal_camera"));
    }

    #[test]
    fn test_server_url_with_token() {
        let config = create_valid_config();
        assert_eq!(config.server_url(), "ws://localhost:3000?user=bridge");
    }

    #[test]
    fn test_server_url_without_token() {
        let mut config = create_valid_config();
        config.server.token = String::new();
        assert_eq!(config.server_url(), "ws://localhost:3000");
    }

    #[test]
    fn test_empty_server_url() {
        let mut config = create_valid_config();
        config.server.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_server_url_rejected() {
        let mut config = create_valid_config();
        config.server.url = "http://localhost:3000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_size_zero() {
        let mut config = create_valid_config();
        config.buffer.size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flush_timeout_zero() {
        let mut config = create_valid_config();
        config.buffer.flush_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_interval_too_high() {
        let mut config = create_valid_config();
        config.health.check_interval_ms = 60001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_disconnect_below_check_interval() {
        let mut config = create_valid_config();
        config.health.max_disconnect_ms = 1000;
        config.health.check_interval_ms = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loop_sleep_zero() {
        let mut config = create_valid_config();
        config.relay.loop_sleep_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = create_valid_config();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = create_valid_config();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_recv_errors_zero() {
        let mut config = create_valid_config();
        config.link.max_recv_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mission_timeout_bounds() {
        let mut config = create_valid_config();
        config.link.mission_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.link.mission_timeout_ms = 60001;
        assert!(config.validate().is_err());
        config.link.mission_timeout_ms = 500;
        assert!(config.validate().is_ok());
        assert_eq!(config.link.mission_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_buffer_size(), 50);
        assert_eq!(default_flush_timeout_ms(), 1000);
        assert_eq!(default_check_interval_ms(), 5000);
        assert_eq!(default_max_disconnect_ms(), 30000);
        assert_eq!(default_loop_sleep_ms(), 10);
        assert_eq!(default_stop_timeout_ms(), 2000);
        assert_eq!(default_log_level(), "info");
    }
}
