//! # Configuration Management
//!
//! Configuration for the ICP engine: whether it runs, where it listens, how
//! fast it may answer, and how it logs.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! Changes are pushed to a running engine with
//! [`IcpCoordinator::apply_config`](crate::service::coordinator::IcpCoordinator::apply_config).

use crate::core::message::{ICP_PORT, MAX_DATAGRAM_SIZE};
use crate::error::{IcpError, Result};
use crate::transport::udp::DEFAULT_WATCHDOG_INTERVAL;
use crate::utils::rate_limit::RateSpec;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default inbound query rate limit
pub const DEFAULT_RATE_LIMIT: &str = "50/1s";

/// Default bind address (all interfaces)
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IcpConfig {
    #[serde(default)]
    pub icp: IcpSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl IcpConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| IcpError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| IcpError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| IcpError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `ICP_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.icp.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IcpError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| IcpError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration. An empty list means it is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.icp.validate();
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IcpError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// ICP engine settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IcpSection {
    /// Whether the ICP responder runs at all
    pub enabled: bool,

    /// UDP port to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Local address to bind
    pub bind_address: String,

    /// Inbound query rate limit, e.g. "50/1s" or "unlimited"
    pub rate_limit: String,

    /// Liveness interval; the socket receive timeout is half of it
    #[serde(with = "duration_serde")]
    pub watchdog_interval: Duration,

    /// Receive buffer size and largest datagram we send
    pub max_datagram_size: usize,
}

impl Default for IcpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: ICP_PORT,
            bind_address: String::from(DEFAULT_BIND_ADDRESS),
            rate_limit: String::from(DEFAULT_RATE_LIMIT),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl IcpSection {
    /// Whether moving from `self` to `other` requires rebinding the socket.
    pub fn needs_restart(&self, other: &IcpSection) -> bool {
        self.enabled != other.enabled
            || self.port != other.port
            || self.bind_address != other.bind_address
            || self.watchdog_interval != other.watchdog_interval
            || self.max_datagram_size != other.max_datagram_size
    }

    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address.parse().map_err(|_| {
            IcpError::ConfigError(format!("Invalid bind address: '{}'", self.bind_address))
        })
    }

    fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| IcpError::ConfigError(format!("Invalid value for {key}: '{value}'")))
        }

        if let Some(v) = var("ICP_ENABLED") {
            self.enabled = parsed("ICP_ENABLED", v)?;
        }
        if let Some(v) = var("ICP_PORT") {
            self.port = parsed("ICP_PORT", v)?;
        }
        if let Some(v) = var("ICP_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = var("ICP_RATE_LIMIT") {
            self.rate_limit = v;
        }
        if let Some(v) = var("ICP_WATCHDOG_INTERVAL_MS") {
            self.watchdog_interval = Duration::from_millis(parsed("ICP_WATCHDOG_INTERVAL_MS", v)?);
        }
        Ok(())
    }

    /// Validate ICP settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "Invalid bind address: '{}' (expected an IP address such as '0.0.0.0')",
                self.bind_address
            ));
        }

        if let Err(e) = self.rate_limit.parse::<RateSpec>() {
            errors.push(format!("{e} (expected format: '50/1s' or 'unlimited')"));
        }

        if self.watchdog_interval.as_millis() < 100 {
            errors.push("Watchdog interval too short (minimum: 100ms)".to_string());
        } else if self.watchdog_interval.as_secs() > 3600 {
            errors.push("Watchdog interval too long (maximum: 1 hour)".to_string());
        }

        if self.max_datagram_size < 64 {
            errors.push("Max datagram size too small (minimum: 64 bytes)".to_string());
        } else if self.max_datagram_size > MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Max datagram size too large: {} bytes (maximum: {MAX_DATAGRAM_SIZE})",
                self.max_datagram_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level used when RUST_LOG is not set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("icp-protocol"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
