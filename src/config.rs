//! # Configuration Management
//!
//! Centralized configuration for the Geco dispatch layer.
//!
//! This module provides structured configuration for the endpoint, State
//! Cookie lifetimes, bundling limits and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`GECO_*` variables)
//!
//! ## Security Considerations
//! - Cookie lifetimes are capped so a peer cannot request arbitrarily long-lived cookies
//! - The endpoint must bind a concrete address: packets addressed to the
//!   unspecified address are discarded by the validator

use crate::core::packet::{max_packet_size, COMMON_HEADER_SIZE, DEFAULT_MTU, MIN_PACKET_SIZE};
use crate::error::{ProtocolError, Result};
use crate::protocol::address::AddressTypes;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default receiver window advertised in INIT and INIT-ACK
pub const DEFAULT_RWND: u32 = 8192;

/// Default cookie lifetime
pub const DEFAULT_COOKIE_LIFESPAN: Duration = Duration::from_millis(10_000);

/// Default stream count in each direction
pub const DEFAULT_STREAMS: u16 = 17;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GecoConfig {
    /// Endpoint and association limits
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// State Cookie settings
    #[serde(default)]
    pub cookie: CookieConfig,

    /// Outbound bundling settings
    #[serde(default)]
    pub bundling: BundlingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GecoConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GECO_BIND_ADDRESS") {
            config.endpoint.bind_address = addr;
        }

        if let Ok(streams) = std::env::var("GECO_STREAMS") {
            if let Ok(val) = streams.parse::<u16>() {
                config.endpoint.inbound_streams = val;
                config.endpoint.outbound_streams = val;
            }
        }

        if let Ok(lifespan) = std::env::var("GECO_COOKIE_LIFESPAN_MS") {
            if let Ok(val) = lifespan.parse::<u64>() {
                config.cookie.lifespan = Duration::from_millis(val);
            }
        }

        if let Ok(mtu) = std::env::var("GECO_MTU") {
            if let Ok(val) = mtu.parse::<usize>() {
                config.bundling.mtu = val;
            }
        }

        if let Ok(ootb) = std::env::var("GECO_SEND_ABORT_FOR_OOTB") {
            if let Ok(val) = ootb.parse::<bool>() {
                config.endpoint.send_abort_for_ootb = val;
            }
        }

        Ok(config)
    }

    /// Defaults with `mutator` applied, handy in tests
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Defaults rendered as TOML, suitable as a starting config file
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Collect every problem found across all sections; empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.endpoint.validate());
        errors.extend(self.cookie.validate());
        errors.extend(self.bundling.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Fail with a single `ConfigError` listing every problem.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Endpoint and association limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Address the UDP endpoint binds (e.g., "127.0.0.1:9899")
    pub bind_address: String,

    /// Inbound streams offered to peers
    pub inbound_streams: u16,

    /// Outbound streams requested from peers
    pub outbound_streams: u16,

    /// Receiver window advertised in INIT and INIT-ACK
    pub rwnd: u32,

    /// Accept IPv4 peers
    pub support_ipv4: bool,

    /// Accept IPv6 peers
    pub support_ipv6: bool,

    /// Answer out-of-the-blue packets with ABORT instead of silence
    pub send_abort_for_ootb: bool,

    /// Interval between sweeps of deleted channels
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1:9899"),
            inbound_streams: DEFAULT_STREAMS,
            outbound_streams: DEFAULT_STREAMS,
            rwnd: DEFAULT_RWND,
            support_ipv4: true,
            support_ipv6: true,
            send_abort_for_ootb: true,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl EndpointConfig {
    /// Address families enabled by this configuration
    pub fn address_types(&self) -> AddressTypes {
        let mut types = AddressTypes::NONE;
        if self.support_ipv4 {
            types = types | AddressTypes::IPV4;
        }
        if self.support_ipv6 {
            types = types | AddressTypes::IPV6;
        }
        types
    }

    /// Validate endpoint configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Bind address cannot be empty".to_string());
        } else {
            match self.bind_address.parse::<std::net::SocketAddr>() {
                Ok(addr) if addr.ip().is_unspecified() => errors.push(format!(
                    "Bind address must be a concrete address, not '{}'",
                    self.bind_address
                )),
                Ok(_) => {}
                Err(_) => errors.push(format!(
                    "Invalid bind address format: '{}' (expected format: '127.0.0.1:9899')",
                    self.bind_address
                )),
            }
        }

        if self.inbound_streams == 0 {
            errors.push("Inbound streams must be greater than 0".to_string());
        }
        if self.outbound_streams == 0 {
            errors.push("Outbound streams must be greater than 0".to_string());
        }

        if self.rwnd < 1500 {
            errors.push(format!(
                "Receiver window too small: {} (minimum: 1500)",
                self.rwnd
            ));
        }

        if !self.support_ipv4 && !self.support_ipv6 {
            errors.push("At least one address family must be supported".to_string());
        }

        if self.sweep_interval.as_millis() < 10 {
            errors.push("Sweep interval too short (minimum: 10ms)".to_string());
        } else if self.sweep_interval.as_secs() > 60 {
            errors.push("Sweep interval too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// State Cookie settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CookieConfig {
    /// Lifetime given to every cookie
    #[serde(with = "duration_serde")]
    pub lifespan: Duration,

    /// Upper bound after adding a peer's requested preservative
    #[serde(with = "duration_serde")]
    pub max_lifespan: Duration,

    /// Add the Cookie Preservative a peer requests in its INIT
    pub honor_preservative: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            lifespan: DEFAULT_COOKIE_LIFESPAN,
            max_lifespan: Duration::from_secs(60),
            honor_preservative: true,
        }
    }
}

impl CookieConfig {
    /// Lifetime in ms for a cookie, given the peer's preservative request.
    pub fn lifetime_ms(&self, preservative_ms: Option<u32>) -> u32 {
        let base = self.lifespan.as_millis() as u64;
        let extra = if self.honor_preservative {
            preservative_ms.unwrap_or(0) as u64
        } else {
            0
        };
        let cap = self.max_lifespan.as_millis() as u64;
        (base + extra).min(cap).min(u32::MAX as u64) as u32
    }

    /// Validate cookie configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.lifespan.as_millis() < 100 {
            errors.push("Cookie lifespan too short (minimum: 100ms)".to_string());
        }
        if self.max_lifespan < self.lifespan {
            errors.push("Cookie max_lifespan cannot be shorter than lifespan".to_string());
        }
        if self.max_lifespan.as_secs() > 3600 {
            errors.push("Cookie max_lifespan too long (maximum: 1 hour)".to_string());
        }

        errors
    }
}

/// Outbound bundling settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BundlingConfig {
    /// Path MTU; the packet ceiling is this minus the IP header
    pub mtu: usize,
}

impl Default for BundlingConfig {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}

impl BundlingConfig {
    /// Largest packet, common header included
    pub fn max_packet_size(&self) -> usize {
        max_packet_size(self.mtu)
    }

    /// Room for chunks in one packet
    pub fn chunk_ceiling(&self) -> usize {
        self.max_packet_size().saturating_sub(COMMON_HEADER_SIZE)
    }

    /// Validate bundling configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_packet_size() < MIN_PACKET_SIZE + 128 {
            errors.push(format!(
                "MTU too small: {} (minimum: {})",
                self.mtu, DEFAULT_MTU
            ));
        } else if self.mtu < DEFAULT_MTU {
            errors.push(format!(
                "MTU below the IPv4 minimum: {} (minimum: {DEFAULT_MTU})",
                self.mtu
            ));
        } else if self.mtu > 65_535 {
            errors.push(format!("MTU too large: {} (maximum: 65535)", self.mtu));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("geco-dispatch"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
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
