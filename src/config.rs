//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the VICP client.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `VICP_`, sections split on `__`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use vicp_scope::config::VicpConfig;
//!
//! let config = VicpConfig::load_from("config/vicp.toml")?;
//! println!("Instrument: {}:{}", config.connection.host, config.connection.port);
//! # Ok::<(), vicp_scope::error::VicpError>(())
//! ```

use crate::error::{AppResult, VicpError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default TCP port of the VICP service.
pub const DEFAULT_VICP_PORT: u16 = 1861;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VicpConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Link-layer framing settings
    #[serde(default)]
    pub link: LinkConfig,
    /// Acquisition settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Where the instrument lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP connect timeout in milliseconds. Reads and writes never time out.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm on the socket
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

/// Link-layer framing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Largest payload put into a single outbound frame; longer commands are chunked.
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Number of waveform sets the pending queue holds before dropping the oldest
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_VICP_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_max_frame_payload() -> usize {
    65536
}

fn default_queue_capacity() -> usize {
    32
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            nodelay: default_true(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: default_max_frame_payload(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl VicpConfig {
    /// Load configuration from a specific file path and `VICP_` environment variables
    ///
    /// Environment variables override the file, e.g.
    /// `VICP_CONNECTION__HOST=10.0.0.5` or `VICP_APPLICATION__LOG_LEVEL=debug`.
    /// A missing file is not an error; defaults fill every field.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VICP_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(VicpError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(VicpError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.connection.host.trim().is_empty() {
            return Err(VicpError::Configuration(
                "connection.host must not be empty".into(),
            ));
        }

        if self.connection.port == 0 {
            return Err(VicpError::Configuration(
                "connection.port must be non-zero".into(),
            ));
        }

        if self.link.max_frame_payload == 0 {
            return Err(VicpError::Configuration(
                "link.max_frame_payload must be at least 1".into(),
            ));
        }

        if self.link.max_frame_payload > u32::MAX as usize {
            return Err(VicpError::Configuration(format!(
                "link.max_frame_payload {} exceeds the 32-bit frame length field",
                self.link.max_frame_payload
            )));
        }

        if self.acquisition.queue_capacity == 0 {
            return Err(VicpError::Configuration(
                "acquisition.queue_capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
