//! Logging setup.
//!
//! One `tracing-subscriber` fmt layer in the configured format. `RUST_LOG`
//! wins over `application.log_level` when it is set. Events carry thread
//! names since callers commonly share one link across threads.
//!
//! # Example
//! ```no_run
//! use vicp_scope::{config::VicpConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VicpConfig::load_from("config/vicp.toml")?;
//! logging::init_from_config(&config)?;
//!
//! info!(host = %config.connection.host, "connecting");
//! # Ok(())
//! # }
//! ```

use crate::config::VicpConfig;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

/// Initialize tracing from `application.log_level` and `application.log_format`
pub fn init_from_config(config: &VicpConfig) -> Result<(), String> {
    let level = parse_log_level(&config.application.log_level)?;
    let format = parse_output_format(&config.application.log_format)?;
    init(level, format)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` if one is already installed, so tests and embedding
/// applications can call it freely.
pub fn init(level: Level, format: OutputFormat) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let result = match format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_thread_names(true)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_thread_names(true)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    result.or_else(|e| {
        if e
            .to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("Failed to initialize tracing: {}", e))
        }
    })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn parse_output_format(format: &str) -> Result<OutputFormat, String> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        )),
    }
}
