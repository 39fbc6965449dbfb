//! Structured logging setup
//!
//! The library only emits `tracing` events. Callers that want to see them
//! install a subscriber once with [`init`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable that overrides the configured filter
pub const LOG_ENV: &str = "FORGE_LOG";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: text or json
    #[serde(default = "default_format")]
    pub format: String,

    /// Enable ANSI colors (text format only)
    #[serde(default)]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            color: false,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(directive) = std::env::var(LOG_ENV) {
            if !directive.is_empty() {
                return EnvFilter::try_new(&directive)
                    .map_err(|e| Error::Config(format!("Invalid {} filter: {}", LOG_ENV, e)));
            }
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", self.level, e)))
    }
}

/// Install a stderr subscriber for the configured level and format.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = config.filter()?;

    let installed = match config.format.as_str() {
        "json" => Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .is_ok(),
        "text" => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(config.color)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok(),
        other => {
            return Err(Error::Config(format!(
                "Unknown log format '{}' (expected 'text' or 'json')",
                other
            )))
        }
    };

    Ok(installed)
}
