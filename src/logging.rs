//! # Logging
//!
//! Structured logging through `tracing`, configured from the environment:
//!
//! - `MCS_LOG_LEVEL`: trace / debug / info (default) / warn / error
//! - `MCS_LOG_FORMAT`: `json` (default) or `pretty`
//! - `MCS_LOG_TARGETS`: extra comma-separated `EnvFilter` directives,
//!   e.g. `mcs_gateway::streaming=debug,may=warn`
//! - `MCS_LOG_LOCATION`: include file and line (`true` / `false`)
//!
//! `RUST_LOG` takes precedence over `MCS_LOG_LEVEL` when set.

use anyhow::{Context, Result};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Log format: JSON for production, pretty-print for development
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub format: LogFormat,
    /// Extra filter directives (comma-separated)
    pub target_filter: Option<String>,
    /// Include file:line location (dev only)
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            target_filter: None,
            include_location: false,
        }
    }
}

impl LogConfig {
    /// Parse configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(&|key| env::var(key).ok())
    }

    #[must_use]
    pub fn from_vars(vars: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            log_level: vars("MCS_LOG_LEVEL").unwrap_or(defaults.log_level),
            format: vars("MCS_LOG_FORMAT").map_or(defaults.format, |f| LogFormat::parse(&f)),
            target_filter: vars("MCS_LOG_TARGETS").filter(|t| !t.trim().is_empty()),
            include_location: vars("MCS_LOG_LOCATION")
                .is_some_and(|v| matches!(v.trim(), "1" | "true")),
        }
    }

    /// Configuration for local runs: debug level, pretty output.
    #[must_use]
    pub fn default_dev() -> Self {
        Self {
            log_level: "debug".to_string(),
            format: LogFormat::Pretty,
            target_filter: None,
            include_location: true,
        }
    }

    fn level(&self) -> Level {
        match self.log_level.trim().to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level().as_str()));
        if let Some(targets) = &self.target_filter {
            for directive in targets.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                match directive.parse() {
                    Ok(directive) => filter = filter.add_directive(directive),
                    Err(_) => eprintln!("Warning: Invalid log filter directive: {directive}"),
                }
            }
        }
        filter
    }
}

/// Install the global subscriber. Calling it again is a no-op.
///
/// # Errors
///
/// Fails if some other global subscriber was installed first.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            INITIALIZED.store(false, Ordering::SeqCst);
            anyhow::anyhow!(e)
        })
        .context("Failed to initialize logging")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("whatever"), LogFormat::Json);
    }

    #[test]
    fn test_log_config_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("MCS_LOG_LEVEL", "debug"),
            ("MCS_LOG_FORMAT", "pretty"),
            ("MCS_LOG_TARGETS", "mcs_gateway::streaming=trace"),
        ]
        .into_iter()
        .collect();
        let config = LogConfig::from_vars(&|k| vars.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.level(), Level::DEBUG);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(
            config.target_filter.as_deref(),
            Some("mcs_gateway::streaming=trace")
        );
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::from_vars(&|_| None);
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.level(), Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        let first = init_logging(&config);
        assert!(first.is_ok());
        assert!(init_logging(&config).is_ok());
    }
}
