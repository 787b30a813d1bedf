//! Unified logging module for VoltageEMS services
//!
//! Console output uses the bracketed level format; an optional daily file is
//! written through a non-blocking appender.

use std::path::PathBuf;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Service started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// Keeps the file writer flushing until process exit
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (e.g., "netsrv")
    pub service_name: String,
    /// Directory for the daily log file; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: Option<String>,
    /// JSON lines instead of the bracketed format in the log file
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: None,
            default_filter: None,
            enable_json: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Filter string applied when `RUST_LOG` is absent
    pub fn filter_directive(&self) -> String {
        self.default_filter
            .clone()
            .unwrap_or_else(|| format!("info,{}=debug", self.service_name))
    }
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    // RUST_LOG wins over the configured default
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.is_empty() => {
            EnvFilter::try_new(&env_str).map_err(|e| LoggingError::Filter(e.to_string()))
        },
        _ => EnvFilter::try_new(config.filter_directive())
            .map_err(|e| LoggingError::Filter(e.to_string())),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config)?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| LoggingError::LogDir {
                path: dir.clone(),
                source: e,
            })?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            if FILE_GUARD.set(guard).is_err() {
                return Err(LoggingError::AlreadyInitialized(
                    "file writer already installed".to_string(),
                ));
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {}", config.service_name, dir.display()),
        None => tracing::info!("Logging: {} (console only)", config.service_name),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_default_filter_directive() {
        let config = LogConfig::for_service("netsrv");
        assert_eq!(config.filter_directive(), "info,netsrv=debug");

        let config = LogConfig {
            default_filter: Some("warn".to_string()),
            ..LogConfig::for_service("netsrv")
        };
        assert_eq!(config.filter_directive(), "warn");
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig {
            default_filter: Some("netsrv=notalevel".to_string()),
            ..LogConfig::for_service("netsrv")
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(build_filter(&config), Err(LoggingError::Filter(_))));
        }
    }
}
