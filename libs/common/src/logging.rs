//! Unified logging module for VoltageEMS services
//!
//! Console output uses a bracketed level format, file output rolls daily
//! through `tracing-appender`. The filter sits behind a reload layer so the
//! level can change while the service runs.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{Error, Result};

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

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "\x1b[35m",
        Level::DEBUG => "\x1b[34m",
        Level::INFO => "\x1b[32m",
        Level::WARN => "\x1b[33m",
        Level::ERROR => "\x1b[31m",
    }
}

/// Event formatter producing `timestamp [LEVEL] message key=value`
///
/// Example output: `2024-03-01T00:00:00.000000Z [WARN] Impact score write timed out, skipped instance_id=AHU-0001_high-sat`
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
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(writer, "{}{}\x1b[0m ", level_color(level), format_level(level))?;
        } else {
            write!(writer, "{} ", format_level(level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();
static CURRENT_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();
// Keeps the non-blocking file writer flushing until exit
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the default filter target
    pub service_name: String,
    /// Directory for daily log files
    pub log_dir: PathBuf,
    /// Filter used when `RUST_LOG` is unset, a level or a full filter spec
    pub level: String,
    /// JSON lines instead of the bracketed format
    pub json: bool,
    /// Also write to daily rolling files under `log_dir`
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: std::env::var("VOLTAGE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            level: "info".to_string(),
            json: false,
            file: false,
        }
    }
}

/// Filter string for a config, `RUST_LOG` wins when set
///
/// A bare level also raises the service's own target to that level, so
/// `debug` does not flood the output with dependency noise.
fn filter_spec(config: &LogConfig, rust_log: Option<String>) -> String {
    if let Some(spec) = rust_log.filter(|s| !s.trim().is_empty()) {
        return spec;
    }
    let level = config.level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let crate_target = config.service_name.replace('-', "_");
    match level.parse::<Level>() {
        Ok(parsed) if parsed > Level::INFO => format!("info,{}={}", crate_target, level),
        _ => level.to_string(),
    }
}

/// Initialize logging system with configuration
///
/// Fails when a global subscriber is already installed.
pub fn init_with_config(config: LogConfig) -> Result<()> {
    let spec = filter_spec(&config, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&spec)
        .map_err(|e| Error::Logging(format!("Invalid log filter '{}': {}", spec, e)))?;

    let (reload_filter, handle) = reload::Layer::new(filter);

    let console_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if FILE_GUARD.set(guard).is_err() {
            return Err(Error::Logging("File logging already initialized".to_string()));
        }
        let layer = if config.json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    let _ = FILTER_HANDLE.set(handle);
    let _ = CURRENT_LEVEL.set(Mutex::new(spec.clone()));
    tracing::debug!("Logging initialized with filter {}", spec);
    Ok(())
}

/// Console logging at `level` with defaults for everything else
pub fn init(level: &str) -> Result<()> {
    init_with_config(LogConfig {
        level: level.to_string(),
        ..Default::default()
    })
}

/// Dynamically set log filter level at runtime
///
/// Accepts a level (`debug`) or a full filter spec (`info,voltage_rules=trace`).
pub fn set_log_level(level: &str) -> Result<()> {
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| Error::Logging("Logging not initialized with reload support".to_string()))?;

    let filter = EnvFilter::try_new(level)
        .map_err(|e| Error::Logging(format!("Invalid log level '{}': {}", level, e)))?;
    handle
        .reload(filter)
        .map_err(|e| Error::Logging(format!("Failed to reload log filter: {}", e)))?;

    if let Some(current) = CURRENT_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current log filter, `unknown` before initialization
pub fn get_log_level() -> String {
    CURRENT_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn config(level: &str) -> LogConfig {
        LogConfig {
            service_name: "rulesrv".to_string(),
            level: level.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_rust_log_wins() {
        let spec = filter_spec(&config("debug"), Some("warn".to_string()));
        assert_eq!(spec, "warn");
        let spec = filter_spec(&config("debug"), Some("  ".to_string()));
        assert_eq!(spec, "info,rulesrv=debug");
    }

    #[test]
    fn test_verbose_level_scoped_to_service() {
        assert_eq!(filter_spec(&config("trace"), None), "info,rulesrv=trace");
        assert_eq!(filter_spec(&config("warn"), None), "warn");
        assert_eq!(filter_spec(&config("info"), None), "info");
    }

    #[test]
    fn test_full_spec_passes_through() {
        let spec = filter_spec(&config("info,voltage_rules=debug"), None);
        assert_eq!(spec, "info,voltage_rules=debug");
    }

    #[test]
    fn test_set_level_before_init_fails() {
        if FILTER_HANDLE.get().is_none() {
            assert!(set_log_level("debug").is_err());
            assert_eq!(get_log_level(), "unknown");
        }
    }
}
