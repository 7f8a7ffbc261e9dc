//! Rule service configuration
//!
//! Loaded through `common::config::load`: serde defaults, then the YAML
//! file, then `RULESRV_`-prefixed environment variables
//! (`RULESRV_ENGINE__MAX_WORKERS=4`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use voltage_rules::RunnerConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RULESRV";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulesrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub data: DataConfig,
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level or filter spec, `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily log files, file logging is off when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// JSON lines instead of the bracketed format
    #[serde(default)]
    pub json_logs: bool,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Instances evaluated concurrently
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Scheduler tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Age after which an input counts as missing
    #[serde(default = "default_max_staleness_minutes")]
    pub max_staleness_minutes: i64,

    /// Limit on aggregate folds while binding one expression
    #[serde(default = "default_max_fold_count")]
    pub max_fold_count: usize,

    /// Bound on each impact score write
    #[serde(default = "default_sink_timeout_ms")]
    pub sink_timeout_ms: u64,

    /// Twin graph refresh interval in seconds
    #[serde(default = "default_graph_refresh_secs")]
    pub graph_refresh_secs: u64,
}

/// Input files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Twin graph document (JSON or YAML)
    #[serde(default = "default_graph_path")]
    pub graph: PathBuf,

    /// Model ontology document, an empty ontology when unset
    #[serde(default)]
    pub ontology: Option<PathBuf>,

    /// Rules and instances (JSON or YAML)
    #[serde(default = "default_rules_path")]
    pub rules: PathBuf,

    /// Telemetry CSV replayed by default
    #[serde(default)]
    pub telemetry: Option<PathBuf>,
}

// Default value functions
fn default_service_name() -> String {
    "rulesrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_workers() -> usize {
    voltage_rules::DEFAULT_MAX_WORKERS
}

fn default_tick_interval_ms() -> u64 {
    voltage_rules::DEFAULT_TICK_MS
}

fn default_max_staleness_minutes() -> i64 {
    30
}

fn default_max_fold_count() -> usize {
    voltage_binding::DEFAULT_MAX_FOLD_COUNT
}

fn default_sink_timeout_ms() -> u64 {
    100
}

fn default_graph_refresh_secs() -> u64 {
    3600
}

fn default_graph_path() -> PathBuf {
    PathBuf::from("data/graph.json")
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("data/rules.yaml")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: None,
            json_logs: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            tick_interval_ms: default_tick_interval_ms(),
            max_staleness_minutes: default_max_staleness_minutes(),
            max_fold_count: default_max_fold_count(),
            sink_timeout_ms: default_sink_timeout_ms(),
            graph_refresh_secs: default_graph_refresh_secs(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            graph: default_graph_path(),
            ontology: None,
            rules: default_rules_path(),
            telemetry: None,
        }
    }
}

impl RulesrvConfig {
    /// Load configuration, a missing file leaves the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = common::config::load(path, ENV_PREFIX)
            .context("Failed to load rulesrv configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_workers == 0 {
            anyhow::bail!("engine.max_workers must be at least 1");
        }
        if self.engine.tick_interval_ms == 0 {
            anyhow::bail!("engine.tick_interval_ms must be at least 1");
        }
        if self.engine.max_staleness_minutes <= 0 {
            anyhow::bail!("engine.max_staleness_minutes must be positive");
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_workers: self.engine.max_workers,
            max_staleness: chrono::TimeDelta::minutes(self.engine.max_staleness_minutes),
            max_fold_count: self.engine.max_fold_count,
        }
    }

    pub fn graph_refresh(&self) -> Duration {
        Duration::from_secs(self.engine.graph_refresh_secs)
    }

    pub fn log_config(&self) -> common::LogConfig {
        let mut log = common::LogConfig {
            service_name: self.service.name.clone(),
            level: self.service.log_level.clone(),
            json: self.service.json_logs,
            ..Default::default()
        };
        if let Some(dir) = &self.service.log_dir {
            log.log_dir = dir.clone();
            log.file = true;
        }
        log
    }
}
