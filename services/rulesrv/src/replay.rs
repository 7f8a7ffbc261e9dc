//! Telemetry replay
//!
//! Feeds a `timestamp,signal_id,value` CSV through the engine in time order.
//! Simulated time drives the scheduler: each tick boundary runs once a later
//! row arrives, so rows stamped on the boundary are seen by that tick. A
//! final tick runs at the last row.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use voltage_rtdb::{FixedTimeProvider, SignalValue, TimedValue};
use voltage_rules::{ActorSnapshot, RuleScheduler, TickBatchReport};

use crate::engine::Engine;

#[derive(Debug, Deserialize)]
struct TelemetryRow {
    timestamp: DateTime<Utc>,
    signal_id: String,
    value: String,
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPoint {
    pub signal_id: String,
    pub point: TimedValue,
}

/// Numbers and booleans are typed, anything else stays text
pub fn parse_value(raw: &str) -> SignalValue {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<f64>() {
        return SignalValue::Number(number);
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => SignalValue::Bool(true),
        "false" => SignalValue::Bool(false),
        _ => SignalValue::Text(raw.to_string()),
    }
}

/// Read a telemetry CSV sorted by timestamp, file order kept for ties
pub fn read_telemetry(path: &Path) -> Result<Vec<TelemetryPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open telemetry {}", path.display()))?;

    let mut points = Vec::new();
    for (line, row) in reader.deserialize::<TelemetryRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid telemetry row {} in {}", line + 2, path.display()))?;
        points.push(TelemetryPoint {
            signal_id: row.signal_id,
            point: TimedValue::new(row.timestamp, parse_value(&row.value)),
        });
    }
    points.sort_by_key(|p| p.point.timestamp);
    Ok(points)
}

/// Outcome of a replay
#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub rows: usize,
    /// Rows the store kept, the rest were duplicates or out of range
    pub accepted: usize,
    pub ticks: u64,
    pub last_report: Option<TickBatchReport>,
    pub impact_writes: u64,
    pub states: Vec<ActorSnapshot>,
}

pub async fn replay(engine: &Engine, points: Vec<TelemetryPoint>, tick: TimeDelta) -> Result<ReplaySummary> {
    let rows = points.len();
    let Some(first) = points.first().map(|p| p.point.timestamp) else {
        return Ok(ReplaySummary {
            rows: 0,
            accepted: 0,
            ticks: 0,
            last_report: None,
            impact_writes: 0,
            states: Vec::new(),
        });
    };
    let tick = tick.max(TimeDelta::milliseconds(1));

    let time = Arc::new(FixedTimeProvider::new(first));
    let scheduler = RuleScheduler::new(
        Arc::clone(&engine.runner),
        time.clone(),
        tick.num_milliseconds() as u64,
    );
    info!(rows, start = %first, "Replaying telemetry");

    let mut next_tick = first + tick;
    let mut last_tick: Option<DateTime<Utc>> = None;
    let mut accepted = 0;
    let mut last_seen = first;

    for TelemetryPoint { signal_id, point } in points {
        while point.timestamp > next_tick {
            time.set(next_tick);
            scheduler.tick().await;
            last_tick = Some(next_tick);
            next_tick += tick;
        }
        last_seen = point.timestamp;
        if engine.store.ingest(&signal_id, point) {
            accepted += 1;
        }
    }

    if last_tick.map_or(true, |t| t < last_seen) {
        time.set(last_seen);
        scheduler.tick().await;
    }

    let status = scheduler.status();
    debug!(ticks = status.ticks, accepted, "Replay finished");
    Ok(ReplaySummary {
        rows,
        accepted,
        ticks: status.ticks,
        last_report: status.last_report,
        impact_writes: engine.sink().stats().snapshot().written,
        states: engine.runner.snapshots().await,
    })
}
