//! Actor state
//!
//! The mutable, long-lived evaluation state of one rule instance: a buffer
//! per field (plus helper variables, impact scores and the internal `TIME`
//! accumulator), the output history and per-trigger command state.
//!
//! A state is owned by exactly one instance and only ever extended by that
//! instance's tick; history is never rewritten, only appended to or evicted
//! past retention.

use crate::definition::{CumulativeMode, RuleInstance};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use voltage_rtdb::{SignalValue, TimeSeriesBuffer, TimedValue};

/// Longest diagnostic text kept on an output point
pub const MAX_OUTPUT_TEXT: usize = 500;

/// Output history is kept at least this long, whatever the rule window
const MIN_OUTPUT_RETENTION_DAYS: i64 = 7;

/// Readiness of a rule instance after its last tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Never ticked
    #[default]
    AwaitingData,
    /// A required signal has no data or is stale
    MissingValue,
    /// A required signal is flagged out of range
    InvalidValue,
    /// Not enough history to cover the window
    InsufficientData,
    /// A temporal operator's window cannot be covered
    InsufficientRange,
    /// Evaluation failed
    InvalidOutput,
    /// Evaluated, the fault flag is meaningful
    Valid,
}

impl InstanceStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, InstanceStatus::Valid)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::AwaitingData => "AwaitingData",
            InstanceStatus::MissingValue => "MissingValue",
            InstanceStatus::InvalidValue => "InvalidValue",
            InstanceStatus::InsufficientData => "InsufficientData",
            InstanceStatus::InsufficientRange => "InsufficientRange",
            InstanceStatus::InvalidOutput => "InvalidOutput",
            InstanceStatus::Valid => "Valid",
        };
        f.write_str(name)
    }
}

/// A run of identical outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: InstanceStatus,
    pub faulted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl OutputPoint {
    pub fn is_valid(&self) -> bool {
        self.status.is_ready()
    }

    fn same_output(&self, status: InstanceStatus, faulted: bool, text: Option<&str>) -> bool {
        self.status == status && self.faulted == faulted && self.text.as_deref() == text
    }
}

/// Command output state of one trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandState {
    pub triggered: bool,
    pub value: f64,
    pub trigger_start: Option<DateTime<Utc>>,
    pub trigger_end: Option<DateTime<Utc>>,
    pub last_evaluated: Option<DateTime<Utc>>,
    /// Times the trigger switched on
    pub trigger_count: u32,
}

/// Output history and fault bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputValues {
    points: Vec<OutputPoint>,
    /// Last fault decision, survives not-ready ticks
    faulted: bool,
    /// Times the instance went from healthy to faulted
    pub faulted_count: u32,
    pub first_faulted_time: Option<DateTime<Utc>>,
    /// When the result series last switched on
    pub last_trigger_on_time: Option<DateTime<Utc>>,
    /// When the result series last switched off
    pub last_trigger_off_time: Option<DateTime<Utc>>,
    pub commands: BTreeMap<String, CommandState>,
}

impl OutputValues {
    pub fn points(&self) -> &[OutputPoint] {
        &self.points
    }

    pub fn last(&self) -> Option<&OutputPoint> {
        self.points.last()
    }

    pub fn faulted(&self) -> bool {
        self.faulted
    }

    /// Extend the last run when nothing changed, otherwise start a new one at `start`
    fn push(
        &mut self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        status: InstanceStatus,
        faulted: bool,
        text: Option<String>,
    ) {
        if let Some(last) = self.points.last_mut() {
            if last.same_output(status, faulted, text.as_deref()) {
                last.end = last.end.max(now);
                return;
            }
            // A backdated run trims the one before it
            let start = start.max(last.start);
            if start < last.end {
                last.end = start;
            }
        }
        self.points.push(OutputPoint {
            start: self.points.last().map_or(start, |p| start.max(p.start)),
            end: now,
            status,
            faulted,
            text,
        });
    }

    fn trim(&mut self, now: DateTime<Utc>, retention: TimeDelta) {
        let cutoff = now - retention.max(TimeDelta::days(MIN_OUTPUT_RETENTION_DAYS));
        let keep_from = self.points.partition_point(|p| p.end < cutoff);
        // Never drop the latest run
        let keep_from = keep_from.min(self.points.len().saturating_sub(1));
        self.points.drain(..keep_from);
    }
}

/// Mutable state of one rule instance
#[derive(Debug, Clone)]
pub struct ActorState {
    /// Rule instance id
    pub id: String,
    pub rule_id: String,
    /// Rule version the state was built for
    pub version: u32,
    /// Time of the last valid evaluation
    pub timestamp: DateTime<Utc>,
    pub earliest_seen: DateTime<Utc>,
    /// When the fault flag last changed
    pub last_changed_output: DateTime<Utc>,
    buffers: BTreeMap<String, TimeSeriesBuffer>,
    output: OutputValues,
    output_retention: TimeDelta,
}

impl ActorState {
    pub fn new(instance: &RuleInstance, start: DateTime<Utc>, version: u32) -> Self {
        Self {
            id: instance.id.clone(),
            rule_id: instance.rule_id.clone(),
            version,
            timestamp: start,
            earliest_seen: start,
            last_changed_output: start,
            buffers: BTreeMap::new(),
            output: OutputValues::default(),
            output_retention: TimeDelta::days(MIN_OUTPUT_RETENTION_DAYS),
        }
    }

    /// Keep output history for at least `retention`
    pub fn with_output_retention(mut self, retention: TimeDelta) -> Self {
        self.output_retention = retention;
        self
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self) -> InstanceStatus {
        self.output.last().map_or(InstanceStatus::AwaitingData, |p| p.status)
    }

    /// Current fault flag, false until the first decision
    pub fn faulted(&self) -> bool {
        self.output.faulted
    }

    /// Diagnostic text of the latest output, if any
    pub fn text(&self) -> Option<&str> {
        self.output.last().and_then(|p| p.text.as_deref())
    }

    pub fn is_valid(&self) -> bool {
        self.status().is_ready()
    }

    pub fn output(&self) -> &OutputValues {
        &self.output
    }

    pub fn buffer(&self, key: &str) -> Option<&TimeSeriesBuffer> {
        self.buffers.get(key)
    }

    pub fn buffers(&self) -> &BTreeMap<String, TimeSeriesBuffer> {
        &self.buffers
    }

    pub fn last_value(&self, key: &str) -> Option<&SignalValue> {
        self.buffers.get(key).and_then(TimeSeriesBuffer::last_value)
    }

    // ========================================================================
    // Buffers
    // ========================================================================

    /// Append a computed value to a buffer, honouring the cumulative mode
    ///
    /// Returns the buffered value, which for cumulative modes is the running
    /// total rather than the input.
    pub fn extend(
        &mut self,
        key: &str,
        point: TimedValue,
        mode: CumulativeMode,
        retention: TimeDelta,
    ) -> Option<SignalValue> {
        let buffer = self
            .buffers
            .entry(key.to_string())
            .or_insert_with(|| TimeSeriesBuffer::with_retention(retention));
        buffer.set_max_retention(retention);

        let point = match buffer.last() {
            _ if mode.is_simple() => point,
            Some(last) => {
                let gap = point.timestamp - last.timestamp;
                let total = last.numeric() + mode.increment(point.numeric(), gap).unwrap_or(0.0);
                TimedValue::new(point.timestamp, total)
            },
            // The first accumulated point carries no elapsed time
            None => {
                let total = mode.increment(point.numeric(), TimeDelta::zero()).unwrap_or(0.0);
                TimedValue::new(point.timestamp, total)
            },
        };

        buffer.append(point, true);
        buffer.last_value().cloned()
    }

    /// Add `amount` to a running total, returns the new total
    pub fn accumulate(
        &mut self,
        key: &str,
        timestamp: DateTime<Utc>,
        amount: f64,
        retention: TimeDelta,
    ) -> f64 {
        let point = TimedValue::new(timestamp, amount);
        self.extend(key, point, CumulativeMode::Accumulate, retention)
            .and_then(|v| v.as_number())
            .unwrap_or(0.0)
    }

    /// Drop every buffered value after `date`
    pub fn remove_values_after(&mut self, date: DateTime<Utc>) {
        for buffer in self.buffers.values_mut() {
            buffer.remove_points_after(date);
        }
        self.buffers.retain(|_, buffer| !buffer.is_empty());
        self.last_changed_output = date;
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    /// Track when the result series switches on and off
    pub fn record_result_edge(&mut self, now: DateTime<Utc>, triggered: bool) {
        let was_on = self
            .output
            .last_trigger_on_time
            .is_some_and(|on| self.output.last_trigger_off_time.map_or(true, |off| on > off));
        if triggered && !was_on {
            self.output.last_trigger_on_time = Some(now);
        } else if !triggered && was_on {
            self.output.last_trigger_off_time = Some(now);
        }
    }

    pub fn missing_value(&mut self, now: DateTime<Utc>, text: impl Into<String>) {
        self.not_ready(now, InstanceStatus::MissingValue, text.into(), false);
    }

    pub fn invalid_value(&mut self, now: DateTime<Utc>, text: impl Into<String>) {
        self.not_ready(now, InstanceStatus::InvalidValue, text.into(), false);
    }

    /// Not enough history yet; `faulted` declares a fault early
    pub fn insufficient_data(&mut self, now: DateTime<Utc>, text: impl Into<String>, faulted: bool) {
        self.not_ready(now, InstanceStatus::InsufficientData, text.into(), faulted);
    }

    pub fn insufficient_range(&mut self, now: DateTime<Utc>, text: impl Into<String>) {
        self.not_ready(now, InstanceStatus::InsufficientRange, text.into(), false);
    }

    /// Evaluation failed; `faulted` carries the previous decision forward
    pub fn invalid_output(&mut self, now: DateTime<Utc>, text: impl Into<String>, faulted: bool) {
        self.not_ready(now, InstanceStatus::InvalidOutput, text.into(), faulted);
    }

    fn not_ready(&mut self, now: DateTime<Utc>, status: InstanceStatus, text: String, faulted: bool) {
        let text = truncate(text);
        if faulted && !self.output.faulted {
            self.mark_faulted(now);
        }
        if faulted {
            self.output.faulted = true;
        }
        self.output.push(now, now, status, faulted, Some(text));
        self.output.trim(now, self.output_retention);
    }

    /// Record a fault decision
    ///
    /// A change of state is backdated to when the result series last
    /// switched on (or off), so the output run starts where the condition
    /// started rather than where the window caught up with it.
    pub fn valid_output(&mut self, now: DateTime<Utc>, faulted: bool) {
        let mut start = now;
        if faulted != self.output.faulted {
            let edge = if faulted {
                self.output.last_trigger_on_time
            } else {
                self.output.last_trigger_off_time
            };
            if let Some(edge) = edge.filter(|edge| *edge <= now) {
                start = edge;
            }
            if faulted {
                self.mark_faulted(start);
            }
            self.last_changed_output = start;
        }

        self.output.faulted = faulted;
        self.timestamp = now;
        self.output
            .push(start, now, InstanceStatus::Valid, faulted, None);
        self.output.trim(now, self.output_retention);
    }

    fn mark_faulted(&mut self, at: DateTime<Utc>) {
        self.output.faulted_count += 1;
        if self.output.first_faulted_time.is_none() {
            self.output.first_faulted_time = Some(at);
        }
    }

    /// Record a trigger evaluation
    pub fn with_trigger(&mut self, trigger_id: &str, now: DateTime<Utc>, triggered: bool, value: f64) {
        let command = self.output.commands.entry(trigger_id.to_string()).or_default();
        if triggered && !command.triggered {
            command.trigger_start = Some(now);
            command.trigger_end = None;
            command.trigger_count += 1;
        } else if !triggered && command.triggered {
            command.trigger_end = Some(now);
        }
        command.triggered = triggered;
        command.value = value;
        command.last_evaluated = Some(now);
    }

    /// Serializable summary for display
    pub fn snapshot(&self) -> ActorSnapshot {
        ActorSnapshot {
            id: self.id.clone(),
            rule_id: self.rule_id.clone(),
            status: self.status(),
            faulted: self.faulted(),
            text: self.text().map(str::to_string),
            timestamp: self.timestamp,
            faulted_count: self.output.faulted_count,
            values: self
                .buffers
                .iter()
                .filter_map(|(key, buffer)| buffer.last_value().map(|v| (key.clone(), v.clone())))
                .collect(),
            commands: self.output.commands.clone(),
        }
    }
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_OUTPUT_TEXT {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_OUTPUT_TEXT).collect();
    cut.push_str("...");
    cut
}

/// Point-in-time view of an actor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub id: String,
    pub rule_id: String,
    pub status: InstanceStatus,
    pub faulted: bool,
    #[serde(default)]
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub faulted_count: u32,
    /// Latest buffered value per field
    pub values: BTreeMap<String, SignalValue>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandState>,
}
