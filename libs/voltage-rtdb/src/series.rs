//! Signal time series with health tracking
//!
//! A [`TimeSeries`] wraps a [`TimeSeriesBuffer`] with the signal's identity,
//! declared unit and valid range, and the running totals used to flag the
//! signal as offline, stuck or out of range.

use crate::buffer::{TimeSeriesBuffer, TimedValue};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Values needed before a flat signal counts as stuck
const STUCK_MIN_VALUES: u64 = 50;

/// Signals silent for longer than this are offline whatever their interval
const OFFLINE_AFTER_DAYS: i64 = 7;

/// Offline after this many missed trend intervals
const OFFLINE_TREND_MULTIPLIER: i32 = 10;

/// Timeliness tolerates this many missed trend intervals
const TIMELY_TREND_MULTIPLIER: i32 = 3;

/// Model suffixes of commanded points which legitimately hold one value
const STEADY_MODEL_SUFFIXES: [&str; 3] = ["Actuator;1", "Setpoint;1", "Energy;1"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    #[default]
    Numeric,
    Boolean,
    Setpoint,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalStatus {
    pub offline: bool,
    pub stuck: bool,
    pub value_out_of_range: bool,
}

impl SignalStatus {
    pub fn is_healthy(&self) -> bool {
        !self.offline && !self.stuck && !self.value_out_of_range
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<&str> = [
            (self.offline, "Offline"),
            (self.stuck, "Stuck"),
            (self.value_out_of_range, "ValueOutOfRange"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if flags.is_empty() {
            write!(f, "Valid")
        } else {
            write!(f, "{}", flags.join(", "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub id: String,
    pub unit: Option<String>,
    pub model_id: Option<String>,
    pub kind: SignalKind,
    pub valid_range: Option<ValidRange>,
    pub trend_interval: Option<TimeDelta>,
    buffer: TimeSeriesBuffer,
    status: SignalStatus,
    total_values_processed: u64,
    min_value: Option<f64>,
    max_value: Option<f64>,
    average_value: f64,
    earliest_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl TimeSeries {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unit: None,
            model_id: None,
            kind: SignalKind::default(),
            valid_range: None,
            trend_interval: None,
            buffer: TimeSeriesBuffer::new(),
            status: SignalStatus::default(),
            total_values_processed: 0,
            min_value: None,
            max_value: None,
            average_value: 0.0,
            earliest_seen: None,
            last_seen: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_kind(mut self, kind: SignalKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_valid_range(mut self, range: ValidRange) -> Self {
        self.valid_range = Some(range);
        self
    }

    pub fn with_trend_interval(mut self, interval: TimeDelta) -> Self {
        self.trend_interval = Some(interval);
        self
    }

    pub fn buffer(&self) -> &TimeSeriesBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut TimeSeriesBuffer {
        &mut self.buffer
    }

    pub fn status(&self) -> SignalStatus {
        self.status
    }

    pub fn total_values_processed(&self) -> u64 {
        self.total_values_processed
    }

    pub fn min_value(&self) -> Option<f64> {
        self.min_value
    }

    pub fn max_value(&self) -> Option<f64> {
        self.max_value
    }

    pub fn average_value(&self) -> f64 {
        self.average_value
    }

    pub fn earliest_seen(&self) -> Option<DateTime<Utc>> {
        self.earliest_seen
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn is_text(&self) -> bool {
        self.kind == SignalKind::Text
    }

    /// Record a point, returns whether the buffer kept it
    ///
    /// Out of range values still count as a sign of life but never reach
    /// the buffer.
    pub fn add_point(&mut self, point: TimedValue, apply_compression: bool) -> bool {
        self.last_seen = Some(self.last_seen.map_or(point.timestamp, |t| t.max(point.timestamp)));
        self.earliest_seen = Some(
            self.earliest_seen
                .map_or(point.timestamp, |t| t.min(point.timestamp)),
        );

        let numeric = point.value.as_number();

        if let (Some(range), Some(v)) = (self.valid_range, numeric) {
            if !range.contains(v) {
                self.status.value_out_of_range = true;
                return false;
            }
        }
        self.status.value_out_of_range = false;

        let compress = apply_compression && !self.is_text();
        if !self.buffer.append(point, compress) {
            return false;
        }

        self.total_values_processed += 1;
        if let Some(v) = numeric {
            self.min_value = Some(self.min_value.map_or(v, |m| m.min(v)));
            self.max_value = Some(self.max_value.map_or(v, |m| m.max(v)));
            let n = self.total_values_processed as f64;
            self.average_value += (v - self.average_value) / n;
        }
        true
    }

    /// Re-derive the offline and stuck flags against `now`
    pub fn set_status(&mut self, now: DateTime<Utc>) -> SignalStatus {
        self.status.offline = !self.is_text() && self.is_offline(now);
        self.status.stuck = self.is_stuck();
        self.status
    }

    fn is_offline(&self, now: DateTime<Utc>) -> bool {
        let Some(last_seen) = self.last_seen else {
            return true;
        };
        let silent = now - last_seen;
        if silent > TimeDelta::days(OFFLINE_AFTER_DAYS) {
            return true;
        }
        self.trend_interval
            .is_some_and(|interval| silent > interval * OFFLINE_TREND_MULTIPLIER)
    }

    fn is_stuck(&self) -> bool {
        if self.kind != SignalKind::Numeric || self.total_values_processed <= STUCK_MIN_VALUES {
            return false;
        }
        if self
            .model_id
            .as_deref()
            .is_some_and(|m| STEADY_MODEL_SUFFIXES.iter().any(|s| m.ends_with(s)))
        {
            return false;
        }
        matches!((self.min_value, self.max_value), (Some(min), Some(max)) if min == max && min != 0.0)
    }

    /// Whether the signal is recent enough to evaluate against
    ///
    /// With a trend interval the signal may miss up to three intervals;
    /// without one it must have reported within `max_staleness`.
    pub fn is_timely(&self, now: DateTime<Utc>, max_staleness: TimeDelta) -> bool {
        if self.is_text() {
            return true;
        }
        if self.buffer.len() < 2 {
            return false;
        }
        let Some(last_seen) = self.last_seen else {
            return false;
        };
        match self.trend_interval {
            Some(interval) => {
                let allowed = interval * TIMELY_TREND_MULTIPLIER;
                if last_seen + allowed < now {
                    return false;
                }
                self.buffer.last_gap() <= allowed
            },
            None => now - last_seen <= max_staleness,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    #[test]
    fn test_out_of_range_value_is_rejected_but_counts_as_seen() {
        let mut series = TimeSeries::new("sensor-1").with_valid_range(ValidRange::new(-50.0, 150.0));
        assert!(series.add_point(TimedValue::new(t(0), 20.0), false));
        assert!(!series.add_point(TimedValue::new(t(5), 900.0), false));

        assert!(series.status().value_out_of_range);
        assert_eq!(series.buffer().len(), 1);
        assert_eq!(series.last_seen(), Some(t(5)));

        assert!(series.add_point(TimedValue::new(t(10), 21.0), false));
        assert!(!series.status().value_out_of_range);
    }

    #[test]
    fn test_offline_after_ten_trend_intervals() {
        let mut series = TimeSeries::new("sensor-1").with_trend_interval(TimeDelta::minutes(15));
        series.add_point(TimedValue::new(t(0), 1.0), false);

        assert!(!series.set_status(t(120)).offline);
        assert!(series.set_status(t(151)).offline);
    }

    #[test]
    fn test_offline_after_seven_days_without_interval() {
        let mut series = TimeSeries::new("sensor-1");
        series.add_point(TimedValue::new(t(0), 1.0), false);
        assert!(!series.set_status(t(60 * 24 * 6)).offline);
        assert!(series.set_status(t(60 * 24 * 8)).offline);
    }

    #[test]
    fn test_text_signals_are_never_offline() {
        let mut series = TimeSeries::new("mode").with_kind(SignalKind::Text);
        series.add_point(TimedValue::new(t(0), "auto"), false);
        assert!(!series.set_status(t(60 * 24 * 30)).offline);
        assert!(series.is_timely(t(60 * 24 * 30), TimeDelta::minutes(30)));
    }

    #[test]
    fn test_flat_signal_becomes_stuck() {
        let mut series = TimeSeries::new("sensor-1");
        for m in 0..60 {
            series.add_point(TimedValue::new(t(m), 21.5), false);
        }
        assert!(series.set_status(t(60)).stuck);
        assert_eq!(series.set_status(t(60)).to_string(), "Stuck");
    }

    #[test]
    fn test_flat_zero_and_setpoints_are_not_stuck() {
        let mut zero = TimeSeries::new("sensor-1");
        let mut setpoint = TimeSeries::new("sp-1").with_model_id("dtmi:com:x:Setpoint;1");
        for m in 0..60 {
            zero.add_point(TimedValue::new(t(m), 0.0), false);
            setpoint.add_point(TimedValue::new(t(m), 22.0), false);
        }
        assert!(!zero.set_status(t(60)).stuck);
        assert!(!setpoint.set_status(t(60)).stuck);
    }

    #[test]
    fn test_timeliness_with_trend_interval() {
        let mut series = TimeSeries::new("sensor-1").with_trend_interval(TimeDelta::minutes(5));
        series.add_point(TimedValue::new(t(0), 1.0), false);
        assert!(!series.is_timely(t(1), TimeDelta::minutes(30)));

        series.add_point(TimedValue::new(t(5), 2.0), false);
        assert!(series.is_timely(t(10), TimeDelta::minutes(30)));
        assert!(!series.is_timely(t(21), TimeDelta::minutes(30)));

        // A long gap before the latest point is not timely either
        series.add_point(TimedValue::new(t(40), 3.0), false);
        assert!(!series.is_timely(t(41), TimeDelta::minutes(30)));
    }

    #[test]
    fn test_timeliness_with_staleness_limit() {
        let mut series = TimeSeries::new("sensor-1");
        series.add_point(TimedValue::new(t(0), 1.0), false);
        series.add_point(TimedValue::new(t(10), 2.0), false);
        assert!(series.is_timely(t(40), TimeDelta::minutes(30)));
        assert!(!series.is_timely(t(41), TimeDelta::minutes(30)));
    }

    #[test]
    fn test_running_totals() {
        let mut series = TimeSeries::new("sensor-1");
        for (m, v) in [(0, 2.0), (1, 4.0), (2, 6.0)] {
            series.add_point(TimedValue::new(t(m), v), false);
        }
        assert_eq!(series.total_values_processed(), 3);
        assert_eq!(series.min_value(), Some(2.0));
        assert_eq!(series.max_value(), Some(6.0));
        assert!((series.average_value() - 4.0).abs() < 1e-9);
        assert_eq!(series.earliest_seen(), Some(t(0)));
    }
}
