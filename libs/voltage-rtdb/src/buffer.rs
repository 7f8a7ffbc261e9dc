//! Bounded, compressed time-series buffer
//!
//! Points are kept in time order. Appends may be compressed with a
//! swinging door: from the last kept point (the anchor) every dropped point
//! narrows a band of slopes that stay within a percentage tolerance of it.
//! The pending point is replaced by the new one while the line from the
//! anchor to the new point stays inside that band, so no dropped point ever
//! strays more than its tolerance from the kept trajectory. The newest point
//! is never altered, so the last value read back is always exact.
//!
//! All window queries use a closed interval: a point exactly at `start` or
//! exactly at `end` is included.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default compression tolerance in percent
pub const DEFAULT_COMPRESSION: f64 = 0.05;

/// Buffers spanning less than this are never re-compressed
const RECOMPRESS_MIN_SPAN_DAYS: i64 = 15;

// ============================================================================
// Points
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl SignalValue {
    /// Numeric view, booleans as 1/0, text has none
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SignalValue::Number(n) => Some(*n),
            SignalValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SignalValue::Text(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, SignalValue::Text(_))
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Number(n) => write!(f, "{}", n),
            SignalValue::Bool(b) => write!(f, "{}", b),
            SignalValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Number(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Text(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        SignalValue::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedValue {
    pub timestamp: DateTime<Utc>,
    pub value: SignalValue,
}

impl TimedValue {
    pub fn new(timestamp: DateTime<Utc>, value: impl Into<SignalValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Numeric value, zero for text
    pub fn numeric(&self) -> f64 {
        self.value.as_number().unwrap_or(0.0)
    }

    /// Reject non-finite numbers before they reach a buffer
    pub fn is_valid(&self) -> bool {
        match self.value {
            SignalValue::Number(n) => n.is_finite(),
            _ => true,
        }
    }
}

// ============================================================================
// Swinging door compression
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Compressed {
    Add,
    Replace,
}

#[derive(Debug, Clone, Default)]
struct CompressionState {
    /// Second to last retained point
    anchor: Option<(DateTime<Utc>, f64)>,
    /// Last retained point, which is always the last real point
    last: Option<(DateTime<Utc>, f64)>,
    /// Allowed (low, high) slope from the anchor, unbounded when nothing was dropped
    band: Option<(f64, f64)>,
    last_delta: f64,
    last_delta_time: f64,
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

fn compress(state: &mut CompressionState, percent: f64, t: DateTime<Utc>, v: f64) -> Compressed {
    if let Some((lt, lv)) = state.last {
        state.last_delta = v - lv;
        state.last_delta_time = seconds(t - lt);
    }

    let outcome = match (state.anchor, state.last) {
        (Some((at, av)), Some((lt, lv))) => {
            // Dropping the pending point narrows the band by its own tolerance
            let (low, high) = state.band.unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
            let tolerance = percent / 100.0 * lv.abs().max(1.0);
            let pending = seconds(lt - at);
            let band = if pending > 0.0 {
                (
                    low.max((lv - tolerance - av) / pending),
                    high.min((lv + tolerance - av) / pending),
                )
            } else {
                (low, high)
            };

            let span = seconds(t - at);
            let slope = if span > 0.0 { (v - av) / span } else { f64::NAN };
            if slope >= band.0 && slope <= band.1 {
                state.band = Some(band);
                Compressed::Replace
            } else {
                state.anchor = state.last;
                state.band = None;
                Compressed::Add
            }
        },
        (None, Some(last)) => {
            state.anchor = Some(last);
            state.band = None;
            Compressed::Add
        },
        _ => Compressed::Add,
    };

    state.last = Some((t, v));
    outcome
}

/// Compression applied to points of a given age during re-compression
fn compression_for_age(age: TimeDelta) -> f64 {
    if age > TimeDelta::days(60) {
        5.0
    } else if age > TimeDelta::days(31) {
        1.0
    } else if age > TimeDelta::days(15) {
        0.5
    } else {
        DEFAULT_COMPRESSION
    }
}

// ============================================================================
// Buffer
// ============================================================================

#[derive(Debug, Clone)]
pub struct TimeSeriesBuffer {
    points: Vec<TimedValue>,
    max_retention: Option<TimeDelta>,
    /// Compression tolerance in percent
    compression: f64,
    state: Option<CompressionState>,
    last_gap: TimeDelta,
}

impl Default for TimeSeriesBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesBuffer {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            max_retention: None,
            compression: DEFAULT_COMPRESSION,
            state: None,
            last_gap: TimeDelta::zero(),
        }
    }

    pub fn with_retention(max_retention: TimeDelta) -> Self {
        let mut buffer = Self::new();
        buffer.set_max_retention(max_retention);
        buffer
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[TimedValue] {
        &self.points
    }

    pub fn first(&self) -> Option<&TimedValue> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&TimedValue> {
        self.points.last()
    }

    pub fn last_gap(&self) -> TimeDelta {
        self.last_gap
    }

    pub fn max_retention(&self) -> Option<TimeDelta> {
        self.max_retention
    }

    /// Grow the retention window, a shorter window than the current one is ignored
    pub fn set_max_retention(&mut self, retention: TimeDelta) {
        if retention > TimeDelta::zero() && self.max_retention.map_or(true, |r| retention > r) {
            self.max_retention = Some(retention);
        }
    }

    pub fn compression(&self) -> f64 {
        self.compression
    }

    pub fn set_compression(&mut self, percent: f64) {
        self.compression = percent.max(0.0);
    }

    /// Append a point, returns false when it was rejected or ignored
    pub fn append(&mut self, point: TimedValue, apply_compression: bool) -> bool {
        if !point.is_valid() {
            return false;
        }

        if apply_compression {
            let last_date = self.points.last().map(|p| p.timestamp.date_naive());
            if last_date.is_some_and(|d: NaiveDate| d != point.timestamp.date_naive()) {
                self.reapply_compression();
            }
        }

        // Going back in time discards everything after the new point
        if self
            .points
            .last()
            .is_some_and(|last| last.timestamp > point.timestamp)
        {
            self.points.retain(|p| p.timestamp <= point.timestamp);
            self.state = Some(CompressionState::default());
        }

        if let Some(last) = self.points.last() {
            if last.timestamp == point.timestamp || *last == point {
                return false;
            }
            self.last_gap = point.timestamp - last.timestamp;
        }

        let timestamp = point.timestamp;
        let numeric = point.value.as_number();
        match numeric {
            Some(v) if apply_compression && !self.points.is_empty() => {
                if self.state.is_none() {
                    self.rebuild_state();
                }
                let percent = self.compression;
                let outcome = match self.state.as_mut() {
                    Some(state) => compress(state, percent, timestamp, v),
                    None => Compressed::Add,
                };
                match (outcome, self.points.last_mut()) {
                    (Compressed::Replace, Some(last)) => *last = point,
                    _ => self.points.push(point),
                }
            },
            _ => {
                // Uncompressed appends invalidate the tracked trajectory
                self.state = None;
                self.points.push(point);
            },
        }

        self.apply_retention(timestamp);
        true
    }

    /// Restart compression from the last two retained points
    fn rebuild_state(&mut self) {
        let numeric = |p: &TimedValue| p.value.as_number().map(|v| (p.timestamp, v));
        let mut state = CompressionState::default();
        match self.points.as_slice() {
            [.., previous, last] => {
                state.anchor = numeric(previous);
                state.last = numeric(last);
            },
            [last] => state.last = numeric(last),
            [] => {},
        }
        self.state = Some(state);
    }

    /// Compress older history harder, run at most once per day rollover
    fn reapply_compression(&mut self) {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return;
        };
        let last_seen = last.timestamp;
        if last_seen - first.timestamp < TimeDelta::days(RECOMPRESS_MIN_SPAN_DAYS) {
            return;
        }

        let before = self.points.len();
        let mut state = CompressionState::default();
        let mut recompressed: Vec<TimedValue> = Vec::with_capacity(before);
        for point in self.points.drain(..) {
            let age = last_seen - point.timestamp;
            let numeric = point.value.as_number();
            match numeric {
                Some(v) if age >= TimeDelta::days(RECOMPRESS_MIN_SPAN_DAYS) => {
                    let percent = compression_for_age(age);
                    match (compress(&mut state, percent, point.timestamp, v), recompressed.last_mut()) {
                        (Compressed::Replace, Some(prev)) => *prev = point,
                        _ => recompressed.push(point),
                    }
                },
                _ => recompressed.push(point),
            }
        }
        self.points = recompressed;

        tracing::trace!(
            before,
            after = self.points.len(),
            "Re-applied age based compression"
        );
    }

    /// Drop points older than the retention window relative to `latest`
    ///
    /// One point before the cutoff is kept so windows can start exactly at
    /// the cutoff, and the buffer never shrinks below two points.
    fn apply_retention(&mut self, latest: DateTime<Utc>) {
        let Some(retention) = self.max_retention else {
            return;
        };
        let cutoff = latest - retention;
        let before_cutoff = self.points.partition_point(|p| p.timestamp < cutoff);
        let remove = before_cutoff
            .saturating_sub(1)
            .min(self.points.len().saturating_sub(2));
        if remove > 0 {
            self.points.drain(..remove);
        }
    }

    /// Discard points after `date`, used before replaying history
    pub fn remove_points_after(&mut self, date: DateTime<Utc>) {
        let before = self.points.len();
        self.points.retain(|p| p.timestamp <= date);
        if self.points.len() != before {
            self.state = None;
            self.last_gap = TimeDelta::zero();
        }
    }

    // ========================================================================
    // Window queries
    // ========================================================================

    /// Points with `start <= timestamp <= end`
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[TimedValue] {
        if start > end {
            return &[];
        }
        let lo = self.points.partition_point(|p| p.timestamp < start);
        let hi = self.points.partition_point(|p| p.timestamp <= end);
        &self.points[lo..hi.max(lo)]
    }

    fn numeric_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        self.range(start, end)
            .iter()
            .filter_map(|p| p.value.as_number().map(|v| (p.timestamp, v)))
            .collect()
    }

    /// Time weighted average (trapezoidal)
    pub fn average(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let points = self.numeric_range(start, end);
        let (first, last) = (points.first()?, points.last()?);
        let span = seconds(last.0 - first.0);
        if span <= 0.0 {
            return Some(points.iter().map(|(_, v)| v).sum::<f64>() / points.len() as f64);
        }
        let integral: f64 = points
            .windows(2)
            .map(|w| (w[0].1 + w[1].1) / 2.0 * seconds(w[1].0 - w[0].0))
            .sum();
        Some(integral / span)
    }

    pub fn min(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        self.numeric_range(start, end)
            .into_iter()
            .map(|(_, v)| v)
            .reduce(f64::min)
    }

    pub fn max(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        self.numeric_range(start, end)
            .into_iter()
            .map(|(_, v)| v)
            .reduce(f64::max)
    }

    pub fn sum(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        self.numeric_range(start, end)
            .into_iter()
            .map(|(_, v)| v)
            .reduce(|a, b| a + b)
    }

    pub fn count(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.range(start, end).len()
    }

    /// Least squares slope in units per second
    pub fn slope(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let points = self.numeric_range(start, end);
        let origin = points.first()?.0;
        linear_regression(points.iter().map(|(t, v)| (seconds(*t - origin), *v)))
            .map(|(slope, _)| slope)
    }

    /// Population standard deviation
    pub fn std_dev(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let values: Vec<f64> = self
            .numeric_range(start, end)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(variance.sqrt())
    }

    /// Numeric points in the window, preceded by the value held at `start`
    ///
    /// The last point before the window is moved to `start` so step-hold
    /// statistics cover the whole window. Empty when no point falls inside.
    fn held_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        let inside = self.numeric_range(start, end);
        if inside.is_empty() {
            return inside;
        }
        let lo = self.points.partition_point(|p| p.timestamp < start);
        let leading = lo
            .checked_sub(1)
            .and_then(|i| self.points.get(i))
            .and_then(|p| p.value.as_number())
            .filter(|_| inside.first().is_some_and(|(t, _)| *t > start))
            .map(|v| (start, v));
        leading.into_iter().chain(inside).collect()
    }

    /// Time the value spent above zero, each point held until the next
    pub fn duration_above_zero(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<TimeDelta> {
        let points = self.held_range(start, end);
        if points.is_empty() {
            return None;
        }
        let mut total = TimeDelta::zero();
        for (i, (t, v)) in points.iter().enumerate() {
            if *v > 0.0 {
                let until = points.get(i + 1).map_or(end, |(next, _)| *next);
                total += until - *t;
            }
        }
        Some(total)
    }

    /// Fraction of the window the value was true
    ///
    /// With history reaching back to `start` the whole window is the
    /// denominator, otherwise only the part since the first point.
    pub fn average_true(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let points = self.held_range(start, end);
        let first = points.first()?;
        let covered = seconds(end - first.0);
        if covered <= 0.0 {
            return Some(if first.1 > 0.0 { 1.0 } else { 0.0 });
        }
        let above = self.duration_above_zero(start, end)?;
        Some(seconds(above) / covered)
    }

    pub fn last_value(&self) -> Option<&SignalValue> {
        self.points.last().map(|p| &p.value)
    }

    /// Change between the last two real points, unaffected by compression
    pub fn last_delta(&self) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        if let Some(state) = &self.state {
            if state.anchor.is_some() {
                return Some(state.last_delta);
            }
        }
        let [.., previous, last] = self.points.as_slice() else {
            return None;
        };
        Some(last.numeric() - previous.numeric())
    }

    /// Seconds between the last two real points
    pub fn last_delta_time(&self) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        if let Some(state) = &self.state {
            if state.anchor.is_some() {
                return Some(state.last_delta_time);
            }
        }
        let [.., previous, last] = self.points.as_slice() else {
            return None;
        };
        Some(seconds(last.timestamp - previous.timestamp))
    }

    /// Regression over the buffer projected `horizon` past the last point
    pub fn forecast(&self, horizon: TimeDelta) -> Option<f64> {
        let values: Vec<(DateTime<Utc>, f64)> = self
            .points
            .iter()
            .filter_map(|p| p.value.as_number().map(|v| (p.timestamp, v)))
            .collect();
        let (first, last) = (values.first()?, values.last()?);
        if values.len() == 1 {
            return Some(first.1);
        }
        let origin = first.0;
        let (slope, intercept) =
            linear_regression(values.iter().map(|(t, v)| (seconds(*t - origin), *v)))?;
        Some(intercept + slope * seconds(last.0 + horizon - origin))
    }
}

/// Ordinary least squares, `None` without at least two distinct x values
fn linear_regression(points: impl Iterator<Item = (f64, f64)>) -> Option<(f64, f64)> {
    let (mut n, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        n += 1.0;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denominator = n * sxx - sx * sx;
    if n < 2.0 || denominator.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sxy - sx * sy) / denominator;
    let intercept = (sy - slope * sx) / n;
    Some((slope, intercept))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::minutes(minutes)
    }

    fn buffer_of(values: &[(i64, f64)]) -> TimeSeriesBuffer {
        let mut buffer = TimeSeriesBuffer::new();
        for (m, v) in values {
            assert!(buffer.append(TimedValue::new(t(*m), *v), false));
        }
        buffer
    }

    // ========================================================================
    // Append
    // ========================================================================

    #[test]
    fn test_rejects_non_finite_values() {
        let mut buffer = TimeSeriesBuffer::new();
        assert!(!buffer.append(TimedValue::new(t(0), f64::NAN), false));
        assert!(!buffer.append(TimedValue::new(t(0), f64::INFINITY), true));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duplicate_timestamp_is_ignored() {
        let mut buffer = buffer_of(&[(0, 1.0)]);
        assert!(!buffer.append(TimedValue::new(t(0), 2.0), false));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_going_back_in_time_truncates() {
        let mut buffer = buffer_of(&[(0, 1.0), (10, 2.0), (20, 3.0)]);
        assert!(buffer.append(TimedValue::new(t(15), 9.0), true));
        let stamps: Vec<_> = buffer.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![t(0), t(10), t(15)]);
        assert_eq!(buffer.last().unwrap().numeric(), 9.0);
    }

    #[test]
    fn test_last_gap_is_tracked() {
        let buffer = buffer_of(&[(0, 1.0), (5, 2.0)]);
        assert_eq!(buffer.last_gap(), TimeDelta::minutes(5));
    }

    #[test]
    fn test_linear_series_compresses_to_endpoints() {
        let mut buffer = TimeSeriesBuffer::new();
        for m in 0..10 {
            buffer.append(TimedValue::new(t(m), m as f64), true);
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.first().unwrap().numeric(), 0.0);
        assert_eq!(buffer.last().unwrap().numeric(), 9.0);
        // Real delta survives compression
        assert_eq!(buffer.last_delta(), Some(1.0));
        assert_eq!(buffer.last_delta_time(), Some(60.0));
    }

    #[test]
    fn test_step_change_is_kept() {
        let mut buffer = TimeSeriesBuffer::new();
        for (m, v) in [(0, 0.0), (1, 0.0), (2, 0.0), (3, 1.0)] {
            buffer.append(TimedValue::new(t(m), v), true);
        }
        let values: Vec<_> = buffer.points().iter().map(|p| (p.timestamp, p.numeric())).collect();
        assert_eq!(values, vec![(t(0), 0.0), (t(2), 0.0), (t(3), 1.0)]);
    }

    #[test]
    fn test_retention_keeps_one_point_before_cutoff() {
        let mut buffer = TimeSeriesBuffer::with_retention(TimeDelta::minutes(30));
        for m in [0, 10, 20, 30, 40, 50] {
            buffer.append(TimedValue::new(t(m), m as f64), false);
        }
        // Cutoff is minute 20, minute 10 is the one point kept before it
        assert_eq!(buffer.first().unwrap().timestamp, t(10));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_retention_never_drops_below_two_points() {
        let mut buffer = TimeSeriesBuffer::with_retention(TimeDelta::minutes(1));
        buffer.append(TimedValue::new(t(0), 1.0), false);
        buffer.append(TimedValue::new(t(100), 2.0), false);
        buffer.append(TimedValue::new(t(200), 3.0), false);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.first().unwrap().timestamp, t(100));
    }

    #[test]
    fn test_retention_only_grows() {
        let mut buffer = TimeSeriesBuffer::with_retention(TimeDelta::hours(2));
        buffer.set_max_retention(TimeDelta::hours(1));
        assert_eq!(buffer.max_retention(), Some(TimeDelta::hours(2)));
        buffer.set_max_retention(TimeDelta::hours(3));
        assert_eq!(buffer.max_retention(), Some(TimeDelta::hours(3)));
    }

    // ========================================================================
    // Window queries
    // ========================================================================

    #[test]
    fn test_range_is_closed_interval() {
        let buffer = buffer_of(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]);
        let range = buffer.range(t(10), t(20));
        assert_eq!(range.len(), 2);
        assert_eq!(buffer.max(t(10), t(20)), Some(3.0));
        assert_eq!(buffer.min(t(10), t(20)), Some(2.0));
        assert_eq!(buffer.count(t(10), t(20)), 2);
    }

    #[test]
    fn test_empty_window_is_no_data() {
        let buffer = buffer_of(&[(0, 1.0), (10, 2.0)]);
        assert_eq!(buffer.average(t(20), t(30)), None);
        assert_eq!(buffer.max(t(20), t(30)), None);
        assert_eq!(buffer.sum(t(20), t(30)), None);
        assert_eq!(buffer.slope(t(20), t(30)), None);
        assert_eq!(buffer.std_dev(t(20), t(30)), None);
        assert_eq!(buffer.duration_above_zero(t(20), t(30)), None);
        assert_eq!(TimeSeriesBuffer::new().forecast(TimeDelta::hours(1)), None);
    }

    #[test]
    fn test_zero_is_not_no_data() {
        let buffer = buffer_of(&[(0, 0.0), (10, 0.0)]);
        assert_eq!(buffer.sum(t(0), t(10)), Some(0.0));
        assert_eq!(buffer.average(t(0), t(10)), Some(0.0));
    }

    #[test]
    fn test_time_weighted_average() {
        // 0 -> 10 over 10 minutes then flat at 10 for 30 minutes
        let buffer = buffer_of(&[(0, 0.0), (10, 10.0), (40, 10.0)]);
        let avg = buffer.average(t(0), t(40)).unwrap();
        assert!((avg - 8.75).abs() < 1e-9);
    }

    #[test]
    fn test_slope_per_second() {
        let buffer = buffer_of(&[(0, 0.0), (1, 60.0), (2, 120.0)]);
        let slope = buffer.slope(t(0), t(2)).unwrap();
        assert!((slope - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_std_dev_population() {
        let buffer = buffer_of(&[(0, 2.0), (1, 4.0), (2, 4.0), (3, 4.0), (4, 5.0), (5, 5.0), (6, 7.0), (7, 9.0)]);
        assert_eq!(buffer.std_dev(t(0), t(7)), Some(2.0));
    }

    #[test]
    fn test_duration_and_average_true() {
        let mut buffer = TimeSeriesBuffer::new();
        buffer.append(TimedValue::new(t(0), true), false);
        buffer.append(TimedValue::new(t(30), false), false);
        buffer.append(TimedValue::new(t(45), true), false);
        let duration = buffer.duration_above_zero(t(0), t(60)).unwrap();
        assert_eq!(duration, TimeDelta::minutes(45));
        let fraction = buffer.average_true(t(0), t(60)).unwrap();
        assert!((fraction - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_average_true_holds_value_from_before_window() {
        // A compressed steady true run: only its ends survive
        let mut buffer = TimeSeriesBuffer::new();
        buffer.append(TimedValue::new(t(10), true), false);
        buffer.append(TimedValue::new(t(160), true), false);
        buffer.append(TimedValue::new(t(170), false), false);
        buffer.append(TimedValue::new(t(180), false), false);

        let fraction = buffer.average_true(t(120), t(180)).unwrap();
        assert!((fraction - 50.0 / 60.0).abs() < 1e-9);
        assert_eq!(
            buffer.duration_above_zero(t(120), t(180)),
            Some(TimeDelta::minutes(50))
        );
    }

    #[test]
    fn test_forecast_extrapolates() {
        let buffer = buffer_of(&[(0, 0.0), (10, 10.0), (20, 20.0)]);
        let forecast = buffer.forecast(TimeDelta::minutes(10)).unwrap();
        assert!((forecast - 30.0).abs() < 1e-9);
        assert_eq!(buffer_of(&[(0, 4.0)]).forecast(TimeDelta::hours(1)), Some(4.0));
    }

    #[test]
    fn test_text_values_are_never_compressed() {
        let mut buffer = TimeSeriesBuffer::new();
        buffer.append(TimedValue::new(t(0), "on"), true);
        buffer.append(TimedValue::new(t(1), "on"), true);
        buffer.append(TimedValue::new(t(2), "on"), true);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.last_value(), Some(&SignalValue::Text("on".to_string())));
    }
}
