//! Template statistics
//!
//! Each template reduces the buffered result series over the rule window to
//! one statistic, then decides the fault flag against its thresholds with
//! hysteresis.

use crate::definition::Template;
use chrono::{DateTime, TimeDelta, Utc};
use voltage_rtdb::{TimeSeriesBuffer, TimedValue};

/// Outcome of reducing the result series
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Not enough history; `faulted` is set when a fault is declared early
    Insufficient { text: String, faulted: bool },
    /// A fault decision, with the statistic that drove it
    Decided {
        faulted: bool,
        statistic: Option<f64>,
    },
}

/// Fault flag with separate trigger and reset thresholds
///
/// Once faulted the flag only clears when the statistic drops below
/// `reset`; while healthy it is only raised at `threshold`. `strict`
/// compares with `>` instead of `>=`.
pub fn apply_hysteresis(
    was_faulted: bool,
    statistic: f64,
    threshold: f64,
    reset: f64,
    strict: bool,
) -> bool {
    let limit = if was_faulted { reset.min(threshold) } else { threshold };
    if strict {
        statistic > limit
    } else {
        statistic >= limit
    }
}

/// Reduce the result buffer and decide the fault flag
pub fn decide(
    template: &Template,
    result: &TimeSeriesBuffer,
    now: DateTime<Utc>,
    window: TimeDelta,
    was_faulted: bool,
) -> Decision {
    let start = now - window;
    let statistic = match template {
        Template::Calculated => {
            return Decision::Decided {
                faulted: false,
                statistic: None,
            }
        },
        Template::Fault { .. } => result.average_true(start, now).unwrap_or(0.0),
        Template::Limit { low, high, .. } => area_outside(result, start, now, *low, *high),
        Template::Frequency { .. } => rising_edges(result, start, now) as f64,
        Template::StuckSensor { .. } => hours_unchanged(result, now),
    };

    let Some((threshold, reset)) = template.thresholds() else {
        return Decision::Decided {
            faulted: false,
            statistic: Some(statistic),
        };
    };
    let strict = matches!(template, Template::Frequency { .. });

    if template.needs_full_window() {
        let have = result.first().map_or(TimeDelta::zero(), |p| now - p.timestamp);
        if have < window {
            let mut text = format!(
                "Insufficient data: need {:.1}h have {:.1}h",
                hours(window),
                hours(have)
            );
            let early = matches!(template, Template::Frequency { early_exit: true, .. })
                && statistic > threshold;
            if early {
                text.push_str(&format!(
                    ". Result rose {} times, more than {}",
                    statistic, threshold
                ));
            }
            return Decision::Insufficient {
                text,
                faulted: early,
            };
        }
    }

    Decision::Decided {
        faulted: apply_hysteresis(was_faulted, statistic, threshold, reset, strict),
        statistic: Some(statistic),
    }
}

fn hours(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 3_600_000.0
}

/// Points in the window preceded by the last point before it, if any
fn with_leading(buffer: &TimeSeriesBuffer, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&TimedValue> {
    let points = buffer.points();
    let lo = points.partition_point(|p| p.timestamp < start);
    let leading = lo.checked_sub(1).and_then(|i| points.get(i));
    leading
        .into_iter()
        .chain(buffer.range(start, end).iter())
        .collect()
}

/// Area outside `[low, high]` in value-hours, each point held until the next
pub fn area_outside(
    buffer: &TimeSeriesBuffer,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    low: Option<f64>,
    high: Option<f64>,
) -> f64 {
    let points = with_leading(buffer, start, end);
    let mut area = 0.0;
    for (i, point) in points.iter().enumerate() {
        let Some(value) = point.value.as_number() else {
            continue;
        };
        let from = point.timestamp.max(start);
        let until = points.get(i + 1).map_or(end, |next| next.timestamp);
        if until <= from {
            continue;
        }
        let excess = high.map_or(0.0, |h| (value - h).max(0.0)) + low.map_or(0.0, |l| (l - value).max(0.0));
        area += excess * hours(until - from);
    }
    area
}

/// Transitions from not-positive to positive within the window
///
/// The last point before the window decides whether the first point in it
/// is a rise.
pub fn rising_edges(buffer: &TimeSeriesBuffer, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
    let points = with_leading(buffer, start, end);
    let mut previous: Option<bool> = None;
    let mut count = 0;
    for point in points {
        let Some(value) = point.value.as_number() else {
            continue;
        };
        let on = value > 0.0;
        if on && previous == Some(false) {
            count += 1;
        }
        previous = Some(on);
    }
    count
}

/// Hours since the series last changed value
pub fn hours_unchanged(buffer: &TimeSeriesBuffer, now: DateTime<Utc>) -> f64 {
    let points = buffer.points();
    let Some(last) = points.last() else {
        return 0.0;
    };
    let since = points
        .iter()
        .rev()
        .take_while(|p| p.value == last.value)
        .last()
        .map_or(last.timestamp, |p| p.timestamp);
    hours(now - since)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn t(hours: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::hours(hours)
    }

    fn buffer(points: &[(i64, f64)]) -> TimeSeriesBuffer {
        let mut buffer = TimeSeriesBuffer::new();
        for (h, v) in points {
            buffer.append(TimedValue::new(t(*h), *v), false);
        }
        buffer
    }

    #[test]
    fn test_hysteresis_holds_between_thresholds() {
        let mut faulted = false;
        let mut seen = Vec::new();
        for statistic in [0.6, 0.3, 0.1] {
            faulted = apply_hysteresis(faulted, statistic, 0.5, 0.2, false);
            seen.push(faulted);
        }
        assert_eq!(seen, vec![true, true, false]);
    }

    #[test]
    fn test_hysteresis_strict_comparison() {
        assert!(!apply_hysteresis(false, 3.0, 3.0, 3.0, true));
        assert!(apply_hysteresis(false, 4.0, 3.0, 3.0, true));
        assert!(apply_hysteresis(false, 3.0, 3.0, 3.0, false));
    }

    #[test]
    fn test_area_outside_step_hold() {
        // 30 for two hours above a high limit of 25, then back inside
        let buffer = buffer(&[(0, 20.0), (1, 30.0), (3, 24.0)]);
        let area = area_outside(&buffer, t(0), t(4), None, Some(25.0));
        assert!((area - 10.0).abs() < 1e-9);

        let area = area_outside(&buffer, t(0), t(4), Some(22.0), Some(25.0));
        assert!((area - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_area_outside_clips_leading_point() {
        let buffer = buffer(&[(0, 30.0), (4, 20.0)]);
        let area = area_outside(&buffer, t(2), t(5), None, Some(25.0));
        assert!((area - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rising_edges_uses_point_before_window() {
        let buffer = buffer(&[(0, 0.0), (1, 1.0), (2, 0.0), (3, 1.0), (4, 1.0)]);
        assert_eq!(rising_edges(&buffer, t(0), t(4)), 2);
        // The rise at hour 1 is seen through the point at hour 0
        assert_eq!(rising_edges(&buffer, t(1), t(4)), 2);
        assert_eq!(rising_edges(&buffer, t(2), t(4)), 1);
    }

    #[test]
    fn test_hours_unchanged() {
        let buffer = buffer(&[(0, 1.0), (2, 5.0), (3, 5.0), (5, 5.0)]);
        assert_eq!(hours_unchanged(&buffer, t(6)), 4.0);
        assert_eq!(hours_unchanged(&TimeSeriesBuffer::new(), t(6)), 0.0);
    }

    #[test]
    fn test_fault_needs_covered_window() {
        let template = Template::Fault {
            threshold: 0.5,
            reset: None,
        };
        let buffer = buffer(&[(0, 1.0), (2, 1.0)]);
        let decision = decide(&template, &buffer, t(4), TimeDelta::hours(6), false);
        assert_eq!(
            decision,
            Decision::Insufficient {
                text: "Insufficient data: need 6.0h have 4.0h".to_string(),
                faulted: false,
            }
        );

        let decision = decide(&template, &buffer, t(4), TimeDelta::hours(4), false);
        assert_eq!(
            decision,
            Decision::Decided {
                faulted: true,
                statistic: Some(1.0),
            }
        );
    }

    #[test]
    fn test_stuck_sensor_decides_without_full_window() {
        let template = Template::StuckSensor {
            threshold_hours: 4.0,
        };
        let buffer = buffer(&[(0, 7.0), (5, 7.0)]);
        let decision = decide(&template, &buffer, t(5), TimeDelta::hours(24), false);
        assert_eq!(
            decision,
            Decision::Decided {
                faulted: true,
                statistic: Some(5.0),
            }
        );
    }
}
