//! Rule tick
//!
//! One evaluation of one rule instance. The tick takes the previous actor
//! state by value and returns the next one:
//!
//! ```text
//! reserved vars -> input checks -> helpers + fields -> template decision
//!      -> TIME -> impact scores (sink) -> triggers -> output point
//! ```
//!
//! Any failed step records a not-ready output point with a diagnostic and
//! ends the tick; the previous fault decision is kept.

use crate::binding::{BoundExpression, BoundField, BoundRule, Capability};
use crate::definition::{CumulativeMode, RESULT_FIELD};
use crate::state::ActorState;
use crate::template::{decide, Decision};
use chrono::{DateTime, TimeDelta, Timelike, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use voltage_calc::{
    format_duration, CalcError, Env, EnvEntry, EvalContext, Evaluator, Expr, InvalidReason,
    TemporalOp, TemporalQuery, TemporalTarget, TwinRef, Value,
};
use voltage_rtdb::{
    MemoryTimeSeriesStore, SignalValue, SinkRecord, SinkWriter, TimeSeries, TimeSeriesBuffer,
    TimedValue,
};

/// Names listed per diagnostic
pub const MAX_DIAGNOSTICS: usize = 10;

/// Score written when an impact has no usable value
pub const ALMOST_ZERO: f64 = 1e-10;

/// Internal accumulator of time the result spent true, in seconds
pub const TIME_KEY: &str = "TIME";

/// External model inference, used by `MODEL(...)`
pub trait ModelInvoker: Send + Sync {
    fn invoke(&self, model_id: &str, inputs: &[Value]) -> Option<Value>;
}

/// What a tick reads from and writes to outside the actor state
#[derive(Clone, Copy)]
pub struct TriggerDependencies<'a> {
    pub store: &'a MemoryTimeSeriesStore,
    pub sink: Option<&'a SinkWriter>,
    pub models: Option<&'a dyn ModelInvoker>,
    /// How old the newest point of an input may be
    pub max_staleness: TimeDelta,
}

/// Run one tick of `rule` at `now`
pub async fn trigger(
    now: DateTime<Utc>,
    env: Env,
    rule: &BoundRule,
    state: ActorState,
    deps: &TriggerDependencies<'_>,
) -> ActorState {
    let mut tick = Tick {
        now,
        rule,
        deps,
        env,
        state,
    };
    tick.run().await;
    tick.state
}

/// Why a tick stopped before a decision
#[derive(Debug)]
enum Failure {
    /// An input had no usable value
    Capability,
    TemporalRange(String),
    NoData(String),
    Invalid(String),
    Evaluation {
        id: String,
        source: String,
        error: CalcError,
    },
}

impl Failure {
    fn from_reason(reason: &InvalidReason) -> Self {
        match reason {
            InvalidReason::MissingCapability(_) => Failure::Capability,
            InvalidReason::TemporalRange { .. } => Failure::TemporalRange(reason.to_string()),
            InvalidReason::NoData(_) => Failure::NoData(reason.to_string()),
            InvalidReason::ModelUnavailable(_) => Failure::Invalid(reason.to_string()),
        }
    }
}

type Step<T> = std::result::Result<T, Failure>;

struct Tick<'a> {
    now: DateTime<Utc>,
    rule: &'a BoundRule,
    deps: &'a TriggerDependencies<'a>,
    env: Env,
    state: ActorState,
}

impl Tick<'_> {
    async fn run(&mut self) {
        self.assign_reserved();

        let rule = self.rule;
        let required: Vec<&Capability> = rule.required().collect();
        if let Some(text) = self.invalid_inputs(&required) {
            self.state.invalid_value(self.now, text);
            return;
        }
        if let Some(text) = self.missing_inputs(&required) {
            self.state.missing_value(self.now, text);
            return;
        }

        if let Err(failure) = self.calculate_fields() {
            self.handle_failure(failure);
            return;
        }

        let faulted = match self.decide() {
            Decision::Insufficient { text, faulted } => {
                self.state.insufficient_data(self.now, text, faulted);
                return;
            },
            Decision::Decided { faulted, statistic } => {
                if let (Some(name), Some(value)) =
                    (self.rule.rule.template.statistic_name(), statistic)
                {
                    self.env.assign_value(name, value);
                }
                faulted
            },
        };

        self.accumulate_time();

        if let Err(failure) = self.calculate_impacts().await {
            self.handle_failure(failure);
            return;
        }
        if let Err(failure) = self.calculate_triggers() {
            self.handle_failure(failure);
            return;
        }

        self.state.valid_output(self.now, faulted);
    }

    // ========================================================================
    // Environment
    // ========================================================================

    fn assign_reserved(&mut self) {
        let now = self.now;
        self.env.assign_value("NOW", now.timestamp() as f64);
        self.env
            .assign_value("LAST_TRIGGER_TIME", self.state.timestamp.timestamp() as f64);

        let (delta, faulty) = self
            .state
            .output()
            .last()
            .map_or((0.0, false), |p| (seconds(now - p.end), p.faulted));
        self.env.assign_value("IS_FAULTY", faulty);
        self.env.assign_value("DELTA_TIME_S", delta);

        let time = self
            .state
            .last_value(TIME_KEY)
            .and_then(SignalValue::as_number)
            .unwrap_or(0.0);
        self.env.assign_value(TIME_KEY, time);

        for name in ["PERCENTAGE_FAULTED", "AREA_OUTSIDE", "COUNT", "STUCK_HOURS"] {
            self.env
                .assign_value(name, Value::Invalid(InvalidReason::NoData(name.to_string())));
        }

        // Previous values, so expressions can read fields computed later in the tick
        let rule = self.rule;
        for field in rule.fields.iter().chain(rule.impacts.iter()) {
            let previous = self.previous_value(&field.id);
            self.env.assign_value(field.id.clone(), previous);
        }
    }

    fn previous_value(&self, key: &str) -> Value {
        self.state
            .last_value(key)
            .map_or_else(|| Value::Invalid(InvalidReason::NoData(key.to_string())), to_value)
    }

    // ========================================================================
    // Input checks
    // ========================================================================

    /// Diagnostic for inputs flagged out of range
    fn invalid_inputs(&self, capabilities: &[&Capability]) -> Option<String> {
        let mut entries = Vec::new();
        for capability in capabilities {
            let Some(series) = self.deps.store.get(capability.twin.signal_key()) else {
                continue;
            };
            let series = series.read();
            if series.status().value_out_of_range {
                entries.push(format!(
                    "'{}' {}: {}",
                    series.status(),
                    capability.name,
                    capability.twin.id
                ));
            }
            if entries.len() >= MAX_DIAGNOSTICS {
                break;
            }
        }
        diagnostic("Invalid value", "Invalid values", entries)
    }

    /// Diagnostic for inputs that never reported, are empty or are stale
    fn missing_inputs(&self, capabilities: &[&Capability]) -> Option<String> {
        let store = self.deps.store;
        let mut entries = Vec::new();
        for capability in capabilities {
            let seen = match store.get(capability.twin.signal_key()) {
                None => Some(format!("never ({})", store.len())),
                Some(series) => {
                    let series = series.read();
                    match series.buffer().last() {
                        None => Some("empty".to_string()),
                        Some(_) if series.is_timely(self.now, self.deps.max_staleness) => None,
                        Some(last) => Some(format!(
                            "{:.1} min ago",
                            seconds(self.now - last.timestamp) / 60.0
                        )),
                    }
                },
            };
            if let Some(seen) = seen {
                entries.push(format!("{} {}", capability.name, seen));
            }
            if entries.len() >= MAX_DIAGNOSTICS {
                break;
            }
        }
        diagnostic("Missing value", "Missing values", entries)
    }

    fn is_usable(&self, twin: &TwinRef) -> bool {
        self.deps.store.get(twin.signal_key()).is_some_and(|series| {
            let series = series.read();
            !series.status().value_out_of_range
                && !series.buffer().is_empty()
                && series.is_timely(self.now, self.deps.max_staleness)
        })
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    fn evaluate(&self, id: &str, source: &str, expr: &Expr) -> Step<Value> {
        let context = TickContext {
            now: self.now,
            store: self.deps.store,
            buffers: self.state.buffers(),
            models: self.deps.models,
            max_staleness: self.deps.max_staleness,
        };
        Evaluator::new(&context, &self.env)
            .evaluate(expr)
            .map_err(|error| Failure::Evaluation {
                id: id.to_string(),
                source: source.to_string(),
                error,
            })
    }

    /// Compute helper variables, buffering scalar results
    fn calculate_helpers(&mut self, id: &str, bound: &BoundExpression) -> Step<()> {
        for helper in &bound.helpers {
            let previous = self.previous_value(&helper.key);
            self.env.assign_value(helper.key.clone(), previous);

            let source = helper.expression.to_string();
            let value = self.evaluate(id, &source, &helper.expression)?;
            check_valid(&value)?;
            let value = match scalar_point(self.now, &value) {
                Some(point) => self
                    .state
                    .extend(&helper.key, point, CumulativeMode::Simple, self.rule.retention)
                    .map_or(value, |v| to_value(&v)),
                None => value,
            };
            self.env.assign_value(helper.key.clone(), value);
        }
        Ok(())
    }

    fn calculate_fields(&mut self) -> Step<()> {
        let rule = self.rule;
        for field in &rule.fields {
            self.calculate_helpers(&field.id, &field.bound)?;

            if let Some(twin) = field.alias().filter(|_| field.id != RESULT_FIELD) {
                if !self.is_usable(twin) {
                    return Err(Failure::Capability);
                }
                self.env
                    .assign(field.id.clone(), EnvEntry::Expr(Expr::Twin(twin.clone())));
                continue;
            }

            let value = self.evaluate(&field.id, &field.source, &field.bound.expr)?;
            check_valid(&value)?;
            let value = self.buffer_field(field, value)?;
            self.env.assign_value(field.id.clone(), value);
        }
        Ok(())
    }

    /// Buffer a computed field value, returns what the environment should see
    fn buffer_field(&mut self, field: &BoundField, value: Value) -> Step<Value> {
        let is_result = field.id == RESULT_FIELD;
        if is_result {
            match &value {
                Value::Array(items) => {
                    return Err(Failure::Invalid(format!(
                        "Result is an array of {} values, use ALL, ANY or an aggregate",
                        items.len()
                    )))
                },
                Value::Number(n) if !n.is_finite() => {
                    return Err(Failure::Invalid(format!("Result is not finite: {}", n)))
                },
                _ => {},
            }
        }
        if !field.buffered {
            return Ok(value);
        }

        let point = match (&value, field.cumulative.is_simple()) {
            (Value::Bool(b), false) => Some(TimedValue::new(self.now, if *b { 1.0 } else { 0.0 })),
            _ => scalar_point(self.now, &value),
        };
        let Some(point) = point else {
            return Ok(value);
        };
        if is_result {
            if let Some(on) = value.as_bool() {
                self.state.record_result_edge(self.now, on);
            }
        }
        Ok(self
            .state
            .extend(&field.id, point, field.cumulative, self.rule.retention)
            .map_or(value, |v| to_value(&v)))
    }

    fn decide(&self) -> Decision {
        let definition = &self.rule.rule;
        let empty = TimeSeriesBuffer::new();
        let result = self.state.buffer(RESULT_FIELD).unwrap_or(&empty);
        decide(
            &definition.template,
            result,
            self.now,
            definition.window(),
            self.state.faulted(),
        )
    }

    /// Add the time since the previous result point while the result is true
    fn accumulate_time(&mut self) {
        let Some(result) = self.state.buffer(RESULT_FIELD) else {
            return;
        };
        let on = matches!(result.last_value(), Some(SignalValue::Bool(true)));
        let gap = seconds(result.last_gap());
        let time = if on && result.len() > 1 {
            self.state
                .accumulate(TIME_KEY, self.now, gap, self.rule.retention)
        } else {
            self.state
                .last_value(TIME_KEY)
                .and_then(SignalValue::as_number)
                .unwrap_or(0.0)
        };
        self.env.assign_value(TIME_KEY, time);
    }

    // ========================================================================
    // Impact scores
    // ========================================================================

    async fn calculate_impacts(&mut self) -> Step<()> {
        let rule = self.rule;
        for impact in &rule.impacts {
            self.calculate_helpers(&impact.id, &impact.bound)?;

            let (last, previous) = last_two(self.state.buffer(&impact.id));
            let value = self.evaluate(&impact.id, &impact.source, &impact.bound.expr)?;
            let score = value
                .as_number()
                .filter(|n| n.is_finite() && *n != 0.0)
                .unwrap_or(ALMOST_ZERO);

            let point = TimedValue::new(self.now, score);
            let score = self
                .state
                .extend(&impact.id, point, CumulativeMode::Simple, rule.retention)
                .and_then(|v| v.as_number())
                .unwrap_or(score);

            if let Some(last) = last {
                let (_, committed) = last_two(self.state.buffer(&impact.id));
                if self.now.date_naive() > last.timestamp.date_naive() {
                    // Forced once per day, changed or not
                    self.emit(impact, &TimedValue::new(self.now, score)).await;
                } else if self.now - floor_hour(last.timestamp) >= TimeDelta::hours(1)
                    && committed != previous
                {
                    if let Some(committed) = committed {
                        self.emit(impact, &committed).await;
                    }
                }
            }

            self.env.assign_value(impact.id.clone(), score);
        }
        Ok(())
    }

    async fn emit(&self, impact: &BoundField, point: &TimedValue) {
        let Some(sink) = self.deps.sink else {
            return;
        };
        let instance = &self.rule.instance;
        let record = SinkRecord::new(
            format!("{}_{}", instance.id, impact.id),
            point.timestamp,
            point.numeric(),
        )
        .with_source("rule_id", instance.rule_id.clone())
        .with_source("rule_instance_id", instance.id.clone())
        .with_source("score", impact.name.clone());

        match sink.write_with_timeout(record).await {
            Ok(()) => debug!(instance_id = %instance.id, score = %impact.id, "Impact score sent"),
            Err(e) if e.is_timeout() => {
                warn!(instance_id = %instance.id, score = %impact.id, "Impact score write timed out, skipped")
            },
            Err(e) => {
                warn!(instance_id = %instance.id, score = %impact.id, error = %e, "Impact score write failed")
            },
        }
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    fn calculate_triggers(&mut self) -> Step<()> {
        let rule = self.rule;
        for trigger in &rule.triggers {
            self.calculate_helpers(&trigger.id, &trigger.condition)?;
            self.calculate_helpers(&trigger.id, &trigger.value)?;

            let source = trigger.condition.expr.to_string();
            let condition = self.evaluate(&trigger.id, &source, &trigger.condition.expr)?;
            check_valid(&condition)?;
            let source = trigger.value.expr.to_string();
            let value = self.evaluate(&trigger.id, &source, &trigger.value.expr)?;
            check_valid(&value)?;

            let triggered = matches!(condition, Value::Bool(true));
            if let Some(value) = value.as_number().filter(|v| v.is_finite()) {
                self.state
                    .with_trigger(&trigger.id, self.now, triggered, value);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Failures
    // ========================================================================

    fn handle_failure(&mut self, failure: Failure) {
        let now = self.now;
        match failure {
            Failure::Capability => {
                // Re-check every input, tolerant ones included, to name the culprit
                let rule = self.rule;
                let all: Vec<&Capability> = rule.capabilities.iter().collect();
                if let Some(text) = self.invalid_inputs(&all) {
                    self.state.invalid_value(now, text);
                } else if let Some(text) = self.missing_inputs(&all) {
                    self.state.missing_value(now, text);
                } else {
                    self.state
                        .invalid_output(now, "Capability has no valid value", false);
                }
            },
            Failure::TemporalRange(reason) => self
                .state
                .insufficient_range(now, format!("Insufficient data range: {}", reason)),
            Failure::NoData(reason) => {
                self.state
                    .insufficient_data(now, format!("Insufficient data: {}", reason), false)
            },
            Failure::Invalid(reason) => self.state.invalid_output(now, reason, false),
            Failure::Evaluation { id, source, error } => {
                error!(
                    rule_id = %self.rule.rule.id,
                    instance_id = %self.rule.instance.id,
                    field_id = %id,
                    expression = %source,
                    error = %error,
                    "Rule evaluation failed"
                );
                let faulted = self.state.faulted();
                self.state
                    .invalid_output(now, format!("{}: {}", id, error), faulted);
            },
        }
    }
}

fn diagnostic(one: &str, many: &str, entries: Vec<String>) -> Option<String> {
    match entries.len() {
        0 => None,
        1 => Some(format!("{}: {}", one, entries[0])),
        _ => Some(format!("{}: {}", many, entries.join(", "))),
    }
}

fn check_valid(value: &Value) -> Step<()> {
    match value.invalid_reason() {
        Some(reason) => Err(Failure::from_reason(reason)),
        None => Ok(()),
    }
}

fn scalar_point(now: DateTime<Utc>, value: &Value) -> Option<TimedValue> {
    match value {
        Value::Number(n) if n.is_finite() => Some(TimedValue::new(now, *n)),
        Value::Bool(b) => Some(TimedValue::new(now, *b)),
        Value::Text(s) => Some(TimedValue::new(now, s.as_str())),
        _ => None,
    }
}

fn to_value(value: &SignalValue) -> Value {
    match value {
        SignalValue::Number(n) => Value::Number(*n),
        SignalValue::Bool(b) => Value::Bool(*b),
        SignalValue::Text(s) => Value::Text(s.clone()),
    }
}

fn last_two(buffer: Option<&TimeSeriesBuffer>) -> (Option<TimedValue>, Option<TimedValue>) {
    let Some(points) = buffer.map(TimeSeriesBuffer::points) else {
        return (None, None);
    };
    let n = points.len();
    let last = points.last().cloned();
    let previous = n.checked_sub(2).and_then(|i| points.get(i)).cloned();
    (last, previous)
}

fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

// ============================================================================
// Evaluation context
// ============================================================================

/// Signal values and history as seen by one tick
///
/// Twins whose signal is out of range or stale read as a missing capability,
/// so tolerant aggregates drop them and everything else fails the tick.
struct TickContext<'a> {
    now: DateTime<Utc>,
    store: &'a MemoryTimeSeriesStore,
    buffers: &'a BTreeMap<String, TimeSeriesBuffer>,
    models: Option<&'a dyn ModelInvoker>,
    max_staleness: TimeDelta,
}

impl TickContext<'_> {
    fn is_trusted(&self, series: &TimeSeries) -> bool {
        !series.status().value_out_of_range && series.is_timely(self.now, self.max_staleness)
    }
}

impl EvalContext for TickContext<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn signal(&self, twin: &TwinRef) -> Value {
        let missing = || Value::Invalid(InvalidReason::MissingCapability(twin.id.clone()));
        let Some(series) = self.store.get(twin.signal_key()) else {
            return missing();
        };
        let series = series.read();
        if !self.is_trusted(&series) {
            return missing();
        }
        series.buffer().last_value().map_or_else(missing, to_value)
    }

    fn temporal(&self, query: &TemporalQuery<'_>) -> Value {
        match query.target {
            TemporalTarget::Twin(twin) => match self.store.get(twin.signal_key()) {
                Some(series) => {
                    let series = series.read();
                    if self.is_trusted(&series) {
                        statistic(series.buffer(), query)
                    } else {
                        Value::Invalid(InvalidReason::MissingCapability(twin.id.clone()))
                    }
                },
                None => Value::Invalid(InvalidReason::MissingCapability(twin.id.clone())),
            },
            TemporalTarget::Variable(name) => match self.buffers.get(name) {
                Some(buffer) => statistic(buffer, query),
                None => Value::Invalid(InvalidReason::NoData(name.to_string())),
            },
        }
    }

    fn invoke_model(&self, model_id: &str, inputs: &[Value]) -> Option<Value> {
        self.models.and_then(|m| m.invoke(model_id, inputs))
    }
}

/// Windowed or pointwise statistic over one buffer
fn statistic(buffer: &TimeSeriesBuffer, query: &TemporalQuery<'_>) -> Value {
    let name = query.target.name();
    let no_data = || Value::Invalid(InvalidReason::NoData(name.to_string()));
    let number = |v: Option<f64>| v.map_or_else(no_data, Value::Number);

    match query.op {
        TemporalOp::Delta => return number(buffer.last_delta()),
        TemporalOp::DeltaTime => return number(buffer.last_delta_time()),
        _ => {},
    }

    let (Some(start), Some(window)) = (query.start, query.window) else {
        return no_data();
    };
    let Some(first) = buffer.first() else {
        return no_data();
    };
    if first.timestamp > start {
        return Value::Invalid(InvalidReason::TemporalRange {
            variable: name.to_string(),
            window: format_duration(window),
        });
    }

    let end = query.end;
    match query.op {
        TemporalOp::Average => number(buffer.average(start, end)),
        TemporalOp::Min => number(buffer.min(start, end)),
        TemporalOp::Max => number(buffer.max(start, end)),
        TemporalOp::Sum => number(buffer.sum(start, end)),
        TemporalOp::Count => Value::Number(buffer.count(start, end) as f64),
        TemporalOp::Slope => number(buffer.slope(start, end)),
        TemporalOp::StdDev => number(buffer.std_dev(start, end)),
        TemporalOp::Forecast => number(buffer.forecast(window)),
        TemporalOp::Duration => number(
            buffer
                .duration_above_zero(start, end)
                .map(|d| seconds(d) / 3600.0),
        ),
        TemporalOp::PercentTrue => number(buffer.average_true(start, end)),
        TemporalOp::Delta | TemporalOp::DeltaTime => no_data(),
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
    fn test_diagnostic_wording() {
        assert_eq!(diagnostic("Missing value", "Missing values", vec![]), None);
        assert_eq!(
            diagnostic("Missing value", "Missing values", vec!["SAT never (0)".into()]).unwrap(),
            "Missing value: SAT never (0)"
        );
        assert_eq!(
            diagnostic(
                "Missing value",
                "Missing values",
                vec!["SAT empty".into(), "RAT never (1)".into()]
            )
            .unwrap(),
            "Missing values: SAT empty, RAT never (1)"
        );
    }

    #[test]
    fn test_floor_hour() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:42:17Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(floor_hour(ts).to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_statistic_reports_short_history() {
        let mut buffer = TimeSeriesBuffer::new();
        buffer.append(TimedValue::new(t(0), 1.0), false);
        buffer.append(TimedValue::new(t(30), 3.0), false);

        let query = TemporalQuery {
            op: TemporalOp::Max,
            target: TemporalTarget::Variable("sat"),
            start: Some(t(-30)),
            end: t(30),
            window: Some(TimeDelta::hours(1)),
        };
        assert_eq!(
            statistic(&buffer, &query),
            Value::Invalid(InvalidReason::TemporalRange {
                variable: "sat".into(),
                window: format_duration(TimeDelta::hours(1)),
            })
        );

        let query = TemporalQuery {
            start: Some(t(0)),
            window: Some(TimeDelta::minutes(30)),
            ..query
        };
        assert_eq!(statistic(&buffer, &query), Value::Number(3.0));
    }

    #[test]
    fn test_statistic_pointwise_delta() {
        let mut buffer = TimeSeriesBuffer::new();
        buffer.append(TimedValue::new(t(0), 1.0), false);
        buffer.append(TimedValue::new(t(1), 4.0), false);
        let query = TemporalQuery {
            op: TemporalOp::Delta,
            target: TemporalTarget::Variable("x"),
            start: None,
            end: t(1),
            window: None,
        };
        assert_eq!(statistic(&buffer, &query), Value::Number(3.0));
    }
}
