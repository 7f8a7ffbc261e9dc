//! Value evaluator
//!
//! Interprets a bound tree against an [`Env`] and an [`EvalContext`] that
//! supplies current signal values, windowed statistics and model inference.
//!
//! Evaluation never touches the environment; it only reads it. Invalid
//! values (stale signals, short history) are returned as
//! [`Value::Invalid`]; `Err` is reserved for trees that cannot be computed at
//! all (type mismatch, unbound nodes, unknown functions).

use crate::ast::{BinaryOp, Constant, Expr, TemporalOp, TwinRef, UnaryOp};
use crate::env::{Env, EnvEntry};
use crate::error::{CalcError, Result};
use crate::functions::{self, ArrayFunction};
use crate::value::{InvalidReason, Value};
use chrono::{DateTime, TimeDelta, Utc};

/// What a temporal operator reads history from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemporalTarget<'a> {
    /// Telemetry buffer of a capability twin
    Twin(&'a TwinRef),
    /// Buffer kept for a rule field or helper variable
    Variable(&'a str),
}

impl TemporalTarget<'_> {
    pub fn name(&self) -> &str {
        match self {
            TemporalTarget::Twin(twin) => &twin.id,
            TemporalTarget::Variable(name) => name,
        }
    }
}

/// A windowed statistic request
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalQuery<'a> {
    pub op: TemporalOp,
    pub target: TemporalTarget<'a>,
    /// Window start, `None` for pointwise ops
    pub start: Option<DateTime<Utc>>,
    /// Window end, `now + offset`
    pub end: DateTime<Utc>,
    pub window: Option<TimeDelta>,
}

/// Data the evaluator reads from the outside world
pub trait EvalContext {
    /// Reference time for temporal windows
    fn now(&self) -> DateTime<Utc>;

    /// Current value of a capability twin
    fn signal(&self, twin: &TwinRef) -> Value;

    /// Windowed statistic over buffered history
    fn temporal(&self, query: &TemporalQuery<'_>) -> Value;

    /// Call an external model, `None` when inference is unavailable
    fn invoke_model(&self, _model_id: &str, _inputs: &[Value]) -> Option<Value> {
        None
    }
}

pub struct Evaluator<'a, C: EvalContext + ?Sized> {
    ctx: &'a C,
    env: &'a Env,
}

impl<'a, C: EvalContext + ?Sized> Evaluator<'a, C> {
    pub fn new(ctx: &'a C, env: &'a Env) -> Self {
        Self { ctx, env }
    }

    /// Evaluate a bound tree
    pub fn evaluate(&self, expr: &Expr) -> Result<Value> {
        self.eval(expr, None)
    }

    fn eval(&self, expr: &Expr, tolerance: Option<f64>) -> Result<Value> {
        match expr {
            Expr::Constant(constant) => Ok(constant_value(constant)),
            Expr::Variable { name, .. } => self.variable(name, tolerance),
            Expr::Property { child, name } => Err(CalcError::Unbound(format!(
                "property {} of {} was not resolved",
                name, child
            ))),
            Expr::Twin(twin) => Ok(self.ctx.signal(twin)),
            Expr::Unary { op, child } => apply_unary(*op, self.eval(child, tolerance)?),
            Expr::Binary {
                op, left, right, ..
            } => self.binary(*op, left, right, tolerance),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => self.ternary(condition, then, otherwise, tolerance),
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| self.eval(item, tolerance))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Expr::Temporal {
                op,
                child,
                window,
                offset,
            } => self.temporal(*op, child, *window, *offset),
            Expr::Call { name, args } => self.call(name, args, tolerance),
            Expr::Failed { reason, inner } => {
                Err(CalcError::Unbound(format!("{}: {}", reason, inner)))
            },
        }
    }

    fn variable(&self, name: &str, tolerance: Option<f64>) -> Result<Value> {
        match self.env.get(name) {
            Some(EnvEntry::Value(value)) => Ok(value.clone()),
            Some(EnvEntry::Expr(expr)) => self.eval(expr, tolerance),
            None => Err(CalcError::variable_not_found(name)),
        }
    }

    fn binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        tolerance: Option<f64>,
    ) -> Result<Value> {
        let lhs = self.eval(left, tolerance)?;

        // Short-circuit only on a definite scalar answer
        match (op, &lhs) {
            (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
            (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
            _ => {},
        }

        let rhs = self.eval(right, tolerance)?;
        apply_binary(op, lhs, rhs)
    }

    fn ternary(
        &self,
        condition: &Expr,
        then: &Expr,
        otherwise: &Expr,
        tolerance: Option<f64>,
    ) -> Result<Value> {
        match self.eval(condition, tolerance)? {
            invalid @ Value::Invalid(_) => Ok(invalid),
            Value::Array(conditions) => {
                let then = self.eval(then, tolerance)?;
                let otherwise = self.eval(otherwise, tolerance)?;
                let picked = conditions
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| match c {
                        invalid @ Value::Invalid(_) => Ok(invalid),
                        c => {
                            let branch = if truthy(&c)? { &then } else { &otherwise };
                            Ok(element(branch, i))
                        },
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(picked))
            },
            c => {
                if truthy(&c)? {
                    self.eval(then, tolerance)
                } else {
                    self.eval(otherwise, tolerance)
                }
            },
        }
    }

    fn temporal(
        &self,
        op: TemporalOp,
        child: &Expr,
        window: Option<TimeDelta>,
        offset: TimeDelta,
    ) -> Result<Value> {
        let target = match child {
            Expr::Twin(twin) => TemporalTarget::Twin(twin),
            Expr::Variable { name, .. } => match self.env.expression(name) {
                Some(Expr::Twin(twin)) => TemporalTarget::Twin(twin),
                _ => TemporalTarget::Variable(name),
            },
            // An ambiguous binding yields one statistic per twin
            Expr::Array(items) => {
                return Ok(Value::Array(
                    items
                        .iter()
                        .map(|item| self.temporal(op, item, window, offset))
                        .collect::<Result<Vec<_>>>()?,
                ))
            },
            other => {
                return Err(CalcError::Unbound(format!(
                    "{} over {} needs a helper variable",
                    op.name(),
                    other
                )))
            },
        };

        let end = self.ctx.now() + offset;
        let query = TemporalQuery {
            op,
            target,
            start: window.map(|w| end - w),
            end,
            window,
        };
        Ok(self.ctx.temporal(&query))
    }

    fn call(&self, name: &str, args: &[Expr], tolerance: Option<f64>) -> Result<Value> {
        if let Some(function) = ArrayFunction::from_name(name) {
            return self.array_function(function, args, tolerance);
        }

        if let Some(math) = functions::unary_math(name) {
            let [arg] = args else {
                return Err(CalcError::function(format!("{} expects one argument", name)));
            };
            return map_numbers(self.eval(arg, tolerance)?, &|x| Ok(math(x)));
        }

        match name {
            "TOLERANCE" => {
                let [inner, fraction] = args else {
                    return Err(CalcError::function("TOLERANCE expects (expression, fraction)"));
                };
                let fraction = self
                    .eval(fraction, tolerance)?
                    .as_number()
                    .ok_or_else(|| CalcError::type_mismatch("TOLERANCE fraction must be numeric"))?;
                match self.eval(inner, Some(fraction))? {
                    Value::Array(items) => match filter_tolerated(items, Some(fraction)) {
                        Ok(valid) => Ok(Value::Array(valid)),
                        Err(invalid) => Ok(invalid),
                    },
                    other => Ok(other),
                }
            },
            "OPTION" | "TOLERANTOPTION" => {
                let mut first_invalid = None;
                for arg in args {
                    let value = self.eval(arg, tolerance)?;
                    if value.is_valid() {
                        return Ok(value);
                    }
                    first_invalid.get_or_insert(value);
                }
                first_invalid
                    .ok_or_else(|| CalcError::function(format!("{} expects arguments", name)))
            },
            "IFNAN" => {
                let [value, fallback] = args else {
                    return Err(CalcError::function("IFNAN expects (value, fallback)"));
                };
                let value = self.eval(value, tolerance)?;
                let is_nan = match &value {
                    Value::Number(n) => !n.is_finite(),
                    other => !other.is_valid(),
                };
                if is_nan {
                    self.eval(fallback, tolerance)
                } else {
                    Ok(value)
                }
            },
            "ROUND" => {
                let (value, digits) = match args {
                    [value] => (value, None),
                    [value, digits] => (value, Some(digits)),
                    _ => return Err(CalcError::function("ROUND expects (value[, digits])")),
                };
                let digits = match digits {
                    Some(d) => self
                        .eval(d, tolerance)?
                        .as_number()
                        .ok_or_else(|| CalcError::type_mismatch("ROUND digits must be numeric"))?
                        as i32,
                    None => 0,
                };
                map_numbers(self.eval(value, tolerance)?, &|x| {
                    Ok(functions::round(x, digits))
                })
            },
            "POW" => {
                let [base, exponent] = args else {
                    return Err(CalcError::function("POW expects (base, exponent)"));
                };
                apply_binary(
                    BinaryOp::Power,
                    self.eval(base, tolerance)?,
                    self.eval(exponent, tolerance)?,
                )
            },
            "MODEL" => {
                let Some((id, inputs)) = args.split_first() else {
                    return Err(CalcError::function("MODEL expects (modelId, inputs...)"));
                };
                let id = match self.eval(id, tolerance)? {
                    Value::Text(id) => id,
                    other => {
                        return Err(CalcError::type_mismatch(format!(
                            "MODEL id must be text, got {}",
                            other.type_name()
                        )))
                    },
                };
                let inputs = inputs
                    .iter()
                    .map(|arg| self.eval(arg, tolerance))
                    .collect::<Result<Vec<_>>>()?;
                if let Some(reason) = inputs.iter().find_map(Value::invalid_reason) {
                    return Ok(Value::Invalid(reason.clone()));
                }
                Ok(self
                    .ctx
                    .invoke_model(&id, &inputs)
                    .unwrap_or(Value::Invalid(InvalidReason::ModelUnavailable(id))))
            },
            _ => Err(CalcError::function(format!("Unknown function {}", name))),
        }
    }

    fn array_function(
        &self,
        function: ArrayFunction,
        args: &[Expr],
        tolerance: Option<f64>,
    ) -> Result<Value> {
        if function == ArrayFunction::Index {
            let [array, index] = args else {
                return Err(CalcError::function("INDEX expects (array, index)"));
            };
            let mut items = Vec::new();
            flatten(self.eval(array, tolerance)?, &mut items);
            let index = self
                .eval(index, tolerance)?
                .as_number()
                .ok_or_else(|| CalcError::type_mismatch("INDEX position must be numeric"))?;
            return Ok(usize::try_from(index as i64)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_else(|| {
                    Value::Invalid(InvalidReason::NoData(format!("INDEX {}", index)))
                }));
        }

        let mut elements = Vec::new();
        let mut dropped = None;
        for arg in args {
            match arg {
                // Alternatives that failed at runtime are simply left out
                Expr::Call { name, args: options } if name == "TOLERANTOPTION" => {
                    for option in options {
                        let mut values = Vec::new();
                        flatten(self.eval(option, tolerance)?, &mut values);
                        for value in values {
                            if value.is_valid() {
                                elements.push(value);
                            } else {
                                dropped.get_or_insert(value);
                            }
                        }
                    }
                },
                other => flatten(self.eval(other, tolerance)?, &mut elements),
            }
        }

        if elements.is_empty() {
            if let Some(invalid) = dropped {
                return Ok(invalid);
            }
        }

        let elements = match filter_tolerated(elements, tolerance) {
            Ok(valid) => valid,
            Err(invalid) => return Ok(invalid),
        };

        let numbers = elements
            .iter()
            .map(|v| {
                v.as_number().ok_or_else(|| {
                    CalcError::type_mismatch(format!(
                        "{} expects numbers, got {}",
                        function.name(),
                        v.type_name()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let result = function.aggregate(&numbers);
        Ok(match (function, result) {
            (ArrayFunction::All | ArrayFunction::Any, Some(r)) => Value::Bool(r != 0.0),
            (ArrayFunction::All | ArrayFunction::Any, None) => Value::Bool(false),
            (ArrayFunction::First | ArrayFunction::Last, Some(_)) => {
                let picked = if function == ArrayFunction::First {
                    elements.first()
                } else {
                    elements.last()
                };
                picked.cloned().unwrap_or(Value::Number(0.0))
            },
            (_, Some(r)) => Value::Number(r),
            (_, None) => Value::Invalid(InvalidReason::NoData(function.name().to_string())),
        })
    }
}

// ============================================================================
// Value arithmetic
// ============================================================================

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Number(n) => Value::Number(*n),
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Text(s) => Value::Text(s.clone()),
        Constant::Null => Value::Invalid(InvalidReason::NoData("NULL".to_string())),
    }
}

fn truthy(value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| {
        CalcError::type_mismatch(format!("expected a condition, got {}", value.type_name()))
    })
}

/// Element `i` of an array, or the value itself when it is a scalar
fn element(value: &Value, i: usize) -> Value {
    match value {
        Value::Array(items) => items.get(i).cloned().unwrap_or_else(|| {
            Value::Invalid(InvalidReason::NoData(format!("element {}", i)))
        }),
        scalar => scalar.clone(),
    }
}

fn flatten(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        },
        other => out.push(other),
    }
}

/// Drop invalid elements when their share is within tolerance
///
/// `Err` carries the first invalid element when the set is rejected.
fn filter_tolerated(
    values: Vec<Value>,
    tolerance: Option<f64>,
) -> std::result::Result<Vec<Value>, Value> {
    let invalid = values.iter().filter(|v| !v.is_valid()).count();
    if invalid == 0 {
        return Ok(values);
    }
    let allowed = match tolerance {
        Some(fraction) => invalid < values.len() && invalid as f64 <= fraction * values.len() as f64,
        None => false,
    };
    if allowed {
        Ok(values.into_iter().filter(Value::is_valid).collect())
    } else {
        Err(values
            .into_iter()
            .find(|v| !v.is_valid())
            .unwrap_or(Value::Invalid(InvalidReason::NoData("tolerance".to_string()))))
    }
}

fn map_numbers(value: Value, f: &dyn Fn(f64) -> Result<f64>) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| map_numbers(item, f))
                .collect::<Result<Vec<_>>>()?,
        )),
        invalid @ Value::Invalid(_) => Ok(invalid),
        other => {
            let n = other.as_number().ok_or_else(|| {
                CalcError::type_mismatch(format!("expected a number, got {}", other.type_name()))
            })?;
            Ok(Value::Number(f(n)?))
        },
    }
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| apply_unary(op, item))
                .collect::<Result<Vec<_>>>()?,
        )),
        invalid @ Value::Invalid(_) => Ok(invalid),
        other => match op {
            UnaryOp::Negate => map_numbers(other, &|x| Ok(-x)),
            UnaryOp::Not => Ok(Value::Bool(!truthy(&other)?)),
        },
    }
}

fn apply_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    match (lhs, rhs) {
        (invalid @ Value::Invalid(_), _) | (_, invalid @ Value::Invalid(_)) => Ok(invalid),
        (Value::Array(left), Value::Array(right)) => {
            if left.len() != right.len() {
                return Err(CalcError::type_mismatch(format!(
                    "cannot combine arrays of length {} and {}",
                    left.len(),
                    right.len()
                )));
            }
            Ok(Value::Array(
                left.into_iter()
                    .zip(right)
                    .map(|(l, r)| apply_binary(op, l, r))
                    .collect::<Result<Vec<_>>>()?,
            ))
        },
        (Value::Array(left), r) => Ok(Value::Array(
            left.into_iter()
                .map(|l| apply_binary(op, l, r.clone()))
                .collect::<Result<Vec<_>>>()?,
        )),
        (l, Value::Array(right)) => Ok(Value::Array(
            right
                .into_iter()
                .map(|r| apply_binary(op, l.clone(), r))
                .collect::<Result<Vec<_>>>()?,
        )),
        (l, r) => apply_scalar(op, l, r),
    }
}

fn apply_scalar(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    if let (Value::Text(l), Value::Text(r)) = (&lhs, &rhs) {
        return match op {
            BinaryOp::Equal => Ok(Value::Bool(l == r)),
            BinaryOp::NotEqual => Ok(Value::Bool(l != r)),
            BinaryOp::Add => Ok(Value::Text(format!("{}{}", l, r))),
            _ => Err(CalcError::type_mismatch(format!(
                "operator {} is not defined for text",
                op.symbol()
            ))),
        };
    }

    let (Some(l), Some(r)) = (lhs.as_number(), rhs.as_number()) else {
        return Err(CalcError::type_mismatch(format!(
            "operator {} cannot combine {} and {}",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        )));
    };

    let value = match op {
        BinaryOp::Add => Value::Number(l + r),
        BinaryOp::Subtract => Value::Number(l - r),
        BinaryOp::Multiply => Value::Number(l * r),
        BinaryOp::Divide | BinaryOp::Modulo if r == 0.0 => {
            return Err(CalcError::evaluation("Division by zero"))
        },
        BinaryOp::Divide => Value::Number(l / r),
        BinaryOp::Modulo => Value::Number(l % r),
        BinaryOp::Power => Value::Number(l.powf(r)),
        BinaryOp::Equal => Value::Bool(l == r),
        BinaryOp::NotEqual => Value::Bool(l != r),
        BinaryOp::Less => Value::Bool(l < r),
        BinaryOp::LessOrEqual => Value::Bool(l <= r),
        BinaryOp::Greater => Value::Bool(l > r),
        BinaryOp::GreaterOrEqual => Value::Bool(l >= r),
        BinaryOp::And => Value::Bool(l != 0.0 && r != 0.0),
        BinaryOp::Or => Value::Bool(l != 0.0 || r != 0.0),
    };
    Ok(value)
}
