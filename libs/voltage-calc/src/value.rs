//! Runtime values

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a value could not be produced
///
/// Invalid values are data, not errors: they flow through arithmetic and
/// aggregation until a rule decides what to do with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvalidReason {
    /// A capability has no usable current value
    MissingCapability(String),
    /// Buffered history does not cover the requested window
    TemporalRange { variable: String, window: String },
    /// An aggregate had nothing to aggregate
    NoData(String),
    /// An external model could not be called
    ModelUnavailable(String),
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::MissingCapability(name) => {
                write!(f, "Capability {} has no valid value", name)
            },
            InvalidReason::TemporalRange { variable, window } => {
                write!(f, "Insufficient history for {} over {}", variable, window)
            },
            InvalidReason::NoData(what) => write!(f, "No data for {}", what),
            InvalidReason::ModelUnavailable(id) => write!(f, "Model {} is unavailable", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
    Array(Vec<Value>),
    Invalid(InvalidReason),
}

impl Value {
    /// Numeric view, booleans count as 1 and 0
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Truth view, non-zero numbers are true
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0 && !n.is_nan()),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// False for invalid values and arrays holding any
    pub fn is_valid(&self) -> bool {
        match self {
            Value::Invalid(_) => false,
            Value::Array(items) => items.iter().all(Value::is_valid),
            _ => true,
        }
    }

    pub fn invalid_reason(&self) -> Option<&InvalidReason> {
        match self {
            Value::Invalid(reason) => Some(reason),
            Value::Array(items) => items.iter().find_map(Value::invalid_reason),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Invalid(_) => "invalid",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            },
            Value::Invalid(reason) => write!(f, "<invalid: {}>", reason),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}
