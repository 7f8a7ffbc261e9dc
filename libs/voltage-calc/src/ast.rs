//! Expression tree
//!
//! Every rewrite produces a new tree; nodes are never mutated in place.
//! `Display` renders the canonical text form, which the parser accepts back
//! and which helper-variable keys are hashed from.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Leaves
// ============================================================================

/// Literal value
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
}

/// Reference to a twin in the asset graph, as it appears in a bound tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwinRef {
    /// Twin identifier
    pub id: String,
    /// Model (type) identifier
    pub model_id: String,
    /// Signal the twin produces, when it is a capability
    #[serde(default)]
    pub signal_id: Option<String>,
    /// Declared unit of the signal
    #[serde(default)]
    pub unit: Option<String>,
}

impl TwinRef {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            signal_id: None,
            unit: None,
        }
    }

    /// Key used to look the twin's telemetry up in a time-series store
    pub fn signal_key(&self) -> &str {
        self.signal_id.as_deref().unwrap_or(&self.id)
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Power => "^",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }

    /// Binding strength, higher binds tighter
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Equal | BinaryOp::NotEqual => 3,
            BinaryOp::Less
            | BinaryOp::LessOrEqual
            | BinaryOp::Greater
            | BinaryOp::GreaterOrEqual => 4,
            BinaryOp::Add | BinaryOp::Subtract => 5,
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => 6,
            BinaryOp::Power => 7,
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Aggregation over a trailing window of a buffered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalOp {
    Average,
    Min,
    Max,
    Sum,
    Count,
    Slope,
    StdDev,
    /// Window is the horizon to project forward
    Forecast,
    /// Hours the value spent above zero
    Duration,
    /// Fraction of the window the value was true
    PercentTrue,
    /// Difference between the last two points
    Delta,
    /// Seconds between the last two points
    DeltaTime,
}

impl TemporalOp {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name.to_ascii_uppercase().as_str() {
            "AVERAGE" => TemporalOp::Average,
            "MIN" => TemporalOp::Min,
            "MAX" => TemporalOp::Max,
            "SUM" => TemporalOp::Sum,
            "COUNT" => TemporalOp::Count,
            "SLOPE" => TemporalOp::Slope,
            "STND" => TemporalOp::StdDev,
            "FORECAST" => TemporalOp::Forecast,
            "DURATION" => TemporalOp::Duration,
            "PERCENTTRUE" => TemporalOp::PercentTrue,
            "DELTA" => TemporalOp::Delta,
            "DELTA_TIME" => TemporalOp::DeltaTime,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TemporalOp::Average => "AVERAGE",
            TemporalOp::Min => "MIN",
            TemporalOp::Max => "MAX",
            TemporalOp::Sum => "SUM",
            TemporalOp::Count => "COUNT",
            TemporalOp::Slope => "SLOPE",
            TemporalOp::StdDev => "STND",
            TemporalOp::Forecast => "FORECAST",
            TemporalOp::Duration => "DURATION",
            TemporalOp::PercentTrue => "PERCENTTRUE",
            TemporalOp::Delta => "DELTA",
            TemporalOp::DeltaTime => "DELTA_TIME",
        }
    }

    /// Ops that only look at the last two points and take no window
    pub fn is_pointwise(&self) -> bool {
        matches!(self, TemporalOp::Delta | TemporalOp::DeltaTime)
    }

    /// Ops whose result is in the unit of the underlying signal
    pub fn keeps_unit(&self) -> bool {
        matches!(
            self,
            TemporalOp::Average
                | TemporalOp::Min
                | TemporalOp::Max
                | TemporalOp::Sum
                | TemporalOp::Forecast
                | TemporalOp::StdDev
                | TemporalOp::Delta
        )
    }
}

// ============================================================================
// Expression node
// ============================================================================

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Constant),
    Variable {
        name: String,
        unit: Option<String>,
    },
    Property {
        child: Box<Expr>,
        name: String,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        child: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        /// Set when a rewrite knows the unit of the result (unit conversions)
        unit: Option<String>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Array(Vec<Expr>),
    Temporal {
        op: TemporalOp,
        child: Box<Expr>,
        window: Option<TimeDelta>,
        /// Shift of the reference time, negative looks into the past
        offset: TimeDelta,
    },
    Twin(TwinRef),
    Failed {
        reason: String,
        inner: Box<Expr>,
    },
}

impl Expr {
    pub fn number(value: f64) -> Self {
        Expr::Constant(Constant::Number(value))
    }

    pub fn boolean(value: bool) -> Self {
        Expr::Constant(Constant::Bool(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Expr::Constant(Constant::Text(value.into()))
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable {
            name: name.into(),
            unit: None,
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn unary(op: UnaryOp, child: Expr) -> Self {
        Expr::Unary {
            op,
            child: Box::new(child),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            unit: None,
        }
    }

    pub fn ternary(condition: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn failed(reason: impl Into<String>, inner: Expr) -> Self {
        Expr::Failed {
            reason: reason.into(),
            inner: Box::new(inner),
        }
    }

    /// Attach a unit to a rewritten arithmetic node
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        match self {
            Expr::Binary {
                op, left, right, ..
            } => Expr::Binary {
                op,
                left,
                right,
                unit: Some(unit.into()),
            },
            other => other,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant(_))
    }

    /// Declared unit of the value this node produces, if known
    pub fn unit(&self) -> Option<&str> {
        match self {
            Expr::Twin(twin) => twin.unit.as_deref(),
            Expr::Variable { unit, .. } => unit.as_deref(),
            Expr::Binary {
                unit: Some(unit), ..
            } => Some(unit),
            Expr::Binary {
                op: BinaryOp::Add | BinaryOp::Subtract,
                left,
                right,
                ..
            } => left.unit().or_else(|| right.unit()),
            Expr::Unary {
                op: UnaryOp::Negate,
                child,
            } => child.unit(),
            Expr::Temporal { op, child, .. } if op.keeps_unit() => child.unit(),
            _ => None,
        }
    }

    /// Immediate children in evaluation order
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Constant(_) | Expr::Variable { .. } | Expr::Twin(_) => Vec::new(),
            Expr::Property { child, .. }
            | Expr::Unary { child, .. }
            | Expr::Temporal { child, .. } => vec![child],
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Array(items) => items.iter().collect(),
            Expr::Binary { left, right, .. } => vec![left, right],
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => vec![condition, then, otherwise],
            Expr::Failed { inner, .. } => vec![inner],
        }
    }

    /// First failure reason anywhere in the tree
    pub fn first_failure(&self) -> Option<&str> {
        if let Expr::Failed { reason, .. } = self {
            return Some(reason);
        }
        self.children().into_iter().find_map(Expr::first_failure)
    }

    pub fn contains_failure(&self) -> bool {
        self.first_failure().is_some()
    }

    /// All twins referenced by the tree, depth first, without duplicates
    pub fn twins(&self) -> Vec<&TwinRef> {
        let mut found: Vec<&TwinRef> = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Expr::Twin(twin) = node {
                if !found.iter().any(|t| t.id == twin.id) {
                    found.push(twin);
                }
            }
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
        found
    }

    /// All variable names referenced by the tree
    pub fn variables(&self) -> Vec<&str> {
        let mut found: Vec<&str> = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Expr::Variable { name, .. } = node {
                if !found.contains(&name.as_str()) {
                    found.push(name);
                }
            }
            stack.extend(node.children());
        }
        found
    }
}

// ============================================================================
// Canonical text
// ============================================================================

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn write_identifier(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if is_plain_identifier(name) {
        write!(f, "{}", name)
    } else {
        write!(f, "[{}]", name)
    }
}

fn write_number(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        write!(f, "{}", value as i64)
    } else {
        write!(f, "{}", value)
    }
}

/// Render a duration with the largest unit that divides it exactly
pub fn format_duration(duration: TimeDelta) -> String {
    let seconds = duration.num_seconds();
    let sign = if seconds < 0 { "-" } else { "" };
    let seconds = seconds.abs();
    let (value, unit) = if seconds == 0 {
        (0, "s")
    } else if seconds % 604_800 == 0 {
        (seconds / 604_800, "w")
    } else if seconds % 86_400 == 0 {
        (seconds / 86_400, "d")
    } else if seconds % 3_600 == 0 {
        (seconds / 3_600, "h")
    } else if seconds % 60 == 0 {
        (seconds / 60, "m")
    } else {
        (seconds, "s")
    };
    format!("{}{}{}", sign, value, unit)
}

/// Wrap operands that bind looser than a binary operator
fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::Binary { .. } | Expr::Ternary { .. } => write!(f, "({})", expr),
        _ => write!(f, "{}", expr),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Number(n) => write_number(f, *n),
            Constant::Bool(true) => write!(f, "TRUE"),
            Constant::Bool(false) => write!(f, "FALSE"),
            Constant::Text(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Constant::Null => write!(f, "NULL"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(c) => write!(f, "{}", c),
            Expr::Variable { name, .. } => write_identifier(f, name),
            Expr::Property { child, name } => {
                write_operand(f, child)?;
                write!(f, ".")?;
                write_identifier(f, name)
            },
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            },
            Expr::Unary { op, child } => {
                match op {
                    UnaryOp::Negate => write!(f, "-")?,
                    UnaryOp::Not => write!(f, "!")?,
                }
                write_operand(f, child)
            },
            Expr::Binary {
                op, left, right, ..
            } => {
                write_operand(f, left)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right)
            },
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => write!(f, "IF({}, {}, {})", condition, then, otherwise),
            Expr::Array(items) => {
                write!(f, "{{")?;
                write_list(f, items)?;
                write!(f, "}}")
            },
            Expr::Temporal {
                op,
                child,
                window,
                offset,
            } => {
                write!(f, "{}({}", op.name(), child)?;
                if let Some(window) = window {
                    write!(f, ", {}", format_duration(*window))?;
                }
                if !offset.is_zero() {
                    write!(f, ", {}", format_duration(*offset))?;
                }
                write!(f, ")")
            },
            Expr::Twin(twin) => write!(f, "[{}]", twin.id),
            Expr::Failed { inner, .. } => write!(f, "FAILED({})", inner),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_display_wraps_nested_binary() {
        let expr = Expr::binary(
            BinaryOp::Multiply,
            Expr::binary(BinaryOp::Add, Expr::variable("a"), Expr::number(1.0)),
            Expr::variable("Zone Air Temp"),
        );
        assert_eq!(expr.to_string(), "(a + 1) * [Zone Air Temp]");
    }

    #[test]
    fn test_display_temporal_with_offset() {
        let expr = Expr::Temporal {
            op: TemporalOp::Max,
            child: Box::new(Expr::variable("x")),
            window: Some(TimeDelta::hours(2)),
            offset: TimeDelta::days(-1),
        };
        assert_eq!(expr.to_string(), "MAX(x, 2h, -1d)");
    }

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(TimeDelta::minutes(90)), "90m");
        assert_eq!(format_duration(TimeDelta::weeks(1)), "1w");
        assert_eq!(format_duration(TimeDelta::seconds(45)), "45s");
    }

    #[test]
    fn test_first_failure_is_found_deep() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::number(1.0),
            Expr::call(
                "ABS",
                vec![Expr::failed("No twin matches found", Expr::variable("x"))],
            ),
        );
        assert_eq!(expr.first_failure(), Some("No twin matches found"));
        assert!(!Expr::number(1.0).contains_failure());
    }

    #[test]
    fn test_unit_follows_arithmetic() {
        let mut twin = TwinRef::new("sensor-1", "dtmi:com:x:TempSensor;1");
        twin.unit = Some("degF".to_string());
        let expr = Expr::binary(BinaryOp::Add, Expr::Twin(twin), Expr::number(1.0));
        assert_eq!(expr.unit(), Some("degF"));

        let scaled = Expr::binary(BinaryOp::Multiply, Expr::number(2.0), Expr::number(1.0))
            .with_unit("degC");
        assert_eq!(scaled.unit(), Some("degC"));
    }

    #[test]
    fn test_twins_are_deduplicated() {
        let twin = TwinRef::new("sensor-1", "dtmi:com:x:TempSensor;1");
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::Twin(twin.clone()),
            Expr::Twin(twin),
        );
        assert_eq!(expr.twins().len(), 1);
    }
}
