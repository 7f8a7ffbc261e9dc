//! Built-in functions
//!
//! Scalar math helpers and the array aggregate table. Names are matched
//! upper case; the parser uppercases every call name.

/// Functions that consume whole arrays instead of being folded over them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayFunction {
    Count,
    Sum,
    Average,
    Max,
    Min,
    All,
    Any,
    First,
    Last,
    Index,
}

impl ArrayFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name {
            "COUNT" => ArrayFunction::Count,
            "SUM" => ArrayFunction::Sum,
            "AVERAGE" => ArrayFunction::Average,
            "MAX" => ArrayFunction::Max,
            "MIN" => ArrayFunction::Min,
            "ALL" => ArrayFunction::All,
            "ANY" => ArrayFunction::Any,
            "FIRST" => ArrayFunction::First,
            "LAST" => ArrayFunction::Last,
            "INDEX" => ArrayFunction::Index,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArrayFunction::Count => "COUNT",
            ArrayFunction::Sum => "SUM",
            ArrayFunction::Average => "AVERAGE",
            ArrayFunction::Max => "MAX",
            ArrayFunction::Min => "MIN",
            ArrayFunction::All => "ALL",
            ArrayFunction::Any => "ANY",
            ArrayFunction::First => "FIRST",
            ArrayFunction::Last => "LAST",
            ArrayFunction::Index => "INDEX",
        }
    }

    /// Aggregate numbers, `None` when the input is empty
    pub fn aggregate(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return match self {
                ArrayFunction::Count | ArrayFunction::Sum => Some(0.0),
                _ => None,
            };
        }
        match self {
            ArrayFunction::Count => Some(values.len() as f64),
            ArrayFunction::Sum => Some(values.iter().sum()),
            ArrayFunction::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
            ArrayFunction::Max => values.iter().copied().reduce(f64::max),
            ArrayFunction::Min => values.iter().copied().reduce(f64::min),
            ArrayFunction::All => Some(bool_to_f64(values.iter().all(|v| *v != 0.0))),
            ArrayFunction::Any => Some(bool_to_f64(values.iter().any(|v| *v != 0.0))),
            ArrayFunction::First => values.first().copied(),
            ArrayFunction::Last => values.last().copied(),
            ArrayFunction::Index => None,
        }
    }
}

/// Calls the binder must not fold over array arguments
pub fn takes_arrays(name: &str) -> bool {
    ArrayFunction::from_name(name).is_some()
        || matches!(
            name,
            "OPTION" | "TOLERANTOPTION" | "TOLERANCE" | "EXISTS" | "COUNT_BINDINGS" | "EACH" | "IS"
        )
}

fn bool_to_f64(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Round to specified decimal places
pub fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

/// Single-argument numeric function by name
pub fn unary_math(name: &str) -> Option<fn(f64) -> f64> {
    let f: fn(f64) -> f64 = match name {
        "ABS" => f64::abs,
        "SQRT" => f64::sqrt,
        "FLOOR" => f64::floor,
        "CEILING" => f64::ceil,
        _ => return None,
    };
    Some(f)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_round() {
        assert_eq!(round(1.23456, 2), 1.23);
        assert_eq!(round(2.5, 0), 3.0);
    }

    #[test]
    fn test_aggregate_empty_input() {
        assert_eq!(ArrayFunction::Count.aggregate(&[]), Some(0.0));
        assert_eq!(ArrayFunction::Sum.aggregate(&[]), Some(0.0));
        assert_eq!(ArrayFunction::Average.aggregate(&[]), None);
        assert_eq!(ArrayFunction::Max.aggregate(&[]), None);
    }

    #[test]
    fn test_aggregate_values() {
        let values = [3.0, 1.0, 2.0];
        assert_eq!(ArrayFunction::Average.aggregate(&values), Some(2.0));
        assert_eq!(ArrayFunction::Max.aggregate(&values), Some(3.0));
        assert_eq!(ArrayFunction::Min.aggregate(&values), Some(1.0));
        assert_eq!(ArrayFunction::First.aggregate(&values), Some(3.0));
        assert_eq!(ArrayFunction::Last.aggregate(&values), Some(2.0));
        assert_eq!(ArrayFunction::All.aggregate(&[1.0, 0.0]), Some(0.0));
        assert_eq!(ArrayFunction::Any.aggregate(&[1.0, 0.0]), Some(1.0));
    }

    #[test]
    fn test_takes_arrays() {
        assert!(takes_arrays("AVERAGE"));
        assert!(takes_arrays("OPTION"));
        assert!(!takes_arrays("ABS"));
    }
}
