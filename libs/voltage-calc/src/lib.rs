//! voltage-calc - Expression language for VoltageEMS rules
//!
//! Provides the expression tree, a visitor framework for rewriting it, a text
//! parser, a scoped environment and the value evaluator used by rule
//! templates.
//!
//! # Features
//!
//! - **Expression tree**: immutable nodes with canonical text rendering
//! - **Visitors**: reconstructing defaults plus a monotonic success flag
//! - **Evaluation**: array broadcasting, tolerance of partially invalid inputs
//!   and temporal statistics through an [`EvalContext`]
//!
//! # Example
//!
//! ```rust
//! use voltage_calc::{parse, Env, EvalContext, Evaluator, TemporalQuery, TwinRef, Value};
//! use chrono::{DateTime, Utc};
//!
//! struct Now;
//!
//! impl EvalContext for Now {
//!     fn now(&self) -> DateTime<Utc> {
//!         Utc::now()
//!     }
//!     fn signal(&self, _twin: &TwinRef) -> Value {
//!         Value::Number(21.5)
//!     }
//!     fn temporal(&self, _query: &TemporalQuery<'_>) -> Value {
//!         Value::Number(0.0)
//!     }
//! }
//!
//! let mut env = Env::new();
//! env.assign_value("setpoint", 20.0);
//!
//! let expr = parse("ABS(setpoint - 22.5) > 2").unwrap();
//! let value = Evaluator::new(&Now, &env).evaluate(&expr).unwrap();
//! assert_eq!(value, Value::Bool(true));
//! ```
//!
//! # Built-in Functions
//!
//! ## Temporal (window is a duration literal, optional offset looks back)
//!
//! | Function | Signature | Description |
//! |----------|-----------|-------------|
//! | `AVERAGE` `MIN` `MAX` `SUM` `COUNT` | `OP(x, 1h[, -1d])` | Windowed statistic |
//! | `SLOPE` | `SLOPE(x, 1h)` | Least-squares rate of change per second |
//! | `STND` | `STND(x, 1h)` | Standard deviation |
//! | `FORECAST` | `FORECAST(x, 1h)` | Linear projection one window ahead |
//! | `DURATION` | `DURATION(x, 1d)` | Hours spent above zero |
//! | `PERCENTTRUE` | `PERCENTTRUE(x, 1d)` | Fraction of the window spent true |
//! | `DELTA` `DELTA_TIME` | `DELTA(x)` | Change / seconds between the last two points |
//!
//! ## Arrays
//!
//! | Function | Signature | Description |
//! |----------|-----------|-------------|
//! | `COUNT` `SUM` `AVERAGE` `MAX` `MIN` | `OP(a, b, {c, d})` | Aggregate over flattened arguments |
//! | `ALL` `ANY` | `ALL({a, b})` | Boolean reduction |
//! | `FIRST` `LAST` `INDEX` | `INDEX(arr, i)` | Element access |
//! | `TOLERANCE` | `TOLERANCE(expr, 0.25)` | Allow a fraction of invalid elements |
//!
//! ## Scalars
//!
//! | Function | Signature | Description |
//! |----------|-----------|-------------|
//! | `ABS` `SQRT` `FLOOR` `CEILING` | `ABS(x)` | Math |
//! | `ROUND` | `ROUND(x[, digits])` | Round to decimals |
//! | `POW` | `POW(x, y)` | Power |
//! | `IF` | `IF(c, a, b)` | Same as `c ? a : b` |
//! | `IFNAN` | `IFNAN(x, fallback)` | Fallback for invalid or non-finite values |
//! | `MODEL` | `MODEL("id", inputs...)` | External model inference |

pub mod ast;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod keys;
pub mod parser;
pub mod units;
pub mod value;
pub mod visitor;

// Re-exports for convenience
pub use ast::{format_duration, BinaryOp, Constant, Expr, TemporalOp, TwinRef, UnaryOp};
pub use env::{Env, EnvEntry, Macro};
pub use error::{CalcError, Result};
pub use evaluator::{EvalContext, Evaluator, TemporalQuery, TemporalTarget};
pub use functions::{takes_arrays, ArrayFunction};
pub use keys::{helper_key, is_helper, HelperVariable, HelperVariables};
pub use parser::parse;
pub use units::{Conversion, Unit};
pub use value::{InvalidReason, Value};
pub use visitor::{transform, ReplaceVariable, SuccessFlag, Visitor};
