//! Error types for voltage-calc

use thiserror::Error;

/// Expression errors
///
/// Invalid data (stale signal, short history) is not an error; it is carried
/// as [`crate::Value::Invalid`]. These variants cover malformed text and
/// expressions that blow up while computing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("Parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Function error: {0}")]
    Function(String),

    #[error("Expression is not bound: {0}")]
    Unbound(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),
}

impl CalcError {
    pub fn parse(position: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: msg.into(),
        }
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }

    pub fn function(msg: impl Into<String>) -> Self {
        Self::Function(msg.into())
    }

    pub fn variable_not_found(name: impl Into<String>) -> Self {
        Self::VariableNotFound(name.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CalcError>;
