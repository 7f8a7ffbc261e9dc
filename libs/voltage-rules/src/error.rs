//! Rule Engine Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule or rule instance not found
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Rule definition cannot be used as written
    #[error("Invalid rule definition: {0}")]
    InvalidDefinition(String),

    /// Expression could not be resolved against the twin graph
    #[error("Binding failed: {0}")]
    Binding(String),

    /// Expression raised an error while computing
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Telemetry sink error
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for RuleError {
    fn from(err: std::io::Error) -> Self {
        RuleError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RuleError {
    fn from(err: serde_yaml::Error) -> Self {
        RuleError::Serialization(err.to_string())
    }
}

impl From<voltage_rtdb::RtdbError> for RuleError {
    fn from(err: voltage_rtdb::RtdbError) -> Self {
        RuleError::Sink(err.to_string())
    }
}

impl From<voltage_binding::BindError> for RuleError {
    fn from(err: voltage_binding::BindError) -> Self {
        RuleError::Binding(err.to_string())
    }
}

impl From<voltage_calc::CalcError> for RuleError {
    fn from(err: voltage_calc::CalcError) -> Self {
        match err {
            voltage_calc::CalcError::Parse { .. } => RuleError::InvalidDefinition(err.to_string()),
            other => RuleError::Evaluation(other.to_string()),
        }
    }
}

impl From<voltage_model::ModelError> for RuleError {
    fn from(err: voltage_model::ModelError) -> Self {
        RuleError::Config(err.to_string())
    }
}

// Helper methods
impl RuleError {
    pub fn not_found(id: impl Into<String>) -> Self {
        RuleError::NotFound(id.into())
    }

    pub fn invalid_definition(msg: impl Into<String>) -> Self {
        RuleError::InvalidDefinition(msg.into())
    }
}
