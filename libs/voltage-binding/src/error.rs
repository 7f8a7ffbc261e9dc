//! Binding Error Types

use thiserror::Error;

/// Result type for voltage-binding operations
pub type Result<T> = std::result::Result<T, BindError>;

/// Binding errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindError {
    /// Subject twin is not part of the graph handed to the binder
    #[error("Subject twin not in graph: {0}")]
    UnknownSubject(String),

    /// Expression could not be resolved against the graph
    #[error("Binding failed for {expression}: {reason}")]
    Failed { expression: String, reason: String },
}

// Helper methods
impl BindError {
    pub fn unknown_subject(id: impl Into<String>) -> Self {
        BindError::UnknownSubject(id.into())
    }

    pub fn failed(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        BindError::Failed {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}
