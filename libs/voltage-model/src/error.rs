//! Model Layer Error Types

use thiserror::Error;

/// Result type for voltage-model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model layer errors
#[derive(Debug, Error, Clone)]
pub enum ModelError {
    /// Twin not present in the graph
    #[error("Unknown twin: {0}")]
    UnknownTwin(String),

    /// Graph service could not produce a graph
    #[error("Graph service error: {0}")]
    GraphService(String),

    /// Malformed graph or ontology document
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        ModelError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::InvalidDocument(err.to_string())
    }
}

// Helper methods
impl ModelError {
    pub fn unknown_twin(id: impl Into<String>) -> Self {
        ModelError::UnknownTwin(id.into())
    }

    pub fn graph_service(msg: impl Into<String>) -> Self {
        ModelError::GraphService(msg.into())
    }
}
