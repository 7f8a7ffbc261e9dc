//! Error types for voltage-rtdb

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtdbError {
    #[error("Telemetry sink closed")]
    SinkClosed,

    #[error("Telemetry sink write timed out after {0}ms")]
    SinkTimeout(u64),

    #[error("Telemetry sink rejected write: {0}")]
    SinkRejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RtdbError {
    /// Timeouts are expected under load and retried by the caller's next emission
    pub fn is_timeout(&self) -> bool {
        matches!(self, RtdbError::SinkTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, RtdbError>;

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_sink_timeout_error() {
        let err = RtdbError::SinkTimeout(100);
        assert_eq!(err.to_string(), "Telemetry sink write timed out after 100ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_sink_rejected_error() {
        let err = RtdbError::SinkRejected("bad signal id".to_string());
        assert_eq!(err.to_string(), "Telemetry sink rejected write: bad signal id");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_from_anyhow_error() {
        let anyhow_err = anyhow::anyhow!("test error");
        let rtdb_err: RtdbError = anyhow_err.into();
        assert!(matches!(rtdb_err, RtdbError::Other(_)));
        assert!(rtdb_err.to_string().contains("test error"));
    }
}
