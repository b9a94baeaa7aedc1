//! Error types for bizlens.

use serde::Serialize;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LensError>;

/// Errors produced by the pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum LensError {
    /// The caller asked for something the registry cannot serve.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The row-store could not run the query.
    #[error("Query execution failed: {0}")]
    Execution(String),

    /// The analysis workflow call failed. Never surfaced to pipeline callers.
    #[error("Enrichment failed: {0}")]
    Enrichment(String),

    /// Configuration or registry file problem.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for LensError {
    fn from(err: sqlx::Error) -> Self {
        LensError::Execution(err.to_string())
    }
}

impl LensError {
    /// Classification reported in a failed [`crate::pipeline::PipelineResponse`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            LensError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::ExecutionFailure,
        }
    }
}

/// Client-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown query identifier or malformed parameters.
    InvalidRequest,
    /// Row-store connection or execution error.
    ExecutionFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            LensError::InvalidRequest("x".into()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            LensError::Execution("x".into()).kind(),
            ErrorKind::ExecutionFailure
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ExecutionFailure).unwrap();
        assert_eq!(json, r#""execution_failure""#);
    }

    #[test]
    fn test_display_messages() {
        let err = LensError::InvalidRequest("unknown query 'x'".into());
        assert_eq!(err.to_string(), "Invalid request: unknown query 'x'");
    }
}
