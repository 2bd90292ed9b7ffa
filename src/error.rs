//! Engine Error Types
//!
//! The error taxonomy surfaced by the run engine. Every variant maps to one
//! HTTP-style outcome so callers (CLI or an HTTP front-end) can translate
//! failures without inspecting message text.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors produced while loading, driving, or signalling a workflow run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No run exists with the given identifier
    #[error("workflow run not found: {0}")]
    NotFound(String),

    /// Another resume currently holds the run's lock
    #[error("workflow run {0} is already running")]
    LockContention(String),

    /// The external command did not finish before its deadline
    #[error("step {step_index} timed out after {timeout:?}")]
    StepTimeout { step_index: usize, timeout: Duration },

    /// The external command could not be started
    #[error("step {step_index} could not be started: {message}")]
    StepSpawnFailure { step_index: usize, message: String },

    /// Non-zero exit, structured step error, or exhausted retries
    #[error("step {step_index} failed: {message}")]
    StepFatal { step_index: usize, message: String },

    /// The stored record moved since it was loaded
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Non-JSON output where JSON was expected (downgraded to a warning)
    #[error("malformed step output: {0}")]
    MalformedOutput(String),

    /// Argument vector or timeout rejected before spawning
    #[error("invalid command invocation: {0}")]
    InvalidInvocation(String),

    /// Caller-side mistake: bad decision, missing note, wrong run state
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A trace entry arrived out of order or duplicated an index
    #[error("trace order violation: {0}")]
    TraceOrder(String),

    /// Step sequence failed validation
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage backend failure other than not-found or conflict
    #[error("storage error: {0}")]
    Storage(String),

    /// Unexpected failure while driving a run (panic, lost worker)
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP-style status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::LockContention(_) | Self::StoreConflict(_) => 409,
            Self::InvalidRequest(_) | Self::InvalidDefinition(_) | Self::InvalidInvocation(_) => {
                400
            }
            Self::StepTimeout { .. }
            | Self::StepSpawnFailure { .. }
            | Self::StepFatal { .. }
            | Self::MalformedOutput(_) => 502,
            _ => 500,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict(msg) => Self::StoreConflict(msg),
            StoreError::OutOfOrder(msg) => Self::TraceOrder(msg),
            StoreError::InvalidId(id) => Self::InvalidRequest(format!("invalid run id '{}'", id)),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::NotFound("run-1".to_string());
        assert_eq!(err.to_string(), "workflow run not found: run-1");

        let err = EngineError::StepTimeout {
            step_index: 2,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "step 2 timed out after 30s");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::LockContention("x".into()).http_status(), 409);
        assert_eq!(EngineError::StoreConflict("x".into()).http_status(), 409);
        assert_eq!(EngineError::InvalidRequest("x".into()).http_status(), 400);
        assert_eq!(
            EngineError::StepFatal {
                step_index: 0,
                message: "boom".into()
            }
            .http_status(),
            502
        );
        assert_eq!(EngineError::Storage("disk".into()).http_status(), 500);
        assert_eq!(EngineError::Internal("panic".into()).http_status(), 500);
    }


    #[test]
    fn test_from_store_error() {
        let err: EngineError = StoreError::NotFound("r".into()).into();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err: EngineError = StoreError::Conflict("moved".into()).into();
        assert!(matches!(err, EngineError::StoreConflict(_)));

        let err: EngineError = StoreError::Backend("down".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
