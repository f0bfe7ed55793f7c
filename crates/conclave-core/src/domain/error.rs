//! Domain-level error taxonomy for Conclave.

use std::fmt;

use conclave_state::{Phase, StateError, StorageError};

/// Per-agent failure. Always captured into `AgentResponse::error`, never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("timeout")]
    Timeout,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no adapter registered for integration type {0}")]
    NoAdapter(String),

    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("`{command}` exited with status {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("no provider client registered for {0}")]
    UnknownProvider(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    #[error("agent task panicked: {0}")]
    Panicked(String),
}

/// Conclave domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ConclaveError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("judge output rejected: {0}")]
    JudgeParse(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("phase {phase} failed: {reason}")]
    PhaseFatal { phase: Phase, reason: String },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ConclaveError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ConclaveError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConclaveError::NotFound { .. })
    }
}

impl From<StorageError> for ConclaveError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => ConclaveError::NotFound { kind, id },
            other => ConclaveError::Storage(other),
        }
    }
}

impl From<StateError> for ConclaveError {
    fn from(err: StateError) -> Self {
        ConclaveError::Storage(err.into())
    }
}

/// Result type for Conclave domain operations.
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Why a run ended in `Failed`. Rendered into `AgentRun::failure_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The run-level deadline elapsed during `phase`.
    Timeout { phase: Phase, limit_ms: u64 },
    /// Verification kept failing until the retry budget ran out.
    RetriesExhausted { attempts: u32 },
    /// Every agent in the phase returned an error.
    ZeroCandidates { phase: Phase, attempted: usize },
    /// The plan for the run could not be resolved.
    PlanNotFound { detail: String },
    /// Storage or other infrastructure failure.
    Internal { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { phase, limit_ms } => write!(
                f,
                "timeout: run deadline of {limit_ms} ms exceeded during {phase} phase"
            ),
            FailureReason::RetriesExhausted { attempts } => write!(
                f,
                "verification failed after {attempts} attempt(s); retries exhausted"
            ),
            FailureReason::ZeroCandidates { phase, attempted } => write!(
                f,
                "zero candidates: all {attempted} agent(s) failed in {phase} phase"
            ),
            FailureReason::PlanNotFound { detail } => write!(f, "plan not found: {detail}"),
            FailureReason::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_strings() {
        assert_eq!(DispatchError::Timeout.to_string(), "timeout");
        assert_eq!(
            DispatchError::DeadlineExceeded.to_string(),
            "deadline exceeded"
        );
    }

    #[test]
    fn test_storage_not_found_maps_to_domain_not_found() {
        let err: ConclaveError = StorageError::not_found("run", "r-1").into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "run not found: r-1");

        let err: ConclaveError = StorageError::Backend("down".to_string()).into();
        assert!(matches!(err, ConclaveError::Storage(_)));
    }

    #[test]
    fn test_failure_reasons_are_distinguishable() {
        let reasons = [
            FailureReason::Timeout {
                phase: Phase::Coding,
                limit_ms: 500,
            }
            .to_string(),
            FailureReason::RetriesExhausted { attempts: 2 }.to_string(),
            FailureReason::ZeroCandidates {
                phase: Phase::Planning,
                attempted: 3,
            }
            .to_string(),
        ];
        assert!(reasons[0].starts_with("timeout"));
        assert!(reasons[1].contains("retries exhausted"));
        assert!(reasons[2].starts_with("zero candidates"));
    }
}
