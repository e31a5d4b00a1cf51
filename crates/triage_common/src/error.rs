//! Error types shared between the agent and the control plane.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriageError {
    /// Flush/ingest network failure. Retried on the buffer's own
    /// schedule, never fatal to the producer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bad or missing credential. Rejected immediately, no retry.
    #[error("Unauthorized: {0}")]
    Auth(String),

    /// Malformed record or plan. The whole batch is rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Blocklisted command. The step is forced to `blocked`, never
    /// silently dropped.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Execution timed out after {0}s")]
    ExecutionTimeout(u64),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Operation on an expired or closed session. The viewer should
    /// re-fetch.
    #[error("Session is expired or closed: {0}")]
    StaleSession(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TriageError>;
