use crate::core::types::FailureReason;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`crate::browser::probe::PageProbe`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The browser session is gone; no further query can succeed.
    #[error("browser session unusable: {0}")]
    SessionGone(FailureReason),

    /// The page is mid-navigation or the execution context was swapped out.
    #[error("transient page state: {0}")]
    Transient(String),
}

/// Run-terminating conditions reported to the workflow loop.
///
/// None of these are fatal to the process; each ends the current run only.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("verification timed out after {0:?}")]
    VerificationTimeout(Duration),

    #[error("verification failed: {0}")]
    VerificationFailure(FailureReason),

    #[error("challenge ceiling exceeded ({ceiling} per run)")]
    AttemptCeilingExceeded { ceiling: u32 },

    #[error("page state mismatch after verification (expected `{expected}`, at `{actual}`)")]
    PageStateMismatch { expected: String, actual: String },

    #[error("stage `{stage}` did not confirm success")]
    StageUnconfirmed { stage: String },

    #[error("stage `{stage}` collaborator failed: {source}")]
    Collaborator {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event sink unavailable: {0}")]
    Unavailable(String),
}
