//! Error kinds carried end-to-end through the pipeline.
//!
//! `PipelineError` is what the domain services return and what the HTTP
//! layer maps to status codes. `StoreError` is the storage-level error; the
//! conversion below fixes how storage failures surface to callers (notably:
//! a uniqueness violation on insert becomes a `Conflict`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A referenced session/response/survey/user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not the owner/assignee, or attempted disallowed navigation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Target already in a terminal state, or a lease is held by another.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A completion was re-submitted for a session that already produced a
    /// response. Treated as success by clients.
    #[error("duplicate submission: response {response_id} already exists for this session")]
    DuplicateSubmission { response_id: u64 },

    /// Missing required field or invalid value.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Telephony vendor failure or timeout. Raw vendor payloads stay in the
    /// logs and never reach clients.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// An error type for storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Other(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => PipelineError::NotFound(msg),
            StoreError::AlreadyExists(msg) | StoreError::Conflict(msg) => {
                PipelineError::Conflict(msg)
            }
            StoreError::Other(msg) => PipelineError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::BadRequest(format!("invalid payload: {err}"))
    }
}
