//! Completion-error classification.
//!
//! The server does not always categorize errors cleanly, so the client
//! recognizes duplicates from several signals: the 409 shape, body markers
//! used by older server builds, the raw storage duplicate-key code, and, as
//! a last resort, repeated opaque server errors for the same session id
//! (threshold and status code configurable in `SyncConfig`).

use serde::Deserialize;

use crate::api::SyncConfig;
use crate::backend::BackendError;

/// Body substrings (lowercased) that mark a server-side duplicate.
pub const DUPLICATE_MARKERS: &[&str] = &[
    "duplicate_submission",
    "already exists",
    "already submitted",
    "already completed",
    "duplicate",
    "e11000",
    "11000",
];

/// How the engine should treat a failed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// The submission already landed server-side; treat as success.
    /// `response_id` is carried when the reply included one.
    Duplicate { response_id: Option<u64> },
    /// Transient; leave the interview failed for a future run.
    Retryable,
    /// Permanent; the interview stays failed and is surfaced to the user.
    Fatal,
}

#[derive(Debug, Deserialize)]
struct DuplicateBody {
    #[serde(default, rename = "isDuplicate")]
    is_duplicate: bool,
    #[serde(default, rename = "responseId")]
    response_id: Option<u64>,
}

/// Classify a completion error. `prior_server_errors` is the count of
/// previous failures with the configured retry status for this session id.
pub fn classify_completion_error(
    err: &BackendError,
    prior_server_errors: u32,
    config: &SyncConfig,
) -> ErrorClass {
    match err {
        BackendError::Network(_) => ErrorClass::Retryable,
        BackendError::Status { status, body } => {
            if let Ok(parsed) = serde_json::from_str::<DuplicateBody>(body) {
                if parsed.is_duplicate {
                    return ErrorClass::Duplicate {
                        response_id: parsed.response_id,
                    };
                }
            }
            let lowered = body.to_lowercase();
            if *status == 409 || DUPLICATE_MARKERS.iter().any(|m| lowered.contains(m)) {
                let response_id = serde_json::from_str::<DuplicateBody>(body)
                    .ok()
                    .and_then(|b| b.response_id);
                return ErrorClass::Duplicate { response_id };
            }
            if *status == config.duplicate_retry_status
                && prior_server_errors >= config.duplicate_500_threshold
            {
                return ErrorClass::Duplicate { response_id: None };
            }
            if *status >= 500 {
                ErrorClass::Retryable
            } else {
                ErrorClass::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16, body: &str) -> BackendError {
        BackendError::Status {
            status: code,
            body: body.to_string(),
        }
    }

    #[test]
    fn conflict_with_shape_carries_response_id() {
        let err = status(409, r#"{"isDuplicate":true,"responseId":71}"#);
        assert_eq!(
            classify_completion_error(&err, 0, &SyncConfig::default()),
            ErrorClass::Duplicate {
                response_id: Some(71)
            }
        );
    }

    #[test]
    fn bare_conflict_is_still_duplicate() {
        let err = status(409, "Conflict");
        assert_eq!(
            classify_completion_error(&err, 0, &SyncConfig::default()),
            ErrorClass::Duplicate { response_id: None }
        );
    }

    #[test]
    fn marker_texts_are_duplicates() {
        for body in [
            "DUPLICATE_SUBMISSION",
            "response already exists",
            "Already Submitted",
            "interview already completed",
            "duplicate key error",
            "E11000 duplicate key error collection",
        ] {
            let err = status(400, body);
            assert!(
                matches!(
                    classify_completion_error(&err, 0, &SyncConfig::default()),
                    ErrorClass::Duplicate { .. }
                ),
                "{body} should classify as duplicate"
            );
        }
    }

    #[test]
    fn repeated_opaque_500s_become_duplicates() {
        let err = status(500, "internal server error");
        let config = SyncConfig::default();
        assert_eq!(
            classify_completion_error(&err, 0, &config),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_completion_error(&err, 1, &config),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify_completion_error(&err, 2, &config),
            ErrorClass::Duplicate { response_id: None }
        );
    }

    #[test]
    fn network_errors_are_retryable() {
        let err = BackendError::Network("connection reset".into());
        assert_eq!(
            classify_completion_error(&err, 0, &SyncConfig::default()),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn client_errors_are_fatal() {
        let err = status(403, "forbidden");
        assert_eq!(
            classify_completion_error(&err, 0, &SyncConfig::default()),
            ErrorClass::Fatal
        );
    }
}
