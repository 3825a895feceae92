//! HTTP surface: routing, error mapping, and principal resolution.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use canvass::domain::User;
use canvass::PipelineError;
use canvass_telephony::TelephonyError;
use serde_json::json;
use tracing::error;

use crate::state::AppState;

mod admin;
mod audio;
mod cati;
mod reviews;
mod sessions;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/:survey_id/start", post(sessions::start))
        .route("/sessions/:session_id", get(sessions::get_session))
        .route(
            "/sessions/:session_id/responses",
            put(sessions::update_response),
        )
        .route("/sessions/:session_id/navigate", put(sessions::navigate))
        .route("/sessions/:session_id/reach", put(sessions::reach))
        .route("/sessions/:session_id/pause", put(sessions::pause))
        .route("/sessions/:session_id/resume", put(sessions::resume))
        .route("/sessions/:session_id/abandon", put(sessions::abandon))
        .route("/sessions/:session_id/complete", post(sessions::complete))
        .route("/audio/upload", post(audio::upload))
        .route(
            "/responses/:response_id/audio-signed-url",
            get(audio::signed_url),
        )
        .route("/reviews/next", get(reviews::next))
        .route("/reviews/:response_id/release", post(reviews::release))
        .route("/reviews/submit", post(reviews::submit))
        .route("/cati/webhook", get(cati::webhook).post(cati::webhook))
        .route("/cati/call", post(cati::make_call))
        .route("/cati/agents/register", post(cati::register_agent))
        .route(
            "/cati/sessions/:session_id/complete",
            post(cati::complete_cati),
        )
        .route("/surveys/:survey_id/next-set", get(cati::next_set))
        .route("/admin/dedup/run", post(admin::run_dedup))
        .with_state(state)
}

/// Wire error: `PipelineError` mapped onto HTTP statuses. The duplicate
/// submission shape is the one clients treat as success.
pub struct ApiError(pub PipelineError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            PipelineError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, json!({ "error": msg }))
            }
            PipelineError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            PipelineError::DuplicateSubmission { response_id } => (
                StatusCode::CONFLICT,
                json!({ "isDuplicate": true, "responseId": response_id }),
            ),
            PipelineError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            PipelineError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            PipelineError::Provider(msg) => {
                error!(error = msg, "provider failure");
                (StatusCode::BAD_GATEWAY, json!({ "error": "telephony provider failure" }))
            }
            PipelineError::Internal(msg) => {
                error!(error = msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError(err)
    }
}

impl From<TelephonyError> for ApiError {
    fn from(err: TelephonyError) -> Self {
        match err {
            TelephonyError::UnknownProvider(p) => {
                ApiError(PipelineError::BadRequest(format!("unknown provider {p}")))
            }
            TelephonyError::NotEnabled(p) => {
                ApiError(PipelineError::BadRequest(format!("provider {p} not enabled")))
            }
            TelephonyError::Webhook(msg) => ApiError(PipelineError::BadRequest(msg)),
            other => ApiError(PipelineError::Provider(other.to_string())),
        }
    }
}

/// Resolve the request principal. Authentication happens upstream; the
/// gateway forwards the user id in `x-user-id`.
pub async fn principal(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError(PipelineError::BadRequest(
                "missing x-user-id header".to_string(),
            ))
        })?;
    let user = state
        .users
        .get_user(user_id)
        .await
        .map_err(PipelineError::from)?
        .ok_or_else(|| ApiError(PipelineError::NotFound(format!("user {user_id}"))))?;
    Ok(user)
}
