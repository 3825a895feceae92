//! Review queue endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use canvass_qc::review::{NextReviewOutcome, ReviewFilters, Verdict};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use super::{principal, ApiError};
use crate::audio::MOCK_URL_PREFIX;
use crate::state::AppState;

const SIGNED_URL_TTL_SECS: u64 = 900;

#[derive(Debug, Default, Deserialize)]
pub struct NextQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default, rename = "ageMin")]
    age_min: Option<u32>,
    #[serde(default, rename = "ageMax")]
    age_max: Option<u32>,
}

pub async fn next(
    State(state): State<AppState>,
    Query(query): Query<NextQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let filters = ReviewFilters {
        search: query.search,
        gender: query.gender,
        age_min: query.age_min,
        age_max: query.age_max,
    };
    match state.reviews.get_next(&caller, &filters).await? {
        NextReviewOutcome::Assigned(next) => {
            // CAPI audio gets a freshly signed URL alongside the lease.
            let audio_signed_url = next
                .response
                .audio
                .as_ref()
                .filter(|a| !a.audio_url.starts_with(MOCK_URL_PREFIX))
                .map(|a| state.audio.signed_url(&a.audio_url, SIGNED_URL_TTL_SECS))
                .transpose()?;
            Ok(Json(json!({
                "interview": next.response,
                "expiresAt": next.expires_at,
                "audioSignedUrl": audio_signed_url,
            })))
        }
        NextReviewOutcome::Empty { message } => Ok(Json(json!({
            "interview": null,
            "message": message,
        }))),
    }
}

pub async fn release(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    state.reviews.release_assignment(&response_id, &caller).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    #[serde(rename = "responseId")]
    response_id: String,
    status: Verdict,
    #[serde(default, rename = "verificationCriteria")]
    verification_criteria: BTreeMap<String, String>,
    #[serde(default)]
    feedback: Option<String>,
}

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let record = state
        .reviews
        .submit_verification(
            &body.response_id,
            &caller,
            body.status,
            body.verification_criteria,
            body.feedback,
        )
        .await?;
    Ok(Json(json!({
        "responseId": record.response_id,
        "status": record.status,
    })))
}
