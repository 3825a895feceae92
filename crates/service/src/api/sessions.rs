//! Interview session endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use canvass::domain::{AnsweredQuestion, CompletionMetadata, QualityMetrics, SessionId};
use canvass::value::ResponseValue;
use canvass_qc::complete::CompletionRequest;
use serde::Deserialize;
use serde_json::json;

use super::{principal, ApiError};
use crate::state::AppState;

pub async fn start(
    State(state): State<AppState>,
    Path(survey_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let started = state.sessions.start_interview(&survey_id, &caller).await?;
    // The full survey rides along so collector devices can cache its
    // structure for offline capture.
    let survey = state
        .surveys
        .get_survey(&survey_id)
        .await
        .map_err(canvass::PipelineError::from)?;
    Ok(Json(json!({
        "sessionId": started.session.id,
        "survey": survey,
        "mode": started.session.mode,
        "currentPosition": {
            "sectionIndex": started.session.position.section,
            "questionIndex": started.session.position.question,
        },
        "requiresACSelection": started.requires_ac_selection,
        "assignedACs": started.assigned_acs,
    })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let session = state
        .sessions
        .get_session(&SessionId::from_str(&session_id), &caller)
        .await?;
    Ok(Json(json!({
        "sessionId": session.id,
        "surveyId": session.survey_id,
        "state": session.state,
        "currentPosition": {
            "sectionIndex": session.position.section,
            "questionIndex": session.position.question,
        },
        "reachedQuestions": session.reached,
        "responses": session.answers,
        "startedAt": session.started_at,
        "lastActivityAt": session.last_activity_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateResponseBody {
    #[serde(rename = "questionId")]
    question_id: String,
    response: serde_json::Value,
}

pub async fn update_response(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateResponseBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    state
        .sessions
        .update_response(
            &SessionId::from_str(&session_id),
            &caller,
            &body.question_id,
            ResponseValue::from(body.response),
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct PositionBody {
    #[serde(rename = "sectionIndex")]
    section_index: usize,
    #[serde(rename = "questionIndex")]
    question_index: usize,
}

pub async fn navigate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PositionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let session = state
        .sessions
        .navigate_to(
            &SessionId::from_str(&session_id),
            &caller,
            body.section_index,
            body.question_index,
        )
        .await?;
    Ok(Json(json!({
        "currentPosition": {
            "sectionIndex": session.position.section,
            "questionIndex": session.position.question,
        },
    })))
}

pub async fn reach(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PositionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    state
        .sessions
        .mark_reached(
            &SessionId::from_str(&session_id),
            &caller,
            body.section_index,
            body.question_index,
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    state
        .sessions
        .pause(&SessionId::from_str(&session_id), &caller)
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    state
        .sessions
        .resume(&SessionId::from_str(&session_id), &caller)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct AbandonBody {
    #[serde(default)]
    responses: Option<Vec<AnsweredQuestion>>,
    #[serde(default)]
    metadata: Option<CompletionMetadata>,
}

pub async fn abandon(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<AbandonBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let promoted = state
        .sessions
        .abandon(
            &SessionId::from_str(&session_id),
            &caller,
            body.responses,
            body.metadata,
        )
        .await?;
    Ok(Json(json!({ "success": true, "responseId": promoted })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    #[serde(default)]
    pub responses: Vec<AnsweredQuestion>,
    #[serde(default, rename = "qualityMetrics")]
    pub quality: QualityMetrics,
    #[serde(default)]
    pub metadata: CompletionMetadata,
}

pub async fn complete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let outcome = state
        .ingestor
        .complete(
            &SessionId::from_str(&session_id),
            &caller,
            CompletionRequest {
                responses: body.responses,
                quality: body.quality,
                metadata: body.metadata,
            },
        )
        .await?;
    Ok(Json(json!({
        "responseId": outcome.response_id,
        "status": outcome.status,
        "summary": outcome.summary,
    })))
}
