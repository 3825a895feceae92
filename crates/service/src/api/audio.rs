//! Audio upload and signed-URL endpoints.

use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use axum::Json;
use canvass::PipelineError;
use serde_json::json;
use tracing::info;

use super::ApiError;
use crate::audio::MOCK_URL_PREFIX;
use crate::state::AppState;

const SIGNED_URL_TTL_SECS: u64 = 900;

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut session_id: Option<String> = None;
    let mut survey_id: Option<String> = None;
    let mut file: Option<(String, Vec<u8>, String)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::BadRequest(format!("bad multipart: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("sessionId") => {
                session_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| PipelineError::BadRequest(e.to_string()))?,
                )
            }
            Some("surveyId") => {
                survey_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| PipelineError::BadRequest(e.to_string()))?,
                )
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .unwrap_or("recording.m4a")
                    .to_string();
                let mimetype = field
                    .content_type()
                    .unwrap_or("audio/mp4")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| PipelineError::BadRequest(e.to_string()))?;
                file = Some((file_name, bytes.to_vec(), mimetype));
            }
            _ => {}
        }
    }

    let session_id = session_id
        .ok_or_else(|| PipelineError::BadRequest("missing sessionId".to_string()))?;
    let survey_id =
        survey_id.ok_or_else(|| PipelineError::BadRequest("missing surveyId".to_string()))?;
    let (file_name, bytes, mimetype) =
        file.ok_or_else(|| PipelineError::BadRequest("missing file".to_string()))?;
    if bytes.is_empty() {
        return Err(PipelineError::BadRequest("empty audio file".to_string()).into());
    }

    // The returned key is opaque to clients; they hand it back in completion
    // metadata.
    let key = format!("audio/{survey_id}/{session_id}/{file_name}");
    let size = state.audio.put(&key, &bytes).await?;
    info!(%key, size, "audio stored");
    Ok(Json(json!({
        "audioUrl": key,
        "size": size,
        "mimetype": mimetype,
        "storageType": state.audio.storage_type(),
    })))
}

pub async fn signed_url(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .responses
        .get_response(&response_id)
        .await
        .map_err(PipelineError::from)?
        .ok_or_else(|| PipelineError::NotFound(format!("response {response_id}")))?;
    let audio = record
        .audio
        .ok_or_else(|| PipelineError::NotFound(format!("response {response_id} has no audio")))?;

    if audio.audio_url.starts_with(MOCK_URL_PREFIX) {
        return Ok(Json(json!({ "isMock": true, "signedUrl": null })));
    }
    let signed = state.audio.signed_url(&audio.audio_url, SIGNED_URL_TTL_SECS)?;
    Ok(Json(json!({
        "signedUrl": signed,
        "expiresIn": SIGNED_URL_TTL_SECS,
    })))
}
