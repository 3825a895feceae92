//! CATI endpoints: dialing, webhook normalization, set rotation, and the
//! CATI completion path.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::response::IntoResponse;
use axum::Json;
use canvass::domain::SessionId;
use canvass::PipelineError;
use canvass_qc::complete::CompletionRequest;
use canvass_telephony::CallRequest;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{principal, ApiError};
use crate::api::sessions::CompleteBody;
use crate::state::AppState;

/// Providers deliver callbacks over GET (query string) or POST (JSON body).
/// The callback URL carries `provider` and `companyId` so the right
/// normalizer is picked.
pub async fn webhook(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<serde_json::Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let provider_name = query
        .get("provider")
        .cloned()
        .ok_or_else(|| PipelineError::BadRequest("missing provider parameter".to_string()))?;
    let company_id = query
        .get("companyId")
        .cloned()
        .ok_or_else(|| PipelineError::BadRequest("missing companyId parameter".to_string()))?;
    let provider = state.telephony.named(&company_id, &provider_name).await?;
    let body = body.map(|Json(b)| b).unwrap_or(serde_json::Value::Null);
    let event = provider.normalize_webhook(method.as_str(), &query, &body)?;

    info!(
        call_id = %event.call_id,
        status = ?event.status,
        duration = event.duration_secs,
        "call webhook"
    );
    let mut log = state.call_log.lock().await;
    log.insert(event.call_id.clone(), event.clone());
    Ok(Json(json!({ "success": true, "callId": event.call_id })))
}

#[derive(Debug, Deserialize)]
pub struct MakeCallBody {
    #[serde(rename = "fromNumber")]
    from_number: String,
    #[serde(rename = "toNumber")]
    to_number: String,
    #[serde(default, rename = "timeLimit")]
    time_limit_secs: Option<u32>,
    #[serde(default)]
    uid: Option<String>,
}

pub async fn make_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MakeCallBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let tenant = state.tenants.get(&caller.company_id).ok_or_else(|| {
        ApiError(PipelineError::BadRequest(format!(
            "no telephony config for company {}",
            caller.company_id
        )))
    })?;
    let provider = state.telephony.provider_for(tenant).await?;
    let receipt = provider
        .make_call(&CallRequest {
            from_number: body.from_number,
            to_number: body.to_number,
            time_limit_secs: body.time_limit_secs,
            uid: body.uid,
            ..Default::default()
        })
        .await?;
    Ok(Json(json!({
        "callId": receipt.call_id,
        "provider": receipt.provider,
        "rawProviderResponse": receipt.raw_provider_response,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentBody {
    number: String,
    name: String,
}

pub async fn register_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterAgentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let tenant = state.tenants.get(&caller.company_id).ok_or_else(|| {
        ApiError(PipelineError::BadRequest(format!(
            "no telephony config for company {}",
            caller.company_id
        )))
    })?;
    let provider = state.telephony.provider_for(tenant).await?;
    provider.register_agent(&body.number, &body.name).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct CatiCompleteBody {
    #[serde(default, rename = "catiQueueId")]
    cati_queue_id: Option<String>,
    #[serde(flatten)]
    completion: CompleteBody,
}

pub async fn complete_cati(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CatiCompleteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    let outcome = state
        .ingestor
        .complete_cati(
            &SessionId::from_str(&session_id),
            &caller,
            body.cati_queue_id,
            CompletionRequest {
                responses: body.completion.responses,
                quality: body.completion.quality,
                metadata: body.completion.metadata,
            },
        )
        .await?;
    Ok(Json(json!({
        "responseId": outcome.response_id,
        "status": outcome.status,
        "summary": outcome.summary,
    })))
}

pub async fn next_set(
    State(state): State<AppState>,
    Path(survey_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.sets.next_set(&survey_id).await?;
    Ok(Json(json!({
        "lastSetNumber": info.last_set_number,
        "nextSetNumber": info.next_set_number,
    })))
}
