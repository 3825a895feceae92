//! Administrative endpoints: duplicate reconciliation runs.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use canvass::domain::Role;
use canvass::PipelineError;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{principal, ApiError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DedupRunBody {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

pub async fn run_dedup(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<DedupRunBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = principal(&state, &headers).await?;
    if !matches!(caller.role, Role::CompanyAdmin | Role::ProjectManager) {
        return Err(PipelineError::Forbidden(
            "duplicate reconciliation is admin-only".to_string(),
        )
        .into());
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let to = body.to.unwrap_or_else(Utc::now);
    let from = body.from.unwrap_or(to - Duration::days(7));
    if from >= to {
        return Err(
            PipelineError::BadRequest("`from` must be before `to`".to_string()).into(),
        );
    }

    let report = state.dedup.run(from, to).await?;
    Ok(Json(json!({ "report": report })))
}
