//! Server API client used by the sync engine.

use async_trait::async_trait;
use canvass::domain::{AnsweredQuestion, CompletionMetadata, QualityMetrics};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Non-success HTTP reply; the body is kept for error classification.
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            BackendError::Network(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartedSessionDto {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioUploadDto {
    #[serde(rename = "audioUrl")]
    pub audio_url: String,
    pub size: u64,
}

/// Reply to a completion call; `is_duplicate` marks the 409 resubmission
/// shape, which the engine treats as success.
#[derive(Debug, Clone)]
pub struct CompletionReply {
    pub response_id: u64,
    pub is_duplicate: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionPayload {
    pub responses: Vec<AnsweredQuestion>,
    #[serde(rename = "qualityMetrics")]
    pub quality: QualityMetrics,
    pub metadata: CompletionMetadata,
}

/// The server operations the engine depends on. Implemented over HTTP in
/// production and mocked in tests.
#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    async fn start_interview(&self, survey_id: &str) -> Result<StartedSessionDto, BackendError>;

    async fn upload_audio(
        &self,
        session_id: &str,
        survey_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<AudioUploadDto, BackendError>;

    async fn complete(
        &self,
        session_id: &str,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError>;

    async fn complete_cati(
        &self,
        session_id: &str,
        cati_queue_id: Option<&str>,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError>;
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(rename = "responseId")]
    response_id: u64,
    #[serde(default, rename = "isDuplicate")]
    is_duplicate: bool,
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: Url,
    user_id: String,
}

impl HttpBackend {
    pub fn new(base_url: Url, user_id: &str) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            user_id: user_id.to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Network(format!("bad url: {e}")))
    }

    async fn read_completion(
        &self,
        response: reqwest::Response,
    ) -> Result<CompletionReply, BackendError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        if status.is_success() {
            let parsed: CompletionBody = serde_json::from_str(&body)
                .map_err(|e| BackendError::Network(format!("bad completion body: {e}")))?;
            return Ok(CompletionReply {
                response_id: parsed.response_id,
                is_duplicate: false,
            });
        }
        // The well-formed duplicate shape is success with the existing id;
        // everything else surfaces for classification.
        if status.as_u16() == 409 {
            if let Ok(parsed) = serde_json::from_str::<CompletionBody>(&body) {
                if parsed.is_duplicate {
                    return Ok(CompletionReply {
                        response_id: parsed.response_id,
                        is_duplicate: true,
                    });
                }
            }
        }
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn start_interview(&self, survey_id: &str) -> Result<StartedSessionDto, BackendError> {
        let url = self.url(&format!("sessions/{survey_id}/start"))?;
        let response = self
            .http
            .post(url)
            .header("x-user-id", &self.user_id)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))
    }

    async fn upload_audio(
        &self,
        session_id: &str,
        survey_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<AudioUploadDto, BackendError> {
        let url = self.url("audio/upload")?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("audio/mp4")
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("sessionId", session_id.to_string())
            .text("surveyId", survey_id.to_string());

        let response = self
            .http
            .post(url)
            .header("x-user-id", &self.user_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))
    }

    async fn complete(
        &self,
        session_id: &str,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError> {
        let url = self.url(&format!("sessions/{session_id}/complete"))?;
        let response = self
            .http
            .post(url)
            .header("x-user-id", &self.user_id)
            .json(payload)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        self.read_completion(response).await
    }

    async fn complete_cati(
        &self,
        session_id: &str,
        cati_queue_id: Option<&str>,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError> {
        let url = self.url(&format!("cati/sessions/{session_id}/complete"))?;
        let body = serde_json::json!({
            "catiQueueId": cati_queue_id,
            "responses": payload.responses,
            "qualityMetrics": payload.quality,
            "metadata": payload.metadata,
        });
        let response = self
            .http
            .post(url)
            .header("x-user-id", &self.user_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        self.read_completion(response).await
    }
}
