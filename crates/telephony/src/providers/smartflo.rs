//! Tata Smartflo click-to-call provider.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::select::join_url;
use crate::webhook::{map_status, param, param_u64, parse_timestamp};
use crate::{CallEvent, CallProvider, CallReceipt, CallRequest, TelephonyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartfloConfig {
    pub base_url: Url,
    pub api_token: String,
}

pub struct SmartfloProvider {
    http: reqwest::Client,
    config: SmartfloConfig,
}

impl SmartfloProvider {
    pub fn new(http: reqwest::Client, config: SmartfloConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Debug, Serialize)]
struct ClickToCallRequest<'a> {
    agent_number: &'a str,
    destination_number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_identifier: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ClickToCallResponse {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// An "already registered" reply from the agent endpoint counts as success.
pub(crate) fn is_already_registered(status: u16, body: &str) -> bool {
    status == 409 || body.to_lowercase().contains("already registered")
}

#[async_trait]
impl CallProvider for SmartfloProvider {
    fn name(&self) -> &'static str {
        "smartflo"
    }

    async fn make_call(&self, request: &CallRequest) -> Result<CallReceipt, TelephonyError> {
        let url = join_url(&self.config.base_url, "v1/click_to_call")?;
        let payload = ClickToCallRequest {
            agent_number: &request.from_number,
            destination_number: &request.to_number,
            caller_id: None,
            call_timeout: request.time_limit_secs,
            custom_identifier: request.uid.as_deref(),
        };

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TelephonyError::from_reqwest("smartflo", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TelephonyError::from_reqwest("smartflo", e))?;
        debug!(%status, raw = %body, "smartflo click-to-call response");
        if !status.is_success() {
            return Err(TelephonyError::CallFailed {
                provider: "smartflo".into(),
                reason: format!("http {status}"),
            });
        }

        let raw_provider_response = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
        let parsed: ClickToCallResponse =
            serde_json::from_str(&body).unwrap_or(ClickToCallResponse {
                call_id: None,
                success: None,
                message: None,
            });
        if parsed.success == Some(false) {
            return Err(TelephonyError::CallFailed {
                provider: "smartflo".into(),
                reason: parsed.message.unwrap_or_else(|| "rejected".into()),
            });
        }
        let call_id = parsed
            .call_id
            .filter(|id| !id.is_empty())
            .or_else(|| request.uid.clone())
            .ok_or_else(|| TelephonyError::MissingCallId {
                provider: "smartflo".into(),
            })?;

        Ok(CallReceipt {
            call_id,
            provider: "smartflo".into(),
            raw_provider_response,
        })
    }

    fn normalize_webhook(
        &self,
        _method: &str,
        query: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<CallEvent, TelephonyError> {
        let call_id = param(query, body, &["call_id", "uuid"])
            .ok_or_else(|| TelephonyError::Webhook("missing call_id".into()))?;
        let raw_status = param(query, body, &["call_status", "status"])
            .ok_or_else(|| TelephonyError::Webhook("missing call_status".into()))?;

        Ok(CallEvent {
            call_id,
            uid: param(query, body, &["custom_identifier"]),
            from_number: param(query, body, &["agent_number"]).unwrap_or_default(),
            to_number: param(query, body, &["customer_number", "destination_number"])
                .unwrap_or_default(),
            answered_number: param(query, body, &["answered_agent_number"]),
            status: map_status(&raw_status),
            duration_secs: param_u64(query, body, &["duration", "call_duration"]).unwrap_or(0),
            start_time: param(query, body, &["start_stamp"]).and_then(|t| parse_timestamp(&t)),
            end_time: param(query, body, &["end_stamp"]).and_then(|t| parse_timestamp(&t)),
            recording_url: param(query, body, &["recording_url"]),
            direction: param(query, body, &["direction"]),
        })
    }

    async fn register_agent(&self, number: &str, name: &str) -> Result<(), TelephonyError> {
        let url = join_url(&self.config.base_url, "v1/agents")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_token)
            .json(&serde_json::json!({ "number": number, "name": name }))
            .send()
            .await
            .map_err(|e| TelephonyError::from_reqwest("smartflo", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TelephonyError::from_reqwest("smartflo", e))?;
        if status.is_success() || is_already_registered(status.as_u16(), &body) {
            return Ok(());
        }
        debug!(%status, raw = %body, "smartflo agent registration failed");
        Err(TelephonyError::CallFailed {
            provider: "smartflo".into(),
            reason: format!("agent registration failed: http {status}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallStatus;

    fn provider() -> SmartfloProvider {
        SmartfloProvider::new(
            reqwest::Client::new(),
            SmartfloConfig {
                base_url: Url::parse("https://dial.example-telco.test/").unwrap(),
                api_token: "token".into(),
            },
        )
    }

    #[test]
    fn already_registered_replies_are_success() {
        assert!(is_already_registered(409, ""));
        assert!(is_already_registered(400, "Agent already registered"));
        assert!(is_already_registered(422, "ALREADY REGISTERED for account"));
        assert!(!is_already_registered(400, "invalid number"));
    }

    #[test]
    fn webhook_normalizes_smartflo_fields() {
        let provider = provider();
        let body = serde_json::json!({
            "call_id": "sf-42",
            "call_status": "answered",
            "agent_number": "+913333",
            "customer_number": "+914444",
            "answered_agent_number": "+913333",
            "duration": "188",
            "start_stamp": "2026-07-01 09:00:00",
            "end_stamp": "2026-07-01 09:03:08",
            "direction": "outbound",
            "custom_identifier": "uid-7",
        });
        let event = provider
            .normalize_webhook("POST", &HashMap::new(), &body)
            .unwrap();
        assert_eq!(event.call_id, "sf-42");
        assert_eq!(event.uid.as_deref(), Some("uid-7"));
        assert_eq!(event.status, CallStatus::Answered);
        assert_eq!(event.duration_secs, 188);
        assert_eq!(event.from_number, "+913333");
        assert_eq!(event.to_number, "+914444");
        assert!(event.end_time.is_some());
    }
}
