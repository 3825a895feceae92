//! Exotel connect-call provider.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::select::join_url;
use crate::webhook::{map_status, param, param_u64, parse_timestamp};
use crate::{CallEvent, CallProvider, CallReceipt, CallRequest, TelephonyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExotelConfig {
    pub base_url: Url,
    pub account_sid: String,
    pub api_key: String,
    pub api_token: String,
    #[serde(default)]
    pub caller_id: Option<String>,
}

pub struct ExotelProvider {
    http: reqwest::Client,
    config: ExotelConfig,
}

impl ExotelProvider {
    pub fn new(http: reqwest::Client, config: ExotelConfig) -> Self {
        Self { http, config }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    #[serde(rename = "Call")]
    call: Option<ConnectCall>,
}

#[derive(Debug, Deserialize)]
struct ConnectCall {
    #[serde(rename = "Sid")]
    sid: Option<String>,
}

#[async_trait]
impl CallProvider for ExotelProvider {
    fn name(&self) -> &'static str {
        "exotel"
    }

    async fn make_call(&self, request: &CallRequest) -> Result<CallReceipt, TelephonyError> {
        let url = join_url(
            &self.config.base_url,
            &format!("v1/Accounts/{}/Calls/connect.json", self.config.account_sid),
        )?;

        let mut form: Vec<(&str, String)> = vec![
            ("From", request.from_number.clone()),
            ("To", request.to_number.clone()),
        ];
        if let Some(caller_id) = &self.config.caller_id {
            form.push(("CallerId", caller_id.clone()));
        }
        if let Some(limit) = request.time_limit_secs {
            form.push(("TimeLimit", limit.to_string()));
        }
        if let Some(uid) = &request.uid {
            form.push(("CustomField", uid.clone()));
        }

        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.api_key, Some(&self.config.api_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| TelephonyError::from_reqwest("exotel", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TelephonyError::from_reqwest("exotel", e))?;
        debug!(%status, raw = %body, "exotel connect response");
        if !status.is_success() {
            return Err(TelephonyError::CallFailed {
                provider: "exotel".into(),
                reason: format!("http {status}"),
            });
        }

        let raw_provider_response = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
        let parsed: ConnectResponse = serde_json::from_str(&body).unwrap_or(ConnectResponse {
            call: None,
        });
        let call_id = parsed
            .call
            .and_then(|c| c.sid)
            .filter(|sid| !sid.is_empty())
            .or_else(|| request.uid.clone())
            .ok_or_else(|| TelephonyError::MissingCallId {
                provider: "exotel".into(),
            })?;

        Ok(CallReceipt {
            call_id,
            provider: "exotel".into(),
            raw_provider_response,
        })
    }

    fn normalize_webhook(
        &self,
        _method: &str,
        query: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<CallEvent, TelephonyError> {
        let call_id = param(query, body, &["CallSid", "Sid"])
            .ok_or_else(|| TelephonyError::Webhook("missing CallSid".into()))?;
        let raw_status = param(query, body, &["Status", "CallStatus"])
            .ok_or_else(|| TelephonyError::Webhook("missing Status".into()))?;

        Ok(CallEvent {
            call_id,
            uid: param(query, body, &["CustomField"]),
            from_number: param(query, body, &["From"]).unwrap_or_default(),
            to_number: param(query, body, &["To"]).unwrap_or_default(),
            answered_number: param(query, body, &["DialWhomNumber"]),
            status: map_status(&raw_status),
            duration_secs: param_u64(query, body, &["ConversationDuration", "DialCallDuration"])
                .unwrap_or(0),
            start_time: param(query, body, &["StartTime"]).and_then(|t| parse_timestamp(&t)),
            end_time: param(query, body, &["EndTime"]).and_then(|t| parse_timestamp(&t)),
            recording_url: param(query, body, &["RecordingUrl"]),
            direction: param(query, body, &["Direction"]),
        })
    }

    /// Exotel dials through the account's exophone; no agent pre-registration
    /// exists, so this is trivially idempotent.
    async fn register_agent(&self, _number: &str, _name: &str) -> Result<(), TelephonyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CallStatus;

    fn provider() -> ExotelProvider {
        ExotelProvider::new(
            reqwest::Client::new(),
            ExotelConfig {
                base_url: Url::parse("https://api.example-telco.test/").unwrap(),
                account_sid: "acct".into(),
                api_key: "key".into(),
                api_token: "token".into(),
                caller_id: None,
            },
        )
    }

    #[test]
    fn webhook_get_normalizes_from_query() {
        let provider = provider();
        let mut query = HashMap::new();
        query.insert("CallSid".into(), "ex-123".into());
        query.insert("Status".into(), "completed".into());
        query.insert("From".into(), "+911111".into());
        query.insert("To".into(), "+912222".into());
        query.insert("ConversationDuration".into(), "95".into());
        query.insert("StartTime".into(), "2026-07-01 10:30:00".into());
        query.insert("RecordingUrl".into(), "https://rec.test/1.mp3".into());

        let event = provider
            .normalize_webhook("GET", &query, &serde_json::Value::Null)
            .unwrap();
        assert_eq!(event.call_id, "ex-123");
        assert_eq!(event.status, CallStatus::Completed);
        assert_eq!(event.duration_secs, 95);
        assert!(event.start_time.is_some());
        assert_eq!(event.recording_url.as_deref(), Some("https://rec.test/1.mp3"));
    }

    #[test]
    fn webhook_post_normalizes_from_body() {
        let provider = provider();
        let body = serde_json::json!({
            "CallSid": "ex-9",
            "Status": "no-answer",
            "From": "+911111",
            "To": "+912222",
        });
        let event = provider
            .normalize_webhook("POST", &HashMap::new(), &body)
            .unwrap();
        assert_eq!(event.status, CallStatus::NoAnswer);
        assert_eq!(event.duration_secs, 0);
    }

    #[test]
    fn webhook_without_call_id_is_rejected() {
        let provider = provider();
        let err = provider
            .normalize_webhook("GET", &HashMap::new(), &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, TelephonyError::Webhook(_)));
    }
}
