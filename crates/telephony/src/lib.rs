//! Uniform interface over the CATI calling providers.
//!
//! Every provider implements [`CallProvider`]; tenants pick one through the
//! selection policy in [`select`]. A successful dial returns the vendor's
//! raw reply on the receipt for call-log auditing; webhook and error
//! payloads are logged at debug level only.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod providers;
pub mod select;
pub mod webhook;

pub use select::{ProviderDirectory, ProviderSettings, SelectionMethod, TenantConfig};

/// Outbound HTTP timeout for provider calls; a timed-out dial is a failed
/// call.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("provider {provider} call failed: {reason}")]
    CallFailed { provider: String, reason: String },

    #[error("provider {provider} timed out")]
    Timeout { provider: String },

    /// The vendor accepted the call but returned no usable identifier and no
    /// `uid` was supplied to fall back on.
    #[error("provider {provider} returned no call identifier")]
    MissingCallId { provider: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {0} is not enabled for this tenant")]
    NotEnabled(String),

    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("malformed webhook payload: {0}")]
    Webhook(String),
}

impl TelephonyError {
    pub(crate) fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TelephonyError::Timeout {
                provider: provider.to_string(),
            }
        } else {
            TelephonyError::CallFailed {
                provider: provider.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Parameters for an outbound CATI call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRequest {
    pub from_number: String,
    pub to_number: String,
    #[serde(default)]
    pub from_type: Option<String>,
    #[serde(default)]
    pub to_type: Option<String>,
    #[serde(default)]
    pub from_ring_time: Option<u32>,
    #[serde(default)]
    pub to_ring_time: Option<u32>,
    #[serde(default)]
    pub time_limit_secs: Option<u32>,
    /// Caller-chosen correlation id; used as the call id when the vendor
    /// returns none.
    #[serde(default)]
    pub uid: Option<String>,
}

/// The provider's answer to a successful dial. `raw_provider_response` is
/// the vendor reply as received (JSON when it parses, the raw text
/// otherwise), kept for call-log auditing.
#[derive(Debug, Clone, Serialize)]
pub struct CallReceipt {
    pub call_id: String,
    pub provider: String,
    pub raw_provider_response: serde_json::Value,
}

/// Normalized call status across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Answered,
    Busy,
    NoAnswer,
    Cancelled,
    Failed,
    Completed,
}

/// A normalized webhook callback.
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub call_id: String,
    pub uid: Option<String>,
    /// The agent's number.
    pub from_number: String,
    /// The respondent's number.
    pub to_number: String,
    pub answered_number: Option<String>,
    pub status: CallStatus,
    pub duration_secs: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub recording_url: Option<String>,
    pub direction: Option<String>,
}

/// The uniform provider interface.
#[async_trait]
pub trait CallProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Dial `to_number` from `from_number`. Must return a non-empty call
    /// identifier; when the vendor omits one, the request `uid` is used, and
    /// with neither the call is treated as failed.
    async fn make_call(&self, request: &CallRequest) -> Result<CallReceipt, TelephonyError>;

    /// Normalize a webhook payload delivered via GET (query parameters) or
    /// POST (JSON body).
    fn normalize_webhook(
        &self,
        method: &str,
        query: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<CallEvent, TelephonyError>;

    /// Pre-register an agent number where the vendor requires it. Must be
    /// idempotent: an "already registered" reply is success.
    async fn register_agent(&self, number: &str, name: &str) -> Result<(), TelephonyError>;
}
