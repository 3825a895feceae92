//! Shared webhook-normalization helpers.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::CallStatus;

/// Map a vendor status string to the normalized status by case-insensitive
/// substring. Vendors disagree on exact spellings ("ANSWER", "answered",
/// "call-answered"); the substrings below are the stable parts.
///
/// Checks run in precedence order cancel, busy, no/unans, fail, complet,
/// answer. The specific no-answer and cancellation substrings must run
/// before the bare "answer" check: vendor strings such as "unanswered" or
/// "cancelled after answer" contain it. Anything unmatched is failed.
pub fn map_status(raw: &str) -> CallStatus {
    let lowered = raw.to_lowercase();
    if lowered.contains("cancel") {
        CallStatus::Cancelled
    } else if lowered.contains("busy") {
        CallStatus::Busy
    } else if lowered.contains("no") || lowered.contains("unans") {
        CallStatus::NoAnswer
    } else if lowered.contains("fail") {
        CallStatus::Failed
    } else if lowered.contains("complet") {
        CallStatus::Completed
    } else if lowered.contains("answer") {
        CallStatus::Answered
    } else {
        CallStatus::Failed
    }
}

/// Read the first of `names` present in the query parameters or the JSON
/// body, query winning (GET webhooks carry everything in the query string).
pub fn param(
    query: &HashMap<String, String>,
    body: &serde_json::Value,
    names: &[&str],
) -> Option<String> {
    for name in names {
        if let Some(v) = query.get(*name) {
            if !v.is_empty() {
                return Some(v.clone());
            }
        }
        if let Some(v) = body.get(*name) {
            match v {
                serde_json::Value::String(s) if !s.is_empty() => return Some(s.clone()),
                serde_json::Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

pub fn param_u64(
    query: &HashMap<String, String>,
    body: &serde_json::Value,
    names: &[&str],
) -> Option<u64> {
    param(query, body, names).and_then(|v| v.parse::<f64>().ok().map(|f| f.max(0.0) as u64))
}

/// Parse vendor timestamps: RFC 3339 first, then the common
/// `YYYY-MM-DD HH:MM:SS` form interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
