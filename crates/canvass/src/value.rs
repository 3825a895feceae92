//! Dynamically shaped answer values and the normalization rules used for
//! response-equality comparison.
//!
//! Collector devices submit loosely typed answers (free text, option lists,
//! nested follow-up maps). `ResponseValue` is the tagged union those shapes
//! map onto; [`ResponseValue::normalize`] is a total function over it and is
//! the basis for duplicate detection.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single answer value as captured on the collector device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<ResponseValue>),
    Map(BTreeMap<String, ResponseValue>),
}

impl Default for ResponseValue {
    fn default() -> Self {
        ResponseValue::Null
    }
}

impl ResponseValue {
    /// Whether this value counts as "no answer" for abandonment promotion:
    /// null, an empty (or whitespace-only) string, or an empty array.
    pub fn is_empty_answer(&self) -> bool {
        match self {
            ResponseValue::Null => true,
            ResponseValue::Str(s) => s.trim().is_empty(),
            ResponseValue::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Normalize for equality comparison: strings are trimmed and lowercased,
    /// numbers and booleans pass through, arrays are recursively normalized
    /// and then sorted, maps are key-sorted with normalized values.
    pub fn normalize(&self) -> ResponseValue {
        match self {
            ResponseValue::Null => ResponseValue::Null,
            ResponseValue::Bool(b) => ResponseValue::Bool(*b),
            ResponseValue::Num(n) => ResponseValue::Num(*n),
            ResponseValue::Str(s) => ResponseValue::Str(s.trim().to_lowercase()),
            ResponseValue::List(items) => {
                let mut normalized: Vec<ResponseValue> =
                    items.iter().map(ResponseValue::normalize).collect();
                normalized.sort_by(canonical_cmp);
                ResponseValue::List(normalized)
            }
            ResponseValue::Map(entries) => ResponseValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.normalize()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for ResponseValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ResponseValue::Null,
            serde_json::Value::Bool(b) => ResponseValue::Bool(b),
            serde_json::Value::Number(n) => ResponseValue::Num(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => ResponseValue::Str(s),
            serde_json::Value::Array(items) => {
                ResponseValue::List(items.into_iter().map(ResponseValue::from).collect())
            }
            serde_json::Value::Object(entries) => ResponseValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, ResponseValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Total order over values, used to sort normalized arrays deterministically.
/// Values order by type rank first, then by content; floats use `total_cmp`.
pub fn canonical_cmp(a: &ResponseValue, b: &ResponseValue) -> Ordering {
    fn rank(v: &ResponseValue) -> u8 {
        match v {
            ResponseValue::Null => 0,
            ResponseValue::Bool(_) => 1,
            ResponseValue::Num(_) => 2,
            ResponseValue::Str(_) => 3,
            ResponseValue::List(_) => 4,
            ResponseValue::Map(_) => 5,
        }
    }

    match (a, b) {
        (ResponseValue::Null, ResponseValue::Null) => Ordering::Equal,
        (ResponseValue::Bool(x), ResponseValue::Bool(y)) => x.cmp(y),
        (ResponseValue::Num(x), ResponseValue::Num(y)) => x.total_cmp(y),
        (ResponseValue::Str(x), ResponseValue::Str(y)) => x.cmp(y),
        (ResponseValue::List(x), ResponseValue::List(y)) => {
            for (xa, ya) in x.iter().zip(y.iter()) {
                let ord = canonical_cmp(xa, ya);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (ResponseValue::Map(x), ResponseValue::Map(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = canonical_cmp(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// One normalized `(question, type, value)` triple of a response fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedAnswer {
    pub question_id: String,
    pub question_type: String,
    pub value: ResponseValue,
}

/// The normalized fingerprint of a full response: the sorted list of
/// `(question_id, question_type, normalized value)` triples. Two responses
/// have equal content iff their fingerprints are equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFingerprint(Vec<NormalizedAnswer>);

impl ResponseFingerprint {
    pub fn new<'a>(
        entries: impl IntoIterator<Item = (&'a str, &'a str, &'a ResponseValue)>,
    ) -> Self {
        let mut triples: Vec<NormalizedAnswer> = entries
            .into_iter()
            .map(|(question_id, question_type, value)| NormalizedAnswer {
                question_id: question_id.to_string(),
                question_type: question_type.to_string(),
                value: value.normalize(),
            })
            .collect();
        triples.sort_by(|a, b| {
            a.question_id
                .cmp(&b.question_id)
                .then_with(|| a.question_type.cmp(&b.question_type))
                .then_with(|| canonical_cmp(&a.value, &b.value))
        });
        ResponseFingerprint(triples)
    }

    pub fn triples(&self) -> &[NormalizedAnswer] {
        &self.0
    }

    /// Canonical serialized form, suitable for exact-content hashing.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}
