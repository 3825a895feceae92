//! Offline duplicate reconciliation over a date window.
//!
//! Candidates are grouped first, by (interviewer, survey) for CAPI and
//! (interviewer, call id) for CATI, so pairwise comparison stays inside
//! small groups instead of O(N²) over the whole window. Within each
//! equivalence class the earliest response is kept and the rest are marked
//! abandoned.

use std::collections::HashMap;
use std::sync::Arc;

use canvass::config::DedupConfig;
use canvass::domain::{AudioRecording, ResponseRecord, ResponseStatus, SurveyMode};
use canvass::store::ResponseStore;
use canvass::value::ResponseFingerprint;
use canvass::PipelineResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Abandonment reason written on removed duplicates.
pub const DUPLICATE_REASON: &str = "Duplicate response";

/// Status updates are flushed in chunks of this size.
const UPDATE_CHUNK: usize = 100;

/// One equivalence class found by a run: the response kept and those marked
/// abandoned.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateClass {
    pub kept: String,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub scanned: usize,
    pub classes: Vec<DuplicateClass>,
    pub removed: usize,
    /// Classes whose status write failed; the run continues past them.
    pub failed_updates: usize,
}

pub struct DuplicateDetector {
    responses: Arc<dyn ResponseStore>,
    config: DedupConfig,
}

impl DuplicateDetector {
    pub fn new(responses: Arc<dyn ResponseStore>, config: DedupConfig) -> Self {
        Self { responses, config }
    }

    /// Reconcile the `[from, to)` window.
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PipelineResult<DedupReport> {
        let records = self.responses.list_window(from, to).await?;
        let mut report = DedupReport {
            scanned: records.len(),
            ..Default::default()
        };

        // Already-abandoned responses never participate.
        let live: Vec<&ResponseRecord> = records
            .iter()
            .filter(|r| r.status != ResponseStatus::Abandoned)
            .collect();

        let mut groups: HashMap<(SurveyMode, String, String), Vec<&ResponseRecord>> =
            HashMap::new();
        for record in live {
            let key = match record.mode {
                SurveyMode::Cati => {
                    let Some(call_id) =
                        record.call_id.as_deref().filter(|c| !c.trim().is_empty())
                    else {
                        continue;
                    };
                    (
                        SurveyMode::Cati,
                        record.interviewer_id.clone(),
                        call_id.to_string(),
                    )
                }
                _ => (
                    SurveyMode::Capi,
                    record.interviewer_id.clone(),
                    record.survey_id.clone(),
                ),
            };
            groups.entry(key).or_default().push(record);
        }

        let mut pending_removals: Vec<String> = Vec::new();
        for ((mode, _, _), mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by_key(|r| r.created_at);
            let fingerprints: Vec<ResponseFingerprint> =
                group.iter().map(|r| r.fingerprint()).collect();

            let mut consumed = vec![false; group.len()];
            for i in 0..group.len() {
                if consumed[i] {
                    continue;
                }
                let mut class = DuplicateClass {
                    kept: group[i].id.clone(),
                    removed: Vec::new(),
                };
                for j in (i + 1)..group.len() {
                    if consumed[j] {
                        continue;
                    }
                    let same = fingerprints[i] == fingerprints[j]
                        && match mode {
                            SurveyMode::Cati => self.cati_match(group[i], group[j]),
                            _ => self.capi_match(group[i], group[j]),
                        };
                    if same {
                        consumed[j] = true;
                        class.removed.push(group[j].id.clone());
                    }
                }
                if !class.removed.is_empty() {
                    pending_removals.extend(class.removed.iter().cloned());
                    report.classes.push(class);
                }
            }
        }

        for chunk in pending_removals.chunks(UPDATE_CHUNK) {
            match self
                .responses
                .set_statuses(
                    chunk,
                    ResponseStatus::Abandoned,
                    Some(DUPLICATE_REASON.to_string()),
                )
                .await
            {
                Ok(updated) => report.removed += updated,
                Err(err) => {
                    warn!(error = %err, "duplicate status update failed; continuing");
                    report.failed_updates += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            classes = report.classes.len(),
            removed = report.removed,
            "duplicate reconciliation finished"
        );
        Ok(report)
    }

    /// CAPI comparator: equal normalized content is checked by the caller;
    /// here the surrounding signals must all hold.
    fn capi_match(&self, a: &ResponseRecord, b: &ResponseRecord) -> bool {
        a.interviewer_id == b.interviewer_id
            && self.start_within_tolerance(a, b)
            && self.gps_match(a, b)
            && self.audio_signature_match(a.audio.as_ref(), b.audio.as_ref())
    }

    /// CATI comparator: same interviewer and call id are the group key; the
    /// remaining signal is start-time proximity.
    fn cati_match(&self, a: &ResponseRecord, b: &ResponseRecord) -> bool {
        a.interviewer_id == b.interviewer_id && self.start_within_tolerance(a, b)
    }

    fn start_within_tolerance(&self, a: &ResponseRecord, b: &ResponseRecord) -> bool {
        let delta = (a.start_time - b.start_time).num_milliseconds().abs();
        delta <= self.config.time_tolerance_secs * 1000
    }

    fn gps_match(&self, a: &ResponseRecord, b: &ResponseRecord) -> bool {
        match (&a.location, &b.location) {
            (Some(la), Some(lb)) => {
                (la.latitude - lb.latitude).abs() <= self.config.gps_tolerance
                    && (la.longitude - lb.longitude).abs() <= self.config.gps_tolerance
            }
            (None, None) => true,
            _ => false,
        }
    }

    /// Audio signatures are equal when duration, size, format, codec, and
    /// bitrate all fall within tolerance. Both-missing audio counts as
    /// equal.
    fn audio_signature_match(
        &self,
        a: Option<&AudioRecording>,
        b: Option<&AudioRecording>,
    ) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                within_f64(
                    a.duration_secs,
                    b.duration_secs,
                    self.config.audio_duration_tolerance_secs,
                ) && within_u64(
                    a.file_size_bytes,
                    b.file_size_bytes,
                    self.config.audio_size_tolerance_bytes,
                ) && a.format == b.format
                    && a.codec == b.codec
                    && within_f64(
                        a.bitrate_kbps,
                        b.bitrate_kbps,
                        self.config.audio_bitrate_tolerance_kbps,
                    )
            }
            _ => false,
        }
    }
}

fn within_f64(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() <= tolerance,
        (None, None) => true,
        _ => false,
    }
}

fn within_u64(a: Option<u64>, b: Option<u64>, tolerance: u64) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.abs_diff(b) <= tolerance,
        (None, None) => true,
        _ => false,
    }
}
