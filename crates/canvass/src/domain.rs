//! Domain entities: surveys, users, interview sessions, responses, QC
//! batches, and CATI set-rotation records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{ResponseFingerprint, ResponseValue};

/// A unique identifier for an interview session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new, random session ID.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        SessionId(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interviewing mode of a survey or a single interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyMode {
    Capi,
    Cati,
    MultiMode,
}

/// Platform role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Interviewer,
    QualityAgent,
    CompanyAdmin,
    ProjectManager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub company_id: String,
}

/// A single survey question. `set_number` tags CATI rotation membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub question_type: String,
    #[serde(default)]
    pub required: bool,
    /// Conditional-display predicate, opaque to the server.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub set_number: Option<u32>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub title: Option<String>,
    pub questions: Vec<Question>,
}

/// A reviewer assigned to a survey. An empty `acs` list means the reviewer
/// covers every AC of the survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerAssignment {
    pub user_id: String,
    #[serde(default)]
    pub acs: Vec<String>,
}

/// An interviewer assigned to a survey; `mode` scopes the assignment to one
/// pool of a multi-mode survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewerAssignment {
    pub user_id: String,
    #[serde(default)]
    pub mode: Option<SurveyMode>,
}

/// What happens to the un-sampled remainder when a batch closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    QueueForQc,
    AutoApprove,
    AutoReject,
}

/// The recorded fate of a batch's remainder once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderDecision {
    QueuedForQc,
    AutoApproved,
    AutoRejected,
}

/// Per-survey QC batching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub sample_fraction: f64,
    pub remainder_policy: RemainderPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            sample_fraction: 0.4,
            remainder_policy: RemainderPolicy::QueueForQc,
        }
    }
}

impl BatchConfig {
    /// Number of responses drawn at batch closure: `ceil(size * fraction)`.
    pub fn sample_count(&self) -> usize {
        ((self.batch_size as f64) * self.sample_fraction).ceil() as usize
    }
}

/// Survey-driven thresholds for the auto-rejection rules. A `None` disables
/// the corresponding rule for this survey.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoRejectConfig {
    #[serde(default)]
    pub minimum_duration_secs: Option<i64>,
    #[serde(default)]
    pub max_required_skip_ratio: Option<f64>,
    #[serde(default)]
    pub straight_line_min_answers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub id: String,
    pub name: String,
    pub company_id: String,
    pub mode: SurveyMode,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub sample_size: Option<u32>,
    /// Target quotas, e.g. gender percentages.
    #[serde(default)]
    pub quotas: BTreeMap<String, f64>,
    /// ACs this survey operates in; empty means AC selection is not required.
    #[serde(default)]
    pub acs: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<ReviewerAssignment>,
    #[serde(default)]
    pub interviewers: Vec<InterviewerAssignment>,
    #[serde(default)]
    pub batch_config: BatchConfig,
    #[serde(default)]
    pub auto_reject: AutoRejectConfig,
}

impl Survey {
    pub fn question_at(&self, section: usize, question: usize) -> Option<&Question> {
        self.sections.get(section)?.questions.get(question)
    }

    pub fn total_questions(&self) -> usize {
        self.sections.iter().map(|s| s.questions.len()).sum()
    }

    /// The position immediately after `(section, question)` in survey order,
    /// or `None` at the end of the survey.
    pub fn next_position(&self, section: usize, question: usize) -> Option<(usize, usize)> {
        let current = self.sections.get(section)?;
        if question + 1 < current.questions.len() {
            return Some((section, question + 1));
        }
        let mut s = section + 1;
        while s < self.sections.len() {
            if !self.sections[s].questions.is_empty() {
                return Some((s, 0));
            }
            s += 1;
        }
        None
    }

    /// Sorted distinct set numbers appearing in this survey's questions.
    pub fn set_numbers(&self) -> Vec<u32> {
        let mut sets: Vec<u32> = self
            .sections
            .iter()
            .flat_map(|s| s.questions.iter().filter_map(|q| q.set_number))
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();
        sets.dedup();
        sets
    }

    pub fn requires_ac_selection(&self) -> bool {
        !self.acs.is_empty()
    }

    /// Whether `user` may interview on this survey, honoring the per-mode
    /// pools of a multi-mode survey.
    pub fn allows_interviewer(&self, user_id: &str) -> bool {
        self.interviewers.iter().any(|a| a.user_id == user_id)
    }

    /// AC restriction for a reviewer on this survey; `None` when the user is
    /// not an assigned reviewer, `Some(empty)` meaning all ACs.
    pub fn reviewer_acs(&self, user_id: &str) -> Option<&[String]> {
        self.reviewers
            .iter()
            .find(|a| a.user_id == user_id)
            .map(|a| a.acs.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Abandoned,
    Completed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Abandoned | SessionState::Completed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub section: usize,
    pub question: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Descriptor of a completed interview's audio recording. `audio_url` is the
/// opaque storage key; signed URLs are derived on demand and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioRecording {
    pub audio_url: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub bitrate_kbps: Option<f64>,
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
}

/// Caller-supplied completion metadata. Every field is optional; at
/// completion the session's accumulated metadata is merged underneath with
/// the caller winning per field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionMetadata {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_time_secs: Option<i64>,
    #[serde(default)]
    pub selected_ac: Option<String>,
    #[serde(default)]
    pub polling_station: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub set_number: Option<u32>,
    #[serde(default)]
    pub consent: Option<bool>,
    #[serde(default)]
    pub audio: Option<AudioRecording>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub abandoned: Option<bool>,
    #[serde(default)]
    pub abandoned_reason: Option<String>,
    #[serde(default)]
    pub abandonment_notes: Option<String>,
    #[serde(default)]
    pub is_completed: Option<bool>,
    #[serde(default)]
    pub geo_fence_passed: Option<bool>,
    #[serde(default)]
    pub respondent_name: Option<String>,
    #[serde(default)]
    pub respondent_gender: Option<String>,
    #[serde(default)]
    pub respondent_age: Option<u32>,
}

impl CompletionMetadata {
    /// Merge `self` (the caller's metadata) over `base` (the session's):
    /// caller-supplied fields win, session fields fill the gaps.
    pub fn merged_over(self, base: &CompletionMetadata) -> CompletionMetadata {
        CompletionMetadata {
            start_time: self.start_time.or(base.start_time),
            end_time: self.end_time.or(base.end_time),
            total_time_secs: self.total_time_secs.or(base.total_time_secs),
            selected_ac: self.selected_ac.or_else(|| base.selected_ac.clone()),
            polling_station: self.polling_station.or_else(|| base.polling_station.clone()),
            location: self.location.or(base.location),
            set_number: self.set_number.or(base.set_number),
            consent: self.consent.or(base.consent),
            audio: self.audio.or_else(|| base.audio.clone()),
            call_id: self.call_id.or_else(|| base.call_id.clone()),
            abandoned: self.abandoned.or(base.abandoned),
            abandoned_reason: self
                .abandoned_reason
                .or_else(|| base.abandoned_reason.clone()),
            abandonment_notes: self
                .abandonment_notes
                .or_else(|| base.abandonment_notes.clone()),
            is_completed: self.is_completed.or(base.is_completed),
            geo_fence_passed: self.geo_fence_passed.or(base.geo_fence_passed),
            respondent_name: self
                .respondent_name
                .or_else(|| base.respondent_name.clone()),
            respondent_gender: self
                .respondent_gender
                .or_else(|| base.respondent_gender.clone()),
            respondent_age: self.respondent_age.or(base.respondent_age),
        }
    }
}

/// An in-progress interview. Owns its tentative answers until completion or
/// abandonment. At most one non-terminal session exists per
/// (survey, interviewer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewSession {
    pub id: SessionId,
    pub survey_id: String,
    pub interviewer_id: String,
    pub mode: SurveyMode,
    pub position: Position,
    /// Questions the interviewer has at some point displayed.
    pub reached: BTreeSet<(usize, usize)>,
    /// Tentative answers keyed by question id.
    pub answers: BTreeMap<String, ResponseValue>,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
    /// Metadata accumulated during the interview (AC selection, location,
    /// consent). Merged under the caller's metadata at completion.
    #[serde(default)]
    pub metadata: CompletionMetadata,
}

impl InterviewSession {
    pub fn new(survey: &Survey, interviewer_id: &str, mode: SurveyMode) -> Self {
        let now = Utc::now();
        let mut reached = BTreeSet::new();
        reached.insert((0, 0));
        Self {
            id: SessionId::new(),
            survey_id: survey.id.clone(),
            interviewer_id: interviewer_id.to_string(),
            mode,
            position: Position::default(),
            reached,
            answers: BTreeMap::new(),
            device: None,
            started_at: now,
            last_activity_at: now,
            state: SessionState::Active,
            metadata: CompletionMetadata::default(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// One entry of the final normalized response array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub section_index: usize,
    pub question_index: usize,
    pub question_id: String,
    pub question_type: String,
    pub question_text: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Option labels normalized to plain text.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub value: ResponseValue,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_skipped: bool,
}

/// Quality metrics captured by the collector; kept open-ended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(default)]
    pub completion_percent: Option<f64>,
    #[serde(default)]
    pub answered_count: Option<u32>,
    #[serde(default)]
    pub skipped_required: Option<u32>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Terminal status of a response. Wire names are historical and preserved
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "Pending_Approval")]
    PendingApproval,
    Approved,
    Rejected,
    Terminated,
    #[serde(rename = "abandoned")]
    Abandoned,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::PendingApproval)
    }
}

/// Reviewer verdict data persisted on approve/reject, or the auto-rejection
/// marker set at ingestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationData {
    #[serde(default)]
    pub verified_by: Option<String>,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    /// Per-criterion codes, e.g. audio quality, gender match.
    #[serde(default)]
    pub criteria: BTreeMap<String, String>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub auto_rejected: bool,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

/// An exclusive, time-bounded review lease on a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAssignment {
    pub assigned_to: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ReviewAssignment {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The central record: a completed (or terminated) interview response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: String,
    /// Human-readable numeric identifier, assigned monotonically.
    pub response_id: u64,
    pub session_id: SessionId,
    pub survey_id: String,
    pub interviewer_id: String,
    pub mode: SurveyMode,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds; never persisted below 1.
    pub total_time_secs: i64,
    pub answers: Vec<AnsweredQuestion>,
    #[serde(default)]
    pub selected_ac: Option<String>,
    #[serde(default)]
    pub polling_station: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub audio: Option<AudioRecording>,
    #[serde(default)]
    pub quality: QualityMetrics,
    pub status: ResponseStatus,
    #[serde(default)]
    pub abandoned_reason: Option<String>,
    #[serde(default)]
    pub verification: Option<VerificationData>,
    #[serde(default)]
    pub assignment: Option<ReviewAssignment>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub is_sample_response: bool,
    /// Provider call identifier for CATI interviews.
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub set_number: Option<u32>,
    #[serde(default)]
    pub respondent_name: Option<String>,
    #[serde(default)]
    pub respondent_gender: Option<String>,
    #[serde(default)]
    pub respondent_age: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ResponseRecord {
    /// Normalized fingerprint over the answered questions.
    pub fn fingerprint(&self) -> ResponseFingerprint {
        ResponseFingerprint::new(self.answers.iter().map(|a| {
            (
                a.question_id.as_str(),
                a.question_type.as_str(),
                &a.value,
            )
        }))
    }

    /// Whether the review lease, if any, is still live.
    pub fn has_live_assignment(&self, now: DateTime<Utc>) -> bool {
        self.assignment
            .as_ref()
            .is_some_and(|a| !a.is_expired(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Collecting,
    Processing,
    QcInProgress,
    Closed,
}

/// A per-(survey, interviewer) bucket of completed responses from which the
/// QC sample is drawn. Samples are drawn exactly once, at closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcBatch {
    pub id: String,
    pub survey_id: String,
    pub interviewer_id: String,
    pub config: BatchConfig,
    pub response_ids: Vec<String>,
    pub state: BatchState,
    #[serde(default)]
    pub remaining_decision: Option<RemainderDecision>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl QcBatch {
    pub fn new(survey_id: &str, interviewer_id: &str, config: BatchConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            survey_id: survey_id.to_string(),
            interviewer_id: interviewer_id.to_string(),
            config,
            response_ids: Vec::new(),
            state: BatchState::Collecting,
            remaining_decision: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

/// One CATI completion using a question set; drives strict set rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetData {
    pub survey_id: String,
    pub mode: SurveyMode,
    pub set_number: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survey_with_sets(sets: &[Option<u32>]) -> Survey {
        Survey {
            id: "s1".into(),
            name: "Test".into(),
            company_id: "c1".into(),
            mode: SurveyMode::Cati,
            sections: vec![Section {
                title: None,
                questions: sets
                    .iter()
                    .enumerate()
                    .map(|(i, set)| Question {
                        id: format!("q{i}"),
                        text: format!("Question {i}"),
                        question_type: "single_choice".into(),
                        required: false,
                        condition: None,
                        set_number: *set,
                        options: vec![],
                    })
                    .collect(),
            }],
            sample_size: None,
            quotas: BTreeMap::new(),
            acs: vec![],
            reviewers: vec![],
            interviewers: vec![],
            batch_config: BatchConfig::default(),
            auto_reject: AutoRejectConfig::default(),
        }
    }

    #[test]
    fn set_numbers_are_sorted_and_distinct() {
        let survey = survey_with_sets(&[Some(3), Some(1), None, Some(3), Some(2)]);
        assert_eq!(survey.set_numbers(), vec![1, 2, 3]);
    }

    #[test]
    fn next_position_walks_sections() {
        let mut survey = survey_with_sets(&[None, None]);
        survey.sections.push(Section {
            title: None,
            questions: vec![Question {
                id: "q10".into(),
                text: "Next section".into(),
                question_type: "text".into(),
                required: false,
                condition: None,
                set_number: None,
                options: vec![],
            }],
        });
        assert_eq!(survey.next_position(0, 0), Some((0, 1)));
        assert_eq!(survey.next_position(0, 1), Some((1, 0)));
        assert_eq!(survey.next_position(1, 0), None);
    }

    #[test]
    fn sample_count_rounds_up() {
        let config = BatchConfig {
            batch_size: 5,
            sample_fraction: 0.4,
            remainder_policy: RemainderPolicy::AutoApprove,
        };
        assert_eq!(config.sample_count(), 2);
        let config = BatchConfig {
            batch_size: 10,
            sample_fraction: 0.25,
            remainder_policy: RemainderPolicy::QueueForQc,
        };
        assert_eq!(config.sample_count(), 3);
    }

    #[test]
    fn response_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ResponseStatus::PendingApproval).unwrap(),
            "\"Pending_Approval\""
        );
        assert_eq!(
            serde_json::to_string(&ResponseStatus::Abandoned).unwrap(),
            "\"abandoned\""
        );
        assert_eq!(
            serde_json::to_string(&ResponseStatus::Approved).unwrap(),
            "\"Approved\""
        );
    }

    #[test]
    fn caller_metadata_wins_in_merge() {
        let session_meta = CompletionMetadata {
            selected_ac: Some("AC-1".into()),
            polling_station: Some("PS-9".into()),
            ..Default::default()
        };
        let caller = CompletionMetadata {
            selected_ac: Some("AC-2".into()),
            ..Default::default()
        };
        let merged = caller.merged_over(&session_meta);
        assert_eq!(merged.selected_ac.as_deref(), Some("AC-2"));
        assert_eq!(merged.polling_station.as_deref(), Some("PS-9"));
    }

    #[test]
    fn lease_expiry_boundary() {
        let now = Utc::now();
        let lease = ReviewAssignment {
            assigned_to: "rev-1".into(),
            assigned_at: now - chrono::Duration::minutes(29),
            expires_at: now + chrono::Duration::minutes(1),
        };
        assert!(!lease.is_expired(now));
        let stale = ReviewAssignment {
            assigned_to: "rev-1".into(),
            assigned_at: now - chrono::Duration::minutes(31),
            expires_at: now - chrono::Duration::minutes(1),
        };
        assert!(stale.is_expired(now));
    }
}
