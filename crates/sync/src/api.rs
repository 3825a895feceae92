//! Public types of the sync engine: configuration, the local interview
//! record, and the progress event stream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use canvass::domain::CompletionMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine configuration. Defaults match the deployed client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Periodic sync interval while online.
    #[serde(default = "default_periodic_interval_secs")]
    pub periodic_interval_secs: u64,
    /// Minimum gap between dashboard-focus triggered syncs.
    #[serde(default = "default_min_gap_between_syncs_secs")]
    pub min_gap_between_syncs_secs: u64,
    #[serde(default = "default_max_audio_upload_attempts")]
    pub max_audio_upload_attempts: u32,
    #[serde(default = "default_focus_reload_cooldown_ms")]
    pub focus_reload_cooldown_ms: u64,
    /// How many prior server errors with the same session id are read as "the
    /// submission actually landed". A coping mechanism for imperfect server
    /// error categorization; see `classify`.
    #[serde(default = "default_duplicate_500_threshold")]
    pub duplicate_500_threshold: u32,
    /// The status code counted by `duplicate_500_threshold`.
    #[serde(default = "default_duplicate_retry_status")]
    pub duplicate_retry_status: u16,
}

fn default_periodic_interval_secs() -> u64 {
    300
}

fn default_min_gap_between_syncs_secs() -> u64 {
    30
}

fn default_max_audio_upload_attempts() -> u32 {
    3
}

fn default_focus_reload_cooldown_ms() -> u64 {
    2000
}

fn default_duplicate_500_threshold() -> u32 {
    2
}

fn default_duplicate_retry_status() -> u16 {
    500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: default_periodic_interval_secs(),
            min_gap_between_syncs_secs: default_min_gap_between_syncs_secs(),
            max_audio_upload_attempts: default_max_audio_upload_attempts(),
            focus_reload_cooldown_ms: default_focus_reload_cooldown_ms(),
            duplicate_500_threshold: default_duplicate_500_threshold(),
            duplicate_retry_status: default_duplicate_retry_status(),
        }
    }
}

/// Delay before audio upload attempt `attempt` (0-based retry count):
/// 1 s, 2 s, 4 s, … capped at 10 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis.min(10_000))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioUploadStatus {
    None,
    Uploading,
    Uploaded,
    Failed,
}

/// Stage of a single interview's sync, for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    UploadingData,
    UploadingAudio,
    Verifying,
    Synced,
    Failed,
}

/// Session ids minted locally while offline carry this prefix; they are
/// replaced by a server session before completion.
pub const OFFLINE_SESSION_PREFIX: &str = "offline_";

/// One locally captured interview awaiting upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineInterview {
    pub id: String,
    pub survey_id: String,
    #[serde(default)]
    pub is_cati_mode: bool,
    #[serde(default)]
    pub cati_queue_id: Option<String>,
    /// Server session id, or a local `offline_` id until one is acquired.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Raw answers keyed by question id.
    #[serde(default)]
    pub answers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub audio_path: Option<PathBuf>,
    /// Storage key returned by a previously successful audio upload.
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub metadata: CompletionMetadata,
    pub status: SyncStatus,
    pub audio_upload_status: AudioUploadStatus,
    #[serde(default)]
    pub sync_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    /// Set by the server on successful (or duplicate) completion.
    #[serde(default)]
    pub response_id: Option<u64>,
    /// Consecutive completion failures with the configured retry status.
    #[serde(default)]
    pub server_error_count: u32,
}

impl OfflineInterview {
    pub fn new(id: &str, survey_id: &str) -> Self {
        Self {
            id: id.to_string(),
            survey_id: survey_id.to_string(),
            is_cati_mode: false,
            cati_queue_id: None,
            session_id: None,
            answers: BTreeMap::new(),
            audio_path: None,
            audio_url: None,
            metadata: CompletionMetadata::default(),
            status: SyncStatus::Pending,
            audio_upload_status: AudioUploadStatus::None,
            sync_attempts: 0,
            error: None,
            response_id: None,
            server_error_count: 0,
        }
    }

    /// Whether a server session must be acquired before completion.
    pub fn needs_session(&self) -> bool {
        match &self.session_id {
            None => true,
            Some(id) => id.starts_with(OFFLINE_SESSION_PREFIX),
        }
    }
}

/// Per-interview progress published for UI consumption.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncProgress {
    pub current_interview: usize,
    pub total_interviews: usize,
    /// 0–100.
    pub interview_progress: u8,
    pub stage: SyncStage,
    pub synced_count: usize,
    pub failed_count: usize,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Started { total: usize },
    Progress(SyncProgress),
    InterviewSynced { id: String, response_id: Option<u64> },
    InterviewFailed { id: String, error: String },
    Finished { synced: usize, failed: usize },
    Skipped { reason: String },
}

/// Latest engine state snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSnapshot {
    pub running: bool,
    pub online: bool,
    pub pending: usize,
    pub synced_count: usize,
    pub failed_count: usize,
    pub last_finished_at: Option<DateTime<Utc>>,
}
