//! The sync engine: one guarded run at a time, triggered by connectivity
//! changes, dashboard focus, app foregrounding, and a periodic timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canvass::domain::{AnsweredQuestion, Survey};
use canvass::value::ResponseValue;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{
    backoff_delay, AudioUploadStatus, OfflineInterview, SyncConfig, SyncEvent, SyncProgress,
    SyncSnapshot, SyncStage, SyncStatus,
};
use crate::backend::{BackendError, CompletionPayload, SyncBackend};
use crate::classify::{classify_completion_error, ErrorClass};
use crate::store::OfflineStore;

/// Result of a `sync_all` invocation. `ran == false` means another run was
/// already in flight (or the trigger was throttled) and nothing happened.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRunOutcome {
    pub ran: bool,
    pub synced: usize,
    pub failed: usize,
}

struct Shared {
    config: SyncConfig,
    backend: Arc<dyn SyncBackend>,
    store: Arc<dyn OfflineStore>,
    running: AtomicBool,
    online: AtomicBool,
    last_run_started: std::sync::Mutex<Option<std::time::Instant>>,
    event_tx: broadcast::Sender<SyncEvent>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    snapshot_rx: watch::Receiver<SyncSnapshot>,
}

#[derive(Clone)]
pub struct SyncEngine {
    shared: Arc<Shared>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn SyncBackend>,
        store: Arc<dyn OfflineStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                config,
                backend,
                store,
                running: AtomicBool::new(false),
                online: AtomicBool::new(false),
                last_run_started: std::sync::Mutex::new(None),
                event_tx,
                snapshot_tx,
                snapshot_rx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.shared.snapshot_rx.borrow().clone()
    }

    /// Connectivity transition. Coming online triggers an immediate sync.
    pub async fn set_online(&self, online: bool) -> SyncRunOutcome {
        let was_online = self.shared.online.swap(online, Ordering::SeqCst);
        self.push_snapshot(false).await;
        if online && !was_online {
            return self.sync_all().await;
        }
        SyncRunOutcome::default()
    }

    /// Dashboard focus: sync immediately when there is pending work, but at
    /// most once per `min_gap_between_syncs_secs`.
    pub async fn on_dashboard_focus(&self) -> SyncRunOutcome {
        if !self.shared.online.load(Ordering::SeqCst) {
            return SyncRunOutcome::default();
        }
        let gap = Duration::from_secs(self.shared.config.min_gap_between_syncs_secs);
        {
            let last = self.shared.last_run_started.lock().expect("lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < gap {
                    self.emit(SyncEvent::Skipped {
                        reason: "sync throttled".to_string(),
                    });
                    return SyncRunOutcome::default();
                }
            }
        }
        match self.shared.store.list_unsynced().await {
            Ok(pending) if !pending.is_empty() => self.sync_all().await,
            _ => SyncRunOutcome::default(),
        }
    }

    /// App foregrounding: sync when online.
    pub async fn on_foreground(&self) -> SyncRunOutcome {
        if self.shared.online.load(Ordering::SeqCst) {
            self.sync_all().await
        } else {
            SyncRunOutcome::default()
        }
    }

    /// Spawn the periodic timer: one sync per interval while online.
    pub fn start_periodic(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(engine.shared.config.periodic_interval_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if engine.shared.online.load(Ordering::SeqCst) {
                    engine.sync_all().await;
                }
            }
        })
    }

    /// Sync every unsynced interview, one at a time. At most one run is
    /// active; concurrent triggers return immediately.
    pub async fn sync_all(&self) -> SyncRunOutcome {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.emit(SyncEvent::Skipped {
                reason: "sync already running".to_string(),
            });
            return SyncRunOutcome::default();
        }
        {
            let mut last = self.shared.last_run_started.lock().expect("lock poisoned");
            *last = Some(std::time::Instant::now());
        }

        let outcome = self.run_once().await;

        self.shared.running.store(false, Ordering::SeqCst);
        self.push_snapshot(true).await;
        outcome
    }

    async fn run_once(&self) -> SyncRunOutcome {
        let queue = match self.shared.store.list_unsynced().await {
            Ok(queue) => queue,
            Err(err) => {
                warn!(error = %err, "could not read sync queue");
                return SyncRunOutcome {
                    ran: true,
                    ..Default::default()
                };
            }
        };
        let total = queue.len();
        self.emit(SyncEvent::Started { total });
        self.push_snapshot(true).await;

        let mut synced = 0usize;
        let mut failed = 0usize;
        for (index, interview) in queue.into_iter().enumerate() {
            let id = interview.id.clone();
            match self
                .sync_one(interview, index + 1, total, synced, failed)
                .await
            {
                Ok(response_id) => {
                    synced += 1;
                    self.emit(SyncEvent::InterviewSynced { id, response_id });
                }
                Err(error) => {
                    failed += 1;
                    self.emit(SyncEvent::InterviewFailed { id, error });
                }
            }
            self.push_snapshot(true).await;
        }

        info!(synced, failed, "sync run finished");
        self.emit(SyncEvent::Finished { synced, failed });
        SyncRunOutcome {
            ran: true,
            synced,
            failed,
        }
    }

    /// Sync a single interview. On success the `response_id` and the
    /// `synced` status are stored in one write, then the local record and
    /// its audio file are deleted.
    async fn sync_one(
        &self,
        mut interview: OfflineInterview,
        current: usize,
        total: usize,
        synced_count: usize,
        failed_count: usize,
    ) -> Result<Option<u64>, String> {
        let progress = |stage: SyncStage, percent: u8| {
            SyncEvent::Progress(SyncProgress {
                current_interview: current,
                total_interviews: total,
                interview_progress: percent,
                stage,
                synced_count,
                failed_count,
            })
        };

        // Already acknowledged by the server in an earlier run.
        if interview.response_id.is_some() {
            let response_id = interview.response_id;
            self.finalize_synced(interview).await?;
            return Ok(response_id);
        }

        interview.status = SyncStatus::Syncing;
        interview.sync_attempts += 1;
        self.store_update(&interview).await?;
        self.emit(progress(SyncStage::UploadingData, 10));

        if interview.needs_session() {
            match self
                .shared
                .backend
                .start_interview(&interview.survey_id)
                .await
            {
                Ok(dto) => {
                    interview.session_id = Some(dto.session_id);
                    self.store_update(&interview).await?;
                }
                Err(err) => {
                    return Err(self.mark_failed(interview, &err, false).await);
                }
            }
        }
        let session_id = interview
            .session_id
            .clone()
            .unwrap_or_default();

        let survey = match self.shared.store.cached_survey(&interview.survey_id).await {
            Ok(Some(survey)) => survey,
            Ok(None) => {
                let message = format!("survey {} not cached locally", interview.survey_id);
                interview.status = SyncStatus::Failed;
                interview.error = Some(message.clone());
                self.store_update(&interview).await?;
                return Err(message);
            }
            Err(err) => return Err(err.to_string()),
        };

        let responses = final_answers(&survey, &interview);
        let mut metadata = interview.metadata.clone();
        metadata.total_time_secs = Some(duration_secs(&interview));

        if !interview.is_cati_mode && interview.audio_url.is_none() && interview.audio_path.is_some()
        {
            self.emit(progress(SyncStage::UploadingAudio, 40));
            self.upload_audio(&mut interview).await?;
        }
        if let Some(audio_url) = &interview.audio_url {
            let mut audio = metadata.audio.clone().unwrap_or_default();
            audio.audio_url = audio_url.clone();
            metadata.audio = Some(audio);
        }

        let payload = CompletionPayload {
            responses,
            quality: Default::default(),
            metadata,
        };

        self.emit(progress(SyncStage::UploadingData, 70));
        let result = if interview.is_cati_mode {
            self.shared
                .backend
                .complete_cati(&session_id, interview.cati_queue_id.as_deref(), &payload)
                .await
        } else {
            self.shared.backend.complete(&session_id, &payload).await
        };

        self.emit(progress(SyncStage::Verifying, 90));
        match result {
            Ok(reply) => {
                if reply.is_duplicate {
                    debug!(interview = %interview.id, response_id = reply.response_id, "server reported duplicate; treating as success");
                }
                interview.response_id = Some(reply.response_id);
                let response_id = interview.response_id;
                self.finalize_synced(interview).await?;
                self.emit(progress(SyncStage::Synced, 100));
                Ok(response_id)
            }
            Err(err) => {
                match classify_completion_error(
                    &err,
                    interview.server_error_count,
                    &self.shared.config,
                ) {
                    ErrorClass::Duplicate { response_id } => {
                        debug!(interview = %interview.id, "completion error classified as duplicate; treating as success");
                        interview.response_id = response_id;
                        self.finalize_synced(interview).await?;
                        self.emit(progress(SyncStage::Synced, 100));
                        Ok(response_id)
                    }
                    ErrorClass::Retryable => {
                        self.emit(progress(SyncStage::Failed, 100));
                        Err(self.mark_failed(interview, &err, true).await)
                    }
                    ErrorClass::Fatal => {
                        self.emit(progress(SyncStage::Failed, 100));
                        Err(self.mark_failed(interview, &err, false).await)
                    }
                }
            }
        }
    }

    /// Upload the recorded audio with retry and exponential backoff. A
    /// terminal failure is not fatal: the completion proceeds without audio
    /// and the upload is retried on the next full sync.
    async fn upload_audio(&self, interview: &mut OfflineInterview) -> Result<(), String> {
        let Some(path) = interview.audio_path.clone() else {
            return Ok(());
        };
        let session_id = interview.session_id.clone().unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.m4a", interview.id));

        interview.audio_upload_status = AudioUploadStatus::Uploading;
        self.store_update(interview).await?;

        for attempt in 0..self.shared.config.max_audio_upload_attempts {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    warn!(interview = %interview.id, "audio file is empty; continuing without audio");
                    break;
                }
                Err(err) => {
                    warn!(interview = %interview.id, error = %err, "audio file unreadable; continuing without audio");
                    break;
                }
            };

            match self
                .shared
                .backend
                .upload_audio(&session_id, &interview.survey_id, &file_name, bytes)
                .await
            {
                Ok(uploaded) => {
                    interview.audio_url = Some(uploaded.audio_url.clone());
                    interview.audio_upload_status = AudioUploadStatus::Uploaded;
                    let mut audio = interview.metadata.audio.clone().unwrap_or_default();
                    audio.audio_url = uploaded.audio_url;
                    audio.file_size_bytes = Some(uploaded.size);
                    interview.metadata.audio = Some(audio);
                    self.store_update(interview).await?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        interview = %interview.id,
                        attempt,
                        error = %err,
                        "audio upload attempt failed"
                    );
                    if attempt + 1 < self.shared.config.max_audio_upload_attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        interview.audio_upload_status = AudioUploadStatus::Failed;
        self.store_update(interview).await?;
        Ok(())
    }

    /// Store `response_id` together with the `synced` status, then delete
    /// the local record and its audio file. The ordering is deliberate: the
    /// acknowledged id is durable before anything is deleted.
    async fn finalize_synced(&self, mut interview: OfflineInterview) -> Result<(), String> {
        interview.status = SyncStatus::Synced;
        interview.error = None;
        self.store_update(&interview).await?;
        self.shared
            .store
            .remove(&interview.id)
            .await
            .map_err(|e| e.to_string())?;
        if let Some(path) = &interview.audio_path {
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!(interview = %interview.id, error = %err, "audio file cleanup failed");
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        mut interview: OfflineInterview,
        err: &BackendError,
        retryable: bool,
    ) -> String {
        if err.status() == Some(self.shared.config.duplicate_retry_status) {
            interview.server_error_count += 1;
        }
        let message = err.to_string();
        interview.status = SyncStatus::Failed;
        interview.error = Some(message.clone());
        if let Err(store_err) = self.shared.store.update(&interview).await {
            warn!(interview = %interview.id, error = %store_err, "could not persist failed state");
        }
        if retryable {
            debug!(interview = %interview.id, "left failed for a future sync run");
        }
        message
    }

    async fn store_update(&self, interview: &OfflineInterview) -> Result<(), String> {
        self.shared
            .store
            .update(interview)
            .await
            .map_err(|e| e.to_string())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    async fn push_snapshot(&self, recount: bool) {
        let pending = if recount {
            self.shared
                .store
                .list_unsynced()
                .await
                .map(|q| q.len())
                .unwrap_or(0)
        } else {
            self.shared.snapshot_rx.borrow().pending
        };
        let previous = self.shared.snapshot_rx.borrow().clone();
        let _ = self.shared.snapshot_tx.send(SyncSnapshot {
            running: self.shared.running.load(Ordering::SeqCst),
            online: self.shared.online.load(Ordering::SeqCst),
            pending,
            synced_count: previous.synced_count,
            failed_count: previous.failed_count,
            last_finished_at: Some(Utc::now()),
        });
    }
}

/// Duration preference chain: stored total, else end − start, else the
/// 1-second floor. Never below 1.
fn duration_secs(interview: &OfflineInterview) -> i64 {
    interview
        .metadata
        .total_time_secs
        .filter(|t| *t > 0)
        .or_else(|| {
            match (interview.metadata.start_time, interview.metadata.end_time) {
                (Some(start), Some(end)) => Some((end - start).num_seconds()),
                _ => None,
            }
        })
        .unwrap_or(1)
        .max(1)
}

/// Build the final response array by walking the cached survey structure,
/// emitting one entry per question and preserving required-but-skipped
/// entries.
fn final_answers(survey: &Survey, interview: &OfflineInterview) -> Vec<AnsweredQuestion> {
    let mut out = Vec::new();
    for (section_index, section) in survey.sections.iter().enumerate() {
        for (question_index, question) in section.questions.iter().enumerate() {
            let value = interview
                .answers
                .get(&question.id)
                .cloned()
                .map(ResponseValue::from)
                .unwrap_or_default();
            let is_skipped = value.is_empty_answer();
            out.push(AnsweredQuestion {
                section_index,
                question_index,
                question_id: question.id.clone(),
                question_type: question.question_type.clone(),
                question_text: question.text.clone(),
                description: None,
                options: question.options.clone(),
                value,
                is_required: question.required,
                is_skipped,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvass::domain::CompletionMetadata;

    #[test]
    fn duration_prefers_stored_total() {
        let mut interview = OfflineInterview::new("i1", "s1");
        interview.metadata.total_time_secs = Some(240);
        assert_eq!(duration_secs(&interview), 240);
    }

    #[test]
    fn duration_falls_back_to_timestamps_then_floor() {
        let mut interview = OfflineInterview::new("i1", "s1");
        let start = Utc::now();
        interview.metadata = CompletionMetadata {
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::seconds(95)),
            ..Default::default()
        };
        assert_eq!(duration_secs(&interview), 95);

        interview.metadata = CompletionMetadata::default();
        assert_eq!(duration_secs(&interview), 1);

        interview.metadata.total_time_secs = Some(-5);
        assert_eq!(duration_secs(&interview), 1);
    }
}
