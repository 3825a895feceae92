//! End-to-end sync engine behavior against a scripted backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use canvass::domain::{
    AutoRejectConfig, BatchConfig, Question, Section, Survey, SurveyMode,
};
use canvass_sync::{
    BackendError, CompletionPayload, CompletionReply, MemoryOfflineStore, OfflineInterview,
    SyncBackend, SyncConfig, SyncEngine, SyncStatus,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct MockState {
    complete_replies: VecDeque<Result<CompletionReply, BackendError>>,
    audio_replies: VecDeque<Result<(String, u64), BackendError>>,
    started_sessions: Vec<String>,
    completions: Vec<(String, CompletionPayload)>,
    audio_uploads: Vec<String>,
}

#[derive(Clone, Default)]
struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    async fn push_complete(&self, reply: Result<CompletionReply, BackendError>) {
        self.state.lock().await.complete_replies.push_back(reply);
    }

    async fn push_audio(&self, reply: Result<(String, u64), BackendError>) {
        self.state.lock().await.audio_replies.push_back(reply);
    }
}

#[async_trait]
impl SyncBackend for MockBackend {
    async fn start_interview(
        &self,
        survey_id: &str,
    ) -> Result<canvass_sync::backend::StartedSessionDto, BackendError> {
        let mut state = self.state.lock().await;
        let session_id = format!("server-session-{}", state.started_sessions.len());
        state.started_sessions.push(survey_id.to_string());
        Ok(canvass_sync::backend::StartedSessionDto { session_id })
    }

    async fn upload_audio(
        &self,
        _session_id: &str,
        _survey_id: &str,
        file_name: &str,
        _bytes: Vec<u8>,
    ) -> Result<canvass_sync::backend::AudioUploadDto, BackendError> {
        let mut state = self.state.lock().await;
        state.audio_uploads.push(file_name.to_string());
        match state.audio_replies.pop_front() {
            Some(Ok((audio_url, size))) => {
                Ok(canvass_sync::backend::AudioUploadDto { audio_url, size })
            }
            Some(Err(err)) => Err(err),
            None => Ok(canvass_sync::backend::AudioUploadDto {
                audio_url: "audio/default.m4a".into(),
                size: 1,
            }),
        }
    }

    async fn complete(
        &self,
        session_id: &str,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError> {
        let mut state = self.state.lock().await;
        state
            .completions
            .push((session_id.to_string(), payload.clone()));
        state
            .complete_replies
            .pop_front()
            .unwrap_or(Ok(CompletionReply {
                response_id: 1,
                is_duplicate: false,
            }))
    }

    async fn complete_cati(
        &self,
        session_id: &str,
        _cati_queue_id: Option<&str>,
        payload: &CompletionPayload,
    ) -> Result<CompletionReply, BackendError> {
        self.complete(session_id, payload).await
    }
}

fn survey() -> Survey {
    Survey {
        id: "s1".into(),
        name: "Household".into(),
        company_id: "c1".into(),
        mode: SurveyMode::Capi,
        sections: vec![Section {
            title: None,
            questions: vec![
                Question {
                    id: "q1".into(),
                    text: "First".into(),
                    question_type: "single_choice".into(),
                    required: true,
                    condition: None,
                    set_number: None,
                    options: vec![],
                },
                Question {
                    id: "q2".into(),
                    text: "Second".into(),
                    question_type: "text".into(),
                    required: true,
                    condition: None,
                    set_number: None,
                    options: vec![],
                },
            ],
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

fn offline_interview(id: &str) -> OfflineInterview {
    let mut interview = OfflineInterview::new(id, "s1");
    interview.session_id = Some(format!("offline_{id}"));
    interview
        .answers
        .insert("q1".into(), serde_json::json!("yes"));
    interview
}

async fn engine_with(
    backend: MockBackend,
) -> (SyncEngine, Arc<MemoryOfflineStore>) {
    let store = Arc::new(MemoryOfflineStore::new());
    store.put_survey(survey()).await;
    let engine = SyncEngine::new(SyncConfig::default(), Arc::new(backend), store.clone());
    (engine, store)
}

#[tokio::test]
async fn offline_interview_acquires_session_and_syncs() {
    let backend = MockBackend::default();
    backend
        .push_complete(Ok(CompletionReply {
            response_id: 42,
            is_duplicate: false,
        }))
        .await;
    let (engine, store) = engine_with(backend.clone()).await;
    store.put_interview(offline_interview("i1")).await;

    let outcome = engine.set_online(true).await;
    assert!(outcome.ran);
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failed, 0);

    // The local record is deleted once synced.
    assert!(store.get_interview("i1").await.is_none());

    let state = backend.state.lock().await;
    assert_eq!(state.started_sessions, vec!["s1".to_string()]);
    let (session_id, payload) = &state.completions[0];
    assert!(session_id.starts_with("server-session-"));
    // The final array walks the cached survey: both questions appear, the
    // unanswered required one preserved as skipped.
    assert_eq!(payload.responses.len(), 2);
    assert!(!payload.responses[0].is_skipped);
    assert!(payload.responses[1].is_skipped);
    assert!(payload.responses[1].is_required);
    assert!(payload.metadata.total_time_secs.unwrap() >= 1);
}

#[tokio::test]
async fn duplicate_reply_counts_as_synced() {
    let backend = MockBackend::default();
    backend
        .push_complete(Ok(CompletionReply {
            response_id: 71,
            is_duplicate: true,
        }))
        .await;
    let (engine, store) = engine_with(backend).await;
    store.put_interview(offline_interview("i1")).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.synced, 1);
    assert!(store.get_interview("i1").await.is_none());
}

#[tokio::test]
async fn duplicate_marker_error_counts_as_synced() {
    let backend = MockBackend::default();
    backend
        .push_complete(Err(BackendError::Status {
            status: 400,
            body: "E11000 duplicate key error".into(),
        }))
        .await;
    let (engine, store) = engine_with(backend).await;
    store.put_interview(offline_interview("i1")).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failed, 0);
    assert!(store.get_interview("i1").await.is_none());
}

#[tokio::test]
async fn retryable_error_leaves_failed_record_for_next_run() {
    let backend = MockBackend::default();
    backend
        .push_complete(Err(BackendError::Status {
            status: 500,
            body: "internal".into(),
        }))
        .await;
    let (engine, store) = engine_with(backend.clone()).await;
    store.put_interview(offline_interview("i1")).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.failed, 1);
    let kept = store.get_interview("i1").await.unwrap();
    assert_eq!(kept.status, SyncStatus::Failed);
    assert_eq!(kept.server_error_count, 1);
    assert!(kept.error.is_some());
}

#[tokio::test]
async fn two_prior_500s_reclassify_the_third_as_duplicate() {
    let backend = MockBackend::default();
    for _ in 0..3 {
        backend
            .push_complete(Err(BackendError::Status {
                status: 500,
                body: "internal".into(),
            }))
            .await;
    }
    let (engine, store) = engine_with(backend).await;
    store.put_interview(offline_interview("i1")).await;
    engine.set_online(true).await;

    // Second and third runs; the third sees two prior 500s and treats the
    // next 500 as a server-side duplicate.
    let second = engine.on_foreground().await;
    assert_eq!(second.failed, 1);
    let third = engine.on_foreground().await;
    assert_eq!(third.synced, 1);
    assert!(store.get_interview("i1").await.is_none());
}

#[tokio::test]
async fn fatal_error_marks_failed_without_retry_credit() {
    let backend = MockBackend::default();
    backend
        .push_complete(Err(BackendError::Status {
            status: 403,
            body: "forbidden".into(),
        }))
        .await;
    let (engine, store) = engine_with(backend).await;
    store.put_interview(offline_interview("i1")).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.failed, 1);
    let kept = store.get_interview("i1").await.unwrap();
    assert_eq!(kept.status, SyncStatus::Failed);
    assert_eq!(kept.server_error_count, 0);
}

#[tokio::test]
async fn audio_failure_continues_without_audio() {
    let dir = tempfile::tempdir().unwrap();
    let audio_path = dir.path().join("rec.m4a");
    tokio::fs::write(&audio_path, b"audio-bytes").await.unwrap();

    let backend = MockBackend::default();
    backend
        .push_audio(Err(BackendError::Status {
            status: 502,
            body: "bad gateway".into(),
        }))
        .await;
    backend
        .push_complete(Ok(CompletionReply {
            response_id: 8,
            is_duplicate: false,
        }))
        .await;

    let store = Arc::new(MemoryOfflineStore::new());
    store.put_survey(survey()).await;
    // One attempt keeps the test fast; the backoff schedule is covered by
    // unit tests.
    let config = SyncConfig {
        max_audio_upload_attempts: 1,
        ..Default::default()
    };
    let engine = SyncEngine::new(config, Arc::new(backend.clone()), store.clone());

    let mut interview = offline_interview("i1");
    interview.audio_path = Some(audio_path.clone());
    store.put_interview(interview).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.synced, 1);
    let state = backend.state.lock().await;
    let (_, payload) = &state.completions[0];
    assert!(payload.metadata.audio.is_none());
}

#[tokio::test]
async fn successful_audio_upload_lands_in_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let audio_path = dir.path().join("rec.m4a");
    tokio::fs::write(&audio_path, b"audio-bytes").await.unwrap();

    let backend = MockBackend::default();
    backend
        .push_audio(Ok(("audio/s1/rec.m4a".into(), 11)))
        .await;
    backend
        .push_complete(Ok(CompletionReply {
            response_id: 9,
            is_duplicate: false,
        }))
        .await;

    let store = Arc::new(MemoryOfflineStore::new());
    store.put_survey(survey()).await;
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Arc::new(backend.clone()),
        store.clone(),
    );

    let mut interview = offline_interview("i1");
    interview.audio_path = Some(audio_path.clone());
    store.put_interview(interview).await;

    engine.set_online(true).await;
    let state = backend.state.lock().await;
    assert_eq!(state.audio_uploads.len(), 1);
    let (_, payload) = &state.completions[0];
    let audio = payload.metadata.audio.as_ref().unwrap();
    assert_eq!(audio.audio_url, "audio/s1/rec.m4a");
    assert_eq!(audio.file_size_bytes, Some(11));
    // The audio file is deleted after a successful sync.
    assert!(!audio_path.exists());
}

#[tokio::test]
async fn cati_interviews_skip_audio_and_use_cati_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let audio_path = dir.path().join("rec.m4a");
    tokio::fs::write(&audio_path, b"audio-bytes").await.unwrap();

    let backend = MockBackend::default();
    backend
        .push_complete(Ok(CompletionReply {
            response_id: 12,
            is_duplicate: false,
        }))
        .await;
    let (engine, store) = engine_with(backend.clone()).await;

    let mut interview = offline_interview("i1");
    interview.is_cati_mode = true;
    interview.cati_queue_id = Some("queue-4".into());
    interview.audio_path = Some(audio_path);
    store.put_interview(interview).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.synced, 1);
    let state = backend.state.lock().await;
    assert!(state.audio_uploads.is_empty());
}

#[tokio::test]
async fn dashboard_focus_is_throttled() {
    let backend = MockBackend::default();
    let (engine, store) = engine_with(backend).await;
    store.put_interview(offline_interview("i1")).await;

    let first = engine.set_online(true).await;
    assert!(first.ran);

    store.put_interview(offline_interview("i2")).await;
    // Within the 30-second gap the focus trigger does nothing.
    let focused = engine.on_dashboard_focus().await;
    assert!(!focused.ran);
}

#[tokio::test]
async fn already_acknowledged_interviews_are_not_resubmitted() {
    let backend = MockBackend::default();
    let (engine, store) = engine_with(backend.clone()).await;

    let mut interview = offline_interview("i1");
    interview.response_id = Some(55);
    interview.status = SyncStatus::Failed;
    store.put_interview(interview).await;

    let outcome = engine.set_online(true).await;
    assert_eq!(outcome.synced, 1);
    assert!(store.get_interview("i1").await.is_none());
    let state = backend.state.lock().await;
    assert!(state.completions.is_empty());
    assert!(state.started_sessions.is_empty());
}
