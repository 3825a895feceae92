//! End-to-end pipeline scenarios: session → completion → batching → review.

use std::collections::BTreeMap;
use std::sync::Arc;

use canvass::config::ReviewConfig;
use canvass::domain::{
    AnsweredQuestion, AudioRecording, AutoRejectConfig, BatchConfig, CompletionMetadata,
    InterviewerAssignment, QualityMetrics, Question, RemainderPolicy, ResponseStatus,
    ReviewerAssignment, Role, Section, Survey, SurveyMode, User,
};
use canvass::memory::MemoryStore;
use canvass::store::{ResponseStore, SessionStore, SurveyStore, UserStore};
use canvass::value::ResponseValue;
use canvass::PipelineError;
use canvass_qc::complete::CompletionRequest;
use canvass_qc::review::{NextReviewOutcome, ReviewFilters, Verdict};
use canvass_qc::{BatchManager, CompletionIngestor, ReviewQueue, SessionManager};

fn survey(remainder_policy: RemainderPolicy) -> Survey {
    Survey {
        id: "s1".into(),
        name: "Household Pulse".into(),
        company_id: "c1".into(),
        mode: SurveyMode::Capi,
        sections: vec![Section {
            title: Some("Main".into()),
            questions: (0..10)
                .map(|i| Question {
                    id: format!("q{i}"),
                    text: format!("Question {i}"),
                    question_type: "single_choice".into(),
                    required: true,
                    condition: None,
                    set_number: None,
                    options: vec!["yes".into(), "no".into()],
                })
                .collect(),
        }],
        sample_size: None,
        quotas: BTreeMap::new(),
        acs: vec![],
        reviewers: vec![
            ReviewerAssignment {
                user_id: "bob".into(),
                acs: vec![],
            },
            ReviewerAssignment {
                user_id: "carol".into(),
                acs: vec![],
            },
        ],
        interviewers: vec![InterviewerAssignment {
            user_id: "alice".into(),
            mode: None,
        }],
        batch_config: BatchConfig {
            batch_size: 5,
            sample_fraction: 0.4,
            remainder_policy,
        },
        auto_reject: AutoRejectConfig::default(),
    }
}

fn alice() -> User {
    User {
        id: "alice".into(),
        name: "Alice".into(),
        role: Role::Interviewer,
        company_id: "c1".into(),
    }
}

fn reviewer(id: &str) -> User {
    User {
        id: id.into(),
        name: id.into(),
        role: Role::QualityAgent,
        company_id: "c1".into(),
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    sessions: SessionManager,
    ingestor: CompletionIngestor,
    reviews: ReviewQueue,
}

async fn pipeline(remainder_policy: RemainderPolicy) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    store.put_survey(survey(remainder_policy)).await.unwrap();
    store.put_user(alice()).await.unwrap();
    let batches = Arc::new(BatchManager::new(store.clone(), store.clone()));
    Pipeline {
        sessions: SessionManager::new(store.clone(), store.clone(), store.clone()),
        ingestor: CompletionIngestor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            batches,
            canvass_qc::rules::default_rules(),
        ),
        reviews: ReviewQueue::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ReviewConfig::default(),
        ),
        store,
    }
}

fn ten_answers() -> Vec<AnsweredQuestion> {
    (0..10)
        .map(|i| AnsweredQuestion {
            section_index: 0,
            question_index: i,
            question_id: format!("q{i}"),
            question_type: "single_choice".into(),
            question_text: format!("Question {i}"),
            description: None,
            options: vec!["yes".into(), "no".into()],
            value: ResponseValue::Str(if i % 2 == 0 { "yes" } else { "no" }.into()),
            is_required: true,
            is_skipped: false,
        })
        .collect()
}

fn capi_metadata() -> CompletionMetadata {
    CompletionMetadata {
        total_time_secs: Some(600),
        audio: Some(AudioRecording {
            audio_url: "audio/s1/alice.m4a".into(),
            duration_secs: Some(600.0),
            format: Some("m4a".into()),
            codec: Some("aac".into()),
            bitrate_kbps: Some(64.0),
            file_size_bytes: Some(4_800_000),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn start_answer_complete_capi() {
    let p = pipeline(RemainderPolicy::QueueForQc).await;
    let started = p.sessions.start_interview("s1", &alice()).await.unwrap();
    let session_id = started.session.id.clone();

    for i in 0..10 {
        p.sessions
            .update_response(
                &session_id,
                &alice(),
                &format!("q{i}"),
                ResponseValue::Str("yes".into()),
            )
            .await
            .unwrap();
    }

    let outcome = p
        .ingestor
        .complete(
            &session_id,
            &alice(),
            CompletionRequest {
                responses: ten_answers(),
                quality: QualityMetrics::default(),
                metadata: capi_metadata(),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ResponseStatus::PendingApproval);
    let record = p.store.find_by_session(&session_id).await.unwrap().unwrap();
    assert_eq!(record.status, ResponseStatus::PendingApproval);
    assert_eq!(record.total_time_secs, 600);
    assert_eq!(
        record.audio.as_ref().map(|a| a.audio_url.as_str()),
        Some("audio/s1/alice.m4a")
    );
    let session = p.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.state, canvass::domain::SessionState::Abandoned);
}

#[tokio::test]
async fn duplicate_completion_returns_existing_response_id() {
    let p = pipeline(RemainderPolicy::QueueForQc).await;
    let started = p.sessions.start_interview("s1", &alice()).await.unwrap();
    let session_id = started.session.id.clone();

    let request = CompletionRequest {
        responses: ten_answers(),
        quality: QualityMetrics::default(),
        metadata: capi_metadata(),
    };
    let first = p
        .ingestor
        .complete(&session_id, &alice(), request.clone())
        .await
        .unwrap();

    // Flaky network: the client retries the same completion.
    let err = p
        .ingestor
        .complete(&session_id, &alice(), request)
        .await
        .unwrap_err();
    match err {
        PipelineError::DuplicateSubmission { response_id } => {
            assert_eq!(response_id, first.response_id);
        }
        other => panic!("expected duplicate submission, got {other:?}"),
    }
}

#[tokio::test]
async fn five_completions_close_a_batch_with_two_samples() {
    let p = pipeline(RemainderPolicy::AutoApprove).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let started = p.sessions.start_interview("s1", &alice()).await.unwrap();
        let session_id = started.session.id.clone();
        p.ingestor
            .complete(
                &session_id,
                &alice(),
                CompletionRequest {
                    responses: ten_answers(),
                    quality: QualityMetrics::default(),
                    metadata: capi_metadata(),
                },
            )
            .await
            .unwrap();
        ids.push(p.store.find_by_session(&session_id).await.unwrap().unwrap().id);
    }

    let mut sampled = 0;
    let mut auto_approved = 0;
    for id in &ids {
        let record = p.store.get_response(id).await.unwrap().unwrap();
        assert!(record.batch_id.is_some());
        if record.is_sample_response {
            sampled += 1;
            assert_eq!(record.status, ResponseStatus::PendingApproval);
        } else {
            auto_approved += 1;
            assert_eq!(record.status, ResponseStatus::Approved);
        }
    }
    assert_eq!(sampled, 2);
    assert_eq!(auto_approved, 3);
}

#[tokio::test]
async fn reviewers_racing_get_distinct_responses() {
    let p = pipeline(RemainderPolicy::QueueForQc).await;

    for _ in 0..2 {
        let started = p.sessions.start_interview("s1", &alice()).await.unwrap();
        p.ingestor
            .complete(
                &started.session.id,
                &alice(),
                CompletionRequest {
                    responses: ten_answers(),
                    quality: QualityMetrics::default(),
                    metadata: capi_metadata(),
                },
            )
            .await
            .unwrap();
    }

    let bob = reviewer("bob");
    let carol = reviewer("carol");
    let bob_filters = ReviewFilters::default();
    let carol_filters = ReviewFilters::default();
    let (bob_next, carol_next) = tokio::join!(
        p.reviews.get_next(&bob, &bob_filters),
        p.reviews.get_next(&carol, &carol_filters),
    );
    let bob_id = match bob_next.unwrap() {
        NextReviewOutcome::Assigned(n) => n.response.id,
        other => panic!("bob got {other:?}"),
    };
    let carol_id = match carol_next.unwrap() {
        NextReviewOutcome::Assigned(n) => n.response.id,
        other => panic!("carol got {other:?}"),
    };
    assert_ne!(bob_id, carol_id);
}

#[tokio::test]
async fn approved_responses_leave_the_queue() {
    let p = pipeline(RemainderPolicy::QueueForQc).await;
    let started = p.sessions.start_interview("s1", &alice()).await.unwrap();
    p.ingestor
        .complete(
            &started.session.id,
            &alice(),
            CompletionRequest {
                responses: ten_answers(),
                quality: QualityMetrics::default(),
                metadata: capi_metadata(),
            },
        )
        .await
        .unwrap();

    let bob = reviewer("bob");
    let next = match p.reviews.get_next(&bob, &ReviewFilters::default()).await.unwrap() {
        NextReviewOutcome::Assigned(n) => n,
        other => panic!("{other:?}"),
    };
    p.reviews
        .submit_verification(
            &next.response.id,
            &bob,
            Verdict::Approved,
            BTreeMap::new(),
            None,
        )
        .await
        .unwrap();

    let outcome = p
        .reviews
        .get_next(&bob, &ReviewFilters::default())
        .await
        .unwrap();
    assert!(matches!(outcome, NextReviewOutcome::Empty { .. }));
}
