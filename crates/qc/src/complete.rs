//! Completion ingestion: turns a finished interview session into a durable
//! response, runs the auto-rejection rules, and hands the response to QC
//! batching.

use std::sync::Arc;

use canvass::domain::{
    AnsweredQuestion, CompletionMetadata, InterviewSession, QualityMetrics, ResponseRecord,
    ResponseStatus, SessionId, SessionState, SetData, Survey, SurveyMode, User, VerificationData,
};
use canvass::store::{ResponseStore, SessionStore, SetDataStore, SurveyStore};
use canvass::{PipelineError, PipelineResult, StoreError};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::BatchManager;
use crate::rules::AutoRejectRule;

/// The final payload of a completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub responses: Vec<AnsweredQuestion>,
    pub quality: QualityMetrics,
    pub metadata: CompletionMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionSummary {
    pub total_questions: usize,
    pub answered: usize,
    pub skipped: usize,
    pub completion_percent: f64,
}

/// What the submitting interviewer gets back. `status` is always
/// `Pending_Approval`, regardless of auto-rejection, to keep QC internals
/// invisible to the collecting side.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub response_id: u64,
    pub status: ResponseStatus,
    pub summary: CompletionSummary,
}

pub struct CompletionIngestor {
    sessions: Arc<dyn SessionStore>,
    surveys: Arc<dyn SurveyStore>,
    responses: Arc<dyn ResponseStore>,
    sets: Arc<dyn SetDataStore>,
    batches: Arc<BatchManager>,
    rules: Vec<Box<dyn AutoRejectRule>>,
}

impl CompletionIngestor {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        surveys: Arc<dyn SurveyStore>,
        responses: Arc<dyn ResponseStore>,
        sets: Arc<dyn SetDataStore>,
        batches: Arc<BatchManager>,
        rules: Vec<Box<dyn AutoRejectRule>>,
    ) -> Self {
        Self {
            sessions,
            surveys,
            responses,
            sets,
            batches,
            rules,
        }
    }

    /// Ingest a CAPI (or multi-mode) completion.
    pub async fn complete(
        &self,
        session_id: &SessionId,
        caller: &User,
        request: CompletionRequest,
    ) -> PipelineResult<CompletionOutcome> {
        self.ingest(session_id, caller, request, None).await
    }

    /// Ingest a CATI completion. Identical pipeline, minus audio, plus the
    /// dialer queue reference for tracing.
    pub async fn complete_cati(
        &self,
        session_id: &SessionId,
        caller: &User,
        cati_queue_id: Option<String>,
        request: CompletionRequest,
    ) -> PipelineResult<CompletionOutcome> {
        self.ingest(session_id, caller, request, cati_queue_id).await
    }

    async fn ingest(
        &self,
        session_id: &SessionId,
        caller: &User,
        request: CompletionRequest,
        cati_queue_id: Option<String>,
    ) -> PipelineResult<CompletionOutcome> {
        let mut session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("session {session_id}")))?;
        if session.interviewer_id != caller.id {
            return Err(PipelineError::Forbidden(format!(
                "session {session_id} does not belong to {}",
                caller.id
            )));
        }

        // Retried submission: the session already produced a response.
        if let Some(existing) = self.responses.find_by_session(session_id).await? {
            return Err(PipelineError::DuplicateSubmission {
                response_id: existing.response_id,
            });
        }
        if session.state.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "session {session_id} is already {:?}",
                session.state
            )));
        }

        let survey = self
            .surveys
            .get_survey(&session.survey_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("survey {}", session.survey_id)))?;

        let metadata = request.metadata.merged_over(&session.metadata);
        let response_id = self.responses.next_response_id().await?;
        let mut record = build_record(
            response_id,
            &session,
            request.responses,
            request.quality,
            metadata,
            ResponseStatus::PendingApproval,
            None,
        );
        if let Some(queue_id) = &cati_queue_id {
            info!(session = %session_id, queue_id, "cati completion");
        }

        let mut auto_rejected = false;
        for rule in &self.rules {
            if let Some(reason) = rule.evaluate(&survey, &record) {
                warn!(
                    session = %session_id,
                    rule = rule.name(),
                    %reason,
                    "auto-rejection rule triggered"
                );
                record.status = ResponseStatus::Rejected;
                record.verification = Some(VerificationData {
                    auto_rejected: true,
                    rejection_reason: Some(reason),
                    verified_at: Some(Utc::now()),
                    ..Default::default()
                });
                auto_rejected = true;
                break;
            }
        }

        match self.responses.insert_response(record.clone()).await {
            Ok(()) => {}
            // A racing retry won the insert; surface the duplicate shape.
            Err(StoreError::AlreadyExists(_)) => {
                let existing = self
                    .responses
                    .find_by_session(session_id)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Internal(format!(
                            "duplicate insert for session {session_id} but no response found"
                        ))
                    })?;
                return Err(PipelineError::DuplicateSubmission {
                    response_id: existing.response_id,
                });
            }
            Err(err) => return Err(err.into()),
        }

        if session.mode == SurveyMode::Cati {
            if let Some(set_number) = record.set_number {
                self.sets
                    .append_set(SetData {
                        survey_id: session.survey_id.clone(),
                        mode: SurveyMode::Cati,
                        set_number,
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }

        if !auto_rejected {
            self.batches.enroll(&record, &survey).await?;
        }

        session.state = SessionState::Abandoned;
        session.touch();
        self.sessions.update_session(&session).await?;

        let summary = summarize(&survey, &record.answers);
        info!(
            session = %session_id,
            response_id,
            auto_rejected,
            "completion ingested"
        );
        Ok(CompletionOutcome {
            response_id,
            // QC internals stay hidden from the collecting side.
            status: ResponseStatus::PendingApproval,
            summary,
        })
    }
}

fn summarize(survey: &Survey, answers: &[AnsweredQuestion]) -> CompletionSummary {
    let total_questions = survey.total_questions();
    let answered = answers
        .iter()
        .filter(|a| !a.is_skipped && !a.value.is_empty_answer())
        .count();
    let skipped = answers.iter().filter(|a| a.is_skipped).count();
    let completion_percent = if total_questions == 0 {
        0.0
    } else {
        (answered as f64 / total_questions as f64) * 100.0
    };
    CompletionSummary {
        total_questions,
        answered,
        skipped,
        completion_percent,
    }
}

/// Build the final response array from a session's tentative answers by
/// walking the survey structure, preserving skipped entries.
pub fn answers_from_session(survey: &Survey, session: &InterviewSession) -> Vec<AnsweredQuestion> {
    let mut out = Vec::new();
    for (section_index, section) in survey.sections.iter().enumerate() {
        for (question_index, question) in section.questions.iter().enumerate() {
            let value = session
                .answers
                .get(&question.id)
                .cloned()
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

/// Promote an abandoned session's in-flight data to a `Terminated` response.
/// Returns the numeric response id (the existing one when a retry already
/// promoted this session).
pub(crate) async fn promote_terminated(
    responses: &dyn ResponseStore,
    session: &InterviewSession,
    answers: Vec<AnsweredQuestion>,
    metadata: CompletionMetadata,
    reason: String,
) -> PipelineResult<u64> {
    let response_id = responses.next_response_id().await?;
    let record = build_record(
        response_id,
        session,
        answers,
        QualityMetrics::default(),
        metadata,
        ResponseStatus::Terminated,
        Some(reason),
    );
    match responses.insert_response(record).await {
        Ok(()) => Ok(response_id),
        Err(StoreError::AlreadyExists(_)) => {
            let existing = responses.find_by_session(&session.id).await?.ok_or_else(|| {
                PipelineError::Internal(format!(
                    "duplicate insert for session {} but no response found",
                    session.id
                ))
            })?;
            Ok(existing.response_id)
        }
        Err(err) => Err(err.into()),
    }
}

/// Assemble a `ResponseRecord` from session state and merged metadata,
/// normalizing the timing fields. `total_time_secs` is never below 1.
pub(crate) fn build_record(
    response_id: u64,
    session: &InterviewSession,
    answers: Vec<AnsweredQuestion>,
    quality: QualityMetrics,
    metadata: CompletionMetadata,
    status: ResponseStatus,
    abandoned_reason: Option<String>,
) -> ResponseRecord {
    let now = Utc::now();
    let start_time = metadata.start_time.unwrap_or(session.started_at);
    let end_time = metadata.end_time.unwrap_or(now);
    let total_time_secs = metadata
        .total_time_secs
        .filter(|t| *t > 0)
        .unwrap_or_else(|| (end_time - session.started_at).num_seconds())
        .max(1);

    ResponseRecord {
        id: Uuid::new_v4().to_string(),
        response_id,
        session_id: session.id.clone(),
        survey_id: session.survey_id.clone(),
        interviewer_id: session.interviewer_id.clone(),
        mode: session.mode,
        start_time,
        end_time,
        total_time_secs,
        answers,
        selected_ac: metadata.selected_ac.clone(),
        polling_station: metadata.polling_station.clone(),
        location: metadata.location,
        audio: metadata.audio.clone(),
        quality,
        status,
        abandoned_reason,
        verification: None,
        assignment: None,
        batch_id: None,
        is_sample_response: false,
        call_id: metadata.call_id.clone(),
        set_number: metadata.set_number,
        respondent_name: metadata.respondent_name.clone(),
        respondent_gender: metadata.respondent_gender.clone(),
        respondent_age: metadata.respondent_age,
        created_at: now,
    }
}
