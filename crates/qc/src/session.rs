//! Interview-session lifecycle: start, navigation, tentative answers,
//! pause/resume, abandonment.

use std::sync::Arc;

use canvass::domain::{
    AnsweredQuestion, CompletionMetadata, InterviewSession, Position, SessionId, SessionState,
    Survey, SurveyMode, User,
};
use canvass::store::{ResponseStore, SessionStore, SurveyStore};
use canvass::value::ResponseValue;
use canvass::{PipelineError, PipelineResult};
use serde::Serialize;
use tracing::{debug, info};

use crate::complete;

/// Question types that select administrative geography rather than answer a
/// survey question; they never count as valid answers for abandonment
/// promotion.
pub const SELECTION_QUESTION_TYPES: [&str; 2] = ["ac_selection", "polling_station_selection"];

/// Result of `start_interview`: the fresh session plus what the client needs
/// to decide whether to show the AC picker first.
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub session: InterviewSession,
    pub requires_ac_selection: bool,
    pub assigned_acs: Vec<String>,
}

pub struct SessionManager {
    surveys: Arc<dyn SurveyStore>,
    sessions: Arc<dyn SessionStore>,
    responses: Arc<dyn ResponseStore>,
}

impl SessionManager {
    pub fn new(
        surveys: Arc<dyn SurveyStore>,
        sessions: Arc<dyn SessionStore>,
        responses: Arc<dyn ResponseStore>,
    ) -> Self {
        Self {
            surveys,
            sessions,
            responses,
        }
    }

    /// Start a new interview for `interviewer` on `survey_id`.
    ///
    /// Any existing non-terminal session for the pair is abandoned first, so
    /// the single-open-session invariant holds without coordination on the
    /// client.
    pub async fn start_interview(
        &self,
        survey_id: &str,
        interviewer: &User,
    ) -> PipelineResult<StartedSession> {
        let survey = self.require_survey(survey_id).await?;
        if !survey.allows_interviewer(&interviewer.id) {
            return Err(PipelineError::Forbidden(format!(
                "user {} is not assigned to survey {survey_id}",
                interviewer.id
            )));
        }

        if let Some(mut open) = self
            .sessions
            .find_open_session(survey_id, &interviewer.id)
            .await?
        {
            debug!(session = %open.id, "abandoning stale session before start");
            open.state = SessionState::Abandoned;
            open.touch();
            self.sessions.update_session(&open).await?;
        }

        let mode = match survey.mode {
            SurveyMode::MultiMode => self.interviewer_mode(&survey, &interviewer.id),
            other => other,
        };
        let session = InterviewSession::new(&survey, &interviewer.id, mode);
        info!(session = %session.id, survey = survey_id, interviewer = %interviewer.id, "interview started");
        self.sessions.create_session(session.clone()).await?;

        Ok(StartedSession {
            requires_ac_selection: survey.requires_ac_selection(),
            assigned_acs: survey.acs.clone(),
            session,
        })
    }

    pub async fn get_session(
        &self,
        session_id: &SessionId,
        caller: &User,
    ) -> PipelineResult<InterviewSession> {
        self.owned_session(session_id, caller).await
    }

    /// Overwrite the tentative answer for a question.
    pub async fn update_response(
        &self,
        session_id: &SessionId,
        caller: &User,
        question_id: &str,
        value: ResponseValue,
    ) -> PipelineResult<()> {
        let mut session = self.owned_live_session(session_id, caller).await?;
        session.answers.insert(question_id.to_string(), value);
        session.touch();
        self.sessions.update_session(&session).await?;
        Ok(())
    }

    /// Navigate to `(section, question)`. Only questions already reached, or
    /// the immediate next question from the current position, are allowed.
    pub async fn navigate_to(
        &self,
        session_id: &SessionId,
        caller: &User,
        section: usize,
        question: usize,
    ) -> PipelineResult<InterviewSession> {
        let mut session = self.owned_live_session(session_id, caller).await?;
        let survey = self.require_survey(&session.survey_id).await?;
        if survey.question_at(section, question).is_none() {
            return Err(PipelineError::BadRequest(format!(
                "no question at ({section}, {question})"
            )));
        }

        let target = (section, question);
        let next = survey.next_position(session.position.section, session.position.question);
        if !session.reached.contains(&target) && next != Some(target) {
            return Err(PipelineError::Forbidden(format!(
                "navigation to unreached question ({section}, {question})"
            )));
        }

        session.position = Position { section, question };
        session.reached.insert(target);
        session.touch();
        self.sessions.update_session(&session).await?;
        Ok(session)
    }

    /// Record that a question has been displayed. Idempotent.
    pub async fn mark_reached(
        &self,
        session_id: &SessionId,
        caller: &User,
        section: usize,
        question: usize,
    ) -> PipelineResult<()> {
        let mut session = self.owned_live_session(session_id, caller).await?;
        session.reached.insert((section, question));
        session.touch();
        self.sessions.update_session(&session).await?;
        Ok(())
    }

    pub async fn pause(&self, session_id: &SessionId, caller: &User) -> PipelineResult<()> {
        self.flip_state(session_id, caller, SessionState::Active, SessionState::Paused)
            .await
    }

    pub async fn resume(&self, session_id: &SessionId, caller: &User) -> PipelineResult<()> {
        self.flip_state(session_id, caller, SessionState::Paused, SessionState::Active)
            .await
    }

    /// Abandon the session. When at least one valid answer exists (excluding
    /// AC/polling-station selections and empty values), the in-flight data is
    /// promoted to a `Terminated` response carrying the abandonment reason;
    /// otherwise the session is simply marked abandoned.
    ///
    /// Returns the numeric response id of the promoted record, if one was
    /// created.
    pub async fn abandon(
        &self,
        session_id: &SessionId,
        caller: &User,
        responses: Option<Vec<AnsweredQuestion>>,
        metadata: Option<CompletionMetadata>,
    ) -> PipelineResult<Option<u64>> {
        let mut session = self.owned_live_session(session_id, caller).await?;
        let survey = self.require_survey(&session.survey_id).await?;

        let answers =
            responses.unwrap_or_else(|| complete::answers_from_session(&survey, &session));
        let valid = answers
            .iter()
            .filter(|a| {
                !SELECTION_QUESTION_TYPES.contains(&a.question_type.as_str())
                    && !a.value.is_empty_answer()
            })
            .count();

        let promoted = if valid > 0 {
            let metadata = metadata
                .unwrap_or_default()
                .merged_over(&session.metadata);
            let reason = metadata
                .abandoned_reason
                .clone()
                .unwrap_or_else(|| "Abandoned by interviewer".to_string());
            let response_id = complete::promote_terminated(
                self.responses.as_ref(),
                &session,
                answers,
                metadata,
                reason,
            )
            .await?;
            info!(session = %session.id, response_id, "abandoned session promoted to terminated response");
            Some(response_id)
        } else {
            debug!(session = %session.id, "abandoned session had no valid answers");
            None
        };

        session.state = SessionState::Abandoned;
        session.touch();
        self.sessions.update_session(&session).await?;
        Ok(promoted)
    }

    async fn flip_state(
        &self,
        session_id: &SessionId,
        caller: &User,
        from: SessionState,
        to: SessionState,
    ) -> PipelineResult<()> {
        let mut session = self.owned_session(session_id, caller).await?;
        if session.state != from {
            return Err(PipelineError::Conflict(format!(
                "session {session_id} is not {from:?}"
            )));
        }
        session.state = to;
        session.touch();
        self.sessions.update_session(&session).await?;
        Ok(())
    }

    async fn owned_session(
        &self,
        session_id: &SessionId,
        caller: &User,
    ) -> PipelineResult<InterviewSession> {
        let session = self
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
        Ok(session)
    }

    async fn owned_live_session(
        &self,
        session_id: &SessionId,
        caller: &User,
    ) -> PipelineResult<InterviewSession> {
        let session = self.owned_session(session_id, caller).await?;
        if session.state.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "session {session_id} is already {:?}",
                session.state
            )));
        }
        Ok(session)
    }

    async fn require_survey(&self, survey_id: &str) -> PipelineResult<Survey> {
        self.surveys
            .get_survey(survey_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("survey {survey_id}")))
    }

    /// The pool an interviewer belongs to on a multi-mode survey; defaults
    /// to CAPI when the assignment does not pin a mode.
    fn interviewer_mode(&self, survey: &Survey, user_id: &str) -> SurveyMode {
        survey
            .interviewers
            .iter()
            .find(|a| a.user_id == user_id)
            .and_then(|a| a.mode)
            .unwrap_or(SurveyMode::Capi)
    }
}
