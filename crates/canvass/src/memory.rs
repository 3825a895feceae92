//! In-memory implementation of the storage contracts.
//!
//! One mutex guards all collections, which makes every conditional update
//! (lease claim, batch transition, verification write) trivially atomic.
//! Production deployments substitute a database-backed implementation with
//! native conditional updates; this one backs the service in development and
//! the test suites.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    BatchState, InterviewSession, QcBatch, RemainderDecision, ResponseRecord, ResponseStatus,
    ReviewAssignment, SessionId, SetData, Survey, SurveyMode, User, VerificationData,
};
use crate::error::StoreError;
use crate::store::{
    BatchStore, ClaimOutcome, ResponseStore, SessionStore, SetDataStore, SurveyStore, UserStore,
    VerifyWrite,
};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, InterviewSession>,
    responses: HashMap<String, ResponseRecord>,
    response_by_session: HashMap<SessionId, String>,
    next_response_id: u64,
    batches: HashMap<String, QcBatch>,
    sets: Vec<SetData>,
    surveys: HashMap<String, Survey>,
    users: HashMap<String, User>,
}

/// In-memory store implementing every storage trait of this crate.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: InterviewSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(format!(
                "session {}",
                session.id
            )));
        }
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<InterviewSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(id).cloned())
    }

    async fn update_session(&self, session: &InterviewSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_open_session(
        &self,
        survey_id: &str,
        interviewer_id: &str,
    ) -> Result<Option<InterviewSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| {
                s.survey_id == survey_id
                    && s.interviewer_id == interviewer_id
                    && !s.state.is_terminal()
            })
            .cloned())
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn insert_response(&self, response: ResponseRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.response_by_session.contains_key(&response.session_id) {
            return Err(StoreError::AlreadyExists(format!(
                "response for session {}",
                response.session_id
            )));
        }
        inner
            .response_by_session
            .insert(response.session_id.clone(), response.id.clone());
        inner.responses.insert(response.id.clone(), response);
        Ok(())
    }

    async fn next_response_id(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_response_id += 1;
        Ok(inner.next_response_id)
    }

    async fn get_response(&self, id: &str) -> Result<Option<ResponseRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.responses.get(id).cloned())
    }

    async fn find_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ResponseRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .response_by_session
            .get(session_id)
            .and_then(|id| inner.responses.get(id))
            .cloned())
    }

    async fn set_status(
        &self,
        id: &str,
        status: ResponseStatus,
        abandoned_reason: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .responses
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("response {id}")))?;
        record.status = status;
        if abandoned_reason.is_some() {
            record.abandoned_reason = abandoned_reason;
        }
        Ok(())
    }

    async fn set_statuses(
        &self,
        ids: &[String],
        status: ResponseStatus,
        abandoned_reason: Option<String>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(record) = inner.responses.get_mut(id) {
                record.status = status;
                if let Some(reason) = &abandoned_reason {
                    record.abandoned_reason = Some(reason.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_sampled(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            if let Some(record) = inner.responses.get_mut(id) {
                record.is_sample_response = true;
            }
        }
        Ok(())
    }

    async fn set_batch(&self, id: &str, batch_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .responses
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("response {id}")))?;
        record.batch_id = Some(batch_id.to_string());
        Ok(())
    }

    async fn try_claim(
        &self,
        id: &str,
        assignment: ReviewAssignment,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.responses.get_mut(id) else {
            return Ok(ClaimOutcome::Missing);
        };
        if record.status != ResponseStatus::PendingApproval {
            return Ok(ClaimOutcome::Contended);
        }
        if record.has_live_assignment(now) {
            return Ok(ClaimOutcome::Contended);
        }
        record.assignment = Some(assignment);
        Ok(ClaimOutcome::Claimed(record.clone()))
    }

    async fn clear_assignment(&self, id: &str, reviewer_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .responses
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("response {id}")))?;
        match &record.assignment {
            None => Ok(true),
            Some(a) if a.assigned_to == reviewer_id || a.is_expired(Utc::now()) => {
                record.assignment = None;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn find_assigned_to(
        &self,
        reviewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ResponseRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .responses
            .values()
            .find(|r| {
                r.status == ResponseStatus::PendingApproval
                    && r.assignment
                        .as_ref()
                        .is_some_and(|a| a.assigned_to == reviewer_id && !a.is_expired(now))
            })
            .cloned())
    }

    async fn list_pending(&self, survey_ids: &[String]) -> Result<Vec<ResponseRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<ResponseRecord> = inner
            .responses
            .values()
            .filter(|r| {
                r.status == ResponseStatus::PendingApproval
                    && survey_ids.iter().any(|s| *s == r.survey_id)
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn complete_verification(
        &self,
        id: &str,
        reviewer_id: &str,
        status: ResponseStatus,
        verification: VerificationData,
        now: DateTime<Utc>,
    ) -> Result<VerifyWrite, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.responses.get_mut(id) else {
            return Ok(VerifyWrite::Missing);
        };
        if record.status != ResponseStatus::PendingApproval {
            return Ok(VerifyWrite::NotPending(record.status));
        }
        if let Some(a) = &record.assignment {
            if a.assigned_to != reviewer_id && !a.is_expired(now) {
                return Ok(VerifyWrite::HeldByOther(a.assigned_to.clone()));
            }
        }
        record.status = status;
        record.verification = Some(verification);
        record.assignment = None;
        Ok(VerifyWrite::Applied(record.clone()))
    }

    async fn list_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResponseRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<ResponseRecord> = inner
            .responses
            .values()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, batch: QcBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists(format!("batch {}", batch.id)));
        }
        inner.batches.insert(batch.id.clone(), batch);
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<QcBatch>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.batches.get(id).cloned())
    }

    async fn find_collecting(
        &self,
        survey_id: &str,
        interviewer_id: &str,
    ) -> Result<Option<QcBatch>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .batches
            .values()
            .find(|b| {
                b.survey_id == survey_id
                    && b.interviewer_id == interviewer_id
                    && b.state == BatchState::Collecting
            })
            .cloned())
    }

    async fn append_response(
        &self,
        batch_id: &str,
        response_id: &str,
    ) -> Result<QcBatch, StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        if batch.state != BatchState::Collecting {
            return Err(StoreError::Conflict(format!(
                "batch {batch_id} is no longer collecting"
            )));
        }
        if batch.response_ids.len() >= batch.config.batch_size {
            return Err(StoreError::Conflict(format!("batch {batch_id} is full")));
        }
        if !batch.response_ids.iter().any(|id| id == response_id) {
            batch.response_ids.push(response_id.to_string());
        }
        Ok(batch.clone())
    }

    async fn transition(
        &self,
        batch_id: &str,
        from: BatchState,
        to: BatchState,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        if batch.state != from {
            return Ok(false);
        }
        batch.state = to;
        if matches!(to, BatchState::QcInProgress | BatchState::Closed) {
            batch.closed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn set_remainder_decision(
        &self,
        batch_id: &str,
        decision: RemainderDecision,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let batch = inner
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        batch.remaining_decision = Some(decision);
        Ok(())
    }
}

#[async_trait]
impl SetDataStore for MemoryStore {
    async fn last_set(
        &self,
        survey_id: &str,
        mode: SurveyMode,
    ) -> Result<Option<SetData>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .iter()
            .filter(|s| s.survey_id == survey_id && s.mode == mode)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn append_set(&self, entry: SetData) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.sets.push(entry);
        Ok(())
    }
}

#[async_trait]
impl SurveyStore for MemoryStore {
    async fn get_survey(&self, id: &str) -> Result<Option<Survey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.surveys.get(id).cloned())
    }

    async fn put_survey(&self, survey: Survey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.surveys.insert(survey.id.clone(), survey);
        Ok(())
    }

    async fn surveys_for_reviewer(&self, user_id: &str) -> Result<Vec<Survey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .surveys
            .values()
            .filter(|s| s.reviewers.iter().any(|r| r.user_id == user_id))
            .cloned()
            .collect())
    }

    async fn surveys_for_company(&self, company_id: &str) -> Result<Vec<Survey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .surveys
            .values()
            .filter(|s| s.company_id == company_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(id).cloned())
    }

    async fn put_user(&self, user: User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user.id.clone(), user);
        Ok(())
    }
}
