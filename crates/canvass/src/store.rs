//! Logical storage contracts.
//!
//! Any concrete database backend (document or relational) implements these
//! traits; the pipeline never performs read-modify-write on shared records.
//! Mutations go through the atomic primitives below (claim, transition,
//! verification write), which a backend maps onto its native conditional
//! update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    BatchState, InterviewSession, QcBatch, RemainderDecision, ResponseRecord, ResponseStatus,
    ReviewAssignment, SessionId, SetData, Survey, SurveyMode, User, VerificationData,
};
use crate::error::StoreError;

/// Outcome of an atomic lease-claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The lease was granted; the updated record is returned.
    Claimed(ResponseRecord),
    /// Another reviewer holds a live lease, or the record left
    /// `Pending_Approval` concurrently.
    Contended,
    Missing,
}

/// Outcome of an atomic verification write.
#[derive(Debug)]
pub enum VerifyWrite {
    /// Transition applied; the updated record is returned.
    Applied(ResponseRecord),
    /// The response is no longer `Pending_Approval`.
    NotPending(ResponseStatus),
    /// A live lease is held by a different reviewer.
    HeldByOther(String),
    Missing,
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn create_session(&self, session: InterviewSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<InterviewSession>, StoreError>;

    /// Full replacement; sessions are single-owner so this is race-free.
    async fn update_session(&self, session: &InterviewSession) -> Result<(), StoreError>;

    /// The non-terminal session for a (survey, interviewer) pair, if any.
    async fn find_open_session(
        &self,
        survey_id: &str,
        interviewer_id: &str,
    ) -> Result<Option<InterviewSession>, StoreError>;
}

#[async_trait]
pub trait ResponseStore: Send + Sync + 'static {
    /// Insert a new response. `session_id` is unique across responses;
    /// a second insert for the same session fails with `AlreadyExists`.
    async fn insert_response(&self, response: ResponseRecord) -> Result<(), StoreError>;

    /// Next value of the human-readable numeric response id.
    async fn next_response_id(&self) -> Result<u64, StoreError>;

    async fn get_response(&self, id: &str) -> Result<Option<ResponseRecord>, StoreError>;

    async fn find_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ResponseRecord>, StoreError>;

    /// Atomic status write on one response.
    async fn set_status(
        &self,
        id: &str,
        status: ResponseStatus,
        abandoned_reason: Option<String>,
    ) -> Result<(), StoreError>;

    /// Atomic status write over a set of responses; returns how many were
    /// updated. Missing ids are skipped, not errors.
    async fn set_statuses(
        &self,
        ids: &[String],
        status: ResponseStatus,
        abandoned_reason: Option<String>,
    ) -> Result<usize, StoreError>;

    /// Set `is_sample_response` on each id.
    async fn mark_sampled(&self, ids: &[String]) -> Result<(), StoreError>;

    /// Set the batch back-pointer.
    async fn set_batch(&self, id: &str, batch_id: &str) -> Result<(), StoreError>;

    /// Atomically install a review lease iff the current assignment is
    /// absent or expired and the response is still `Pending_Approval`.
    async fn try_claim(
        &self,
        id: &str,
        assignment: ReviewAssignment,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Clear the lease iff held by `reviewer_id` (or already absent).
    /// Returns `false` when a different reviewer holds a live lease.
    async fn clear_assignment(&self, id: &str, reviewer_id: &str) -> Result<bool, StoreError>;

    /// The response currently leased to `reviewer_id` with an unexpired
    /// assignment, if any.
    async fn find_assigned_to(
        &self,
        reviewer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ResponseRecord>, StoreError>;

    /// All `Pending_Approval` responses in the given surveys, ordered by
    /// `created_at` ascending.
    async fn list_pending(&self, survey_ids: &[String]) -> Result<Vec<ResponseRecord>, StoreError>;

    /// Atomically transition `Pending_Approval` → `status` with the holder
    /// check of §review, persisting the verification data and clearing the
    /// lease.
    async fn complete_verification(
        &self,
        id: &str,
        reviewer_id: &str,
        status: ResponseStatus,
        verification: VerificationData,
        now: DateTime<Utc>,
    ) -> Result<VerifyWrite, StoreError>;

    /// Responses created inside `[from, to)`, for reconciliation runs.
    async fn list_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ResponseRecord>, StoreError>;
}

#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    async fn create_batch(&self, batch: QcBatch) -> Result<(), StoreError>;

    async fn get_batch(&self, id: &str) -> Result<Option<QcBatch>, StoreError>;

    /// The `collecting` batch for a (survey, interviewer) pair, if any.
    async fn find_collecting(
        &self,
        survey_id: &str,
        interviewer_id: &str,
    ) -> Result<Option<QcBatch>, StoreError>;

    /// Append a response to a `collecting` batch that is below its
    /// configured size; `Conflict` otherwise. Returns the batch after the
    /// append.
    async fn append_response(
        &self,
        batch_id: &str,
        response_id: &str,
    ) -> Result<QcBatch, StoreError>;

    /// Compare-and-set state transition; `false` when the current state is
    /// not `from`.
    async fn transition(
        &self,
        batch_id: &str,
        from: BatchState,
        to: BatchState,
    ) -> Result<bool, StoreError>;

    async fn set_remainder_decision(
        &self,
        batch_id: &str,
        decision: RemainderDecision,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SetDataStore: Send + Sync + 'static {
    /// The most recent set record for (survey, mode).
    async fn last_set(
        &self,
        survey_id: &str,
        mode: SurveyMode,
    ) -> Result<Option<SetData>, StoreError>;

    async fn append_set(&self, entry: SetData) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SurveyStore: Send + Sync + 'static {
    async fn get_survey(&self, id: &str) -> Result<Option<Survey>, StoreError>;

    async fn put_survey(&self, survey: Survey) -> Result<(), StoreError>;

    /// Surveys where `user_id` appears as an assigned reviewer.
    async fn surveys_for_reviewer(&self, user_id: &str) -> Result<Vec<Survey>, StoreError>;

    async fn surveys_for_company(&self, company_id: &str) -> Result<Vec<Survey>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn put_user(&self, user: User) -> Result<(), StoreError>;
}
