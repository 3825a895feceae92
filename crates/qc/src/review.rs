//! The review queue: serves "next response to review" under expiring
//! exclusive leases, and applies reviewer verdicts.

use std::collections::HashMap;
use std::sync::Arc;

use canvass::config::ReviewConfig;
use canvass::domain::{
    QcBatch, ResponseRecord, ResponseStatus, ReviewAssignment, Role, Survey, User,
    VerificationData,
};
use canvass::store::{BatchStore, ClaimOutcome, ResponseStore, SurveyStore, VerifyWrite};
use canvass::{PipelineError, PipelineResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::is_reviewable;

/// Optional narrowing filters for `get_next`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewFilters {
    /// Free-text search over survey name, response id, session id, and
    /// respondent name.
    pub search: Option<String>,
    pub gender: Option<String>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
}

/// Reviewer verdict on a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextReview {
    pub response: ResponseRecord,
    pub expires_at: DateTime<Utc>,
}

/// Result of `get_next`: either a leased response or the reason the queue
/// came up empty. An empty queue is not an error.
#[derive(Debug)]
pub enum NextReviewOutcome {
    Assigned(NextReview),
    Empty { message: String },
}

struct ScopedSurvey {
    survey: Survey,
    /// `None` = every AC of the survey.
    allowed_acs: Option<Vec<String>>,
}

pub struct ReviewQueue {
    responses: Arc<dyn ResponseStore>,
    batches: Arc<dyn BatchStore>,
    surveys: Arc<dyn SurveyStore>,
    config: ReviewConfig,
}

impl ReviewQueue {
    pub fn new(
        responses: Arc<dyn ResponseStore>,
        batches: Arc<dyn BatchStore>,
        surveys: Arc<dyn SurveyStore>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            responses,
            batches,
            surveys,
            config,
        }
    }

    /// Serve the next reviewable response to `reviewer`, granting an
    /// exclusive lease. An existing unexpired lease held by the reviewer is
    /// returned as-is, so reloads and device switches resume the same item.
    pub async fn get_next(
        &self,
        reviewer: &User,
        filters: &ReviewFilters,
    ) -> PipelineResult<NextReviewOutcome> {
        let now = Utc::now();

        if let Some(held) = self.responses.find_assigned_to(&reviewer.id, now).await? {
            let expires_at = held
                .assignment
                .as_ref()
                .map(|a| a.expires_at)
                .unwrap_or(now);
            debug!(reviewer = %reviewer.id, response = %held.id, "returning held lease");
            return Ok(NextReviewOutcome::Assigned(NextReview {
                response: held,
                expires_at,
            }));
        }

        let scope = self.scope_for(reviewer).await?;
        if scope.is_empty() {
            return Ok(NextReviewOutcome::Empty {
                message: "No surveys assigned for review".to_string(),
            });
        }

        // Claim loop: losers of a racing claim re-query and move on to the
        // next candidate.
        for _ in 0..3 {
            let now = Utc::now();
            let candidates = self.candidates(&scope, filters, now).await?;
            if candidates.is_empty() {
                return Ok(NextReviewOutcome::Empty {
                    message: "No responses pending review".to_string(),
                });
            }

            for candidate in candidates {
                let assignment = ReviewAssignment {
                    assigned_to: reviewer.id.clone(),
                    assigned_at: now,
                    expires_at: now + Duration::seconds(self.config.lease_duration_secs),
                };
                match self
                    .responses
                    .try_claim(&candidate.id, assignment.clone(), now)
                    .await?
                {
                    ClaimOutcome::Claimed(response) => {
                        info!(reviewer = %reviewer.id, response = %response.id, "lease granted");
                        return Ok(NextReviewOutcome::Assigned(NextReview {
                            response,
                            expires_at: assignment.expires_at,
                        }));
                    }
                    ClaimOutcome::Contended => continue,
                    ClaimOutcome::Missing => continue,
                }
            }
        }

        Ok(NextReviewOutcome::Empty {
            message: "No responses pending review".to_string(),
        })
    }

    /// Clear the reviewer's lease on a response. Succeeds when the caller is
    /// the holder or the lease is already gone.
    pub async fn release_assignment(
        &self,
        response_id: &str,
        reviewer: &User,
    ) -> PipelineResult<()> {
        let cleared = self
            .responses
            .clear_assignment(response_id, &reviewer.id)
            .await?;
        if !cleared {
            return Err(PipelineError::Forbidden(format!(
                "response {response_id} is leased to another reviewer"
            )));
        }
        Ok(())
    }

    /// Apply a reviewer verdict. When the verdict is `rejected` and no
    /// free-text feedback is supplied, a structured reason is derived from
    /// the failing criteria codes.
    pub async fn submit_verification(
        &self,
        response_id: &str,
        reviewer: &User,
        verdict: Verdict,
        criteria: std::collections::BTreeMap<String, String>,
        feedback: Option<String>,
    ) -> PipelineResult<ResponseRecord> {
        let now = Utc::now();
        let target = match verdict {
            Verdict::Approved => ResponseStatus::Approved,
            Verdict::Rejected => ResponseStatus::Rejected,
        };

        let feedback = feedback.filter(|f| !f.trim().is_empty());
        let rejection_reason = match (verdict, &feedback) {
            (Verdict::Rejected, None) => derive_rejection_reason(&criteria),
            _ => None,
        };

        let verification = VerificationData {
            verified_by: Some(reviewer.id.clone()),
            verified_at: Some(now),
            criteria,
            feedback,
            auto_rejected: false,
            rejection_reason,
        };

        let written = match self
            .responses
            .complete_verification(response_id, &reviewer.id, target, verification, now)
            .await?
        {
            VerifyWrite::Applied(record) => record,
            VerifyWrite::NotPending(status) => {
                return Err(PipelineError::Conflict(format!(
                    "response {response_id} is already {status:?}"
                )));
            }
            VerifyWrite::HeldByOther(holder) => {
                return Err(PipelineError::Forbidden(format!(
                    "response {response_id} is leased to {holder}"
                )));
            }
            VerifyWrite::Missing => {
                return Err(PipelineError::NotFound(format!("response {response_id}")));
            }
        };

        // Confirm the write landed; retry a direct status write once before
        // surfacing an inconsistency.
        let confirmed = self.responses.get_response(response_id).await?;
        if confirmed.as_ref().map(|r| r.status) != Some(target) {
            warn!(response = response_id, "verification write unconfirmed, retrying status write");
            self.responses.set_status(response_id, target, None).await?;
            let reread = self.responses.get_response(response_id).await?;
            if reread.as_ref().map(|r| r.status) != Some(target) {
                return Err(PipelineError::Internal(format!(
                    "verification status for response {response_id} did not persist"
                )));
            }
        }

        info!(response = response_id, reviewer = %reviewer.id, ?verdict, "verification submitted");
        Ok(written)
    }

    /// The reviewer's scope: quality agents get their assigned surveys with
    /// per-survey AC restriction (empty = all), company admins every survey
    /// of their company.
    async fn scope_for(&self, reviewer: &User) -> PipelineResult<Vec<ScopedSurvey>> {
        match reviewer.role {
            Role::QualityAgent => {
                let surveys = self.surveys.surveys_for_reviewer(&reviewer.id).await?;
                Ok(surveys
                    .into_iter()
                    .map(|survey| {
                        let allowed = survey.reviewer_acs(&reviewer.id).and_then(|acs| {
                            if acs.is_empty() {
                                None
                            } else {
                                Some(acs.to_vec())
                            }
                        });
                        ScopedSurvey {
                            survey,
                            allowed_acs: allowed,
                        }
                    })
                    .collect())
            }
            Role::CompanyAdmin | Role::ProjectManager => {
                let surveys = self.surveys.surveys_for_company(&reviewer.company_id).await?;
                Ok(surveys
                    .into_iter()
                    .map(|survey| ScopedSurvey {
                        survey,
                        allowed_acs: None,
                    })
                    .collect())
            }
            Role::Interviewer => Err(PipelineError::Forbidden(
                "interviewers cannot review responses".to_string(),
            )),
        }
    }

    async fn candidates(
        &self,
        scope: &[ScopedSurvey],
        filters: &ReviewFilters,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<ResponseRecord>> {
        let survey_ids: Vec<String> = scope.iter().map(|s| s.survey.id.clone()).collect();
        let pending = self.responses.list_pending(&survey_ids).await?;

        // One batch fetch per distinct batch id in the pending set.
        let mut batch_cache: HashMap<String, Option<QcBatch>> = HashMap::new();
        let mut out = Vec::new();
        for record in pending {
            if record.has_live_assignment(now) {
                continue;
            }
            let Some(scoped) = scope.iter().find(|s| s.survey.id == record.survey_id) else {
                continue;
            };
            if let Some(allowed) = &scoped.allowed_acs {
                match &record.selected_ac {
                    Some(ac) if allowed.contains(ac) => {}
                    _ => continue,
                }
            }
            if let Some(batch_id) = &record.batch_id {
                if !batch_cache.contains_key(batch_id) {
                    let fetched = self.batches.get_batch(batch_id).await?;
                    batch_cache.insert(batch_id.clone(), fetched);
                }
                let batch = batch_cache.get(batch_id).and_then(|b| b.as_ref());
                if !is_reviewable(&record, batch) {
                    continue;
                }
            }
            if !matches_filters(&record, &scoped.survey, filters) {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }
}

fn matches_filters(record: &ResponseRecord, survey: &Survey, filters: &ReviewFilters) -> bool {
    if let Some(search) = filters.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        let haystacks = [
            survey.name.to_lowercase(),
            record.response_id.to_string(),
            record.session_id.to_string().to_lowercase(),
            record
                .respondent_name
                .clone()
                .unwrap_or_default()
                .to_lowercase(),
        ];
        if !haystacks.iter().any(|h| h.contains(&needle)) {
            return false;
        }
    }
    if let Some(gender) = &filters.gender {
        match &record.respondent_gender {
            Some(g) if g.eq_ignore_ascii_case(gender) => {}
            _ => return false,
        }
    }
    if filters.age_min.is_some() || filters.age_max.is_some() {
        let Some(age) = record.respondent_age else {
            return false;
        };
        if filters.age_min.is_some_and(|min| age < min) {
            return false;
        }
        if filters.age_max.is_some_and(|max| age > max) {
            return false;
        }
    }
    true
}

/// Map failing criterion codes to human-readable sentences and join them.
/// Returns `None` when no criterion failed.
pub fn derive_rejection_reason(
    criteria: &std::collections::BTreeMap<String, String>,
) -> Option<String> {
    let mut reasons = Vec::new();
    for (key, code) in criteria {
        if let Some(sentence) = criterion_failure(key, code) {
            reasons.push(sentence);
        }
    }
    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join("; "))
    }
}

fn criterion_failure(key: &str, code: &str) -> Option<&'static str> {
    match (key, code) {
        ("audio_quality", "poor") => Some("Audio quality was too poor to verify the interview"),
        ("audio_quality", "inaudible") => Some("Audio recording was inaudible"),
        ("audio_quality", "missing") => Some("Audio recording was missing"),
        ("gender_match", "mismatch") => {
            Some("Respondent gender did not match the recorded answer")
        }
        ("name_match", "mismatch") => Some("Respondent name did not match the recorded answer"),
        ("age_match", "mismatch") => Some("Respondent age did not match the recorded answer"),
        ("vote_preference_match", "mismatch") => {
            Some("Stated vote preference did not match the recorded answer")
        }
        ("party_preference_match", "mismatch") => {
            Some("Stated party preference did not match the recorded answer")
        }
        ("phone_asked", "not_asked") => Some("Respondent phone number was not asked"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvass::domain::{
        AnsweredQuestion, AutoRejectConfig, BatchConfig, QualityMetrics, ReviewerAssignment,
        SessionId, SurveyMode,
    };
    use canvass::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn survey(reviewer_acs: Vec<String>) -> Survey {
        Survey {
            id: "s1".into(),
            name: "Voter Pulse".into(),
            company_id: "c1".into(),
            mode: SurveyMode::Capi,
            sections: vec![],
            sample_size: None,
            quotas: BTreeMap::new(),
            acs: vec!["AC-1".into(), "AC-2".into()],
            reviewers: vec![ReviewerAssignment {
                user_id: "bob".into(),
                acs: reviewer_acs,
            }],
            interviewers: vec![],
            batch_config: BatchConfig::default(),
            auto_reject: AutoRejectConfig::default(),
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

    fn record(i: usize, ac: &str) -> ResponseRecord {
        let now = Utc::now() + Duration::milliseconds(i as i64);
        ResponseRecord {
            id: format!("r{i}"),
            response_id: i as u64,
            session_id: SessionId::from_str(&format!("sess-{i}")),
            survey_id: "s1".into(),
            interviewer_id: "alice".into(),
            mode: SurveyMode::Capi,
            start_time: now,
            end_time: now,
            total_time_secs: 60,
            answers: Vec::<AnsweredQuestion>::new(),
            selected_ac: Some(ac.into()),
            polling_station: None,
            location: None,
            audio: None,
            quality: QualityMetrics::default(),
            status: ResponseStatus::PendingApproval,
            abandoned_reason: None,
            verification: None,
            assignment: None,
            batch_id: None,
            is_sample_response: false,
            call_id: None,
            set_number: None,
            respondent_name: Some(format!("Respondent {i}")),
            respondent_gender: Some(if i % 2 == 0 { "female" } else { "male" }.into()),
            respondent_age: Some(20 + i as u32),
            created_at: now,
        }
    }

    async fn queue(reviewer_acs: Vec<String>) -> (ReviewQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put_survey(survey(reviewer_acs)).await.unwrap();
        let queue = ReviewQueue::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ReviewConfig::default(),
        );
        (queue, store)
    }

    #[tokio::test]
    async fn oldest_first_and_lease_is_sticky() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        store.insert_response(record(1, "AC-1")).await.unwrap();

        let bob = reviewer("bob");
        let first = match queue.get_next(&bob, &ReviewFilters::default()).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n,
            other => panic!("expected assignment, got {other:?}"),
        };
        assert_eq!(first.response.id, "r0");

        // A second call before expiry returns the same response.
        let again = match queue.get_next(&bob, &ReviewFilters::default()).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n,
            other => panic!("expected assignment, got {other:?}"),
        };
        assert_eq!(again.response.id, "r0");
    }

    #[tokio::test]
    async fn second_reviewer_gets_next_candidate() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        store.insert_response(record(1, "AC-1")).await.unwrap();
        store
            .put_survey({
                let mut s = survey(vec![]);
                s.reviewers.push(ReviewerAssignment {
                    user_id: "carol".into(),
                    acs: vec![],
                });
                s
            })
            .await
            .unwrap();

        let bob = reviewer("bob");
        let carol = reviewer("carol");
        let first = match queue.get_next(&bob, &ReviewFilters::default()).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n.response.id,
            other => panic!("{other:?}"),
        };
        let second = match queue.get_next(&carol, &ReviewFilters::default()).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n.response.id,
            other => panic!("{other:?}"),
        };
        assert_eq!(first, "r0");
        assert_eq!(second, "r1");
    }

    #[tokio::test]
    async fn ac_scope_restricts_candidates() {
        let (queue, store) = queue(vec!["AC-2".into()]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        store.insert_response(record(1, "AC-2")).await.unwrap();

        let bob = reviewer("bob");
        let next = match queue.get_next(&bob, &ReviewFilters::default()).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n.response.id,
            other => panic!("{other:?}"),
        };
        assert_eq!(next, "r1");
    }

    #[tokio::test]
    async fn empty_queue_is_a_message_not_an_error() {
        let (queue, _) = queue(vec![]).await;
        let outcome = queue
            .get_next(&reviewer("bob"), &ReviewFilters::default())
            .await
            .unwrap();
        assert!(matches!(outcome, NextReviewOutcome::Empty { .. }));
    }

    #[tokio::test]
    async fn filters_narrow_candidates() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap(); // female, 20
        store.insert_response(record(1, "AC-1")).await.unwrap(); // male, 21

        let bob = reviewer("bob");
        let filters = ReviewFilters {
            gender: Some("male".into()),
            ..Default::default()
        };
        let next = match queue.get_next(&bob, &filters).await.unwrap() {
            NextReviewOutcome::Assigned(n) => n.response.id,
            other => panic!("{other:?}"),
        };
        assert_eq!(next, "r1");
    }

    #[tokio::test]
    async fn submit_approves_and_clears_lease() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        let bob = reviewer("bob");
        queue.get_next(&bob, &ReviewFilters::default()).await.unwrap();

        let record = queue
            .submit_verification("r0", &bob, Verdict::Approved, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(record.status, ResponseStatus::Approved);
        assert!(record.assignment.is_none());

        // A second submit conflicts: the response is terminal.
        let err = queue
            .submit_verification("r0", &bob, Verdict::Rejected, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[tokio::test]
    async fn rejection_reason_derived_from_criteria() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        let bob = reviewer("bob");
        queue.get_next(&bob, &ReviewFilters::default()).await.unwrap();

        let mut criteria = BTreeMap::new();
        criteria.insert("audio_quality".to_string(), "poor".to_string());
        criteria.insert("gender_match".to_string(), "mismatch".to_string());
        criteria.insert("name_match".to_string(), "match".to_string());
        let record = queue
            .submit_verification("r0", &bob, Verdict::Rejected, criteria, None)
            .await
            .unwrap();
        let reason = record.verification.unwrap().rejection_reason.unwrap();
        assert!(reason.contains("Audio quality"));
        assert!(reason.contains("gender"));
        assert!(!reason.contains("name"));
    }

    #[tokio::test]
    async fn leaseholder_mismatch_is_forbidden() {
        let (queue, store) = queue(vec![]).await;
        store.insert_response(record(0, "AC-1")).await.unwrap();
        let bob = reviewer("bob");
        queue.get_next(&bob, &ReviewFilters::default()).await.unwrap();

        let carol = reviewer("carol");
        let err = queue
            .submit_verification("r0", &carol, Verdict::Approved, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Forbidden(_)));

        let err = queue.release_assignment("r0", &carol).await.unwrap_err();
        assert!(matches!(err, PipelineError::Forbidden(_)));
        queue.release_assignment("r0", &bob).await.unwrap();
    }
}
