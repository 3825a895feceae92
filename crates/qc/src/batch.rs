//! QC batch accumulation, closure, and sampling.
//!
//! Batches are scoped per (survey, interviewer). Closure is serialized by
//! the `collecting → processing` compare-and-set: whichever enrolling task
//! wins the transition draws the sample, exactly once.

use std::sync::Arc;

use canvass::domain::{
    BatchState, QcBatch, RemainderDecision, RemainderPolicy, ResponseRecord, ResponseStatus,
    Survey,
};
use canvass::store::{BatchStore, ResponseStore};
use canvass::{PipelineError, PipelineResult, StoreError};
use rand::seq::index::sample;
use tracing::{debug, info};

pub struct BatchManager {
    batches: Arc<dyn BatchStore>,
    responses: Arc<dyn ResponseStore>,
}

impl BatchManager {
    pub fn new(batches: Arc<dyn BatchStore>, responses: Arc<dyn ResponseStore>) -> Self {
        Self { batches, responses }
    }

    /// Enroll a freshly ingested response into the current `collecting`
    /// batch for its (survey, interviewer), creating one as needed, and
    /// close the batch when it reaches the configured size.
    pub async fn enroll(&self, record: &ResponseRecord, survey: &Survey) -> PipelineResult<()> {
        // Find-or-create can race with a concurrent closure; retry on the
        // batch going non-collecting underneath us.
        for _ in 0..3 {
            let batch = match self
                .batches
                .find_collecting(&record.survey_id, &record.interviewer_id)
                .await?
            {
                Some(batch) => batch,
                None => {
                    let batch = QcBatch::new(
                        &record.survey_id,
                        &record.interviewer_id,
                        survey.batch_config.clone(),
                    );
                    debug!(batch = %batch.id, survey = %record.survey_id, "opened qc batch");
                    self.batches.create_batch(batch.clone()).await?;
                    batch
                }
            };

            let appended = match self.batches.append_response(&batch.id, &record.id).await {
                Ok(b) => b,
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            self.responses.set_batch(&record.id, &batch.id).await?;

            if appended.response_ids.len() >= appended.config.batch_size {
                self.close_batch(&appended).await?;
            }
            return Ok(());
        }
        Err(PipelineError::Internal(format!(
            "could not enroll response {} into a collecting batch",
            record.id
        )))
    }

    /// Close a full batch: draw the sample, resolve the remainder, and move
    /// the batch to its post-QC state. Sampling happens exactly once; the
    /// `collecting → processing` transition guards re-entry.
    async fn close_batch(&self, batch: &QcBatch) -> PipelineResult<()> {
        let won = self
            .batches
            .transition(&batch.id, BatchState::Collecting, BatchState::Processing)
            .await?;
        if !won {
            return Ok(());
        }

        let sample_count = batch.config.sample_count().min(batch.response_ids.len());
        let picked: Vec<String> = {
            let mut rng = rand::rng();
            sample(&mut rng, batch.response_ids.len(), sample_count)
                .into_iter()
                .map(|i| batch.response_ids[i].clone())
                .collect()
        };
        self.responses.mark_sampled(&picked).await?;

        let remainder: Vec<String> = batch
            .response_ids
            .iter()
            .filter(|id| !picked.contains(id))
            .cloned()
            .collect();

        let decision = match batch.config.remainder_policy {
            RemainderPolicy::QueueForQc => RemainderDecision::QueuedForQc,
            RemainderPolicy::AutoApprove => {
                self.responses
                    .set_statuses(&remainder, ResponseStatus::Approved, None)
                    .await?;
                RemainderDecision::AutoApproved
            }
            RemainderPolicy::AutoReject => {
                self.responses
                    .set_statuses(&remainder, ResponseStatus::Rejected, None)
                    .await?;
                RemainderDecision::AutoRejected
            }
        };
        self.batches
            .set_remainder_decision(&batch.id, decision)
            .await?;

        // With no samples pending (possible only at a zero sample fraction)
        // and an auto-decided remainder, the batch is done outright.
        let final_state = if sample_count == 0 && decision != RemainderDecision::QueuedForQc {
            BatchState::Closed
        } else {
            BatchState::QcInProgress
        };
        self.batches
            .transition(&batch.id, BatchState::Processing, final_state)
            .await?;
        info!(
            batch = %batch.id,
            sampled = sample_count,
            remainder = remainder.len(),
            ?decision,
            "qc batch closed"
        );
        Ok(())
    }
}

/// The reviewer-visibility contract: a response can be served for review iff
/// it has no batch (legacy), its batch is still collecting or mid-closure,
/// it was drawn as a sample, or it belongs to the remainder that was queued
/// for QC.
pub fn is_reviewable(record: &ResponseRecord, batch: Option<&QcBatch>) -> bool {
    if record.is_sample_response {
        return true;
    }
    let Some(batch) = batch else {
        return true;
    };
    match batch.state {
        BatchState::Collecting => true,
        BatchState::Processing | BatchState::QcInProgress => match batch.remaining_decision {
            None => true,
            Some(RemainderDecision::QueuedForQc) => true,
            Some(_) => false,
        },
        BatchState::Closed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvass::domain::{
        AnsweredQuestion, AutoRejectConfig, BatchConfig, QualityMetrics, SessionId, SurveyMode,
    };
    use canvass::memory::MemoryStore;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn survey(policy: RemainderPolicy) -> Survey {
        Survey {
            id: "s1".into(),
            name: "Test".into(),
            company_id: "c1".into(),
            mode: SurveyMode::Capi,
            sections: vec![],
            sample_size: None,
            quotas: BTreeMap::new(),
            acs: vec![],
            reviewers: vec![],
            interviewers: vec![],
            batch_config: BatchConfig {
                batch_size: 5,
                sample_fraction: 0.4,
                remainder_policy: policy,
            },
            auto_reject: AutoRejectConfig::default(),
        }
    }

    fn record(i: usize) -> ResponseRecord {
        let now = Utc::now();
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
            selected_ac: None,
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
            respondent_name: None,
            respondent_gender: None,
            respondent_age: None,
            created_at: now,
        }
    }

    async fn enroll_five(policy: RemainderPolicy) -> (Arc<MemoryStore>, Vec<ResponseRecord>) {
        let store = Arc::new(MemoryStore::new());
        let manager = BatchManager::new(store.clone(), store.clone());
        let survey = survey(policy);
        let mut records = Vec::new();
        for i in 0..5 {
            let r = record(i);
            store.insert_response(r.clone()).await.unwrap();
            manager.enroll(&r, &survey).await.unwrap();
            records.push(r);
        }
        (store, records)
    }

    #[tokio::test]
    async fn closure_samples_exactly_two_of_five() {
        let (store, records) = enroll_five(RemainderPolicy::AutoApprove).await;
        let mut sampled = 0;
        let mut approved = 0;
        for r in &records {
            let stored = store.get_response(&r.id).await.unwrap().unwrap();
            assert!(stored.batch_id.is_some());
            if stored.is_sample_response {
                sampled += 1;
                assert_eq!(stored.status, ResponseStatus::PendingApproval);
            } else {
                approved += 1;
                assert_eq!(stored.status, ResponseStatus::Approved);
            }
        }
        assert_eq!(sampled, 2);
        assert_eq!(approved, 3);

        let batch_id = store
            .get_response("r0")
            .await
            .unwrap()
            .unwrap()
            .batch_id
            .unwrap();
        let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.state, BatchState::QcInProgress);
        assert_eq!(batch.remaining_decision, Some(RemainderDecision::AutoApproved));
        assert_eq!(batch.response_ids.len(), 5);
    }

    #[tokio::test]
    async fn queue_for_qc_keeps_remainder_pending() {
        let (store, records) = enroll_five(RemainderPolicy::QueueForQc).await;
        for r in &records {
            let stored = store.get_response(&r.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ResponseStatus::PendingApproval);
        }
        let batch_id = store
            .get_response("r0")
            .await
            .unwrap()
            .unwrap()
            .batch_id
            .unwrap();
        let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.remaining_decision, Some(RemainderDecision::QueuedForQc));
    }

    #[tokio::test]
    async fn sixth_response_opens_a_new_batch() {
        let (store, _) = enroll_five(RemainderPolicy::AutoApprove).await;
        let manager = BatchManager::new(store.clone(), store.clone());
        let survey = survey(RemainderPolicy::AutoApprove);
        let r = record(5);
        store.insert_response(r.clone()).await.unwrap();
        manager.enroll(&r, &survey).await.unwrap();
        let stored = store.get_response("r5").await.unwrap().unwrap();
        let first_batch = store.get_response("r0").await.unwrap().unwrap().batch_id;
        assert_ne!(stored.batch_id, first_batch);
    }

    #[tokio::test]
    async fn visibility_contract() {
        let now = Utc::now();
        let mut r = record(0);
        // No batch: reviewable.
        assert!(is_reviewable(&r, None));

        let mut batch = QcBatch::new("s1", "alice", BatchConfig::default());
        batch.created_at = now;
        r.batch_id = Some(batch.id.clone());
        // Collecting batch: reviewable.
        assert!(is_reviewable(&r, Some(&batch)));

        // Auto-decided remainder: not reviewable.
        batch.state = BatchState::QcInProgress;
        batch.remaining_decision = Some(RemainderDecision::AutoApproved);
        assert!(!is_reviewable(&r, Some(&batch)));

        // Sampled response: always reviewable.
        r.is_sample_response = true;
        assert!(is_reviewable(&r, Some(&batch)));

        // Queued remainder: reviewable.
        r.is_sample_response = false;
        batch.remaining_decision = Some(RemainderDecision::QueuedForQc);
        assert!(is_reviewable(&r, Some(&batch)));
    }
}
