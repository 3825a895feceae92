//! CATI question-set rotation: strict round-robin over the survey's sorted
//! distinct set numbers, seeded by the most recent recorded use.

use std::sync::Arc;

use canvass::domain::{SetData, SurveyMode};
use canvass::store::{SetDataStore, SurveyStore};
use canvass::{PipelineError, PipelineResult};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SetRotationInfo {
    pub last_set_number: Option<u32>,
    pub next_set_number: Option<u32>,
}

pub struct SetRotation {
    surveys: Arc<dyn SurveyStore>,
    sets: Arc<dyn SetDataStore>,
}

impl SetRotation {
    pub fn new(surveys: Arc<dyn SurveyStore>, sets: Arc<dyn SetDataStore>) -> Self {
        Self { surveys, sets }
    }

    /// Compute the next set for a CATI interview on `survey_id`.
    ///
    /// With sets `S` (sorted, distinct) and `last` the most recently used
    /// set: no history or `last ∉ S` yields `S[0]`; otherwise the successor
    /// of `last` in `S`, wrapping around.
    pub async fn next_set(&self, survey_id: &str) -> PipelineResult<SetRotationInfo> {
        let survey = self
            .surveys
            .get_survey(survey_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("survey {survey_id}")))?;
        let sets = survey.set_numbers();
        let last = self
            .sets
            .last_set(survey_id, SurveyMode::Cati)
            .await?
            .map(|s| s.set_number);

        let next = if sets.is_empty() {
            None
        } else {
            match last.and_then(|l| sets.iter().position(|s| *s == l)) {
                Some(index) => Some(sets[(index + 1) % sets.len()]),
                None => Some(sets[0]),
            }
        };

        Ok(SetRotationInfo {
            last_set_number: last,
            next_set_number: next,
        })
    }

    /// Record that a CATI completion used `set_number`.
    pub async fn record_use(&self, survey_id: &str, set_number: u32) -> PipelineResult<()> {
        self.sets
            .append_set(SetData {
                survey_id: survey_id.to_string(),
                mode: SurveyMode::Cati,
                set_number,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}
