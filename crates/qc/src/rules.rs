//! Survey-driven auto-rejection rules, evaluated at completion before a
//! response enters QC batching.
//!
//! Rules are chained; the first one that triggers rejects the response. The
//! rejection is invisible to the submitting interviewer.

use canvass::domain::{ResponseRecord, Survey};
use canvass::value::ResponseValue;

/// One pluggable rejection rule. Returns a reason when the rule triggers.
pub trait AutoRejectRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, survey: &Survey, record: &ResponseRecord) -> Option<String>;
}

/// Rejects interviews shorter than the survey's minimum duration.
pub struct MinimumDuration;

impl AutoRejectRule for MinimumDuration {
    fn name(&self) -> &'static str {
        "minimum_duration"
    }

    fn evaluate(&self, survey: &Survey, record: &ResponseRecord) -> Option<String> {
        let minimum = survey.auto_reject.minimum_duration_secs?;
        if record.total_time_secs < minimum {
            return Some(format!(
                "Interview duration {}s below survey minimum {}s",
                record.total_time_secs, minimum
            ));
        }
        None
    }
}

/// Rejects responses whose required-question skip rate exceeds the survey
/// threshold.
pub struct RequiredSkipRatio;

impl AutoRejectRule for RequiredSkipRatio {
    fn name(&self) -> &'static str {
        "required_skip_ratio"
    }

    fn evaluate(&self, survey: &Survey, record: &ResponseRecord) -> Option<String> {
        let threshold = survey.auto_reject.max_required_skip_ratio?;
        let required: Vec<_> = record.answers.iter().filter(|a| a.is_required).collect();
        if required.is_empty() {
            return None;
        }
        let skipped = required
            .iter()
            .filter(|a| a.is_skipped || a.value.is_empty_answer())
            .count();
        let ratio = skipped as f64 / required.len() as f64;
        if ratio > threshold {
            return Some(format!(
                "Required-question skip rate {:.0}% above threshold {:.0}%",
                ratio * 100.0,
                threshold * 100.0
            ));
        }
        None
    }
}

/// Rejects straight-lined interviews: every answered single-choice question
/// carries the identical answer, over at least the configured count.
pub struct StraightLining;

impl AutoRejectRule for StraightLining {
    fn name(&self) -> &'static str {
        "straight_lining"
    }

    fn evaluate(&self, survey: &Survey, record: &ResponseRecord) -> Option<String> {
        let min_answers = survey.auto_reject.straight_line_min_answers?;
        let answered: Vec<&ResponseValue> = record
            .answers
            .iter()
            .filter(|a| a.question_type == "single_choice" && !a.value.is_empty_answer())
            .map(|a| &a.value)
            .collect();
        if answered.len() < min_answers {
            return None;
        }
        let first = answered[0].normalize();
        if answered.iter().all(|v| v.normalize() == first) {
            return Some(format!(
                "All {} single-choice answers identical",
                answered.len()
            ));
        }
        None
    }
}

/// The deployed rule chain, in evaluation order.
pub fn default_rules() -> Vec<Box<dyn AutoRejectRule>> {
    vec![
        Box::new(MinimumDuration),
        Box::new(RequiredSkipRatio),
        Box::new(StraightLining),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvass::domain::{
        AnsweredQuestion, AutoRejectConfig, BatchConfig, ResponseStatus, SessionId, SurveyMode,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn survey(auto_reject: AutoRejectConfig) -> Survey {
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
            batch_config: BatchConfig::default(),
            auto_reject,
        }
    }

    fn record(total_time_secs: i64, answers: Vec<AnsweredQuestion>) -> ResponseRecord {
        let now = Utc::now();
        ResponseRecord {
            id: "r1".into(),
            response_id: 1,
            session_id: SessionId::new(),
            survey_id: "s1".into(),
            interviewer_id: "int-1".into(),
            mode: SurveyMode::Capi,
            start_time: now,
            end_time: now,
            total_time_secs,
            answers,
            selected_ac: None,
            polling_station: None,
            location: None,
            audio: None,
            quality: Default::default(),
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

    fn answer(id: &str, value: &str, required: bool, skipped: bool) -> AnsweredQuestion {
        AnsweredQuestion {
            section_index: 0,
            question_index: 0,
            question_id: id.into(),
            question_type: "single_choice".into(),
            question_text: id.into(),
            description: None,
            options: vec![],
            value: if skipped {
                ResponseValue::Null
            } else {
                ResponseValue::Str(value.into())
            },
            is_required: required,
            is_skipped: skipped,
        }
    }

    #[test]
    fn minimum_duration_triggers_below_threshold() {
        let survey = survey(AutoRejectConfig {
            minimum_duration_secs: Some(120),
            ..Default::default()
        });
        assert!(MinimumDuration.evaluate(&survey, &record(60, vec![])).is_some());
        assert!(MinimumDuration.evaluate(&survey, &record(120, vec![])).is_none());
    }

    #[test]
    fn skip_ratio_counts_required_only() {
        let survey = survey(AutoRejectConfig {
            max_required_skip_ratio: Some(0.5),
            ..Default::default()
        });
        let answers = vec![
            answer("q1", "yes", true, true),
            answer("q2", "yes", true, true),
            answer("q3", "yes", true, false),
            answer("q4", "yes", false, true),
        ];
        // 2 of 3 required skipped: 66% > 50%.
        assert!(RequiredSkipRatio.evaluate(&survey, &record(300, answers)).is_some());
    }

    #[test]
    fn straight_lining_requires_minimum_count() {
        let survey = survey(AutoRejectConfig {
            straight_line_min_answers: Some(3),
            ..Default::default()
        });
        let same = vec![
            answer("q1", "Yes", false, false),
            answer("q2", "yes ", false, false),
            answer("q3", "YES", false, false),
        ];
        assert!(StraightLining.evaluate(&survey, &record(300, same)).is_some());

        let varied = vec![
            answer("q1", "yes", false, false),
            answer("q2", "no", false, false),
            answer("q3", "yes", false, false),
        ];
        assert!(StraightLining.evaluate(&survey, &record(300, varied)).is_none());
    }

    #[test]
    fn disabled_rules_never_trigger() {
        let survey = survey(AutoRejectConfig::default());
        assert!(MinimumDuration.evaluate(&survey, &record(1, vec![])).is_none());
        assert!(RequiredSkipRatio
            .evaluate(&survey, &record(1, vec![answer("q1", "x", true, true)]))
            .is_none());
    }
}
