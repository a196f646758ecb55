//! Summaries of the top-ranked trials
//!
//! Identity fields always come from the ranked records. The model contributes
//! only key criteria and a one-line summary for identifiers it echoes back, so
//! it can never introduce a trial that was not found.

use crate::parsing::{extract_json, truncate_chars};
use crate::pipelines::trials_from;
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, State, StateOutput, Transition};
use crate::tools::TrialRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

const DEFAULT_KEY_CRITERIA: &str = "See full eligibility criteria on ClinicalTrials.gov";

/// Caller-facing summary of one ranked trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub nct_id: String,
    pub title: String,
    pub phase: String,
    pub status: String,
    pub location: String,
    pub score: f64,
    pub key_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// False when built only from record fields
    pub model_enriched: bool,
}

impl TrialSummary {
    /// Summary built from already-known fields only (pure function)
    pub fn from_record(trial: &TrialRecord) -> Self {
        Self {
            nct_id: trial.nct_id.clone(),
            title: truncate_chars(&trial.title, 80),
            phase: trial.phase.clone(),
            status: trial.status.clone(),
            location: if trial.location.is_empty() {
                "See trial details".to_string()
            } else {
                trial.location.clone()
            },
            score: trial.score,
            key_criteria: vec![DEFAULT_KEY_CRITERIA.to_string()],
            summary: None,
            model_enriched: false,
        }
    }

    fn enrich(mut self, model: &Value) -> Self {
        let criteria: Vec<String> = model
            .get("key_criteria")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !criteria.is_empty() {
            self.key_criteria = criteria;
        }
        self.summary = model
            .get("summary")
            .and_then(Value::as_str)
            .map(|s| truncate_chars(s.trim(), 300))
            .filter(|s| !s.is_empty());
        self.model_enriched = true;
        self
    }
}

/// Per-record summaries, enriched where the model echoed the identifier (pure function)
fn build_summaries(top: &[TrialRecord], model_entries: &[Value]) -> (Vec<TrialSummary>, usize) {
    let mut matched = 0;
    let summaries = top
        .iter()
        .map(|trial| {
            let base = TrialSummary::from_record(trial);
            let entry = model_entries.iter().find(|entry| {
                entry
                    .get("nct_id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.trim().eq_ignore_ascii_case(&trial.nct_id))
            });
            match entry {
                Some(entry) => {
                    matched += 1;
                    base.enrich(entry)
                }
                None => base,
            }
        })
        .collect();
    (summaries, matched)
}

/// Compact summaries for the top-ranked trials; never fails
pub struct PrepareSummariesState {
    limit: usize,
}

impl PrepareSummariesState {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    fn top_trials(&self, memory: &SharedMemory) -> Vec<TrialRecord> {
        let mut ranked = trials_from(memory, keys::RANKED_TRIALS);
        ranked.truncate(self.limit);
        ranked
    }
}

#[async_trait]
impl State for PrepareSummariesState {
    fn name(&self) -> &str {
        "prepare_summaries"
    }

    fn description(&self) -> &str {
        "Create concise summaries of the top trials"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !self.top_trials(memory).is_empty()
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "Summarize the clinical trials you are given.\n\n\
         RULES:\n\
         1. Use the EXACT NCT IDs given; never create or modify an NCT ID\n\
         2. Use only the data provided\n\n\
         Return ONLY a JSON array:\n\
         [{\"nct_id\": \"<exact NCT ID>\", \"summary\": \"<one sentence>\", \
         \"key_criteria\": [\"<criterion>\", \"...\"]}]"
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let mut text = String::from("TRIAL DATA:\n\n");
        for (i, trial) in self.top_trials(memory).iter().enumerate() {
            text.push_str(&format!(
                "Trial {}:\n  NCT ID: {}\n  Title: {}\n  Phase: {}\n  Status: {}\n  Location: {}\n  Brief Summary: {}\n  Criteria: {}\n\n",
                i + 1,
                trial.nct_id,
                trial.title,
                trial.phase,
                trial.status,
                trial.location,
                truncate_chars(&trial.brief_summary, 200),
                truncate_chars(&trial.criteria_snippet, 200),
            ));
        }
        text
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let top = self.top_trials(memory);
        let mut output = StateOutput::new();

        let model_entries: Vec<Value> = if top.is_empty() {
            Vec::new()
        } else {
            match extract_json::<Vec<Value>>(raw) {
                Ok(entries) => entries,
                Err(reason) => {
                    warn!(reason = %reason, "Summary parsing failed, building summaries from records");
                    output = output.degraded(format!("summaries built from records: {reason}"));
                    Vec::new()
                }
            }
        };

        let (summaries, matched) = build_summaries(&top, &model_entries);
        if !top.is_empty() && matched == 0 && !output.is_degraded() {
            warn!("No model summary matched a ranked trial");
            output = output.degraded("no model summary matched a ranked trial");
        }

        info!(summaries = summaries.len(), model_matched = matched, "Trial summaries prepared");
        Transition::Advance(
            output
                .with_serialized(keys::TRIAL_SUMMARIES, &summaries)
                .with(keys::TRIAL_DISCOVERY_COMPLETE, json!(true)),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        None
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::TRIAL_SUMMARIES, keys::TRIAL_DISCOVERY_COMPLETE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scored_trial;
    use proptest::prelude::*;

    fn memory_with(trials: &[TrialRecord]) -> SharedMemory {
        let mut memory = SharedMemory::new();
        memory.insert_serialized(keys::RANKED_TRIALS, &trials.to_vec());
        memory
    }

    #[tokio::test]
    async fn test_model_cannot_introduce_unknown_trial() {
        let memory = memory_with(&[scored_trial("NCT1", 90.0), scored_trial("NCT2", 80.0)]);
        let raw = r#"[
            {"nct_id": "NCT2", "summary": "Checkpoint inhibitor study", "key_criteria": ["Age 18+"]},
            {"nct_id": "NCT999", "summary": "Invented"}
        ]"#;

        let Transition::Advance(output) = PrepareSummariesState::new(10).process(raw, &memory).await
        else {
            panic!("expected advance");
        };
        let summaries: Vec<TrialSummary> =
            serde_json::from_value(output.values[keys::TRIAL_SUMMARIES].clone()).unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].nct_id, "NCT1");
        assert!(!summaries[0].model_enriched);
        assert_eq!(summaries[1].key_criteria, vec!["Age 18+"]);
        assert!(summaries.iter().all(|s| s.nct_id != "NCT999"));
    }

    #[tokio::test]
    async fn test_empty_ranking_yields_empty_summaries() {
        let memory = memory_with(&[]);
        let state = PrepareSummariesState::new(10);
        assert!(!state.requires_completion(&memory));
        let Transition::Advance(output) = state.process("", &memory).await else {
            panic!("expected advance");
        };
        assert_eq!(output.values[keys::TRIAL_SUMMARIES], json!([]));
        assert!(!output.is_degraded());
    }

    proptest! {
        #[test]
        fn prop_unparseable_text_yields_bounded_summaries(raw in ".{0,120}", n in 1usize..25) {
            let trials: Vec<TrialRecord> = (0..n)
                .map(|i| scored_trial(&format!("NCT{i:08}"), 100.0 - i as f64))
                .collect();
            let memory = memory_with(&trials);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let transition = runtime.block_on(PrepareSummariesState::new(10).process(&raw, &memory));

            let Transition::Advance(output) = transition else {
                panic!("prepare_summaries must always advance");
            };
            let summaries = output.values[keys::TRIAL_SUMMARIES].as_array().unwrap();
            prop_assert_eq!(summaries.len(), n.min(10));
        }
    }
}
