//! Batch-continuation ranking
//!
//! The filtered candidates are split into fixed-size batches. Each step renders
//! exactly one batch, selected by `rank_batch_index`, and accumulates its
//! scores into `rank_partial_scores` (one slot per candidate, by absolute
//! position). Until the last batch the state returns `Continue`; the final
//! batch assigns the default score to unscored candidates, stable-sorts by
//! score descending, and clears both scratch keys.

use crate::parsing::{as_score, clamp_score, extract_json, truncate_chars};
use crate::pipelines::{headline, profile_from, trials_from};
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, State, StateOutput, Transition};
use crate::tools::TrialRecord;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::ops::Range;
use tracing::{info, warn};

/// Scores by position within a batch (pure function)
///
/// Accepts an object keyed by 1-based batch index or by identifier, or an
/// array of `{index|nct_id, score}` objects. Entries that match no candidate
/// in `batch` are ignored.
pub fn parse_batch_scores(value: &Value, batch: &[TrialRecord], default: f64) -> Vec<(usize, f64)> {
    let position = |key: &str| -> Option<usize> {
        let key = key.trim();
        if let Ok(index) = key.parse::<usize>() {
            return (1..=batch.len()).contains(&index).then(|| index - 1);
        }
        batch
            .iter()
            .position(|t| t.nct_id.eq_ignore_ascii_case(key))
    };

    let mut scores = Vec::new();
    match value {
        Value::Object(map) => {
            for (key, raw_score) in map {
                if let (Some(pos), Some(score)) = (position(key), as_score(raw_score)) {
                    scores.push((pos, clamp_score(score, default)));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let key = item
                    .get("index")
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .or_else(|| {
                        item.get("nct_id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    });
                let score = item.get("score").and_then(as_score);
                if let (Some(pos), Some(score)) = (key.as_deref().and_then(position), score) {
                    scores.push((pos, clamp_score(score, default)));
                }
            }
        }
        _ => {}
    }
    scores
}

/// Scores each candidate 0-100 across several steps
pub struct RankTrialsState {
    batch_size: usize,
    default_score: f64,
}

impl RankTrialsState {
    pub fn new(batch_size: usize, default_score: f64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            default_score,
        }
    }

    fn batch_count(&self, total: usize) -> usize {
        total.div_ceil(self.batch_size)
    }

    fn batch_range(&self, batch_index: usize, total: usize) -> Range<usize> {
        let start = (batch_index * self.batch_size).min(total);
        start..(start + self.batch_size).min(total)
    }

    /// Compact table of one batch (pure function)
    fn render_batch(batch: &[TrialRecord]) -> String {
        let mut table = String::from("| # | NCT ID | Title | Phase | Status | Conditions | Interventions |\n");
        table.push_str("|---|---|---|---|---|---|---|\n");
        for (i, trial) in batch.iter().enumerate() {
            table.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                i + 1,
                trial.nct_id,
                truncate_chars(&trial.title, 100).replace('|', "/"),
                trial.phase,
                trial.status,
                trial.conditions.join(", ").replace('|', "/"),
                trial.interventions.join(", ").replace('|', "/"),
            ));
        }
        table
    }
}

#[async_trait]
impl State for RankTrialsState {
    fn name(&self) -> &str {
        "rank_trials"
    }

    fn description(&self) -> &str {
        "Score and rank filtered trials in bounded batches"
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        !trials_from(memory, keys::FILTERED_TRIALS).is_empty()
    }

    fn instruction(&self, memory: &SharedMemory) -> String {
        let profile = profile_from(memory);
        let diagnosis = headline(&profile.diagnoses, 150);
        let biomarkers = headline(&profile.biomarkers, 200);
        format!(
            "You are a clinical trial relevance scorer.\n\n\
             PATIENT CONTEXT:\n\
             - Primary Diagnosis: {}\n\
             - Key Biomarkers: {}\n\n\
             Score each trial's relevance to this patient from 0 to 100:\n\
             - Condition match: up to 40 points\n\
             - Biomarker relevance (targets the patient's markers): up to 30 points\n\
             - Treatment approach fit: up to 20 points\n\
             - Phase maturity (Phase 2/3 over Phase 1): up to 10 points\n\n\
             Return ONLY a JSON object mapping each row number (#) to an integer score, \
             e.g. {{\"1\": 85, \"2\": 60}}. Score every row.",
            if diagnosis.is_empty() { "cancer" } else { diagnosis.as_str() },
            if biomarkers.is_empty() { "None" } else { biomarkers.as_str() },
        )
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let trials = trials_from(memory, keys::FILTERED_TRIALS);
        let batch_index: usize = memory.get_as(keys::RANK_BATCH_INDEX).unwrap_or(0);
        let range = self.batch_range(batch_index, trials.len());
        format!(
            "Batch {} of {}:\n\n{}",
            batch_index + 1,
            self.batch_count(trials.len()),
            Self::render_batch(&trials[range])
        )
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let trials = trials_from(memory, keys::FILTERED_TRIALS);
        if trials.is_empty() {
            info!("No filtered trials to rank");
            return Transition::Advance(
                StateOutput::new().with(keys::RANKED_TRIALS, json!([])),
            );
        }

        let total_batches = self.batch_count(trials.len());
        let batch_index: usize = memory.get_as(keys::RANK_BATCH_INDEX).unwrap_or(0);
        if batch_index >= total_batches {
            return Transition::Fatal(format!(
                "rank batch index {batch_index} out of range for {total_batches} batches"
            ));
        }

        let mut partial: Vec<Option<f64>> = memory
            .get_as(keys::RANK_PARTIAL_SCORES)
            .unwrap_or_else(|| vec![None; trials.len()]);
        if partial.len() != trials.len() {
            return Transition::Fatal(format!(
                "partial scores cover {} trials, expected {}",
                partial.len(),
                trials.len()
            ));
        }

        let range = self.batch_range(batch_index, trials.len());
        let batch = &trials[range.clone()];
        let scores = match extract_json::<Value>(raw) {
            Ok(value) => parse_batch_scores(&value, batch, self.default_score),
            Err(_) => Vec::new(),
        };

        let mut output = StateOutput::new();
        if scores.is_empty() {
            warn!(batch = batch_index + 1, size = batch.len(), "Batch scoring unparseable, using default scores");
            output = output.degraded(format!(
                "batch {} of {total_batches} unscored, default {} applied",
                batch_index + 1,
                self.default_score
            ));
        }
        for (pos, score) in &scores {
            partial[range.start + pos] = Some(*score);
        }

        if batch_index + 1 < total_batches {
            info!(
                batch = batch_index + 1,
                total_batches,
                scored = scores.len(),
                "Batch scored, continuing"
            );
            return Transition::Continue(
                output
                    .with(keys::RANK_BATCH_INDEX, json!(batch_index + 1))
                    .with_serialized(keys::RANK_PARTIAL_SCORES, &partial),
            );
        }

        let ranked = finalize_ranking(trials, &partial, self.default_score);
        info!(
            ranked = ranked.len(),
            total_batches,
            top_score = ranked.first().map(|t| t.score),
            "Trials ranked"
        );

        Transition::Advance(
            output
                .with_serialized(keys::RANKED_TRIALS, &ranked)
                .removing(keys::RANK_BATCH_INDEX)
                .removing(keys::RANK_PARTIAL_SCORES),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("prepare_summaries".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[
            keys::RANKED_TRIALS,
            keys::RANK_BATCH_INDEX,
            keys::RANK_PARTIAL_SCORES,
        ]
    }

    fn scratch_keys(&self) -> &'static [&'static str] {
        &[keys::RANK_BATCH_INDEX, keys::RANK_PARTIAL_SCORES]
    }
}

/// Apply accumulated scores and stable-sort descending (pure function)
fn finalize_ranking(
    mut trials: Vec<TrialRecord>,
    partial: &[Option<f64>],
    default_score: f64,
) -> Vec<TrialRecord> {
    for (trial, score) in trials.iter_mut().zip(partial) {
        trial.score = score.unwrap_or(default_score);
    }
    trials.sort_by(|a, b| b.score.total_cmp(&a.score));
    trials
}
