//! Knowledge-Enhanced Ranking
//!
//! A single `enhance_ranking` state re-scores the discovery ranking against
//! retrieved treatment guidelines. The machine is built in one of two arms:
//!
//! - **control**: no retrieval, no model call, the ranking passes through as
//!   the exact JSON value it was seeded with
//! - **treatment**: guideline chunks are retrieved in `prepare`, the model
//!   returns a guideline score, a rationale, and an adjusted score per trial
//!
//! Blending of ranking and guideline signals is left to the model. Any failure
//! along the treatment path (retrieval error, no chunks, unparseable output)
//! leaves the ranking untouched.

use crate::capability_span;
use crate::config::{KnowledgeMode, KnowledgeSection};
use crate::parsing::{as_score, clamp_score, extract_json, truncate_chars};
use crate::pipelines::{profile_from, trials_from, PatientProfile};
use crate::state_machine::keys::{self, KNOWLEDGE_RANKING};
use crate::state_machine::{SharedMemory, State, StateMachine, StateOutput, Transition};
use crate::tools::{DocumentRetrieval, GuidelineChunk, TrialRecord};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn, Instrument};

const CHUNK_PROMPT_CHARS: usize = 500;
const TITLE_PROMPT_CHARS: usize = 100;

/// Enhancement knobs taken from `[knowledge]`
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSettings {
    pub mode: KnowledgeMode,
    pub top_k: usize,
    pub query_suffix: String,
    pub max_trials: usize,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self::from_section(&KnowledgeSection::default())
    }
}

impl KnowledgeSettings {
    pub fn from_section(section: &KnowledgeSection) -> Self {
        Self {
            mode: section.mode,
            top_k: section.top_k.max(1),
            query_suffix: section.query_suffix.clone(),
            max_trials: section.max_trials,
        }
    }

    /// Same settings in the control arm
    pub fn control() -> Self {
        Self {
            mode: KnowledgeMode::Control,
            ..Self::default()
        }
    }
}

/// Retrieval query for a profile: diagnosis, biomarkers, fixed suffix (pure function)
pub fn guideline_query(profile: &PatientProfile, suffix: &str) -> String {
    [profile.diagnoses.trim(), profile.biomarkers.trim(), suffix.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One per-trial guideline assessment returned by the model
#[derive(Debug, Clone, Deserialize)]
struct GuidelineAssessment {
    #[serde(default)]
    nct_id: String,
    #[serde(default)]
    guideline_score: Option<Value>,
    #[serde(default)]
    guideline_rationale: Option<String>,
    #[serde(default)]
    adjusted_score: Option<Value>,
}

/// Apply assessments to a ranking and re-sort it descending
///
/// Unknown identifiers are ignored. A trial counts as updated when it received
/// an adjusted score. Returns the number of updated trials (pure function).
fn apply_assessments(ranked: &mut [TrialRecord], assessments: &[GuidelineAssessment]) -> usize {
    let mut updated = 0;
    for trial in ranked.iter_mut() {
        let Some(assessment) = assessments
            .iter()
            .find(|a| a.nct_id.trim().eq_ignore_ascii_case(&trial.nct_id))
        else {
            continue;
        };

        if let Some(score) = assessment.guideline_score.as_ref().and_then(as_score) {
            trial.guideline_score = Some(clamp_score(score, 0.0));
        }
        if let Some(rationale) = &assessment.guideline_rationale {
            trial.guideline_rationale = Some(rationale.trim().to_string());
        }
        if let Some(adjusted) = assessment.adjusted_score.as_ref().and_then(as_score) {
            trial.original_score = Some(trial.score);
            trial.score = clamp_score(adjusted, trial.score);
            updated += 1;
        }
    }

    if updated > 0 {
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    }
    updated
}

/// Re-scores the ranking with retrieved guideline knowledge
pub struct EnhanceRankingState {
    settings: KnowledgeSettings,
    retriever: Option<Arc<dyn DocumentRetrieval>>,
}

impl EnhanceRankingState {
    pub fn new(settings: KnowledgeSettings, retriever: Option<Arc<dyn DocumentRetrieval>>) -> Self {
        Self {
            settings,
            retriever,
        }
    }

    fn retriever(&self) -> Option<&Arc<dyn DocumentRetrieval>> {
        match self.settings.mode {
            KnowledgeMode::Control => None,
            KnowledgeMode::Treatment => self.retriever.as_ref(),
        }
    }

    fn chunks(memory: &SharedMemory) -> Vec<GuidelineChunk> {
        memory.get_as(keys::GUIDELINE_CHUNKS).unwrap_or_default()
    }

    /// Ranking exactly as seeded, plus the "not enhanced" markers
    fn pass_through(memory: &SharedMemory) -> StateOutput {
        let ranked = memory
            .get(keys::RANKED_TRIALS)
            .cloned()
            .unwrap_or_else(|| json!([]));
        StateOutput::new()
            .with(keys::RANKED_TRIALS, ranked)
            .with(keys::KNOWLEDGE_ENHANCED, json!(false))
            .with(keys::ENHANCEMENT_COUNT, json!(0))
    }
}

#[async_trait]
impl State for EnhanceRankingState {
    fn name(&self) -> &str {
        "enhance_ranking"
    }

    fn description(&self) -> &str {
        "Re-score ranked trials against treatment guidelines"
    }

    async fn prepare(&self, memory: &SharedMemory) -> StateOutput {
        let Some(retriever) = self.retriever() else {
            if self.settings.mode == KnowledgeMode::Treatment {
                warn!("Treatment arm has no guideline retriever, ranking passes through");
            }
            return StateOutput::new();
        };

        let query = guideline_query(&profile_from(memory), &self.settings.query_suffix);
        let span = capability_span!(capability = "document_retrieval", query = %query, k = self.settings.top_k);
        let chunks = match retriever
            .retrieve(&query, self.settings.top_k)
            .instrument(span)
            .await
        {
            Ok(chunks) => {
                info!(chunks = chunks.len(), "Guideline chunks retrieved");
                chunks
            }
            Err(e) => {
                warn!(error = %e, "Guideline retrieval failed, ranking passes through");
                Vec::new()
            }
        };

        StateOutput::new().with_serialized(keys::GUIDELINE_CHUNKS, &chunks)
    }

    fn requires_completion(&self, memory: &SharedMemory) -> bool {
        self.retriever().is_some()
            && !Self::chunks(memory).is_empty()
            && !trials_from(memory, keys::RANKED_TRIALS).is_empty()
    }

    fn instruction(&self, memory: &SharedMemory) -> String {
        let profile = profile_from(memory);
        let mut text = String::from(
            "You are an oncology expert aligning clinical trial rankings with treatment guidelines.\n\n",
        );
        text.push_str(&format!(
            "PATIENT:\n- Diagnosis: {}\n- Biomarkers: {}\n\n",
            profile.diagnoses, profile.biomarkers
        ));
        text.push_str("GUIDELINE EXCERPTS:\n");
        for (i, chunk) in Self::chunks(memory).iter().enumerate() {
            text.push_str(&format!(
                "[{}] ({})\n{}\n\n",
                i + 1,
                chunk.source,
                truncate_chars(&chunk.content, CHUNK_PROMPT_CHARS)
            ));
        }
        text.push_str(
            "For each trial, score how well it aligns with the guideline excerpts (0-100), \
             justify the score citing the excerpts by number, and give an adjusted score that \
             combines the current ranking score with guideline alignment.\n\n\
             Return ONLY a JSON array:\n\
             [{\"nct_id\": \"<exact NCT ID>\", \"guideline_score\": 80, \
             \"guideline_rationale\": \"<short justification>\", \"adjusted_score\": 75}]",
        );
        text
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let mut text = String::from("RANKED TRIALS:\n");
        for (i, trial) in trials_from(memory, keys::RANKED_TRIALS)
            .iter()
            .take(self.settings.max_trials)
            .enumerate()
        {
            text.push_str(&format!(
                "{}. {} | {} | {} | current score {:.0}\n",
                i + 1,
                trial.nct_id,
                truncate_chars(&trial.title, TITLE_PROMPT_CHARS),
                trial.primary_intervention(),
                trial.score
            ));
        }
        text
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        if !self.requires_completion(memory) {
            info!(mode = ?self.settings.mode, "Knowledge enhancement skipped");
            return Transition::Advance(Self::pass_through(memory));
        }

        let assessments = match extract_json::<Vec<GuidelineAssessment>>(raw) {
            Ok(assessments) => assessments,
            Err(reason) => {
                warn!(reason = %reason, "Guideline assessment parsing failed, keeping ranking");
                return Transition::Advance(
                    Self::pass_through(memory)
                        .degraded(format!("guideline assessment unparseable: {reason}")),
                );
            }
        };

        let mut ranked = trials_from(memory, keys::RANKED_TRIALS);
        let updated = apply_assessments(&mut ranked, &assessments);
        if updated == 0 {
            warn!("Guideline assessment matched no ranked trial");
            return Transition::Advance(
                Self::pass_through(memory).degraded("guideline assessment matched no ranked trial"),
            );
        }

        info!(
            enhanced = updated,
            top_score = ranked.first().map(|t| t.score),
            "Ranking enhanced with guidelines"
        );
        Transition::Advance(
            StateOutput::new()
                .with_serialized(keys::RANKED_TRIALS, &ranked)
                .with(keys::KNOWLEDGE_ENHANCED, json!(true))
                .with(keys::ENHANCEMENT_COUNT, json!(updated)),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        None
    }

    fn writes(&self) -> &'static [&'static str] {
        &[
            keys::GUIDELINE_CHUNKS,
            keys::RANKED_TRIALS,
            keys::KNOWLEDGE_ENHANCED,
            keys::ENHANCEMENT_COUNT,
        ]
    }
}

/// Fresh enhancement machine seeded with the profile and the ranking
pub fn build_knowledge_machine(
    profile: &PatientProfile,
    ranked_trials: &[TrialRecord],
    settings: KnowledgeSettings,
    retriever: Option<Arc<dyn DocumentRetrieval>>,
) -> StateMachine {
    let mut machine = StateMachine::new(KNOWLEDGE_RANKING)
        .with_state(Box::new(EnhanceRankingState::new(settings, retriever)), true);

    let memory = machine.memory_mut();
    memory.insert_serialized(keys::PATIENT_PROFILE, profile);
    memory.insert_serialized(keys::RANKED_TRIALS, &ranked_trials.to_vec());
    machine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StateMachineAgent;
    use crate::config::LlmSection;
    use crate::testing::{sample_profile, scored_trial, MockLlmProvider, MockRetriever};

    fn chunk(content: &str) -> GuidelineChunk {
        GuidelineChunk {
            content: content.to_string(),
            source: "NCCN Cervical Cancer v1".to_string(),
            category: "treatment".to_string(),
        }
    }

    fn ranking() -> Vec<TrialRecord> {
        vec![
            scored_trial("NCT1", 90.0),
            scored_trial("NCT2", 80.0),
            scored_trial("NCT3", 70.0),
        ]
    }

    async fn run(
        settings: KnowledgeSettings,
        retriever: Option<Arc<dyn DocumentRetrieval>>,
        llm: Arc<MockLlmProvider>,
    ) -> SharedMemory {
        let machine = build_knowledge_machine(&sample_profile(), &ranking(), settings, retriever);
        let mut agent = StateMachineAgent::new(machine, llm, LlmSection::default());
        agent.run_to_completion(8).await.unwrap();
        agent.into_machine().into_memory()
    }

    #[test]
    fn test_guideline_query_joins_profile_text() {
        let query = guideline_query(&sample_profile(), "treatment guidelines");
        assert!(query.starts_with("Stage IIIB squamous cell carcinoma of the cervix PD-L1"));
        assert!(query.ends_with("treatment guidelines"));

        let empty = guideline_query(&PatientProfile::default(), "treatment guidelines");
        assert_eq!(empty, "treatment guidelines");
    }

    #[tokio::test]
    async fn test_control_arm_is_identity() {
        let llm = Arc::new(MockLlmProvider::single_response("[]"));
        let retriever = Arc::new(MockRetriever::new(vec![chunk("Pembrolizumab")]));
        let memory = run(KnowledgeSettings::control(), Some(retriever.clone()), llm.clone()).await;

        let ranked: Vec<TrialRecord> = memory.get_as(keys::RANKED_TRIALS).unwrap();
        assert_eq!(ranked, ranking());
        assert_eq!(memory.get(keys::KNOWLEDGE_ENHANCED), Some(&json!(false)));
        assert_eq!(memory.get(keys::ENHANCEMENT_COUNT), Some(&json!(0)));
        assert_eq!(llm.call_count().await, 0);
        assert!(retriever.queries().await.is_empty());
    }

    #[tokio::test]
    async fn test_treatment_rescores_and_resorts() {
        let llm = Arc::new(MockLlmProvider::single_response(
            r#"[{"nct_id": "NCT3", "guideline_score": 95, "guideline_rationale": "Matches [1]", "adjusted_score": 97},
                {"nct_id": "NCT1", "guideline_score": 40, "adjusted_score": "60"},
                {"nct_id": "NCT404", "adjusted_score": 100}]"#,
        ));
        let retriever = Arc::new(MockRetriever::new(vec![chunk("Pembrolizumab for PD-L1 positive")]));
        let memory = run(KnowledgeSettings::default(), Some(retriever.clone()), llm.clone()).await;

        let ranked: Vec<TrialRecord> = memory.get_as(keys::RANKED_TRIALS).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|t| t.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT3", "NCT2", "NCT1"]);
        assert_eq!(ranked[0].original_score, Some(70.0));
        assert_eq!(ranked[0].guideline_rationale.as_deref(), Some("Matches [1]"));
        assert_eq!(ranked[1].original_score, None);
        assert_eq!(memory.get(keys::ENHANCEMENT_COUNT), Some(&json!(2)));
        assert_eq!(memory.get(keys::KNOWLEDGE_ENHANCED), Some(&json!(true)));

        let queries = retriever.queries().await;
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].1, 3);
        let requests = llm.requests().await;
        assert!(requests[0].messages[0].content.contains("NCCN Cervical Cancer v1"));
    }

    #[tokio::test]
    async fn test_retrieval_failure_matches_control() {
        let llm = Arc::new(MockLlmProvider::single_response("[]"));
        let memory = run(
            KnowledgeSettings::default(),
            Some(Arc::new(MockRetriever::with_failure())),
            llm.clone(),
        )
        .await;

        let ranked: Vec<TrialRecord> = memory.get_as(keys::RANKED_TRIALS).unwrap();
        assert_eq!(ranked, ranking());
        assert_eq!(memory.get(keys::ENHANCEMENT_COUNT), Some(&json!(0)));
        assert_eq!(llm.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_unparseable_assessment_keeps_ranking() {
        let llm = Arc::new(MockLlmProvider::single_response("the guidelines are unclear"));
        let retriever = Arc::new(MockRetriever::new(vec![chunk("Cisplatin chemoradiation")]));
        let memory = run(KnowledgeSettings::default(), Some(retriever), llm).await;

        let ranked: Vec<TrialRecord> = memory.get_as(keys::RANKED_TRIALS).unwrap();
        assert_eq!(ranked, ranking());
        assert_eq!(memory.get(keys::KNOWLEDGE_ENHANCED), Some(&json!(false)));
    }

    #[test]
    fn test_adjusted_scores_are_clamped() {
        let mut ranked = ranking();
        let assessments = vec![GuidelineAssessment {
            nct_id: "nct2".to_string(),
            guideline_score: Some(json!(150)),
            guideline_rationale: None,
            adjusted_score: Some(json!(-20)),
        }];
        assert_eq!(apply_assessments(&mut ranked, &assessments), 1);
        let nct2 = ranked.iter().find(|t| t.nct_id == "NCT2").unwrap();
        assert_eq!(nct2.score, 0.0);
        assert_eq!(nct2.guideline_score, Some(100.0));
        assert_eq!(ranked.last().unwrap().nct_id, "NCT2");
    }

    #[test]
    fn test_knowledge_machine_key_contracts() {
        let machine = build_knowledge_machine(
            &sample_profile(),
            &ranking(),
            KnowledgeSettings::default(),
            None,
        );
        assert!(machine.key_collisions().is_empty());
        assert!(machine.undocumented_writes().is_empty());
    }
}
