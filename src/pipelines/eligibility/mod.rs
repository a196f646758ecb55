//! Eligibility Analyzer pipeline
//!
//! extract_criteria → match_demographics → match_clinical_features →
//! assess_eligibility → generate_recommendations. Each stage narrows the
//! candidate set of the one before it: only demographic-passing trials are
//! graded clinically, and only trials scoring at least
//! [`CLINICAL_THRESHOLD`] get a detailed assessment. Every stage keeps a
//! rule-based fallback, so the machine always reaches its terminal state.

mod assessment;
mod clinical;
mod criteria;

pub use assessment::{
    synthesize_recommendations, EligibilityAssessment, EligibilityTier, Recommendation,
    RecommendationReport,
};
pub use clinical::{grade_clinical_features, BiomarkerMatch, BiomarkerStatus, ClinicalMatch, MatchGrade};
pub use criteria::{
    criteria_from_record, match_demographics_by_rules, parse_age_years, Criterion,
    DemographicMatch, TrialCriteria,
};

use crate::pipelines::{trials_from, PatientProfile};
use crate::state_machine::keys::{self, ELIGIBILITY_ANALYZER};
use crate::state_machine::{SharedMemory, StateMachine};
use crate::tools::TrialRecord;
use std::collections::BTreeMap;

/// Minimum clinical score for a detailed assessment
pub const CLINICAL_THRESHOLD: f64 = 0.7;
pub const MAX_RECOMMENDATIONS: usize = 5;
pub const MIN_RECOMMENDATIONS: usize = 3;

/// Ranked trials under analysis
fn eligibility_trials(memory: &SharedMemory) -> Vec<TrialRecord> {
    trials_from(memory, keys::RANKED_TRIALS)
}

/// Entry for `nct_id`, tolerating case and whitespace differences in model keys
fn find_entry<'a, T>(entries: &'a BTreeMap<String, T>, nct_id: &str) -> Option<&'a T> {
    entries.get(nct_id).or_else(|| {
        entries
            .iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(nct_id))
            .map(|(_, value)| value)
    })
}

/// Identifier, title, published eligibility, and criteria text for prompts
fn trial_block(trial: &TrialRecord) -> String {
    let eligibility = &trial.eligibility;
    format!(
        "{}: {}\n   Age: {} to {} | Sex: {}\n   Criteria: {}",
        trial.nct_id,
        trial.title,
        eligibility.min_age.as_deref().unwrap_or("N/A"),
        eligibility.max_age.as_deref().unwrap_or("N/A"),
        eligibility.sex.as_deref().unwrap_or("ALL"),
        if trial.criteria_snippet.is_empty() {
            "No criteria"
        } else {
            trial.criteria_snippet.as_str()
        }
    )
}

/// Fresh analyzer seeded with the profile and the top `max_trials` ranked trials
pub fn build_eligibility_machine(
    profile: &PatientProfile,
    ranked_trials: &[TrialRecord],
    max_trials: usize,
) -> StateMachine {
    let mut machine = StateMachine::new(ELIGIBILITY_ANALYZER)
        .with_state(Box::new(criteria::ExtractCriteriaState), true)
        .with_state(Box::new(criteria::MatchDemographicsState), false)
        .with_state(Box::new(clinical::MatchClinicalFeaturesState), false)
        .with_state(Box::new(assessment::AssessEligibilityState), false)
        .with_state(Box::new(assessment::GenerateRecommendationsState), false);

    let trials: Vec<TrialRecord> = ranked_trials.iter().take(max_trials).cloned().collect();
    let memory = machine.memory_mut();
    memory.insert_serialized(keys::PATIENT_PROFILE, profile);
    memory.insert_serialized(keys::RANKED_TRIALS, &trials);
    machine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StateMachineAgent;
    use crate::config::LlmSection;
    use crate::state_machine::StepStatus;
    use crate::testing::{sample_profile, sample_trial, MockLlmProvider};
    use serde_json::json;
    use std::sync::Arc;

    fn candidate_trials() -> Vec<TrialRecord> {
        let mut matching = sample_trial("NCT00000001", "Pembrolizumab in Stage IIIB Cervical Cancer");
        matching.brief_summary = "PD-L1 positive squamous cell carcinoma, HPV associated".to_string();
        matching.score = 92.0;

        let mut male_only = sample_trial("NCT00000002", "Prostate Radiotherapy Study");
        male_only.eligibility.sex = Some("MALE".to_string());
        male_only.score = 85.0;

        let mut early = sample_trial("NCT00000003", "Early Stage Adenocarcinoma Surgery");
        early.brief_summary = "early stage adenocarcinoma of the cervix".to_string();
        early.criteria_snippet = "Inclusion Criteria: adenocarcinoma".to_string();
        early.score = 70.0;

        vec![matching, male_only, early]
    }

    #[tokio::test]
    async fn test_fallback_path_end_to_end() {
        let machine = build_eligibility_machine(&sample_profile(), &candidate_trials(), 10);
        let llm = Arc::new(MockLlmProvider::single_response("I cannot produce JSON today."));
        let mut agent = StateMachineAgent::new(machine, llm.clone(), LlmSection::default());

        let summary = agent.run_to_completion(16).await.unwrap();
        assert_eq!(summary.steps.len(), 5);
        assert!(summary
            .steps
            .iter()
            .all(|s| s.result.status == StepStatus::Degraded));

        let memory = agent.machine().memory();
        let demographics: BTreeMap<String, DemographicMatch> =
            memory.get_as(keys::DEMOGRAPHIC_MATCHES).unwrap();
        assert!(demographics["NCT00000001"].demographic_pass);
        assert!(!demographics["NCT00000002"].demographic_pass);

        let clinical: BTreeMap<String, ClinicalMatch> =
            memory.get_as(keys::CLINICAL_MATCHES).unwrap();
        assert_eq!(clinical.len(), 2);
        assert!(clinical["NCT00000001"].clinical_score >= CLINICAL_THRESHOLD);
        assert!(clinical["NCT00000003"].clinical_score < CLINICAL_THRESHOLD);

        let assessments: BTreeMap<String, EligibilityAssessment> =
            memory.get_as(keys::ELIGIBILITY_ASSESSMENTS).unwrap();
        assert_eq!(assessments.len(), 1);
        assert_eq!(
            assessments["NCT00000001"].overall_eligibility,
            EligibilityTier::HighlyLikely
        );

        let recommendations: Vec<Recommendation> = memory.get_as(keys::RECOMMENDATIONS).unwrap();
        let ids: Vec<&str> = recommendations.iter().map(|r| r.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT00000001", "NCT00000003"]);
        assert!(recommendations.iter().all(|r| r.nct_id != "NCT00000002"));
        assert!(memory
            .get_str(keys::OVERALL_RECOMMENDATION)
            .contains("NCT00000001"));
        assert_eq!(memory.get(keys::ANALYSIS_COMPLETE), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_model_recommendations_flag_unknown_trials() {
        let machine = build_eligibility_machine(&sample_profile(), &candidate_trials(), 10);
        let llm = Arc::new(MockLlmProvider::with_responder(|request| {
            let system = request.system_prompt().unwrap_or_default();
            if system.contains("top_matches") {
                json!({
                    "top_matches": [
                        {"rank": 2, "nct_id": "NCT99999999", "trial_title": "Invented"},
                        {"rank": 1, "nct_id": "NCT00000001", "match_score": 95, "eligibility_status": "highly_likely"}
                    ],
                    "summary": "One strong match",
                    "overall_recommendation": "Enroll in NCT00000001"
                })
                .to_string()
            } else {
                "no structured output".to_string()
            }
        }));
        let mut agent = StateMachineAgent::new(machine, llm, LlmSection::default());
        agent.run_to_completion(16).await.unwrap();

        let memory = agent.machine().memory();
        let recommendations: Vec<Recommendation> = memory.get_as(keys::RECOMMENDATIONS).unwrap();
        assert_eq!(recommendations.len(), 2);
        assert_eq!(recommendations[0].nct_id, "NCT00000001");
        assert!(recommendations[0].verified);
        assert_eq!(
            recommendations[0].trial_title,
            "Pembrolizumab in Stage IIIB Cervical Cancer"
        );
        assert!(!recommendations[1].verified);
        assert_eq!(memory.get_str(keys::ELIGIBILITY_SUMMARY), "One strong match");
    }

    #[tokio::test]
    async fn test_no_trials_needs_no_completions() {
        let machine = build_eligibility_machine(&sample_profile(), &[], 10);
        let llm = Arc::new(MockLlmProvider::single_response("{}"));
        let mut agent = StateMachineAgent::new(machine, llm.clone(), LlmSection::default());
        agent.run_to_completion(16).await.unwrap();

        assert_eq!(llm.call_count().await, 0);
        let memory = agent.machine().memory();
        assert_eq!(memory.get(keys::RECOMMENDATIONS), Some(&json!([])));
        assert_eq!(
            memory.get_str(keys::OVERALL_RECOMMENDATION),
            "No suitable trials identified"
        );
    }

    #[test]
    fn test_builder_keeps_top_trials_only() {
        let trials = crate::testing::sample_trials(12);
        let machine = build_eligibility_machine(&sample_profile(), &trials, 10);
        assert_eq!(eligibility_trials(machine.memory()).len(), 10);
    }

    #[test]
    fn test_find_entry_tolerates_key_case() {
        let mut entries = BTreeMap::new();
        entries.insert(" nct00000001 ".to_string(), 1);
        assert_eq!(find_entry(&entries, "NCT00000001"), Some(&1));
        assert_eq!(find_entry(&entries, "NCT00000002"), None);
    }

    #[test]
    fn test_eligibility_machine_key_contracts() {
        let machine = build_eligibility_machine(&sample_profile(), &candidate_trials(), 10);
        assert!(machine.key_collisions().is_empty());
        assert!(machine.undocumented_writes().is_empty());
    }
}
