//! Shared memory keys and their writer/reader contracts
//!
//! Keys are not namespaced per state, so every key a state writes is listed
//! here with the one state allowed to write it within its machine. Keys with
//! writer [`SEED`] are placed by the workflow engine before the first step.

pub const SEED: &str = "seed";

pub const PATIENT_PROFILER: &str = "PatientProfiler";
pub const TRIAL_DISCOVERY: &str = "TrialDiscovery";
pub const KNOWLEDGE_RANKING: &str = "KnowledgeEnhancedRanking";
pub const ELIGIBILITY_ANALYZER: &str = "EligibilityAnalyzer";

// Patient profile
pub const REPORT_TEXT: &str = "report_text";
pub const DEMOGRAPHICS: &str = "demographics";
pub const DIAGNOSES: &str = "diagnoses";
pub const BIOMARKERS: &str = "biomarkers";
pub const TREATMENT_HISTORY: &str = "treatment_history";
pub const SEARCH_TERMS: &str = "search_terms";
pub const PROFILE_COMPLETE: &str = "profile_complete";

// Seeded into downstream machines
pub const PATIENT_PROFILE: &str = "patient_profile";

// Trial discovery
pub const SEARCH_QUERIES: &str = "search_queries";
pub const RAW_TRIALS: &str = "raw_trials";
pub const SEARCH_FAILURES: &str = "search_failures";
pub const FILTERED_TRIALS: &str = "filtered_trials";
pub const RAW_TRIAL_COUNT: &str = "raw_trial_count";
pub const UNIQUE_TRIAL_COUNT: &str = "unique_trial_count";
pub const FILTERED_TRIAL_COUNT: &str = "filtered_trial_count";
pub const RANKED_TRIALS: &str = "ranked_trials";
pub const RANK_BATCH_INDEX: &str = "rank_batch_index";
pub const RANK_PARTIAL_SCORES: &str = "rank_partial_scores";
pub const TRIAL_SUMMARIES: &str = "trial_summaries";
pub const TRIAL_DISCOVERY_COMPLETE: &str = "trial_discovery_complete";

// Knowledge enhancement
pub const GUIDELINE_CHUNKS: &str = "guideline_chunks";
pub const KNOWLEDGE_ENHANCED: &str = "knowledge_enhanced";
pub const ENHANCEMENT_COUNT: &str = "enhancement_count";

// Eligibility
pub const TRIAL_CRITERIA: &str = "trial_criteria";
pub const DEMOGRAPHIC_MATCHES: &str = "demographic_matches";
pub const CLINICAL_MATCHES: &str = "clinical_matches";
pub const ELIGIBILITY_ASSESSMENTS: &str = "eligibility_assessments";
pub const RECOMMENDATIONS: &str = "recommendations";
pub const OVERALL_RECOMMENDATION: &str = "overall_recommendation";
pub const ELIGIBILITY_SUMMARY: &str = "eligibility_summary";
pub const ANALYSIS_COMPLETE: &str = "analysis_complete";

/// One documented "written by X, read by Y" key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyContract {
    pub machine: &'static str,
    pub key: &'static str,
    pub writer: &'static str,
    pub readers: &'static [&'static str],
}

const fn contract(
    machine: &'static str,
    key: &'static str,
    writer: &'static str,
    readers: &'static [&'static str],
) -> KeyContract {
    KeyContract {
        machine,
        key,
        writer,
        readers,
    }
}

pub const CONTRACTS: &[KeyContract] = &[
    contract(PATIENT_PROFILER, REPORT_TEXT, SEED, &[
        "extract_demographics",
        "extract_diagnoses",
        "extract_biomarkers",
        "extract_treatment_history",
    ]),
    contract(PATIENT_PROFILER, DEMOGRAPHICS, "extract_demographics", &["caller"]),
    contract(PATIENT_PROFILER, DIAGNOSES, "extract_diagnoses", &[
        "extract_biomarkers",
        "generate_search_terms",
    ]),
    contract(PATIENT_PROFILER, BIOMARKERS, "extract_biomarkers", &["generate_search_terms"]),
    contract(PATIENT_PROFILER, TREATMENT_HISTORY, "extract_treatment_history", &[
        "generate_search_terms",
    ]),
    contract(PATIENT_PROFILER, SEARCH_TERMS, "generate_search_terms", &["caller"]),
    contract(PATIENT_PROFILER, PROFILE_COMPLETE, "generate_search_terms", &["caller"]),
    contract(TRIAL_DISCOVERY, PATIENT_PROFILE, SEED, &[
        "generate_queries",
        "rank_trials",
        "prepare_summaries",
    ]),
    contract(TRIAL_DISCOVERY, SEARCH_QUERIES, "generate_queries", &["execute_search"]),
    contract(TRIAL_DISCOVERY, RAW_TRIALS, "execute_search", &["deduplicate"]),
    contract(TRIAL_DISCOVERY, SEARCH_FAILURES, "execute_search", &["caller"]),
    contract(TRIAL_DISCOVERY, FILTERED_TRIALS, "deduplicate", &["rank_trials"]),
    contract(TRIAL_DISCOVERY, RAW_TRIAL_COUNT, "deduplicate", &["caller"]),
    contract(TRIAL_DISCOVERY, UNIQUE_TRIAL_COUNT, "deduplicate", &["caller"]),
    contract(TRIAL_DISCOVERY, FILTERED_TRIAL_COUNT, "deduplicate", &["caller"]),
    contract(TRIAL_DISCOVERY, RANKED_TRIALS, "rank_trials", &["prepare_summaries", "caller"]),
    contract(TRIAL_DISCOVERY, RANK_BATCH_INDEX, "rank_trials", &["rank_trials"]),
    contract(TRIAL_DISCOVERY, RANK_PARTIAL_SCORES, "rank_trials", &["rank_trials"]),
    contract(TRIAL_DISCOVERY, TRIAL_SUMMARIES, "prepare_summaries", &["caller"]),
    contract(TRIAL_DISCOVERY, TRIAL_DISCOVERY_COMPLETE, "prepare_summaries", &["caller"]),
    contract(KNOWLEDGE_RANKING, PATIENT_PROFILE, SEED, &["enhance_ranking"]),
    contract(KNOWLEDGE_RANKING, GUIDELINE_CHUNKS, "enhance_ranking", &["enhance_ranking"]),
    contract(KNOWLEDGE_RANKING, RANKED_TRIALS, "enhance_ranking", &["caller"]),
    contract(KNOWLEDGE_RANKING, KNOWLEDGE_ENHANCED, "enhance_ranking", &["caller"]),
    contract(KNOWLEDGE_RANKING, ENHANCEMENT_COUNT, "enhance_ranking", &["caller"]),
    contract(ELIGIBILITY_ANALYZER, PATIENT_PROFILE, SEED, &[
        "match_demographics",
        "match_clinical_features",
        "assess_eligibility",
        "generate_recommendations",
    ]),
    contract(ELIGIBILITY_ANALYZER, RANKED_TRIALS, SEED, &[
        "extract_criteria",
        "match_clinical_features",
        "assess_eligibility",
        "generate_recommendations",
    ]),
    contract(ELIGIBILITY_ANALYZER, TRIAL_CRITERIA, "extract_criteria", &[
        "match_demographics",
        "assess_eligibility",
    ]),
    contract(ELIGIBILITY_ANALYZER, DEMOGRAPHIC_MATCHES, "match_demographics", &[
        "match_clinical_features",
        "generate_recommendations",
    ]),
    contract(ELIGIBILITY_ANALYZER, CLINICAL_MATCHES, "match_clinical_features", &[
        "assess_eligibility",
        "generate_recommendations",
    ]),
    contract(ELIGIBILITY_ANALYZER, ELIGIBILITY_ASSESSMENTS, "assess_eligibility", &[
        "generate_recommendations",
    ]),
    contract(ELIGIBILITY_ANALYZER, RECOMMENDATIONS, "generate_recommendations", &["caller"]),
    contract(ELIGIBILITY_ANALYZER, OVERALL_RECOMMENDATION, "generate_recommendations", &[
        "caller",
    ]),
    contract(ELIGIBILITY_ANALYZER, ELIGIBILITY_SUMMARY, "generate_recommendations", &["caller"]),
    contract(ELIGIBILITY_ANALYZER, ANALYSIS_COMPLETE, "generate_recommendations", &["caller"]),
];

/// Contract for `key` within `machine`
pub fn contract_for(machine: &str, key: &str) -> Option<&'static KeyContract> {
    CONTRACTS
        .iter()
        .find(|c| c.machine == machine && c.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_each_key_has_one_writer_per_machine() {
        let mut seen = HashSet::new();
        for c in CONTRACTS {
            assert!(
                seen.insert((c.machine, c.key)),
                "key '{}' documented twice in {}",
                c.key,
                c.machine
            );
        }
    }

    #[test]
    fn test_contract_lookup() {
        let c = contract_for(TRIAL_DISCOVERY, RANK_BATCH_INDEX).unwrap();
        assert_eq!(c.writer, "rank_trials");
        assert!(contract_for(PATIENT_PROFILER, RANKED_TRIALS).is_none());
    }
}
