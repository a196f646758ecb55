//! Trial Discovery pipeline
//!
//! generate_queries → execute_search → deduplicate → rank_trials →
//! prepare_summaries. Search and deduplication are deterministic and skip the
//! completion call. Ranking runs in bounded batches across several steps.

mod ranking;
mod summaries;

pub use ranking::{parse_batch_scores, RankTrialsState};
pub use summaries::{PrepareSummariesState, TrialSummary};

use crate::capability_span;
use crate::config::MatcherConfig;
use crate::parsing::extract_validated;
use crate::pipelines::{cancer_type_queries, profile_from, trials_from, PatientProfile};
use crate::state_machine::keys::{self, TRIAL_DISCOVERY};
use crate::state_machine::{SharedMemory, State, StateMachine, StateOutput, Transition};
use crate::tools::{TrialRecord, TrialSearch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Discovery knobs taken from `[search]` and `[ranking]`
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverySettings {
    pub batch_size: usize,
    pub default_score: f64,
    pub summary_limit: usize,
    pub min_queries: usize,
    pub max_queries: usize,
    pub max_results_per_query: usize,
    pub allowed_statuses: Vec<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::from_config(&MatcherConfig::default())
    }
}

impl DiscoverySettings {
    pub fn from_config(config: &MatcherConfig) -> Self {
        Self {
            batch_size: config.ranking.batch_size.max(1),
            default_score: config.ranking.default_score,
            summary_limit: config.ranking.summary_limit,
            min_queries: config.ranking.min_queries,
            max_queries: config.ranking.max_queries,
            max_results_per_query: config.search.max_results_per_query,
            allowed_statuses: config.search.allowed_statuses.clone(),
        }
    }
}

/// One query whose search call failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFailure {
    pub query: String,
    pub error: String,
}

/// Uppercase with spaces and hyphens folded to underscores (pure function)
pub fn normalize_status(status: &str) -> String {
    status
        .trim()
        .to_uppercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Drop repeated identifiers (first wins) and statuses outside the allow-list
///
/// Returns the unique count alongside the filtered records (pure function).
pub fn deduplicate_and_filter(
    records: &[TrialRecord],
    allowed_statuses: &[String],
) -> (usize, Vec<TrialRecord>) {
    let allowed: HashSet<String> = allowed_statuses.iter().map(|s| normalize_status(s)).collect();
    let mut seen = HashSet::new();
    let unique: Vec<&TrialRecord> = records
        .iter()
        .filter(|r| !r.nct_id.trim().is_empty() && seen.insert(r.nct_id.trim().to_string()))
        .collect();

    let filtered = unique
        .iter()
        .filter(|r| allowed.contains(&normalize_status(&r.status)))
        .map(|r| (*r).clone())
        .collect();

    (unique.len(), filtered)
}

/// Cleaned query list: strings only, trimmed, empties dropped (pure function)
fn clean_queries(values: &[Value], max_queries: usize) -> Vec<String> {
    values
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .take(max_queries)
        .map(str::to_string)
        .collect()
}

/// Rule-based queries for a profile (pure function)
fn fallback_queries(profile: &PatientProfile, max_queries: usize) -> Vec<String> {
    if let Some(queries) = cancer_type_queries(&profile.diagnoses) {
        return queries.into_iter().take(max_queries).collect();
    }
    let terms: Vec<String> = profile
        .search_terms
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .take(max_queries)
        .collect();
    if terms.is_empty() {
        vec!["cancer".to_string()]
    } else {
        terms
    }
}

struct GenerateQueriesState {
    min_queries: usize,
    max_queries: usize,
}

#[async_trait]
impl State for GenerateQueriesState {
    fn name(&self) -> &str {
        "generate_queries"
    }

    fn description(&self) -> &str {
        "Expand the diagnosis into broad registry search queries"
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        "You are a clinical trial search query optimizer for ClinicalTrials.gov.\n\n\
         Generate EXACTLY 5 simple, broad search queries from the patient diagnosis.\n\n\
         RULES:\n\
         1. Use ONLY 2-4 words per query\n\
         2. NO specific biomarkers or mutation codes (PIK3CA, KRAS G12D, ...)\n\
         3. NO virus subtypes (HPV-16) - use \"HPV positive\" if needed\n\
         4. NO stage details (IIIB) - use \"advanced\" or \"locally advanced\"\n\
         5. ALWAYS include the primary cancer type\n\n\
         Example for cervical cancer:\n\
         [\"cervical cancer\", \"gynecologic cancer\", \"cervical cancer treatment\", \"cervical cancer HPV\", \"cervical carcinoma\"]\n\n\
         Return ONLY a JSON array of exactly 5 strings."
            .to_string()
    }

    fn task(&self, memory: &SharedMemory) -> String {
        let profile = profile_from(memory);
        format!(
            "Patient diagnosis: {}\nSearch terms: {}",
            profile.diagnoses,
            profile.search_terms.join(", ")
        )
    }

    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition {
        let (min, max) = (self.min_queries, self.max_queries);
        let parsed = extract_validated(raw, |values: &Vec<Value>| {
            let valid = clean_queries(values, max).len();
            if valid >= min {
                Ok(())
            } else {
                Err(format!("only {valid} valid queries, need at least {min}"))
            }
        });

        let output = match parsed {
            Ok(values) => {
                let queries = clean_queries(&values, max);
                info!(count = queries.len(), queries = ?queries, "Search queries generated");
                StateOutput::new().with_serialized(keys::SEARCH_QUERIES, &queries)
            }
            Err(reason) => {
                let queries = fallback_queries(&profile_from(memory), max);
                warn!(reason = %reason, queries = ?queries, "Query generation failed, using fallback queries");
                StateOutput::new()
                    .with_serialized(keys::SEARCH_QUERIES, &queries)
                    .degraded(format!("query generation fell back: {reason}"))
            }
        };

        Transition::Advance(output)
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("execute_search".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::SEARCH_QUERIES]
    }
}

struct ExecuteSearchState {
    search: Arc<dyn TrialSearch>,
    max_results: usize,
}

#[async_trait]
impl State for ExecuteSearchState {
    fn name(&self) -> &str {
        "execute_search"
    }

    fn description(&self) -> &str {
        "Run every query against the trial registry"
    }

    fn requires_completion(&self, _memory: &SharedMemory) -> bool {
        false
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        String::new()
    }

    fn task(&self, _memory: &SharedMemory) -> String {
        String::new()
    }

    async fn process(&self, _raw: &str, memory: &SharedMemory) -> Transition {
        let queries: Vec<String> = memory.get_as(keys::SEARCH_QUERIES).unwrap_or_default();
        let mut raw_trials: Vec<TrialRecord> = Vec::new();
        let mut failures: Vec<SearchFailure> = Vec::new();

        for (idx, query) in queries.iter().enumerate() {
            let span = capability_span!(capability = "trial_search", query = %query, index = idx + 1);
            match self
                .search
                .search(query, self.max_results)
                .instrument(span)
                .await
            {
                Ok(records) => {
                    info!(query = %query, found = records.len(), "Search query returned");
                    raw_trials.extend(records);
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Search query failed, skipping");
                    failures.push(SearchFailure {
                        query: query.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            queries = queries.len(),
            trials = raw_trials.len(),
            failures = failures.len(),
            "Trial search complete"
        );

        let mut output = StateOutput::new()
            .with_serialized(keys::RAW_TRIALS, &raw_trials)
            .with_serialized(keys::SEARCH_FAILURES, &failures);
        if !queries.is_empty() && failures.len() == queries.len() {
            output = output.degraded("every search query failed");
        }
        Transition::Advance(output)
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("deduplicate".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[keys::RAW_TRIALS, keys::SEARCH_FAILURES]
    }
}

struct DeduplicateState {
    allowed_statuses: Vec<String>,
}

#[async_trait]
impl State for DeduplicateState {
    fn name(&self) -> &str {
        "deduplicate"
    }

    fn description(&self) -> &str {
        "Remove duplicate identifiers and trials not open for enrollment"
    }

    fn requires_completion(&self, _memory: &SharedMemory) -> bool {
        false
    }

    fn instruction(&self, _memory: &SharedMemory) -> String {
        String::new()
    }

    fn task(&self, _memory: &SharedMemory) -> String {
        String::new()
    }

    async fn process(&self, _raw: &str, memory: &SharedMemory) -> Transition {
        let raw_trials = trials_from(memory, keys::RAW_TRIALS);
        let (unique_count, filtered) = deduplicate_and_filter(&raw_trials, &self.allowed_statuses);

        info!(
            raw = raw_trials.len(),
            unique = unique_count,
            active = filtered.len(),
            "Deduplicated and filtered trials"
        );

        Transition::Advance(
            StateOutput::new()
                .with(keys::RAW_TRIAL_COUNT, json!(raw_trials.len()))
                .with(keys::UNIQUE_TRIAL_COUNT, json!(unique_count))
                .with(keys::FILTERED_TRIAL_COUNT, json!(filtered.len()))
                .with_serialized(keys::FILTERED_TRIALS, &filtered),
        )
    }

    fn successor(&self, _memory: &SharedMemory) -> Option<String> {
        Some("rank_trials".to_string())
    }

    fn writes(&self) -> &'static [&'static str] {
        &[
            keys::FILTERED_TRIALS,
            keys::RAW_TRIAL_COUNT,
            keys::UNIQUE_TRIAL_COUNT,
            keys::FILTERED_TRIAL_COUNT,
        ]
    }
}

/// Fresh discovery machine seeded with the patient profile
pub fn build_trial_discovery_machine(
    profile: &PatientProfile,
    search: Arc<dyn TrialSearch>,
    settings: &DiscoverySettings,
) -> StateMachine {
    let mut machine = StateMachine::new(TRIAL_DISCOVERY)
        .with_state(
            Box::new(GenerateQueriesState {
                min_queries: settings.min_queries,
                max_queries: settings.max_queries,
            }),
            true,
        )
        .with_state(
            Box::new(ExecuteSearchState {
                search,
                max_results: settings.max_results_per_query,
            }),
            false,
        )
        .with_state(
            Box::new(DeduplicateState {
                allowed_statuses: settings.allowed_statuses.clone(),
            }),
            false,
        )
        .with_state(
            Box::new(RankTrialsState::new(settings.batch_size, settings.default_score)),
            false,
        )
        .with_state(
            Box::new(PrepareSummariesState::new(settings.summary_limit)),
            false,
        );

    machine
        .memory_mut()
        .insert_serialized(keys::PATIENT_PROFILE, profile);
    machine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::StepStatus;
    use crate::testing::{sample_profile, sample_trial_with_status, MockTrialSearch};

    fn machine_with(search: MockTrialSearch, settings: &DiscoverySettings) -> StateMachine {
        build_trial_discovery_machine(&sample_profile(), Arc::new(search), settings)
    }

    #[test]
    fn test_normalize_status() {
        assert_eq!(normalize_status(" Not yet recruiting "), "NOT_YET_RECRUITING");
        assert_eq!(normalize_status("active-not-recruiting"), "ACTIVE_NOT_RECRUITING");
    }

    #[test]
    fn test_deduplicate_keeps_first_and_filters_status() {
        let mut duplicate = sample_trial_with_status("NCT1", "RECRUITING");
        duplicate.title = "second copy".to_string();
        let records = vec![
            sample_trial_with_status("NCT1", "RECRUITING"),
            duplicate,
            sample_trial_with_status("NCT2", "COMPLETED"),
            sample_trial_with_status("NCT3", "Not yet recruiting"),
            sample_trial_with_status("", "RECRUITING"),
        ];

        let (unique, filtered) =
            deduplicate_and_filter(&records, &DiscoverySettings::default().allowed_statuses);

        assert_eq!(unique, 3);
        let ids: Vec<_> = filtered.iter().map(|t| t.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT1", "NCT3"]);
        assert_eq!(filtered[0].title, "Trial NCT1");
    }

    #[tokio::test]
    async fn test_generate_queries_fallback_below_minimum() {
        let mut machine = machine_with(MockTrialSearch::new(), &DiscoverySettings::default());
        let result = machine
            .run_current_state(r#"["cervical cancer","gynecologic cancer"]"#)
            .await;

        assert_eq!(result.status, StepStatus::Degraded);
        let queries: Vec<String> = machine.memory().get_as(keys::SEARCH_QUERIES).unwrap();
        assert_eq!(queries.len(), 5);
        assert_eq!(queries[0], "cervical cancer");
        assert_eq!(queries[1], "advanced cervical cancer");
    }

    #[tokio::test]
    async fn test_generate_queries_verbatim_when_minimum_allows() {
        let settings = DiscoverySettings {
            min_queries: 2,
            ..Default::default()
        };
        let mut machine = machine_with(MockTrialSearch::new(), &settings);
        let result = machine
            .run_current_state(r#"["cervical cancer","gynecologic cancer"]"#)
            .await;

        assert_eq!(result.status, StepStatus::Success);
        let queries: Vec<String> = machine.memory().get_as(keys::SEARCH_QUERIES).unwrap();
        assert_eq!(queries, vec!["cervical cancer", "gynecologic cancer"]);
    }

    #[tokio::test]
    async fn test_generate_queries_truncates_to_maximum() {
        let mut machine = machine_with(MockTrialSearch::new(), &DiscoverySettings::default());
        machine
            .run_current_state(r#"```json
["a b", " c d ", "", "e f", "g h", "i j", "k l"]
```"#)
            .await;
        let queries: Vec<String> = machine.memory().get_as(keys::SEARCH_QUERIES).unwrap();
        assert_eq!(queries, vec!["a b", "c d", "e f", "g h", "i j"]);
    }

    #[test]
    fn test_fallback_without_known_cancer_uses_search_terms() {
        let profile = PatientProfile {
            diagnoses: "Glioblastoma".to_string(),
            search_terms: vec!["glioblastoma".to_string(), " ".to_string()],
            ..Default::default()
        };
        assert_eq!(fallback_queries(&profile, 5), vec!["glioblastoma"]);
        assert_eq!(fallback_queries(&PatientProfile::default(), 5), vec!["cancer"]);
    }

    #[tokio::test]
    async fn test_execute_search_skips_failing_queries() {
        let search = MockTrialSearch::new()
            .with_query("a", vec![sample_trial_with_status("NCT1", "RECRUITING")])
            .failing_on("b");
        let mut machine = machine_with(search, &DiscoverySettings::default());
        machine
            .memory_mut()
            .insert(keys::SEARCH_QUERIES, json!(["a", "b"]));
        machine.advance().unwrap();

        let result = machine.run_current_state("").await;

        assert_eq!(result.status, StepStatus::Success);
        assert_eq!(trials_from(machine.memory(), keys::RAW_TRIALS).len(), 1);
        let failures: Vec<SearchFailure> =
            machine.memory().get_as(keys::SEARCH_FAILURES).unwrap();
        assert_eq!(failures[0].query, "b");
    }

    #[test]
    fn test_discovery_machine_key_contracts() {
        let machine = machine_with(MockTrialSearch::new(), &DiscoverySettings::default());
        assert!(machine.key_collisions().is_empty());
        assert!(machine.undocumented_writes().is_empty());
    }
}
