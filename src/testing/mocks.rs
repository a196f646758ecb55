//! Mock implementations for testing
//!
//! Scripted completion provider, trial search, and guideline retriever, plus
//! record builders, so pipelines can be exercised without network access.

use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::pipelines::patient_profile::{Demographics, PatientProfile};
use crate::tools::{
    DocumentRetrieval, GuidelineChunk, ToolError, TrialEligibility, TrialRecord, TrialSearch,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

type Responder = dyn Fn(&CompletionRequest) -> String + Send + Sync;

/// Scripted completion provider
///
/// Responses are returned in order and cycle once exhausted. Every request is
/// recorded for inspection.
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<Mutex<usize>>,
    pub should_fail: bool,
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
    responder: Option<Box<Responder>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(Mutex::new(0)),
            should_fail: false,
            requests: Arc::new(Mutex::new(Vec::new())),
            responder: None,
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new(vec![])
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Compute each response from its request
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(vec![])
        }
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().await.push(request.clone());

        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let content = if let Some(responder) = &self.responder {
            responder(&request)
        } else {
            let mut current = self.current_response.lock().await;
            let response_idx = *current % self.responses.len().max(1);
            *current += 1;
            self.responses
                .get(response_idx)
                .cloned()
                .unwrap_or_else(|| "Mock response".to_string())
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: "mock-model".to_string(),
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
        })
    }
}

/// Trial search over a fixed query table
#[derive(Debug, Default)]
pub struct MockTrialSearch {
    pub results: HashMap<String, Vec<TrialRecord>>,
    /// Returned for queries missing from `results`
    pub default_results: Vec<TrialRecord>,
    pub failing_queries: HashSet<String>,
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl MockTrialSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every query returns the same records
    pub fn returning(records: Vec<TrialRecord>) -> Self {
        Self {
            default_results: records,
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>, records: Vec<TrialRecord>) -> Self {
        self.results.insert(query.into(), records);
        self
    }

    pub fn failing_on(mut self, query: impl Into<String>) -> Self {
        self.failing_queries.insert(query.into());
        self
    }

    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl TrialSearch for MockTrialSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<TrialRecord>, ToolError> {
        self.queries.lock().await.push(query.to_string());

        if self.failing_queries.contains(query) {
            return Err(ToolError::RequestFailed(format!("Mock search failure for '{query}'")));
        }

        let records = self.results.get(query).unwrap_or(&self.default_results);
        Ok(records.iter().take(max_results).cloned().collect())
    }
}

/// Guideline retriever returning fixed chunks
#[derive(Debug, Default)]
pub struct MockRetriever {
    pub chunks: Vec<GuidelineChunk>,
    pub should_fail: bool,
    pub queries: Arc<Mutex<Vec<(String, usize)>>>,
}

impl MockRetriever {
    pub fn new(chunks: Vec<GuidelineChunk>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn queries(&self) -> Vec<(String, usize)> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl DocumentRetrieval for MockRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<GuidelineChunk>, ToolError> {
        self.queries.lock().await.push((query.to_string(), k));

        if self.should_fail {
            return Err(ToolError::RetrievalUnavailable(
                "Mock retrieval failure".to_string(),
            ));
        }
        Ok(self.chunks.iter().take(k).cloned().collect())
    }
}

/// Recruiting trial with a generic cervical cancer profile
pub fn sample_trial(nct_id: &str, title: &str) -> TrialRecord {
    TrialRecord {
        nct_id: nct_id.to_string(),
        title: title.to_string(),
        status: "RECRUITING".to_string(),
        phase: "PHASE2".to_string(),
        location: "Boston, Massachusetts".to_string(),
        brief_summary: format!("{title}: study of chemoradiation in cervical cancer"),
        conditions: vec!["Cervical Cancer".to_string()],
        interventions: vec!["Cisplatin".to_string()],
        criteria_snippet: "Inclusion Criteria: squamous cell carcinoma of the cervix".to_string(),
        eligibility: TrialEligibility {
            min_age: Some("18 Years".to_string()),
            max_age: None,
            sex: Some("FEMALE".to_string()),
        },
        ..Default::default()
    }
}

/// `sample_trial` with a status
pub fn sample_trial_with_status(nct_id: &str, status: &str) -> TrialRecord {
    TrialRecord {
        status: status.to_string(),
        ..sample_trial(nct_id, &format!("Trial {nct_id}"))
    }
}

/// `n` distinct recruiting trials with ids NCT00000001..
pub fn sample_trials(n: usize) -> Vec<TrialRecord> {
    (1..=n)
        .map(|i| {
            let id = format!("NCT{i:08}");
            sample_trial(&id, &format!("Trial {i}"))
        })
        .collect()
}

/// `sample_trial` carrying a ranking score
pub fn scored_trial(nct_id: &str, score: f64) -> TrialRecord {
    TrialRecord {
        score,
        ..sample_trial(nct_id, &format!("Trial {nct_id}"))
    }
}

/// A 45-year-old woman with stage IIIB cervical squamous cell carcinoma
pub fn sample_profile() -> PatientProfile {
    PatientProfile {
        demographics: Demographics {
            age: Some(45),
            sex: Some("female".to_string()),
            ecog: Some(1),
            pregnancy_status: None,
        },
        diagnoses: "Stage IIIB squamous cell carcinoma of the cervix".to_string(),
        biomarkers: "PD-L1 positive (CPS 10), HPV 16 positive".to_string(),
        treatment_history: "No prior systemic therapy".to_string(),
        search_terms: vec!["cervical cancer".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_llm_cycles_and_records() {
        let llm = MockLlmProvider::new(vec!["a".to_string(), "b".to_string()]);
        for expected in ["a", "b", "a"] {
            let response = llm
                .complete(CompletionRequest::from_instruction("m", "sys", "task"))
                .await
                .unwrap();
            assert_eq!(response.content.as_deref(), Some(expected));
        }
        assert_eq!(llm.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_mock_search_failing_query() {
        let search = MockTrialSearch::returning(sample_trials(3)).failing_on("bad");
        assert!(search.search("bad", 10).await.is_err());
        assert_eq!(search.search("good", 2).await.unwrap().len(), 2);
        assert_eq!(search.queries().await, vec!["bad", "good"]);
    }

    #[test]
    fn test_sample_trials_are_distinct() {
        let trials = sample_trials(12);
        let ids: HashSet<_> = trials.iter().map(|t| t.nct_id.clone()).collect();
        assert_eq!(ids.len(), 12);
        assert_eq!(trials[0].nct_id, "NCT00000001");
    }
}
