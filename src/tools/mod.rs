//! External capabilities consumed by the pipelines
//!
//! Trial search and guideline retrieval are traits so pipelines run the same
//! against the live ClinicalTrials.gov API, the in-memory guideline index, or
//! test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod clinical_trials;
pub mod guideline_index;

pub use clinical_trials::ClinicalTrialsClient;
pub use guideline_index::{GuidelineDocument, GuidelineIndex};

/// Eligibility fields published with a trial record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialEligibility {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
}

/// Candidate trial record
///
/// Ranking and enhancement update `score` in place. Records are never deleted,
/// only filtered into smaller ordered sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub nct_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub brief_summary: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub interventions: Vec<String>,
    #[serde(default)]
    pub criteria_snippet: String,
    #[serde(default)]
    pub eligibility: TrialEligibility,
    #[serde(default)]
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guideline_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guideline_rationale: Option<String>,
}

impl TrialRecord {
    /// First listed intervention, if any
    pub fn primary_intervention(&self) -> &str {
        self.interventions
            .first()
            .map(String::as_str)
            .unwrap_or("Not specified")
    }
}

/// One retrieved guideline passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineChunk {
    pub content: String,
    pub source: String,
    pub category: String,
}

/// Search and retrieval failures
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool initialization failed: {0}")]
    InitializationError(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
}

/// `TrialSearch(query, maxResults)`: raw candidate records for one query
#[async_trait]
pub trait TrialSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<TrialRecord>, ToolError>;
}

/// `DocumentRetrieval(query, k)`: ordered guideline chunks, read-only
#[async_trait]
pub trait DocumentRetrieval: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<GuidelineChunk>, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trial_record_tolerates_sparse_json() {
        let record: TrialRecord =
            serde_json::from_value(json!({"nct_id": "NCT01", "title": "A trial"})).unwrap();
        assert_eq!(record.nct_id, "NCT01");
        assert_eq!(record.score, 0.0);
        assert_eq!(record.primary_intervention(), "Not specified");
    }

    #[test]
    fn test_optional_scores_skipped_when_absent() {
        let record = TrialRecord {
            nct_id: "NCT02".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("original_score").is_none());
        assert!(value.get("guideline_rationale").is_none());
    }

    #[test]
    fn test_tool_error_display() {
        let error = ToolError::HttpStatus {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(error.to_string(), "HTTP 503: unavailable");
    }
}
