//! ClinicalTrials.gov API v2 search client
//!
//! Request building and study parsing are pure functions; only `search`
//! performs I/O.

use crate::config::SearchSection;
use crate::parsing::truncate_chars;
use crate::tools::{ToolError, TrialEligibility, TrialRecord, TrialSearch};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const SUMMARY_MAX_CHARS: usize = 400;
const CRITERIA_MAX_CHARS: usize = 600;
const MAX_INTERVENTIONS: usize = 3;
const MAX_PAGE_SIZE: usize = 100;

/// Trial search backed by the public ClinicalTrials.gov API
pub struct ClinicalTrialsClient {
    client: reqwest::Client,
    base_url: String,
    statuses: Vec<String>,
    max_results: usize,
}

impl ClinicalTrialsClient {
    pub fn new(config: &SearchSection) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ToolError::InitializationError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            statuses: config.allowed_statuses.clone(),
            max_results: config.max_results_per_query,
        })
    }

    /// Query parameters for one search (pure function)
    fn build_query_params(
        query: &str,
        statuses: &[String],
        requested: usize,
        configured_max: usize,
    ) -> Vec<(&'static str, String)> {
        let page_size = requested.min(configured_max).clamp(1, MAX_PAGE_SIZE);
        vec![
            ("query.cond", query.to_string()),
            ("filter.overallStatus", statuses.join(",")),
            ("pageSize", page_size.to_string()),
            ("format", "json".to_string()),
        ]
    }

    /// Parse a search response body into records (pure function)
    fn parse_studies(body: &Value) -> Result<Vec<TrialRecord>, ToolError> {
        let studies = body
            .get("studies")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::InvalidResponse("missing 'studies' array".to_string()))?;

        Ok(studies.iter().filter_map(Self::parse_study).collect())
    }

    /// Parse one study; studies without an identifier are dropped (pure function)
    fn parse_study(study: &Value) -> Option<TrialRecord> {
        let protocol = study.get("protocolSection")?;
        let text = |module: &str, field: &str| -> Option<String> {
            protocol
                .get(module)
                .and_then(|m| m.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let list = |module: &str, field: &str| -> Vec<Value> {
            protocol
                .get(module)
                .and_then(|m| m.get(field))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        let nct_id = text("identificationModule", "nctId")?;

        let phase = list("designModule", "phases")
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("/");

        let interventions = list("armsInterventionsModule", "interventions")
            .iter()
            .filter_map(|i| i.get("name").and_then(Value::as_str))
            .filter(|name| !name.is_empty())
            .take(MAX_INTERVENTIONS)
            .map(str::to_string)
            .collect();

        let conditions = list("conditionsModule", "conditions")
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        Some(TrialRecord {
            nct_id,
            title: text("identificationModule", "briefTitle").unwrap_or_default(),
            status: text("statusModule", "overallStatus").unwrap_or_default(),
            phase: if phase.is_empty() {
                "Not specified".to_string()
            } else {
                phase
            },
            location: Self::first_location(&list("contactsLocationsModule", "locations")),
            brief_summary: truncate_chars(
                &text("descriptionModule", "briefSummary").unwrap_or_default(),
                SUMMARY_MAX_CHARS,
            ),
            conditions,
            interventions,
            criteria_snippet: truncate_chars(
                &text("eligibilityModule", "eligibilityCriteria").unwrap_or_default(),
                CRITERIA_MAX_CHARS,
            ),
            eligibility: TrialEligibility {
                min_age: text("eligibilityModule", "minimumAge"),
                max_age: text("eligibilityModule", "maximumAge"),
                sex: text("eligibilityModule", "sex"),
            },
            ..Default::default()
        })
    }

    /// "City, State" of the first listed site, with country outside the US (pure function)
    fn first_location(locations: &[Value]) -> String {
        let Some(location) = locations.iter().find(|l| l.get("city").is_some()) else {
            return "Not specified".to_string();
        };
        let field = |name: &str| location.get(name).and_then(Value::as_str).unwrap_or("");

        let mut parts = vec![field("city")];
        if !field("state").is_empty() {
            parts.push(field("state"));
        }
        let country = field("country");
        if !country.is_empty() && country != "United States" {
            parts.push(country);
        }
        parts.join(", ")
    }
}

#[async_trait]
impl TrialSearch for ClinicalTrialsClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<TrialRecord>, ToolError> {
        let params =
            Self::build_query_params(query, &self.statuses, max_results, self.max_results);

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| ToolError::RequestFailed(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ToolError::HttpStatus {
                status: status.as_u16(),
                body: truncate_chars(&body, 500),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let records = Self::parse_studies(&body)?;
        debug!(query, count = records.len(), "Trial search returned");
        Ok(records)
    }
}
