//! Workflow engine
//!
//! [`TrialMatcher`] owns the configuration and the external capabilities and
//! exposes one entry point per pipeline. Every call builds a fresh machine,
//! so independent runs never share memory and may execute concurrently.
//! Entry points never return `Err`: failures are reported through the
//! `success`/`error` fields of the result.

use crate::agent::{RunSummary, StateMachineAgent};
use crate::config::{ConfigError, MatcherConfig};
use crate::error::{MatchError, MatchResult};
use crate::llm::{LlmProvider, OpenAiConfig, OpenAiProvider};
use crate::pipelines::discovery::{build_trial_discovery_machine, DiscoverySettings, TrialSummary};
use crate::pipelines::eligibility::{build_eligibility_machine, Recommendation};
use crate::pipelines::knowledge::{build_knowledge_machine, KnowledgeSettings};
use crate::pipelines::patient_profile::build_patient_profile_machine;
use crate::pipelines::PatientProfile;
use crate::state_machine::keys;
use crate::state_machine::{SharedMemory, StateMachine};
use crate::tools::{ClinicalTrialsClient, DocumentRetrieval, TrialRecord, TrialSearch};
use crate::workflow_span;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Instrument};
use uuid::Uuid;

/// How many ranked trials a public result carries
pub const RESULT_TRIAL_LIMIT: usize = 10;

/// Result of `run_patient_profiling`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<PatientProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Candidate counts observed by the discovery pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryCounts {
    pub raw: usize,
    pub unique: usize,
    pub filtered: usize,
    pub search_failures: usize,
}

/// Result of `run_trial_discovery`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unique trials open for enrollment
    pub total_found: usize,
    pub ranked_trials: Vec<TrialRecord>,
    pub top_score: f64,
    pub summaries: Vec<TrialSummary>,
    pub counts: DiscoveryCounts,
}

/// Result of `run_knowledge_enhancement`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancementResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub knowledge_enhanced: bool,
    pub ranked_trials: Vec<TrialRecord>,
    pub enhancement_count: usize,
}

/// Result of `run_eligibility_analysis`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub top_matches: Vec<Recommendation>,
    pub summary: String,
    pub overall_recommendation: String,
}

/// Result of `run_complete_workflow`
///
/// Stage results after the first unsuccessful one are absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub execution_time_seconds: f64,
    pub patient_profile: ProfilingResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_discovery: Option<DiscoveryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_enhancement: Option<EnhancementResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligibility_analysis: Option<EligibilityResult>,
}

/// Orchestrates the four pipelines over shared capabilities
pub struct TrialMatcher {
    config: MatcherConfig,
    llm: Arc<dyn LlmProvider>,
    search: Arc<dyn TrialSearch>,
    retriever: Option<Arc<dyn DocumentRetrieval>>,
}

impl TrialMatcher {
    pub fn new(
        config: MatcherConfig,
        llm: Arc<dyn LlmProvider>,
        search: Arc<dyn TrialSearch>,
    ) -> Self {
        Self {
            config,
            llm,
            search,
            retriever: None,
        }
    }

    /// Attach the guideline retriever used in treatment mode
    pub fn with_retriever(mut self, retriever: Arc<dyn DocumentRetrieval>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Build the live adapters named by `config`
    ///
    /// Resolves the API key from the configured environment variable and
    /// connects the OpenAI-compatible provider and the ClinicalTrials.gov
    /// client.
    pub fn from_config(
        config: MatcherConfig,
        retriever: Option<Arc<dyn DocumentRetrieval>>,
    ) -> MatchResult<Self> {
        config.validate()?;

        let llm: Arc<dyn LlmProvider> = match config.llm.provider.as_str() {
            "openai" => {
                let api_key = config.get_llm_api_key()?;
                Arc::new(OpenAiProvider::new(OpenAiConfig::from_section(
                    &config.llm,
                    api_key,
                ))?)
            }
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Unsupported LLM provider '{other}'"
                ))
                .into())
            }
        };
        let search: Arc<dyn TrialSearch> = Arc::new(ClinicalTrialsClient::new(&config.search)?);

        Ok(Self {
            config,
            llm,
            search,
            retriever,
        })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Drive `machine` to completion and hand back its memory
    async fn drive(&self, machine: StateMachine) -> MatchResult<(SharedMemory, RunSummary)> {
        let mut agent = StateMachineAgent::new(machine, self.llm.clone(), self.config.llm.clone());
        let summary = agent
            .run_to_completion(self.config.workflow.max_steps)
            .await?;
        Ok((agent.into_machine().into_memory(), summary))
    }

    /// Extract a structured profile from report text
    pub async fn run_patient_profiling(&self, report_text: &str) -> ProfilingResult {
        let run_id = Uuid::new_v4();
        let span = workflow_span!(run_id = %run_id, machine = keys::PATIENT_PROFILER);

        async {
            if report_text.trim().is_empty() {
                return profiling_failure(MatchError::workflow("Report text is empty"));
            }

            match self.drive(build_patient_profile_machine(report_text)).await {
                Ok((memory, summary)) => {
                    let profile = PatientProfile::from_memory(&memory);
                    info!(
                        steps = summary.steps.len(),
                        search_terms = profile.search_terms.len(),
                        "Patient profiling complete"
                    );
                    ProfilingResult {
                        success: true,
                        profile: Some(profile),
                        error: None,
                    }
                }
                Err(e) => profiling_failure(e),
            }
        }
        .instrument(span)
        .await
    }

    /// Find, filter, and rank candidate trials for a profile
    pub async fn run_trial_discovery(&self, profile: &PatientProfile) -> DiscoveryResult {
        let run_id = Uuid::new_v4();
        let span = workflow_span!(run_id = %run_id, machine = keys::TRIAL_DISCOVERY);

        async {
            let settings = DiscoverySettings::from_config(&self.config);
            let machine = build_trial_discovery_machine(profile, self.search.clone(), &settings);

            match self.drive(machine).await {
                Ok((memory, summary)) => {
                    let result = discovery_result(&memory);
                    info!(
                        steps = summary.steps.len(),
                        continuations = summary.continuations,
                        total_found = result.total_found,
                        top_score = result.top_score,
                        "Trial discovery complete"
                    );
                    result
                }
                Err(e) => {
                    error!(error = %e, "Trial discovery failed");
                    DiscoveryResult {
                        error: Some(e.to_report_message()),
                        ..DiscoveryResult::default()
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Re-rank with guideline evidence (treatment) or pass through (control)
    pub async fn run_knowledge_enhancement(
        &self,
        profile: &PatientProfile,
        ranked_trials: &[TrialRecord],
    ) -> EnhancementResult {
        let run_id = Uuid::new_v4();
        let span = workflow_span!(run_id = %run_id, machine = keys::KNOWLEDGE_RANKING);

        async {
            let settings = KnowledgeSettings::from_section(&self.config.knowledge);
            let machine =
                build_knowledge_machine(profile, ranked_trials, settings, self.retriever.clone());

            match self.drive(machine).await {
                Ok((memory, _)) => {
                    let ranked: Vec<TrialRecord> =
                        memory.get_as(keys::RANKED_TRIALS).unwrap_or_default();
                    let result = EnhancementResult {
                        success: true,
                        error: None,
                        knowledge_enhanced: memory
                            .get_as(keys::KNOWLEDGE_ENHANCED)
                            .unwrap_or(false),
                        ranked_trials: ranked.into_iter().take(RESULT_TRIAL_LIMIT).collect(),
                        enhancement_count: memory.get_as(keys::ENHANCEMENT_COUNT).unwrap_or(0),
                    };
                    info!(
                        knowledge_enhanced = result.knowledge_enhanced,
                        enhancement_count = result.enhancement_count,
                        "Knowledge enhancement complete"
                    );
                    result
                }
                Err(e) => {
                    error!(error = %e, "Knowledge enhancement failed");
                    EnhancementResult {
                        error: Some(e.to_report_message()),
                        ..EnhancementResult::default()
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Assess eligibility of the top ranked trials and recommend
    pub async fn run_eligibility_analysis(
        &self,
        profile: &PatientProfile,
        ranked_trials: &[TrialRecord],
    ) -> EligibilityResult {
        let run_id = Uuid::new_v4();
        let span = workflow_span!(run_id = %run_id, machine = keys::ELIGIBILITY_ANALYZER);

        async {
            let machine = build_eligibility_machine(profile, ranked_trials, RESULT_TRIAL_LIMIT);

            match self.drive(machine).await {
                Ok((memory, summary)) => {
                    let result = EligibilityResult {
                        success: true,
                        error: None,
                        top_matches: memory.get_as(keys::RECOMMENDATIONS).unwrap_or_default(),
                        summary: memory.get_str(keys::ELIGIBILITY_SUMMARY).to_string(),
                        overall_recommendation: memory
                            .get_str(keys::OVERALL_RECOMMENDATION)
                            .to_string(),
                    };
                    info!(
                        steps = summary.steps.len(),
                        degraded = summary.degraded_states.len(),
                        top_matches = result.top_matches.len(),
                        "Eligibility analysis complete"
                    );
                    result
                }
                Err(e) => {
                    error!(error = %e, "Eligibility analysis failed");
                    EligibilityResult {
                        error: Some(e.to_report_message()),
                        ..EligibilityResult::default()
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Profile → discovery → knowledge enhancement → eligibility
    ///
    /// Stops at the first unsuccessful stage and reports its error.
    pub async fn run_complete_workflow(&self, report_text: &str) -> WorkflowReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, mode = ?self.config.knowledge.mode, "Starting complete workflow");

        let patient_profile = self.run_patient_profiling(report_text).await;
        let mut report = WorkflowReport {
            success: false,
            error: patient_profile.error.clone(),
            run_id,
            started_at,
            execution_time_seconds: 0.0,
            patient_profile,
            trial_discovery: None,
            knowledge_enhancement: None,
            eligibility_analysis: None,
        };

        let profile = match report.patient_profile.profile.clone() {
            Some(profile) if report.patient_profile.success => profile,
            _ => return finish(report, clock),
        };

        let discovery = self.run_trial_discovery(&profile).await;
        let discovery_ok = discovery.success;
        report.error = discovery.error.clone();
        let ranked = discovery.ranked_trials.clone();
        report.trial_discovery = Some(discovery);
        if !discovery_ok {
            return finish(report, clock);
        }

        let enhancement = self.run_knowledge_enhancement(&profile, &ranked).await;
        let enhancement_ok = enhancement.success;
        report.error = enhancement.error.clone();
        let ranked = enhancement.ranked_trials.clone();
        report.knowledge_enhancement = Some(enhancement);
        if !enhancement_ok {
            return finish(report, clock);
        }

        let eligibility = self.run_eligibility_analysis(&profile, &ranked).await;
        report.success = eligibility.success;
        report.error = eligibility.error.clone();
        report.eligibility_analysis = Some(eligibility);
        finish(report, clock)
    }
}

fn profiling_failure(e: MatchError) -> ProfilingResult {
    error!(error = %e, "Patient profiling failed");
    ProfilingResult {
        success: false,
        profile: None,
        error: Some(e.to_report_message()),
    }
}

/// Public discovery result from a completed discovery machine's memory
fn discovery_result(memory: &SharedMemory) -> DiscoveryResult {
    let ranked: Vec<TrialRecord> = memory.get_as(keys::RANKED_TRIALS).unwrap_or_default();
    let filtered: usize = memory.get_as(keys::FILTERED_TRIAL_COUNT).unwrap_or(0);
    let counts = DiscoveryCounts {
        raw: memory.get_as(keys::RAW_TRIAL_COUNT).unwrap_or(0),
        unique: memory.get_as(keys::UNIQUE_TRIAL_COUNT).unwrap_or(0),
        filtered,
        search_failures: memory
            .get(keys::SEARCH_FAILURES)
            .and_then(|v| v.as_array())
            .map_or(0, Vec::len),
    };

    DiscoveryResult {
        success: true,
        error: None,
        total_found: filtered,
        top_score: ranked.first().map_or(0.0, |t| t.score),
        ranked_trials: ranked.into_iter().take(RESULT_TRIAL_LIMIT).collect(),
        summaries: memory.get_as(keys::TRIAL_SUMMARIES).unwrap_or_default(),
        counts,
    }
}

fn finish(mut report: WorkflowReport, clock: Instant) -> WorkflowReport {
    report.execution_time_seconds = clock.elapsed().as_secs_f64();
    if report.success {
        info!(
            run_id = %report.run_id,
            seconds = report.execution_time_seconds,
            "Complete workflow finished"
        );
    } else {
        error!(
            run_id = %report.run_id,
            error = report.error.as_deref().unwrap_or("unknown"),
            "Complete workflow stopped"
        );
    }
    report
}
