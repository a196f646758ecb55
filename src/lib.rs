//! Trialmatch
//!
//! Orchestration and ranking core for matching patient clinical profiles to
//! clinical trials.
//!
//! # Overview
//!
//! Four linear state machines run against a text-completion capability:
//! - Patient Profile extraction from report text
//! - Trial Discovery with batched ranking of search results
//! - Knowledge-Enhanced Ranking against retrieved treatment guidelines
//! - Eligibility Analysis producing final recommendations
//!
//! Completion output is untrusted. Every state parses it with the shared
//! best-effort extractor in [`parsing`] and falls back to deterministic
//! defaults, so a run reaches its terminal state even when the model
//! misbehaves.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trialmatch::{MatcherConfig, TrialMatcher};
//! use trialmatch::testing::{sample_trials, MockLlmProvider, MockTrialSearch};
//!
//! # async fn run() {
//! let matcher = TrialMatcher::new(
//!     MatcherConfig::default(),
//!     Arc::new(MockLlmProvider::single_response("[]")),
//!     Arc::new(MockTrialSearch::returning(sample_trials(3))),
//! );
//!
//! let report = matcher
//!     .run_complete_workflow("45-year-old female, stage IIIB cervical cancer")
//!     .await;
//! println!("success: {}", report.success);
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod parsing;
pub mod pipelines;
pub mod state_machine;
pub mod testing;
pub mod tools;
pub mod workflow;

pub use agent::{AgentStep, RunSummary, StateMachineAgent};
pub use config::{ConfigError, KnowledgeMode, MatcherConfig};
pub use error::{MatchError, MatchResult};
pub use pipelines::{Demographics, PatientProfile};
pub use state_machine::{SharedMemory, State, StateMachine, StateOutput, Transition};
pub use tools::{DocumentRetrieval, GuidelineChunk, TrialRecord, TrialSearch};
pub use workflow::{
    DiscoveryResult, EligibilityResult, EnhancementResult, ProfilingResult, TrialMatcher,
    WorkflowReport,
};
