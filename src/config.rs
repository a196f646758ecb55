//! Configuration for the trial matching pipelines
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! configuration. Secrets are never stored here: the LLM API key is read from
//! the environment variable named in `[llm].api_key_env` at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level matcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatcherConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub ranking: RankingSection,
    #[serde(default)]
    pub knowledge: KnowledgeSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
}

/// Text-completion provider settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name (e.g., "openai")
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Optional max tokens
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            temperature: Some(0.2),
            max_tokens: Some(4000),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Trial search settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchSection {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    /// Upper bound on records requested per query
    #[serde(default = "default_max_results_per_query")]
    pub max_results_per_query: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    /// Statuses treated as open for enrollment
    #[serde(default = "default_allowed_statuses")]
    pub allowed_statuses: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            max_results_per_query: default_max_results_per_query(),
            timeout_secs: default_search_timeout_secs(),
            allowed_statuses: default_allowed_statuses(),
        }
    }
}

/// Ranking and summarization settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingSection {
    /// Candidates rendered per ranking prompt
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Neutral score for unscored or unparseable items
    #[serde(default = "default_score")]
    pub default_score: f64,
    /// Records summarized and returned to callers
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,
    /// Fewer valid generated queries than this is a parse failure
    #[serde(default = "default_min_queries")]
    pub min_queries: usize,
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
}

impl Default for RankingSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            default_score: default_score(),
            summary_limit: default_summary_limit(),
            min_queries: default_min_queries(),
            max_queries: default_max_queries(),
        }
    }
}

/// Knowledge enhancement arm of the A/B experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeMode {
    /// Enhancement disabled; ranking passes through untouched
    Control,
    /// Guideline retrieval and model re-scoring enabled
    #[default]
    Treatment,
}

/// Knowledge-enhanced ranking settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeSection {
    #[serde(default)]
    pub mode: KnowledgeMode,
    /// Guideline chunks retrieved per call
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_query_suffix")]
    pub query_suffix: String,
    /// Ranked trials rendered into the enhancement prompt
    #[serde(default = "default_summary_limit")]
    pub max_trials: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            mode: KnowledgeMode::default(),
            top_k: default_top_k(),
            query_suffix: default_query_suffix(),
            max_trials: default_summary_limit(),
        }
    }
}

/// Driver loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSection {
    /// Safety bound on agent steps per machine run; must cover
    /// [`MatcherConfig::discovery_step_bound`]
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_search_base_url() -> String {
    "https://clinicaltrials.gov/api/v2/studies".to_string()
}

fn default_max_results_per_query() -> usize {
    20
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_allowed_statuses() -> Vec<String> {
    [
        "RECRUITING",
        "NOT_YET_RECRUITING",
        "ENROLLING_BY_INVITATION",
        "ACTIVE_NOT_RECRUITING",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_batch_size() -> usize {
    10
}

fn default_score() -> f64 {
    50.0
}

fn default_summary_limit() -> usize {
    10
}

fn default_min_queries() -> usize {
    3
}

fn default_max_queries() -> usize {
    5
}

fn default_top_k() -> usize {
    3
}

fn default_query_suffix() -> String {
    "treatment guidelines".to_string()
}

fn default_max_steps() -> usize {
    64
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MatcherConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MatcherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.ranking.batch_size == 0 {
            return invalid("ranking.batch_size must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.ranking.default_score) {
            return invalid("ranking.default_score must be within 0..=100");
        }
        if self.ranking.summary_limit == 0 {
            return invalid("ranking.summary_limit must be at least 1");
        }
        if self.ranking.min_queries > self.ranking.max_queries {
            return invalid("ranking.min_queries cannot exceed ranking.max_queries");
        }
        if self.ranking.max_queries == 0 {
            return invalid("ranking.max_queries must be at least 1");
        }
        if self.knowledge.top_k == 0 {
            return invalid("knowledge.top_k must be at least 1");
        }
        if self.workflow.max_steps == 0 {
            return invalid("workflow.max_steps must be at least 1");
        }
        let bound = self.discovery_step_bound();
        if self.workflow.max_steps < bound {
            return Err(ConfigError::InvalidConfig(format!(
                "workflow.max_steps ({}) is below the {bound} steps discovery can take with \
                 {} queries of {} results in batches of {}",
                self.workflow.max_steps,
                self.ranking.max_queries,
                self.search.max_results_per_query,
                self.ranking.batch_size
            )));
        }
        if self.search.allowed_statuses.is_empty() {
            return invalid("search.allowed_statuses cannot be empty");
        }
        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return invalid("llm.temperature must be within 0.0..=2.0");
            }
        }

        Ok(())
    }

    /// Worst-case steps for one discovery run: one per ranking batch over
    /// every candidate the queries can return, plus the four other states
    pub fn discovery_step_bound(&self) -> usize {
        let candidates = self
            .search
            .max_results_per_query
            .saturating_mul(self.ranking.max_queries);
        let batches = candidates.div_ceil(self.ranking.batch_size.max(1)).max(1);
        batches.saturating_add(4)
    }

    /// Get LLM API key from environment variable
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }
}
