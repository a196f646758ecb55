//! Error types for the trial matching pipelines
//!
//! Structural parse failures never appear here: they are recovered inside each
//! state. These variants cover configuration, capability, and workflow-structure
//! failures, which public entry points report as `{ success: false, error }`.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Main error type for trial matching operations
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Capability error: {0}")]
    Tool(#[from] crate::tools::ToolError),

    #[error("State '{state}' is not registered in machine '{machine}'")]
    UnknownState { machine: String, state: String },

    #[error("Machine '{machine}' has no current state")]
    NoCurrentState { machine: String },

    #[error("Batch continuation of '{state}' lost its scratch state ({missing})")]
    ContinuationLost { state: String, missing: String },

    #[error("Machine '{machine}' did not complete within {limit} steps")]
    StepLimitExceeded { machine: String, limit: usize },

    #[error("Workflow error: {message}")]
    Workflow { message: String },
}

impl MatchError {
    /// Create unknown state error
    pub fn unknown_state<M: Into<String>, S: Into<String>>(machine: M, state: S) -> Self {
        Self::UnknownState {
            machine: machine.into(),
            state: state.into(),
        }
    }

    /// Create no current state error
    pub fn no_current_state<M: Into<String>>(machine: M) -> Self {
        Self::NoCurrentState {
            machine: machine.into(),
        }
    }

    /// Create continuation lost error
    pub fn continuation_lost<S: Into<String>, K: Into<String>>(state: S, missing: K) -> Self {
        Self::ContinuationLost {
            state: state.into(),
            missing: missing.into(),
        }
    }

    /// Create workflow error
    pub fn workflow<S: Into<String>>(message: S) -> Self {
        Self::Workflow {
            message: message.into(),
        }
    }

    /// Message safe to place in a public result
    pub fn to_report_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Redact credentials and private paths, and bound the length of error text
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for trial matching operations
pub type MatchResult<T> = Result<T, MatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_state_constructor() {
        let error = MatchError::unknown_state("TrialDiscovery", "missing");
        assert!(matches!(error, MatchError::UnknownState { .. }));
        assert_eq!(
            error.to_string(),
            "State 'missing' is not registered in machine 'TrialDiscovery'"
        );
    }

    #[test]
    fn test_no_current_state_constructor() {
        let error = MatchError::no_current_state("EligibilityAnalyzer");
        assert_eq!(
            error.to_string(),
            "Machine 'EligibilityAnalyzer' has no current state"
        );
    }

    #[test]
    fn test_continuation_lost_constructor() {
        let error = MatchError::continuation_lost("rank_trials", "rank_batch_index");
        assert!(error.to_string().contains("rank_trials"));
        assert!(error.to_string().contains("rank_batch_index"));
    }

    #[test]
    fn test_report_message_is_sanitized() {
        let error = MatchError::workflow("search failed: token=abc123");
        let message = error.to_report_message();
        assert!(!message.contains("abc123"));
        assert!(message.contains("token=***"));
    }

    #[test]
    fn test_sanitize_multiple_secrets() {
        let message = "Auth failed: password=pass1 api_key=key123 secret=hidden";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("pass1"));
        assert!(!sanitized.contains("key123"));
        assert!(!sanitized.contains("hidden"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_path_redaction() {
        let sanitized = sanitize_error_message("Failed to read /home/user/.aws/credentials");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains(".aws/credentials"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let sanitized = sanitize_error_message(&"x".repeat(500));
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }
}
