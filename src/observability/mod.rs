//! Observability for trial matching runs
//!
//! Structured logging setup and the span macros used by the agent and the
//! pipelines.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{capability_span, state_span, workflow_span};
