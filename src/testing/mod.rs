//! Testing utilities and mock implementations
//!
//! Mocks for the completion, search, and retrieval capabilities so the
//! pipelines can be tested without network access.

pub mod mocks;

pub use mocks::*;
