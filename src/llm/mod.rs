//! Text-completion capability for the trial matching pipelines
//!
//! The pipelines treat completion output as untrusted text. This module only
//! moves prompts out and text back; structure is recovered by `parsing`.

pub mod provider;
pub mod providers;
pub mod response;

pub use provider::*;
pub use providers::*;
pub use response::ResponseText;
