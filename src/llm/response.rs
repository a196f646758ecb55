//! Text payload extraction from completion responses
//!
//! Completion backends return different shapes. Each known shape gets one
//! `ResponseText` implementation instead of runtime shape sniffing at call sites.

use crate::llm::provider::{CompletionResponse, Message};
use serde_json::Value;

/// Adapter that yields the textual payload of a completion response
pub trait ResponseText {
    fn extract_text(&self) -> String;
}

/// Provider-normalized response: the content field, empty when absent
impl ResponseText for CompletionResponse {
    fn extract_text(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

/// Role/content transcript: the last record's content
impl ResponseText for [Message] {
    fn extract_text(&self) -> String {
        self.last().map(|m| m.content.clone()).unwrap_or_default()
    }
}

impl ResponseText for Vec<Message> {
    fn extract_text(&self) -> String {
        self.as_slice().extract_text()
    }
}

/// Untyped response: a `messages` array yields its last record's content,
/// anything else is stringified whole
impl ResponseText for Value {
    fn extract_text(&self) -> String {
        let last_content = self
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| messages.last())
            .and_then(|last| last.get("content"));

        match last_content {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => match self {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }
}
