//! Best-effort structured extraction from untrusted completion text
//!
//! Completion output is parsed with three tiers, stopping at the first
//! candidate that deserializes into the expected type and passes validation:
//!
//! 1. the interior of a fenced block tagged `json`
//! 2. the first balanced top-level array or object literal in the text
//! 3. the whole trimmed text
//!
//! When every tier fails the caller gets `Extraction::Degraded` carrying its
//! deterministic default and the reason, so a pipeline keeps going on
//! defaulted data instead of halting.

use serde::de::DeserializeOwned;
use serde_json::Value;

const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// Outcome of a best-effort extraction
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<T> {
    /// The completion text yielded a value of the expected shape
    Parsed(T),
    /// Nothing usable was found; `value` is the caller's default
    Degraded { value: T, reason: String },
}

impl<T> Extraction<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed(_))
    }

    /// Degradation reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Extraction::Parsed(_) => None,
            Extraction::Degraded { reason, .. } => Some(reason),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Extraction::Parsed(value) | Extraction::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Extraction::Parsed(value) | Extraction::Degraded { value, .. } => value,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Extraction<U> {
        match self {
            Extraction::Parsed(value) => Extraction::Parsed(f(value)),
            Extraction::Degraded { value, reason } => Extraction::Degraded {
                value: f(value),
                reason,
            },
        }
    }
}

/// Extract a `T` from completion text, or report why nothing matched
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    extract_validated(text, |_: &T| Ok(()))
}

/// Extract a `T` that also satisfies `validate`
///
/// A candidate that deserializes but fails validation does not stop the
/// search; later tiers are still tried.
pub fn extract_validated<T, V>(text: &str, validate: V) -> Result<T, String>
where
    T: DeserializeOwned,
    V: Fn(&T) -> Result<(), String>,
{
    let mut last_rejection: Option<String> = None;
    let mut accept = |candidate: &str| -> Option<T> {
        let value = serde_json::from_str::<T>(candidate).ok()?;
        match validate(&value) {
            Ok(()) => Some(value),
            Err(reason) => {
                last_rejection = Some(reason);
                None
            }
        }
    };

    if let Some(fenced) = fenced_block(text) {
        if let Some(value) = accept(fenced) {
            return Ok(value);
        }
    }

    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if bytes[start] != b'[' && bytes[start] != b'{' {
            start += 1;
            continue;
        }
        let Some(end) = balanced_end(bytes, start) else {
            start += 1;
            continue;
        };
        let candidate = &text[start..=end];
        if let Some(value) = accept(candidate) {
            return Ok(value);
        }
        // Well-formed JSON of the wrong shape is one top-level literal; skip it whole
        start = if serde_json::from_str::<Value>(candidate).is_ok() {
            end + 1
        } else {
            start + 1
        };
    }

    let trimmed = text.trim();
    if let Some(value) = accept(trimmed) {
        return Ok(value);
    }

    Err(match last_rejection {
        Some(reason) => format!("structured output rejected: {reason}"),
        None if trimmed.is_empty() => "empty completion text".to_string(),
        None => "no parseable structured output found".to_string(),
    })
}

/// Extract with validation, falling back to `default` on failure
pub fn extract_or<T, V, D>(text: &str, validate: V, default: D) -> Extraction<T>
where
    T: DeserializeOwned,
    V: Fn(&T) -> Result<(), String>,
    D: FnOnce() -> T,
{
    match extract_validated(text, validate) {
        Ok(value) => Extraction::Parsed(value),
        Err(reason) => Extraction::Degraded {
            value: default(),
            reason,
        },
    }
}

/// Interior of the first ```json fenced block (pure function)
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find(FENCE_OPEN)?;
    let body_start = open + FENCE_OPEN.len();
    let close = text[body_start..].find(FENCE_CLOSE)?;
    Some(text[body_start..body_start + close].trim())
}

/// Byte index of the bracket closing the literal opened at `start`
///
/// String contents and escapes are skipped, so brackets inside quoted text do
/// not count. Returns `None` for unterminated or mismatched literals.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'[' => stack.push(b']'),
            b'{' => stack.push(b'}'),
            b']' | b'}' => {
                if stack.pop() != Some(byte) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/// Clamp a model-provided score into 0..=100, mapping NaN to `default`
pub fn clamp_score(score: f64, default: f64) -> f64 {
    if score.is_nan() {
        default
    } else {
        score.clamp(0.0, 100.0)
    }
}

/// Numeric reading of a loosely typed JSON value ("85", 85, 85.0)
pub fn as_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

/// Truncate on a char boundary, appending an ellipsis when shortened
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_fenced_block_wins() {
        let text = "Sure! [\"ignored\"]\n```json\n[\"lung cancer trial\", \"nsclc\"]\n```";
        let queries: Vec<String> = extract_json(text).unwrap();
        assert_eq!(queries, vec!["lung cancer trial", "nsclc"]);
    }

    #[test]
    fn test_first_balanced_literal() {
        let text = "Here are the scores: {\"1\": 80, \"2\": 65} hope that helps";
        let scores: Value = extract_json(text).unwrap();
        assert_eq!(scores, json!({"1": 80, "2": 65}));
    }

    #[test]
    fn test_brackets_inside_strings_are_ignored() {
        let text = r#"Result: ["stage [IV] cervical", "a \"quoted\" } brace"] done"#;
        let items: Vec<String> = extract_json(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], "stage [IV] cervical");
    }

    #[test]
    fn test_wrong_shape_literal_is_skipped() {
        let text = r#"Context {"note": "x"} then ["a", "b", "c"]"#;
        let items: Vec<String> = extract_json(text).unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_whole_text_tier() {
        let value: f64 = extract_json("  42.5 ").unwrap();
        assert_eq!(value, 42.5);
    }

    #[test]
    fn test_unparseable_text_reports_reason() {
        let result: Result<Vec<String>, String> = extract_json("I cannot help with that.");
        assert!(result.is_err());
        let empty: Result<Vec<String>, String> = extract_json("   ");
        assert_eq!(empty.unwrap_err(), "empty completion text");
    }

    #[test]
    fn test_validation_failure_falls_through_to_default() {
        let extraction = extract_or(
            r#"["only one"]"#,
            |items: &Vec<String>| {
                if items.len() >= 3 {
                    Ok(())
                } else {
                    Err(format!("expected at least 3 items, got {}", items.len()))
                }
            },
            || vec!["fallback".to_string()],
        );

        assert!(!extraction.is_parsed());
        assert!(extraction.reason().unwrap().contains("at least 3"));
        assert_eq!(extraction.into_value(), vec!["fallback"]);
    }

    #[test]
    fn test_validation_tries_later_tiers() {
        let text = "```json\n[]\n```\nActually: [\"x\"]";
        let items: Vec<String> = extract_validated(text, |v: &Vec<String>| {
            if v.is_empty() {
                Err("empty".to_string())
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(items, vec!["x"]);
    }

    #[test]
    fn test_extraction_map_keeps_reason() {
        let extraction: Extraction<i32> = Extraction::Degraded {
            value: 1,
            reason: "bad".to_string(),
        };
        let mapped = extraction.map(|v| v + 1);
        assert_eq!(mapped.value(), &2);
        assert_eq!(mapped.reason(), Some("bad"));
    }

    #[test]
    fn test_score_helpers() {
        assert_eq!(clamp_score(140.0, 50.0), 100.0);
        assert_eq!(clamp_score(-3.0, 50.0), 0.0);
        assert_eq!(clamp_score(f64::NAN, 50.0), 50.0);
        assert_eq!(as_score(&json!("85%")), Some(85.0));
        assert_eq!(as_score(&json!(72)), Some(72.0));
        assert_eq!(as_score(&json!(null)), None);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("ééééé", 2), "éé...");
    }

    proptest! {
        #[test]
        fn prop_arbitrary_text_never_panics(text in ".{0,200}") {
            let _ = extract_json::<Value>(&text);
            let _ = extract_json::<Vec<String>>(&text);
        }

        #[test]
        fn prop_array_embedded_in_prose_is_recovered(
            items in proptest::collection::vec("[a-z ]{1,12}", 1..6),
            prefix in "[A-Za-z :,.]{0,40}",
            suffix in "[A-Za-z :,.]{0,40}",
        ) {
            let text = format!("{prefix}{}{suffix}", serde_json::to_string(&items).unwrap());
            let parsed: Vec<String> = extract_json(&text).unwrap();
            prop_assert_eq!(parsed, items);
        }

        #[test]
        fn prop_fenced_object_is_recovered(score in 0u32..=100, noise in "[a-z ]{0,30}") {
            let text = format!("{noise}\n```json\n{{\"score\": {score}}}\n```\n{noise}");
            let parsed: Value = extract_json(&text).unwrap();
            prop_assert_eq!(parsed["score"].as_u64(), Some(score as u64));
        }
    }
}
