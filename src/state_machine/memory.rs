//! Shared memory threaded through one machine run
//!
//! A typed wrapper over a JSON object. Every state reads it, and only the
//! output of the state currently executing is merged into it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Context mapping owned by exactly one `StateMachine`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedMemory {
    values: Map<String, Value>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserialize the value under `key`; `None` if absent or of another shape
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// String value under `key`, empty when absent or not a string
    pub fn get_str(&self, key: &str) -> &str {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Serialize and insert; values that cannot be represented as JSON become null
    pub fn insert_serialized<T: Serialize>(&mut self, key: impl Into<String>, value: &T) {
        self.values
            .insert(key.into(), serde_json::to_value(value).unwrap_or(Value::Null));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Merge `other` in, later writes replacing same-named keys
    ///
    /// Returns the keys written, in the order they were merged.
    pub fn merge(&mut self, other: Map<String, Value>) -> Vec<String> {
        let mut written = Vec::with_capacity(other.len());
        for (key, value) in other {
            written.push(key.clone());
            self.values.insert(key, value);
        }
        written
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl From<Map<String, Value>> for SharedMemory {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_only_named_keys() {
        let mut memory = SharedMemory::new();
        memory.insert("diagnoses", json!("stage IIIB cervical cancer"));
        memory.insert("search_queries", json!(["old"]));

        let mut update = Map::new();
        update.insert("search_queries".to_string(), json!(["cervical cancer"]));
        update.insert("raw_trial_count".to_string(), json!(4));
        let written = memory.merge(update);

        assert_eq!(written.len(), 2);
        assert_eq!(memory.get("search_queries"), Some(&json!(["cervical cancer"])));
        assert_eq!(memory.get_str("diagnoses"), "stage IIIB cervical cancer");
        assert_eq!(memory.get_as::<u64>("raw_trial_count"), Some(4));
    }

    #[test]
    fn test_get_as_wrong_shape_is_none() {
        let mut memory = SharedMemory::new();
        memory.insert("ranked_trials", json!("not a list"));
        assert!(memory.get_as::<Vec<String>>("ranked_trials").is_none());
        assert_eq!(memory.get_str("missing"), "");
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut memory = SharedMemory::new();
        memory.insert_serialized("enhancement_count", &3usize);
        assert_eq!(serde_json::to_value(&memory).unwrap(), json!({"enhancement_count": 3}));
    }
}
