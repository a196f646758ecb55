//! Linear state machines over shared memory
//!
//! A `StateMachine` owns an ordered registry of states, a current-state
//! pointer, one `SharedMemory`, and an execution history. It executes one state
//! per step. The chain is linear: a state names its successor, and any
//! branching happens inside that state's `successor` over shared memory.
//!
//! Steps never fail by unwinding. Every outcome, including structural misuse
//! such as running a completed machine, comes back as a `StepResult`.

pub mod keys;
pub mod memory;

pub use memory::SharedMemory;

use crate::error::{MatchError, MatchResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Whether a state's output came from parsed model text or from its fallback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    #[default]
    Success,
    Degraded,
}

/// Keys a state writes into shared memory, plus scratch keys it removes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOutput {
    pub values: Map<String, Value>,
    pub removals: Vec<String>,
    pub status: OutputStatus,
    pub message: Option<String>,
}

impl StateOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to write
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    /// Serialize and add a key to write
    pub fn with_serialized<T: Serialize>(self, key: &str, value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| {
            warn!(key, error = %e, "State output value is not representable as JSON");
            Value::Null
        });
        self.with(key, value)
    }

    /// Remove a key once this output is merged
    pub fn removing(mut self, key: &str) -> Self {
        self.removals.push(key.to_string());
        self
    }

    /// Mark the output as produced by a fallback
    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.status = OutputStatus::Degraded;
        self.message = Some(reason.into());
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.status == OutputStatus::Degraded
    }
}

/// What the driver loop should do after a state processed its input
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Merge the output and run this same state again
    Continue(StateOutput),
    /// Merge the output and move to the successor
    Advance(StateOutput),
    /// Stop the run; nothing is merged
    Fatal(String),
}

/// Status of one executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Degraded,
    Continue,
    Error,
}

/// Result of running the current state once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub state: Option<String>,
    pub status: StepStatus,
    pub output: Map<String, Value>,
    pub next_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// Error result for a step that could not run
    pub fn error(state: Option<String>, error: &MatchError) -> Self {
        Self {
            state,
            status: StepStatus::Error,
            output: Map::new(),
            next_state: None,
            message: None,
            error: Some(error.to_report_message()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }
}

/// Atomic unit of a pipeline
#[async_trait]
pub trait State: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Capability work that must happen before the instruction is built
    async fn prepare(&self, _memory: &SharedMemory) -> StateOutput {
        StateOutput::new()
    }

    /// Whether this step needs model output; deterministic states return false
    fn requires_completion(&self, _memory: &SharedMemory) -> bool {
        true
    }

    /// System context for the completion request
    fn instruction(&self, memory: &SharedMemory) -> String;

    /// User content for the completion request
    fn task(&self, memory: &SharedMemory) -> String;

    /// Turn raw completion text into shared memory updates
    async fn process(&self, raw: &str, memory: &SharedMemory) -> Transition;

    /// Next state once this one advances; `None` ends the machine
    fn successor(&self, memory: &SharedMemory) -> Option<String>;

    /// Every key `process` may write
    fn writes(&self) -> &'static [&'static str];

    /// Keys that must survive between `Continue` and the resumed step
    fn scratch_keys(&self) -> &'static [&'static str] {
        &[]
    }
}

/// One history record: a state was entered or finished a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: String,
    pub status: Option<StepStatus>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    fn new(state: &str, status: Option<StepStatus>) -> Self {
        Self {
            state: state.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Registry of named states with one shared memory
pub struct StateMachine {
    name: String,
    states: Vec<Box<dyn State>>,
    current: Option<String>,
    memory: SharedMemory,
    history: Vec<HistoryEntry>,
    pending_continuation: Option<String>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.state_names())
            .field("current", &self.current)
            .field("memory_keys", &self.memory.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            current: None,
            memory: SharedMemory::new(),
            history: Vec::new(),
            pending_continuation: None,
        }
    }

    /// Register a state; the first entry state registered becomes current
    pub fn add(&mut self, state: Box<dyn State>, is_entry: bool) {
        if is_entry && self.current.is_none() {
            self.current = Some(state.name().to_string());
            self.history.push(HistoryEntry::new(state.name(), None));
        }
        self.states.push(state);
    }

    /// Builder form of [`StateMachine::add`]
    pub fn with_state(mut self, state: Box<dyn State>, is_entry: bool) -> Self {
        self.add(state, is_entry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.states.iter().map(|s| s.name()).collect()
    }

    pub fn current_state_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_state(&self) -> Option<&dyn State> {
        let name = self.current.as_deref()?;
        self.states
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        self.current.is_none()
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SharedMemory {
        &mut self.memory
    }

    pub fn into_memory(self) -> SharedMemory {
        self.memory
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    fn index_of(&self, name: &str) -> MatchResult<usize> {
        self.states
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| MatchError::unknown_state(&self.name, name))
    }

    /// Move to the current state's successor, or clear the pointer at the end
    pub fn advance(&mut self) -> MatchResult<()> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        let index = self.index_of(&current)?;
        let next = self.states[index].successor(&self.memory);

        match next {
            Some(next) => {
                self.index_of(&next)?;
                debug!(machine = %self.name, from = %current, to = %next, "Advancing state");
                self.history.push(HistoryEntry::new(&next, None));
                self.current = Some(next);
            }
            None => {
                debug!(machine = %self.name, from = %current, "Machine complete");
                self.current = None;
            }
        }
        Ok(())
    }

    /// Run the current state's `prepare` hook and merge its output
    pub async fn prepare_current_state(&mut self) -> MatchResult<()> {
        let name = self
            .current
            .clone()
            .ok_or_else(|| MatchError::no_current_state(&self.name))?;
        let index = self.index_of(&name)?;
        let output = self.states[index].prepare(&self.memory).await;
        self.apply(output);
        Ok(())
    }

    fn apply(&mut self, output: StateOutput) -> Map<String, Value> {
        self.memory.merge(output.values.clone());
        for key in &output.removals {
            self.memory.remove(key);
        }
        output.values
    }

    /// A resumed continuation needs its scratch; scratch without one is stale
    fn check_continuation(&self, index: usize) -> MatchResult<()> {
        let state = &self.states[index];
        let resuming = self.pending_continuation.as_deref() == Some(state.name());

        if resuming {
            if let Some(missing) = state
                .scratch_keys()
                .iter()
                .find(|key| !self.memory.contains(key))
            {
                return Err(MatchError::continuation_lost(state.name(), *missing));
            }
        } else if let Some(stale) = state
            .scratch_keys()
            .iter()
            .find(|key| self.memory.contains(key))
        {
            return Err(MatchError::continuation_lost(
                state.name(),
                format!("{stale} present without a pending continuation"),
            ));
        }

        Ok(())
    }

    /// Process `raw` with the current state, merge its output, and advance
    pub async fn run_current_state(&mut self, raw: &str) -> StepResult {
        let Some(name) = self.current.clone() else {
            return StepResult::error(None, &MatchError::no_current_state(&self.name));
        };

        let index = match self.index_of(&name) {
            Ok(index) => index,
            Err(e) => return StepResult::error(Some(name), &e),
        };

        if let Err(e) = self.check_continuation(index) {
            warn!(machine = %self.name, state = %name, error = %e, "Batch continuation desynchronized");
            self.pending_continuation = None;
            self.history
                .push(HistoryEntry::new(&name, Some(StepStatus::Error)));
            return StepResult::error(Some(name), &e);
        }

        let transition = self.states[index].process(raw, &self.memory).await;

        let result = match transition {
            Transition::Fatal(message) => {
                self.pending_continuation = None;
                let error = MatchError::workflow(message);
                warn!(machine = %self.name, state = %name, error = %error, "State failed");
                StepResult::error(Some(name.clone()), &error)
            }
            Transition::Continue(output) => {
                let message = output.message.clone();
                let written = self.apply(output);
                self.pending_continuation = Some(name.clone());
                StepResult {
                    state: Some(name.clone()),
                    status: StepStatus::Continue,
                    output: written,
                    next_state: Some(name.clone()),
                    message,
                    error: None,
                }
            }
            Transition::Advance(output) => {
                let status = match output.status {
                    OutputStatus::Success => StepStatus::Success,
                    OutputStatus::Degraded => StepStatus::Degraded,
                };
                let message = output.message.clone();
                let written = self.apply(output);
                self.pending_continuation = None;

                if let Err(e) = self.advance() {
                    self.history
                        .push(HistoryEntry::new(&name, Some(StepStatus::Error)));
                    return StepResult::error(Some(name), &e);
                }

                StepResult {
                    state: Some(name.clone()),
                    status,
                    output: written,
                    next_state: self.current.clone(),
                    message,
                    error: None,
                }
            }
        };

        self.history
            .push(HistoryEntry::new(&name, Some(result.status)));
        result
    }

    /// Keys declared as written by more than one state of this machine
    pub fn key_collisions(&self) -> Vec<(String, Vec<String>)> {
        let mut writers: Vec<(String, Vec<String>)> = Vec::new();
        for state in &self.states {
            for key in state.writes() {
                match writers.iter_mut().find(|(k, _)| k.as_str() == *key) {
                    Some((_, names)) => names.push(state.name().to_string()),
                    None => writers.push((key.to_string(), vec![state.name().to_string()])),
                }
            }
        }
        writers.retain(|(_, names)| names.len() > 1);
        writers
    }

    /// Declared writes with no entry in the key contract table
    pub fn undocumented_writes(&self) -> Vec<(String, String)> {
        self.states
            .iter()
            .flat_map(|state| {
                state.writes().iter().filter_map(move |key| {
                    match keys::contract_for(&self.name, key) {
                        Some(contract) if contract.writer == state.name() => None,
                        _ => Some((state.name().to_string(), key.to_string())),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoState {
        name: &'static str,
        next: Option<&'static str>,
        key: &'static str,
    }

    #[async_trait]
    impl State for EchoState {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "writes the raw input under its key"
        }

        fn instruction(&self, _memory: &SharedMemory) -> String {
            format!("instruction for {}", self.name)
        }

        fn task(&self, _memory: &SharedMemory) -> String {
            String::new()
        }

        async fn process(&self, raw: &str, _memory: &SharedMemory) -> Transition {
            if raw == "fail" {
                return Transition::Fatal("asked to fail".to_string());
            }
            Transition::Advance(StateOutput::new().with(self.key, json!(raw)))
        }

        fn successor(&self, _memory: &SharedMemory) -> Option<String> {
            self.next.map(str::to_string)
        }

        fn writes(&self) -> &'static [&'static str] {
            match self.key {
                "a" => &["a"],
                _ => &["b"],
            }
        }
    }

    fn two_state_machine() -> StateMachine {
        StateMachine::new("Test")
            .with_state(
                Box::new(EchoState {
                    name: "first",
                    next: Some("second"),
                    key: "a",
                }),
                true,
            )
            .with_state(
                Box::new(EchoState {
                    name: "second",
                    next: None,
                    key: "b",
                }),
                false,
            )
    }

    #[test]
    fn test_entry_registration() {
        let machine = two_state_machine();
        assert_eq!(machine.current_state_name(), Some("first"));
        assert!(!machine.is_complete());
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_second_entry_does_not_replace_current() {
        let mut machine = two_state_machine();
        machine.add(
            Box::new(EchoState {
                name: "third",
                next: None,
                key: "a",
            }),
            true,
        );
        assert_eq!(machine.current_state_name(), Some("first"));
    }

    #[tokio::test]
    async fn test_run_advances_and_completes() {
        let mut machine = two_state_machine();
        machine.memory_mut().insert("untouched", json!(1));

        let first = machine.run_current_state("hello").await;
        assert_eq!(first.status, StepStatus::Success);
        assert_eq!(first.next_state.as_deref(), Some("second"));
        assert_eq!(machine.memory().get("a"), Some(&json!("hello")));

        let second = machine.run_current_state("world").await;
        assert_eq!(second.next_state, None);
        assert!(machine.is_complete());
        assert_eq!(machine.memory().get("untouched"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_run_on_complete_machine_is_error_result() {
        let mut machine = StateMachine::new("Empty");
        let result = machine.run_current_state("anything").await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("no current state"));
    }

    #[tokio::test]
    async fn test_fatal_does_not_merge_or_advance() {
        let mut machine = two_state_machine();
        let result = machine.run_current_state("fail").await;
        assert!(result.is_error());
        assert!(machine.memory().get("a").is_none());
        assert_eq!(machine.current_state_name(), Some("first"));
    }

    #[tokio::test]
    async fn test_unknown_successor_is_error_result() {
        let mut machine = StateMachine::new("Broken").with_state(
            Box::new(EchoState {
                name: "only",
                next: Some("missing"),
                key: "a",
            }),
            true,
        );
        let result = machine.run_current_state("x").await;
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("missing"));
    }

    #[test]
    fn test_key_collisions_detected() {
        let machine = StateMachine::new("Test")
            .with_state(
                Box::new(EchoState {
                    name: "first",
                    next: None,
                    key: "a",
                }),
                true,
            )
            .with_state(
                Box::new(EchoState {
                    name: "again",
                    next: None,
                    key: "a",
                }),
                false,
            );
        let collisions = machine.key_collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].0, "a");
        assert_eq!(collisions[0].1, vec!["first", "again"]);
    }
}
