//! Orchestration agent: one state machine paired with a completion provider
//!
//! Each step builds the current state's instruction over shared memory, asks
//! the provider for a completion, and feeds the extracted text to the machine.
//! Malformed completion text is never retried here; each state degrades on its
//! own. A transport failure is treated the same way: the state receives empty
//! text and applies its fallback.

use crate::config::LlmSection;
use crate::error::MatchError;
use crate::llm::provider::{CompletionRequest, LlmProvider};
use crate::llm::ResponseText;
use crate::state_machine::{StateMachine, StepResult};
use crate::{capability_span, state_span};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Outcome of one agent step
#[derive(Debug, Clone, Serialize)]
pub struct AgentStep {
    pub state: Option<String>,
    pub raw_text: String,
    pub result: StepResult,
    pub next_state: Option<String>,
}

/// Drives a `StateMachine` with a text-completion provider
pub struct StateMachineAgent {
    machine: StateMachine,
    llm: Arc<dyn LlmProvider>,
    llm_config: LlmSection,
}

impl StateMachineAgent {
    pub fn new(machine: StateMachine, llm: Arc<dyn LlmProvider>, llm_config: LlmSection) -> Self {
        Self {
            machine,
            llm,
            llm_config,
        }
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut StateMachine {
        &mut self.machine
    }

    pub fn into_machine(self) -> StateMachine {
        self.machine
    }

    /// Build the completion request for the current state (pure function)
    fn build_request(llm_config: &LlmSection, instruction: String, task: String) -> CompletionRequest {
        let mut request = CompletionRequest::from_instruction(&llm_config.model, instruction, task);
        request.temperature = llm_config.temperature;
        request.max_tokens = llm_config.max_tokens;
        request
    }

    /// Ask the provider for text; transport failures become empty text
    async fn complete_text(&self, state: &str, request: CompletionRequest) -> String {
        let span = capability_span!(capability = "text_completion", provider = %self.llm.name(), state);
        async {
            match self.llm.complete(request).await {
                Ok(response) => response.extract_text(),
                Err(e) => {
                    warn!(error = %e, "Completion failed, state will apply its fallback");
                    String::new()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Execute exactly one state of the machine
    pub async fn step(&mut self) -> AgentStep {
        let Some(state_name) = self.machine.current_state_name().map(str::to_string) else {
            let error = MatchError::no_current_state(self.machine.name());
            return AgentStep {
                state: None,
                raw_text: String::new(),
                result: StepResult::error(None, &error),
                next_state: None,
            };
        };

        let span = state_span!(machine = %self.machine.name(), state = %state_name);
        self.step_state(state_name).instrument(span).await
    }

    async fn step_state(&mut self, state_name: String) -> AgentStep {
        if let Err(e) = self.machine.prepare_current_state().await {
            return AgentStep {
                state: Some(state_name.clone()),
                raw_text: String::new(),
                result: StepResult::error(Some(state_name), &e),
                next_state: None,
            };
        }

        let request = match self.machine.current_state() {
            Some(state) if state.requires_completion(self.machine.memory()) => {
                let memory = self.machine.memory();
                Some(Self::build_request(
                    &self.llm_config,
                    state.instruction(memory),
                    state.task(memory),
                ))
            }
            _ => None,
        };

        let raw_text = match request {
            Some(request) => self.complete_text(&state_name, request).await,
            None => {
                debug!("State is deterministic, skipping completion");
                String::new()
            }
        };

        let result = self.machine.run_current_state(&raw_text).await;
        info!(
            status = ?result.status,
            next_state = ?result.next_state,
            keys_written = result.output.len(),
            "State step finished"
        );

        AgentStep {
            state: Some(state_name),
            raw_text,
            next_state: result.next_state.clone(),
            result,
        }
    }
}
