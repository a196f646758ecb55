//! Driver loop: step an agent until its machine completes
//!
//! `Continue` re-invokes the same state with shared memory (and its batch
//! scratch) intact. An error step ends the run. The loop is bounded by the
//! configured step limit.

use crate::agent::processor::{AgentStep, StateMachineAgent};
use crate::error::{MatchError, MatchResult};
use crate::state_machine::StepStatus;
use tracing::{info, warn};

/// What happened over one driven run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: Vec<AgentStep>,
    /// States whose output came from a fallback
    pub degraded_states: Vec<String>,
    pub continuations: usize,
}

impl RunSummary {
    /// How many times `state` was executed
    pub fn invocations_of(&self, state: &str) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state.as_deref() == Some(state))
            .count()
    }
}

impl StateMachineAgent {
    /// Step until the machine completes, an error step occurs, or `max_steps` is hit
    pub async fn run_to_completion(&mut self, max_steps: usize) -> MatchResult<RunSummary> {
        let mut summary = RunSummary::default();

        while !self.machine().is_complete() {
            if summary.steps.len() >= max_steps {
                warn!(machine = %self.machine().name(), max_steps, "Step limit exceeded");
                return Err(MatchError::StepLimitExceeded {
                    machine: self.machine().name().to_string(),
                    limit: max_steps,
                });
            }

            let step = self.step().await;
            let state = step.state.clone().unwrap_or_default();

            match step.result.status {
                StepStatus::Error => {
                    let reason = step
                        .result
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(MatchError::workflow(format!(
                        "state '{state}' of {} failed: {reason}",
                        self.machine().name()
                    )));
                }
                StepStatus::Continue => summary.continuations += 1,
                StepStatus::Degraded => summary.degraded_states.push(state),
                StepStatus::Success => {}
            }

            summary.steps.push(step);
        }

        info!(
            machine = %self.machine().name(),
            steps = summary.steps.len(),
            continuations = summary.continuations,
            degraded = summary.degraded_states.len(),
            "Machine run complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::state_machine::{SharedMemory, State, StateMachine, StateOutput, Transition};
    use crate::testing::MockLlmProvider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// Continues until `counter` reaches `target`
    struct Countdown {
        target: u64,
    }

    #[async_trait]
    impl State for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        fn description(&self) -> &str {
            "loops via Continue"
        }

        fn instruction(&self, _memory: &SharedMemory) -> String {
            String::new()
        }

        fn task(&self, _memory: &SharedMemory) -> String {
            String::new()
        }

        async fn process(&self, _raw: &str, memory: &SharedMemory) -> Transition {
            let next = memory.get_as::<u64>("counter").unwrap_or(0) + 1;
            let output = StateOutput::new().with("counter", json!(next));
            if next < self.target {
                Transition::Continue(output)
            } else {
                Transition::Advance(output)
            }
        }

        fn successor(&self, _memory: &SharedMemory) -> Option<String> {
            None
        }

        fn writes(&self) -> &'static [&'static str] {
            &["counter"]
        }
    }

    fn countdown_agent(target: u64) -> StateMachineAgent {
        let machine = StateMachine::new("Loop").with_state(Box::new(Countdown { target }), true);
        StateMachineAgent::new(
            machine,
            Arc::new(MockLlmProvider::single_response("ok")),
            LlmSection::default(),
        )
    }

    #[tokio::test]
    async fn test_continue_reinvokes_same_state() {
        let mut agent = countdown_agent(3);
        let summary = agent.run_to_completion(10).await.unwrap();

        assert_eq!(summary.invocations_of("countdown"), 3);
        assert_eq!(summary.continuations, 2);
        assert!(agent.machine().is_complete());
        assert_eq!(agent.machine().memory().get_as::<u64>("counter"), Some(3));
    }

    #[tokio::test]
    async fn test_step_limit_is_an_error() {
        let mut agent = countdown_agent(100);
        let result = agent.run_to_completion(5).await;
        assert!(matches!(
            result,
            Err(MatchError::StepLimitExceeded { limit: 5, .. })
        ));
    }
}
