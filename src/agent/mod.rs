//! State machine agent and its driver loop

pub mod driver;
pub mod processor;

pub use driver::RunSummary;
pub use processor::{AgentStep, StateMachineAgent};
