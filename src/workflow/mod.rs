//! Workflow documents, run identifiers and run state.

pub mod definition;
pub mod state;
pub mod types;

pub use definition::{
    AgentKwargs, AgentRef, Next, Step, StepDefinition, Workflow, WorkflowDefinition,
};
pub use state::{RunState, StepRecord};
pub use types::{RunId, RunStatus, StepStatus};
