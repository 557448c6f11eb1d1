pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod llm;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod tools;
pub mod util;
pub mod workflow;

pub use error::{Error, Result};
pub use workflow::{RunId, RunStatus, StepStatus, Workflow};
