//! Core domain models for mosaic orchestration.
//!
//! Tasks handed to agents and the step graph that orders workflow steps.

pub mod dag;
pub mod task;

pub use dag::StepGraph;
pub use task::{Task, TaskId, TaskSpec, TaskStatus};
