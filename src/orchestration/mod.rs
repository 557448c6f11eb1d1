//! Orchestration layer.
//!
//! This module provides the scheduler that walks a workflow's step graph,
//! the splitter that fans a task out into concurrent subtasks, and the
//! worker pool and retry bookkeeping both rely on.

mod pool;
mod retry;
mod scheduler;
mod splitter;

pub use pool::WorkerPool;
pub use retry::RetryTracker;
pub use scheduler::{RunOptions, RunReport, Scheduler, SchedulerEvent, RUN_SUMMARY_FILE};
pub use splitter::{BatchResult, SubtaskBatch, SubtaskEntry, SubtaskResult, SubtaskSplitter};
