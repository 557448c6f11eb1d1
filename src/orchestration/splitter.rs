//! Sub-task splitting and batch dispatch.
//!
//! A split turns one parent task into an ordered batch of children. Each
//! child carries a configuration no wider than its parent's. Children run
//! concurrently up to the configured limit, each under its own cancellation
//! token, and a failing child does not stop its siblings.

use futures::future::{join_all, BoxFuture};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::pool::WorkerPool;
use crate::agent::ExecutionContext;
use crate::config::{AgentConfig, Ordering};
use crate::core::{Task, TaskSpec, TaskStatus};
use crate::{mlog, mlog_warn, Error, Result};

/// One child ready for dispatch.
#[derive(Debug, Clone)]
pub struct SubtaskEntry {
    pub task: Task,
    pub config: Arc<AgentConfig>,
}

/// Ordered children produced by one split.
#[derive(Debug, Clone)]
pub struct SubtaskBatch {
    entries: Vec<SubtaskEntry>,
    max_concurrency: usize,
    ordering: Ordering,
    require_all: bool,
}

/// Outcome of one child.
#[derive(Debug, Clone)]
pub struct SubtaskResult {
    /// Position of the child's spec in the split request.
    pub index: usize,
    pub task: Task,
    pub status: TaskStatus,
    pub output: Option<ExecutionContext>,
}

impl SubtaskResult {
    pub fn answer(&self) -> Option<&str> {
        self.output.as_ref().and_then(|ctx| ctx.final_answer())
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub results: Vec<SubtaskResult>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.status.is_success())
            .count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.len() - self.failed_count()
    }

    /// Escalate any child failure to `Error::SubtaskFailure`.
    pub fn require_all(&self) -> Result<&Self> {
        let failed = self.failed_count();
        if failed > 0 {
            return Err(Error::SubtaskFailure {
                failed,
                total: self.len(),
            });
        }
        Ok(self)
    }
}

pub struct SubtaskSplitter;

impl SubtaskSplitter {
    /// Build the batch for split round `round` of `parent`.
    ///
    /// Every child's configuration is `parent_config` narrowed by the
    /// child's overrides; a child whose overrides would widen the parent
    /// fails the whole split with `Error::Config`.
    pub fn split(
        parent: &Task,
        parent_config: &AgentConfig,
        specs: &[TaskSpec],
        round: u32,
    ) -> Result<SubtaskBatch> {
        if specs.is_empty() {
            return Err(Error::Validation(
                "split requires at least one subtask".into(),
            ));
        }
        let settings = parent_config.tools.split_task.clone().unwrap_or_default();

        let entries = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let task = parent.child(index, round, &settings.tag_prefix, spec);
                let config = parent_config
                    .narrow(task.overrides())?
                    .at_depth(task.depth());
                Ok(SubtaskEntry {
                    task,
                    config: Arc::new(config),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SubtaskBatch {
            entries,
            max_concurrency: settings.max_concurrency,
            ordering: settings.ordering,
            require_all: settings.require_all,
        })
    }
}

impl SubtaskBatch {
    pub fn entries(&self) -> &[SubtaskEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn requires_all(&self) -> bool {
        self.require_all
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Run every child through `run` and collect their outcomes.
    ///
    /// Results are in submission order unless the batch was configured for
    /// completion order. `cancel` reaches every child through a child token;
    /// a child that has started is left to wind down on its own so it can
    /// release what it holds. Children still queued are not started.
    pub async fn dispatch<F>(self, run: F, cancel: &CancellationToken) -> BatchResult
    where
        F: Fn(Task, Arc<AgentConfig>, CancellationToken) -> BoxFuture<'static, Result<ExecutionContext>>
            + Send
            + Sync,
    {
        let pool = WorkerPool::new(self.max_concurrency);
        let finished = AtomicUsize::new(0);
        let total = self.entries.len();

        let work = self.entries.into_iter().enumerate().map(|(index, entry)| {
            let pool = &pool;
            let run = &run;
            let finished = &finished;
            let child_cancel = cancel.child_token();
            async move {
                let tag = entry.task.tag().to_string();
                let task = entry.task.clone();
                let outcome = pool
                    .run(&tag, async {
                        if child_cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        run(entry.task, entry.config, child_cancel.clone()).await
                    })
                    .await;
                let seq = finished.fetch_add(1, AtomicOrdering::SeqCst);

                let result = match outcome {
                    Ok(ctx) => SubtaskResult {
                        index,
                        task,
                        status: TaskStatus::Completed,
                        output: Some(ctx),
                    },
                    Err(e) => {
                        mlog_warn!("[{}] subtask failed: {}", tag, e);
                        SubtaskResult {
                            index,
                            task,
                            status: TaskStatus::Failed {
                                error: e.to_string(),
                            },
                            output: None,
                        }
                    }
                };
                (seq, result)
            }
        });

        let mut outcomes = join_all(work).await;
        if self.ordering == Ordering::Completion {
            outcomes.sort_by_key(|(seq, _)| *seq);
        }

        let batch = BatchResult {
            results: outcomes.into_iter().map(|(_, r)| r).collect(),
        };
        mlog!(
            "Subtask batch finished: {}/{} succeeded",
            batch.succeeded_count(),
            total
        );
        batch
    }
}
