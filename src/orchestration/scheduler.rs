//! Scheduler for workflow execution.
//!
//! The Scheduler walks the step graph one step at a time in topological
//! order. A step receives the output of its predecessor, or the merge of
//! all predecessors' outputs at a join. Failures are retried up to the
//! step's bound; after that a critical step halts the run and a
//! non-critical one hands its input to its successors unchanged.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::retry::RetryTracker;
use crate::agent::{AgentExecutor, AgentKind, CodeAgent, ExecutionContext, LlmAgent, Runtime};
use crate::state::{input_digest, StepHistory};
use crate::workflow::{RunId, RunState, RunStatus, Step, StepStatus, Workflow};
use crate::{mlog, mlog_error, mlog_warn, Error, Result};

pub const RUN_SUMMARY_FILE: &str = "run.json";

/// Events emitted by the scheduler for step lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    StepStarted { step: String, attempt: u32 },
    StepCompleted { step: String },
    /// Output reused from a previous run.
    StepCached { step: String },
    StepFailed {
        step: String,
        error: String,
        critical: bool,
    },
    RunCompleted { run_id: RunId, status: RunStatus },
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse outputs of steps whose input is unchanged since the last run.
    pub load_cache: bool,
    pub events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// Output of every step that finished, by step name.
    pub outputs: HashMap<String, ExecutionContext>,
    /// Terminal steps' outputs, merged.
    pub context: ExecutionContext,
}

impl RunReport {
    pub fn run_id(&self) -> RunId {
        self.state.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.context.final_answer()
    }
}

/// Executes one workflow.
///
/// # Example
///
/// ```ignore
/// let workflow = Workflow::load(Path::new("flows/report"), &env)?;
/// let mut scheduler = Scheduler::new(workflow, runtime, RunOptions::default())?;
/// let report = scheduler.run(ExecutionContext::new(RunId::new(), "output"), &cancel).await?;
/// ```
pub struct Scheduler {
    workflow: Workflow,
    runtime: Arc<Runtime>,
    options: RunOptions,
}

impl Scheduler {
    /// Check every code step and callback the workflow names is available.
    pub fn new(workflow: Workflow, runtime: Arc<Runtime>, options: RunOptions) -> Result<Self> {
        for step in workflow.steps() {
            match (step.kind, &step.code) {
                (AgentKind::Code, Some(code)) => {
                    runtime.code.resolve(code, runtime.trust_remote_code)?;
                }
                (AgentKind::Code, None) => {
                    return Err(Error::Config(format!(
                        "CodeAgent step '{}' names no code",
                        step.name
                    )))
                }
                (AgentKind::Llm, _) => {
                    runtime
                        .callbacks
                        .resolve(&step.config.callbacks, runtime.trust_remote_code)?;
                }
            }
        }
        Ok(Self {
            workflow,
            runtime,
            options,
        })
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.options.events {
            let _ = tx.send(event);
        }
    }

    fn executor(&self, step: &Step) -> Result<AgentExecutor> {
        Ok(match step.kind {
            AgentKind::Llm => AgentExecutor::Llm(LlmAgent::new(
                &step.tag,
                step.config.clone(),
                self.runtime.clone(),
            )),
            AgentKind::Code => {
                let name = step.code.as_deref().unwrap_or_default();
                let code = self.runtime.code.resolve(name, self.runtime.trust_remote_code)?;
                AgentExecutor::Code(CodeAgent::new(&step.tag, code))
            }
        })
    }

    /// Run every step once, starting from `initial`.
    ///
    /// Returns `Error::StepFailed` when a critical step fails and
    /// `Error::Cancelled` when `cancel` fires. `run.json` is written to the
    /// context's output directory either way.
    pub async fn run(&mut self, initial: ExecutionContext, cancel: &CancellationToken) -> Result<RunReport> {
        let output_dir = initial.output_dir.clone();
        let history = StepHistory::new(&output_dir);
        let mut state = RunState::new(initial.run_id, self.workflow.order().iter().cloned());
        let mut outputs: HashMap<String, ExecutionContext> = HashMap::new();
        let mut retries = RetryTracker::new();

        mlog!(
            "Run {} started: {} steps",
            initial.run_id.short(),
            self.workflow.len()
        );

        loop {
            if cancel.is_cancelled() {
                return self.halt(&mut state, &output_dir, RunStatus::Cancelled, Error::Cancelled);
            }

            let ready = self
                .workflow
                .graph()
                .ready_steps(&state.finished_steps())?;
            let Some(name) = ready.into_iter().next() else {
                break;
            };
            let Some(step) = self.workflow.step(&name).cloned() else {
                return Err(Error::Config(format!("unknown step: {}", name)));
            };

            let input = self.input_for(&name, &initial, &outputs)?;
            match self
                .execute_step(&step, input, &history, &mut state, &mut retries, cancel)
                .await
            {
                Ok(output) => {
                    outputs.insert(name, output);
                }
                Err(Error::Cancelled) => {
                    return self.halt(&mut state, &output_dir, RunStatus::Cancelled, Error::Cancelled);
                }
                Err(e) => {
                    return self.halt(
                        &mut state,
                        &output_dir,
                        RunStatus::Failed,
                        Error::StepFailed {
                            step: name,
                            source: Box::new(e),
                        },
                    );
                }
            }
        }

        let terminal: Vec<ExecutionContext> = self
            .workflow
            .order()
            .iter()
            .filter(|name| self.workflow.graph().successors(name).is_empty())
            .filter_map(|name| outputs.get(name).cloned())
            .collect();
        let context = ExecutionContext::merge(terminal)?;

        state.finish(RunStatus::Completed);
        self.write_summary(&state, &output_dir)?;
        self.emit(SchedulerEvent::RunCompleted {
            run_id: state.run_id,
            status: RunStatus::Completed,
        });
        mlog!(
            "Run {} completed ({} failed non-critical steps, {} retries)",
            state.run_id.short(),
            state.count(StepStatus::Failed),
            retries.total()
        );

        Ok(RunReport {
            state,
            outputs,
            context,
        })
    }

    /// Input for `name`: the initial context for roots, else the merge of
    /// its predecessors' outputs in topological order.
    fn input_for(
        &self,
        name: &str,
        initial: &ExecutionContext,
        outputs: &HashMap<String, ExecutionContext>,
    ) -> Result<ExecutionContext> {
        let preds = self.workflow.ordered_predecessors(name);
        if preds.is_empty() {
            return Ok(initial.clone());
        }
        let contexts = preds
            .iter()
            .map(|pred| {
                outputs
                    .get(pred)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("missing output of step {}", pred)))
            })
            .collect::<Result<Vec<_>>>()?;
        ExecutionContext::merge(contexts)
    }

    /// Run one step with its retries. A failed non-critical step yields its
    /// input back; only critical failures and cancellation are errors.
    async fn execute_step(
        &self,
        step: &Step,
        input: ExecutionContext,
        history: &StepHistory,
        state: &mut RunState,
        retries: &mut RetryTracker,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        let task = step.task();
        let digest = input_digest(&step.name, task.system(), task.query(), &input)?;

        if self.options.load_cache {
            if let Some(mut cached) = history.lookup(&step.name, &digest)? {
                cached.run_id = input.run_id;
                cached.output_dir = input.output_dir.clone();
                state.mark_cached(&step.name)?;
                mlog!("[{}] reusing cached output", step.name);
                self.emit(SchedulerEvent::StepCached {
                    step: step.name.clone(),
                });
                return Ok(cached);
            }
        }

        let executor = self.executor(step)?;
        state.transition(&step.name, StepStatus::Running)?;

        loop {
            state.record_attempt(&step.name);
            let attempt = retries.get_retries(&step.name) + 1;
            self.emit(SchedulerEvent::StepStarted {
                step: step.name.clone(),
                attempt,
            });
            mlog!("[{}] attempt {} ({})", step.name, attempt, executor.kind());

            match executor.run(&task, input.clone(), cancel).await {
                Ok(output) => {
                    if let Err(e) = history.save(&step.name, &digest, &output) {
                        mlog_warn!("[{}] could not save history: {}", step.name, e);
                    }
                    state.transition(&step.name, StepStatus::Completed)?;
                    self.emit(SchedulerEvent::StepCompleted {
                        step: step.name.clone(),
                    });
                    return Ok(output);
                }
                Err(Error::Cancelled) => {
                    state.fail(&step.name, &Error::Cancelled)?;
                    return Err(Error::Cancelled);
                }
                Err(e) if retries.can_retry(&step.name, step.retries) => {
                    retries.increment(&step.name);
                    mlog_warn!("[{}] attempt {} failed, retrying: {}", step.name, attempt, e);
                }
                Err(e) => {
                    state.fail(&step.name, &e)?;
                    self.emit(SchedulerEvent::StepFailed {
                        step: step.name.clone(),
                        error: e.to_string(),
                        critical: step.critical,
                    });
                    if step.critical {
                        return Err(e);
                    }
                    mlog_warn!("[{}] non-critical step failed, continuing: {}", step.name, e);
                    return Ok(input);
                }
            }
        }
    }

    fn halt(
        &self,
        state: &mut RunState,
        output_dir: &Path,
        status: RunStatus,
        error: Error,
    ) -> Result<RunReport> {
        state.finish(status);
        mlog_error!("Run {} {}: {}", state.run_id.short(), status, error);
        if let Err(e) = self.write_summary(state, output_dir) {
            mlog_warn!("Could not write run summary: {}", e);
        }
        self.emit(SchedulerEvent::RunCompleted {
            run_id: state.run_id,
            status,
        });
        Err(error)
    }

    fn write_summary(&self, state: &RunState, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;
        std::fs::write(
            output_dir.join(RUN_SUMMARY_FILE),
            serde_json::to_string_pretty(state)?,
        )?;
        Ok(())
    }
}
