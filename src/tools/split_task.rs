//! The `split_to_sub_task` tool.
//!
//! Lets a model fan its task out into independent children. Each child
//! runs as its own LLM agent with a configuration narrowed from the
//! parent's, and the answers come back as `SplitTask<i>:` lines.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{decode_arguments, ResolveContext, ToolOutput, ToolProvider, ToolSpec};
use crate::agent::{run_subtask, Artifact, ArtifactKind, ExecutionContext, Runtime};
use crate::config::agent::SPLIT_TASK;
use crate::config::AgentConfig;
use crate::core::{Task, TaskSpec, TaskStatus};
use crate::orchestration::{BatchResult, SubtaskSplitter};
use crate::workflow::RunId;
use crate::{mlog, Error, Result};

pub struct SplitTaskProvider {
    runtime: Arc<Runtime>,
    task: Task,
    config: Arc<AgentConfig>,
    output_dir: PathBuf,
    run_id: RunId,
    round: AtomicU32,
}

impl SplitTaskProvider {
    pub fn new(ctx: &ResolveContext) -> Self {
        Self {
            runtime: ctx.runtime.clone(),
            task: ctx.task.clone(),
            config: ctx.config.clone(),
            output_dir: ctx.output_dir.clone(),
            run_id: ctx.run_id,
            round: AtomicU32::new(0),
        }
    }

    fn parse_specs(args: &Value) -> Result<Vec<TaskSpec>> {
        let tasks = args
            .get("tasks")
            .cloned()
            .ok_or_else(|| Error::Validation("missing required argument: tasks".into()))?;
        let tasks = match tasks {
            Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| Error::Validation(format!("tasks is not valid JSON: {}", e)))?,
            other => other,
        };
        serde_json::from_value(tasks)
            .map_err(|e| Error::Validation(format!("invalid tasks argument: {}", e)))
    }
}

/// Render child answers, one `SplitTask<i>:` entry per child.
pub fn render_batch(batch: &BatchResult) -> String {
    batch
        .results
        .iter()
        .map(|r| match &r.status {
            TaskStatus::Completed => {
                format!("SplitTask{}:{}\n", r.index, r.answer().unwrap_or_default())
            }
            status => format!("SplitTask{}:{}\n", r.index, status),
        })
        .collect()
}

#[async_trait]
impl ToolProvider for SplitTaskProvider {
    fn key(&self) -> &str {
        SPLIT_TASK
    }

    async fn get_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(vec![ToolSpec::new(
            SPLIT_TASK,
            "split_to_sub_task",
            "Split a complex task into independent subtasks. Each subtask runs as a separate \
             agent with its own system prompt and query; their answers are returned in order.",
            json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "system": {"type": "string"},
                                "query": {"type": "string"}
                            },
                            "required": ["system", "query"]
                        }
                    }
                },
                "required": ["tasks"]
            }),
        )])
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        if tool != "split_to_sub_task" {
            return Err(Error::Tool(format!("unknown split_task tool: {}", tool)));
        }
        let specs = Self::parse_specs(&decode_arguments(args)?)?;
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        // A rejected override is the model's mistake; let it try again.
        let batch = SubtaskSplitter::split(&self.task, &self.config, &specs, round).map_err(
            |e| match e {
                Error::Config(msg) => Error::Validation(msg),
                other => other,
            },
        )?;
        let require_all = batch.requires_all();
        mlog!(
            "[{}] split round {} into {} subtasks",
            self.task.tag(),
            round,
            batch.len()
        );

        let runtime = self.runtime.clone();
        let template = ExecutionContext::new(self.run_id, self.output_dir.clone());
        let result = batch
            .dispatch(
                move |task, config, child_cancel| {
                    run_subtask(runtime.clone(), task, config, template.clone(), child_cancel)
                },
                cancel,
            )
            .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if require_all {
            result.require_all()?;
        }

        let mut output = ToolOutput::text(render_batch(&result)).with_artifact(Artifact::new(
            ArtifactKind::Subtasks,
            format!("{}-r{}", self.task.tag(), round),
            self.task.tag(),
            format!("{}/{} succeeded", result.succeeded_count(), result.len()),
        ));
        for child in result.results {
            if let Some(ctx) = child.output {
                output.artifacts.extend(ctx.artifacts);
            }
        }
        Ok(output)
    }

    fn runs_agents(&self) -> bool {
        true
    }
}
