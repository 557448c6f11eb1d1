//! Agents: the units of work a workflow step or subtask executes.

pub mod callbacks;
pub mod code_agent;
pub mod context;
pub mod llm_agent;
pub mod runtime;

pub use callbacks::{Callback, CallbackRegistry, Callbacks, TranscriptCallback};
pub use code_agent::{CodeAgent, CodeFn, CodeRegistry};
pub use context::{Artifact, ArtifactKind, ExecutionContext};
pub use llm_agent::LlmAgent;
pub use runtime::{Runtime, RuntimeBuilder};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::core::Task;
use crate::Result;

/// Agent implementation a workflow step names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    #[default]
    #[serde(rename = "LLMAgent")]
    Llm,
    #[serde(rename = "CodeAgent")]
    Code,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Llm => write!(f, "LLMAgent"),
            AgentKind::Code => write!(f, "CodeAgent"),
        }
    }
}

pub enum AgentExecutor {
    Llm(LlmAgent),
    Code(CodeAgent),
}

impl AgentExecutor {
    pub fn tag(&self) -> &str {
        match self {
            AgentExecutor::Llm(agent) => agent.tag(),
            AgentExecutor::Code(agent) => agent.tag(),
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AgentExecutor::Llm(_) => AgentKind::Llm,
            AgentExecutor::Code(_) => AgentKind::Code,
        }
    }

    /// Execute `task` against `ctx`, returning the updated context.
    pub async fn run(
        &self,
        task: &Task,
        ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        match self {
            AgentExecutor::Llm(agent) => agent.run(task, ctx, cancel).await,
            AgentExecutor::Code(agent) => agent.run(task, ctx, cancel).await,
        }
    }
}

/// Run a split child as its own LLM agent on a fresh context.
///
/// Boxed so the agent loop can recurse through the `split_task` tool.
pub fn run_subtask(
    runtime: Arc<Runtime>,
    task: Task,
    config: Arc<AgentConfig>,
    template: ExecutionContext,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<ExecutionContext>> {
    async move {
        let agent = LlmAgent::new(task.tag(), config, runtime);
        agent.run(&task, template.fork_empty(), &cancel).await
    }
    .boxed()
}
