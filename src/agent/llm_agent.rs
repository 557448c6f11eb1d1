//! The LLM agent loop.
//!
//! One run alternates between asking the model for its next message and
//! executing the tool calls that message requests, until the model answers
//! without tools or the iteration bound is reached. Reaching the bound is
//! reported in the history and is not an error.

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::callbacks::Callbacks;
use super::context::{Artifact, ArtifactKind, ExecutionContext};
use super::runtime::Runtime;
use crate::config::AgentConfig;
use crate::core::Task;
use crate::llm::{LlmClient, Message, Role, ToolCall};
use crate::log;
use crate::tools::{ResolveContext, ToolRegistry, ToolSpec};
use crate::util::cancellable;
use crate::{mlog, mlog_debug, mlog_error, mlog_warn, Error, Result};

#[derive(Debug)]
enum LoopState {
    AwaitingModel,
    AwaitingTool(Vec<ToolCall>),
    Done,
    Failed(Error),
}

/// Everything one run of the loop touches.
struct Turn<'a> {
    task: &'a Task,
    llm: &'a dyn LlmClient,
    registry: &'a ToolRegistry,
    tools: Vec<ToolSpec>,
    callbacks: &'a Callbacks,
    cancel: &'a CancellationToken,
}

pub struct LlmAgent {
    tag: String,
    config: Arc<AgentConfig>,
    runtime: Arc<Runtime>,
}

impl LlmAgent {
    pub fn new(tag: impl Into<String>, config: Arc<AgentConfig>, runtime: Arc<Runtime>) -> Self {
        Self {
            tag: tag.into(),
            config,
            runtime,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Directory the agent's tools work in.
    pub fn tool_root(&self, ctx: &ExecutionContext) -> PathBuf {
        match &self.config.output_dir {
            Some(dir) => ctx.output_dir.join(dir),
            None => ctx.output_dir.clone(),
        }
    }

    /// Put the system prompt first and append the task's query.
    ///
    /// A history that already ends with a user message, such as a query
    /// given on the command line, keeps it as the question to answer and
    /// the configured query is not added.
    pub fn prepare_messages(&self, task: &Task, messages: &mut Vec<Message>) {
        let system = if task.system().is_empty() {
            self.config.system_prompt()
        } else {
            task.system()
        };

        if messages.is_empty() {
            messages.push(Message::system(system));
            messages.push(Message::user(task.query()));
            return;
        }

        let pending = messages.last().is_some_and(|m| m.role == Role::User);
        match messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = system.to_string(),
            _ => messages.insert(0, Message::system(system)),
        }
        if pending {
            mlog_debug!("[{}] answering pending user message", self.tag);
        } else if !task.query().is_empty() {
            messages.push(Message::user(task.query()));
        }
    }

    pub async fn run(
        &self,
        task: &Task,
        mut ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        let callbacks = self
            .runtime
            .callbacks
            .resolve(&self.config.callbacks, self.runtime.trust_remote_code)?;
        let llm = (self.runtime.llm_factory)(&self.config.llm)?;
        let registry = ToolRegistry::resolve(ResolveContext {
            runtime: self.runtime.clone(),
            task: task.clone(),
            config: self.config.clone(),
            output_dir: self.tool_root(&ctx),
            run_id: ctx.run_id,
        })
        .await?;

        mlog!(
            "[{}] starting with model {} and {} tools",
            self.tag,
            llm.model_name(),
            registry.len()
        );

        let turn = Turn {
            task,
            llm: llm.as_ref(),
            registry: &registry,
            tools: registry.specs(),
            callbacks: &callbacks,
            cancel,
        };
        let outcome = self.drive(&turn, &mut ctx).await;

        registry.cleanup().await;
        callbacks.on_task_end(task, &ctx, outcome.as_ref().err()).await;

        match outcome {
            Ok(()) => {
                mlog!("[{}] finished", self.tag);
                Ok(ctx)
            }
            Err(e) => {
                mlog_error!("[{}] failed: {}", self.tag, e);
                if let Some(help) = &self.config.help {
                    log::tagged(&self.tag, help);
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, turn: &Turn<'_>, ctx: &mut ExecutionContext) -> Result<()> {
        turn.callbacks.on_task_begin(turn.task, ctx).await?;
        self.prepare_messages(turn.task, &mut ctx.messages);

        let mut model_turns = 0u32;
        let mut state = LoopState::AwaitingModel;
        loop {
            state = match state {
                LoopState::AwaitingModel if model_turns >= self.config.max_iterations => {
                    self.note_exhausted(ctx);
                    LoopState::Done
                }
                LoopState::AwaitingModel => {
                    model_turns += 1;
                    match self.generate(turn, ctx).await {
                        Ok(response) => {
                            let next = if response.has_tool_calls() {
                                LoopState::AwaitingTool(response.tool_calls.clone())
                            } else {
                                LoopState::Done
                            };
                            ctx.messages.push(response);
                            next
                        }
                        Err(e) => LoopState::Failed(e),
                    }
                }
                LoopState::AwaitingTool(calls) => match self.call_tools(turn, ctx, calls).await {
                    Ok(()) => LoopState::AwaitingModel,
                    Err(e) => LoopState::Failed(e),
                },
                LoopState::Done => return Ok(()),
                LoopState::Failed(e) => return Err(e),
            };
            mlog_debug!("[{}] turn {} -> {:?}", self.tag, model_turns, state);
        }
    }

    /// The bound was hit while the model still wanted tools. The step ends
    /// with what it has, and the history says so.
    fn note_exhausted(&self, ctx: &mut ExecutionContext) {
        let exceeded = Error::MaxIterationsExceeded {
            tag: self.tag.clone(),
            max_iterations: self.config.max_iterations,
        };
        mlog_warn!("[{}] {}", self.tag, exceeded);
        ctx.record_artifact(Artifact::new(
            ArtifactKind::Note,
            "max_iterations",
            &self.tag,
            exceeded.to_string(),
        ));
        ctx.set_var(
            format!("{}.max_iterations_exceeded", self.tag),
            serde_json::Value::Bool(true),
        );
        ctx.messages.push(Message::assistant(exceeded.to_string()));
    }

    /// One model call, retried once on a model error.
    async fn generate(&self, turn: &Turn<'_>, ctx: &ExecutionContext) -> Result<Message> {
        turn.callbacks
            .on_generate_response(turn.task, &ctx.messages)
            .await?;

        let mut retried = false;
        let response = loop {
            let attempt = cancellable(
                turn.cancel,
                turn.llm.generate(&ctx.messages, &turn.tools),
            )
            .await;
            match attempt {
                Err(Error::Llm(msg)) if !retried => {
                    mlog_warn!("[{}] model call failed, retrying: {}", self.tag, msg);
                    retried = true;
                }
                other => break other?,
            }
        };

        if !response.content.is_empty() {
            log::tagged(&self.tag, &response.content);
        }
        turn.callbacks
            .after_generate_response(turn.task, &response)
            .await?;
        Ok(response)
    }

    /// Run every requested call at once and answer them in request order.
    async fn call_tools(
        &self,
        turn: &Turn<'_>,
        ctx: &mut ExecutionContext,
        calls: Vec<ToolCall>,
    ) -> Result<()> {
        for call in &calls {
            mlog!("[{}] tool call {} {}", self.tag, call.name, call.arguments);
            turn.callbacks.on_tool_call(turn.task, call).await?;
        }

        let results = join_all(calls.iter().map(|call| turn.registry.call(call, turn.cancel))).await;

        for (call, result) in calls.iter().zip(results) {
            turn.callbacks
                .after_tool_call(turn.task, call, &result)
                .await?;
            let content = match result {
                Ok(output) => {
                    ctx.record_artifact(Artifact::new(
                        ArtifactKind::ToolCall,
                        &call.name,
                        &self.tag,
                        call.arguments.to_string(),
                    ));
                    for artifact in output.artifacts {
                        ctx.record_artifact(artifact);
                    }
                    output.content
                }
                Err(e) if e.is_recoverable() => {
                    ctx.record_artifact(Artifact::new(
                        ArtifactKind::ToolCall,
                        &call.name,
                        &self.tag,
                        format!("failed: {}", e),
                    ));
                    format!("Tool calling failed: {}", e)
                }
                Err(e) => return Err(e),
            };
            log::tagged(&self.tag, &format!("{} -> {}", call.name, content));
            ctx.messages.push(Message::tool(call, content));
        }
        Ok(())
    }
}
