//! Lifecycle hooks around an LLM agent run.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::context::ExecutionContext;
use crate::core::Task;
use crate::llm::{Message, ToolCall};
use crate::tools::ToolOutput;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Hooks an agent invokes as it runs. Every method defaults to a no-op.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn on_task_begin(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    async fn on_generate_response(&self, _task: &Task, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    async fn after_generate_response(&self, _task: &Task, _response: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_tool_call(&self, _task: &Task, _call: &ToolCall) -> Result<()> {
        Ok(())
    }

    async fn after_tool_call(
        &self,
        _task: &Task,
        _call: &ToolCall,
        _result: &Result<ToolOutput>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once per run, on success or failure. `error` is the failure.
    async fn on_task_end(
        &self,
        _task: &Task,
        _ctx: &ExecutionContext,
        _error: Option<&Error>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Writes `<output_dir>/<tag>.transcript.json` when a task ends.
pub struct TranscriptCallback;

#[derive(Serialize)]
struct Transcript<'a> {
    tag: &'a str,
    query: &'a str,
    succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    messages: &'a [Message],
}

#[async_trait]
impl Callback for TranscriptCallback {
    async fn on_task_end(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        error: Option<&Error>,
    ) -> Result<()> {
        let transcript = Transcript {
            tag: task.tag(),
            query: task.query(),
            succeeded: error.is_none(),
            error: error.map(|e| e.to_string()),
            messages: &ctx.messages,
        };
        let path = ctx.output_dir.join(format!("{}.transcript.json", task.tag()));
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        tokio::fs::write(&path, serde_json::to_string_pretty(&transcript)?).await?;
        mlog_debug!("[{}] transcript written to {}", task.tag(), path.display());
        Ok(())
    }
}

struct Entry {
    callback: Arc<dyn Callback>,
    external: bool,
}

/// Named callbacks available to agent documents.
pub struct CallbackRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CallbackRegistry {
    pub fn with_builtins() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "transcript".to_string(),
            Entry {
                callback: Arc::new(TranscriptCallback),
                external: false,
            },
        );
        Self { entries }
    }

    /// Add a host callback. Host entries need `trust_remote_code`.
    pub fn register(&mut self, name: &str, callback: Arc<dyn Callback>) {
        self.entries.insert(
            name.to_string(),
            Entry {
                callback,
                external: true,
            },
        );
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Look up `names` in order.
    pub fn resolve(&self, names: &[String], trust_remote_code: bool) -> Result<Callbacks> {
        let hooks = names
            .iter()
            .map(|name| {
                let entry = self
                    .entries
                    .get(name)
                    .ok_or_else(|| Error::Config(format!("unknown callback: {}", name)))?;
                if entry.external && !trust_remote_code {
                    return Err(Error::Config(format!(
                        "callback '{}' is host code; enable trust_remote_code to use it",
                        name
                    )));
                }
                Ok(entry.callback.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Callbacks(hooks))
    }
}

/// Callbacks resolved for one agent, invoked in configuration order.
#[derive(Clone, Default)]
pub struct Callbacks(Vec<Arc<dyn Callback>>);

impl Callbacks {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub async fn on_task_begin(&self, task: &Task, ctx: &ExecutionContext) -> Result<()> {
        for cb in &self.0 {
            cb.on_task_begin(task, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_generate_response(&self, task: &Task, messages: &[Message]) -> Result<()> {
        for cb in &self.0 {
            cb.on_generate_response(task, messages).await?;
        }
        Ok(())
    }

    pub async fn after_generate_response(&self, task: &Task, response: &Message) -> Result<()> {
        for cb in &self.0 {
            cb.after_generate_response(task, response).await?;
        }
        Ok(())
    }

    pub async fn on_tool_call(&self, task: &Task, call: &ToolCall) -> Result<()> {
        for cb in &self.0 {
            cb.on_tool_call(task, call).await?;
        }
        Ok(())
    }

    pub async fn after_tool_call(
        &self,
        task: &Task,
        call: &ToolCall,
        result: &Result<ToolOutput>,
    ) -> Result<()> {
        for cb in &self.0 {
            cb.after_tool_call(task, call, result).await?;
        }
        Ok(())
    }

    /// Errors are logged; the task outcome is already decided.
    pub async fn on_task_end(&self, task: &Task, ctx: &ExecutionContext, error: Option<&Error>) {
        for cb in &self.0 {
            if let Err(e) = cb.on_task_end(task, ctx, error).await {
                mlog_warn!("[{}] on_task_end callback failed: {}", task.tag(), e);
            }
        }
    }
}
