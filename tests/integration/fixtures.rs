//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted language models
//! - Temporary workflow directories
//! - A sandbox that crashes on demand

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use mosaic::agent::{ExecutionContext, Runtime, RuntimeBuilder};
use mosaic::config::LlmConfig;
use mosaic::config::env::EnvMap;
use mosaic::llm::{LlmClient, Message, Role, ToolCall};
use mosaic::orchestration::{RunOptions, RunReport, Scheduler};
use mosaic::tools::{ExecOutput, Sandbox, SandboxFactory, SandboxSpec, ToolSpec};
use mosaic::{Result, RunId, Workflow};

type Reply = dyn Fn(&[Message], &[ToolSpec]) -> Result<Message> + Send + Sync;
type Delay = dyn Fn(&[Message]) -> Duration + Send + Sync;

/// A model whose answers are computed from the conversation.
pub struct MockLlm {
    reply: Box<Reply>,
    delay: Option<Box<Delay>>,
    calls: AtomicUsize,
    offered: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockLlm {
    pub fn new(
        reply: impl Fn(&[Message], &[ToolSpec]) -> Result<Message> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            delay: None,
            calls: AtomicUsize::new(0),
            offered: Mutex::new(Vec::new()),
        })
    }

    /// Like [`MockLlm::new`], sleeping for `delay(messages)` before each answer.
    pub fn delayed(
        delay: impl Fn(&[Message]) -> Duration + Send + Sync + 'static,
        reply: impl Fn(&[Message], &[ToolSpec]) -> Result<Message> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            delay: Some(Box::new(delay)),
            calls: AtomicUsize::new(0),
            offered: Mutex::new(Vec::new()),
        })
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Tool names offered on each call, keyed by the system prompt.
    pub fn offered(&self) -> Vec<(String, Vec<String>)> {
        self.offered.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<Message> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let names = tools.iter().map(|t| t.name.clone()).collect();
            self.offered
                .lock()
                .unwrap()
                .push((system(messages).to_string(), names));
        }
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(messages)).await;
        }
        (self.reply)(messages, tools)
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Content of the system message, or "".
pub fn system(messages: &[Message]) -> &str {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Content of the last user message, or "".
pub fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// The last message, if it is a tool result.
pub fn last_tool_result(messages: &[Message]) -> Option<&str> {
    messages
        .last()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.content.as_str())
}

/// An assistant message requesting one tool call.
pub fn call(id: &str, name: &str, arguments: Value) -> Message {
    Message::assistant_with_tools("", vec![ToolCall::new(id, name, arguments)])
}

/// A model that plays `turns` in order, one per assistant turn, and then
/// answers with the last tool result.
pub fn scripted(turns: Vec<Message>) -> Arc<MockLlm> {
    MockLlm::new(move |messages, _| {
        let turn = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        Ok(match turns.get(turn) {
            Some(message) => message.clone(),
            None => Message::assistant(last_tool_result(messages).unwrap_or("done")),
        })
    })
}

/// A runtime builder whose every agent talks to `llm`.
pub fn runtime_with(llm: Arc<MockLlm>) -> RuntimeBuilder {
    Runtime::builder().llm_factory(Arc::new(move |_: &LlmConfig| {
        Ok(llm.clone() as Arc<dyn LlmClient>)
    }))
}

/// A temporary directory holding workflow and agent documents, plus an
/// output directory for runs.
pub struct WorkflowDir {
    pub temp_dir: TempDir,
    pub output: TempDir,
}

impl WorkflowDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
            output: TempDir::new().expect("Failed to create output directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn output_dir(&self) -> &Path {
        self.output.path()
    }

    /// Write `content` to `name` inside the workflow directory.
    pub fn file(&self, name: &str, content: &str) -> &Self {
        std::fs::write(self.path().join(name), content).expect("Failed to write document");
        self
    }

    pub fn workflow(&self, content: &str) -> &Self {
        self.file("workflow.toml", content)
    }

    pub fn load(&self) -> Result<Workflow> {
        Workflow::load(self.path(), &EnvMap::new())
    }

    /// A fresh context rooted at the output directory.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(RunId::new(), self.output_dir())
    }

    /// Load the workflow and run it to completion with `runtime`.
    pub async fn run(&self, runtime: Arc<Runtime>, options: RunOptions) -> Result<RunReport> {
        let mut scheduler = Scheduler::new(self.load()?, runtime, options)?;
        scheduler
            .run(self.context(), &CancellationToken::new())
            .await
    }
}

/// An agent document with a system prompt and the given extra sections.
pub fn agent_doc(system: &str, extra: &str) -> String {
    format!(
        "max_iterations = 10\n\n[llm]\nmodel = \"mock\"\n\n[prompt]\nsystem = \"{}\"\n\n{}",
        system, extra
    )
}

/// Counters shared by every [`FlakySandbox`] one factory builds.
#[derive(Default)]
pub struct SandboxStats {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub executions: AtomicUsize,
}

/// Executes nothing; reports a crash for the first `failures` executions.
pub struct FlakySandbox {
    failures: Arc<AtomicUsize>,
    stats: Arc<SandboxStats>,
}

#[async_trait]
impl Sandbox for FlakySandbox {
    async fn start(&mut self) -> Result<()> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, code: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.stats.executions.fetch_add(1, Ordering::SeqCst);
        let crashed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            return Err(mosaic::Error::Sandbox("sandbox crashed".into()));
        }
        Ok(ExecOutput {
            stdout: format!("ran {}", code),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A factory of sandboxes that together crash `failures` times.
pub fn flaky_sandboxes(failures: usize) -> (SandboxFactory, Arc<SandboxStats>) {
    let failures = Arc::new(AtomicUsize::new(failures));
    let stats = Arc::new(SandboxStats::default());
    let shared = stats.clone();
    let factory: SandboxFactory = Arc::new(move |_: &SandboxSpec| {
        Box::new(FlakySandbox {
            failures: failures.clone(),
            stats: shared.clone(),
        }) as Box<dyn Sandbox>
    });
    (factory, stats)
}
