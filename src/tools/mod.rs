//! Tool providers and the per-agent tool registry.
//!
//! Each provider serves the tools of one server name. The set of provider
//! kinds is closed: built-in file system, code executor and task splitter,
//! plus remote servers whose tools are declared in configuration and
//! bridged to a host-registered handler.

pub mod code_executor;
pub mod file_system;
pub mod registry;
pub mod remote;
pub mod split_task;

pub use code_executor::{ExecOutput, ProcessSandbox, Sandbox, SandboxFactory, SandboxSpec};
pub use registry::{decode_arguments, ResolveContext, ToolRegistry};
pub use remote::RemoteToolHandler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agent::Artifact;
use crate::config::agent::{CODE_EXECUTOR, FILE_SYSTEM, SPLIT_TASK};
use crate::Result;

/// Description of one callable tool, as offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Qualified name, `server:tool`.
    pub name: String,
    pub server: String,
    pub tool: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(server: &str, tool: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: format!("{}:{}", server, tool),
            server: server.to_string(),
            tool: tool.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Result of a successful tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Text handed back to the model.
    pub content: String,
    /// Side effects the call produced.
    pub artifacts: Vec<Artifact>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Server name this provider answers to.
    fn key(&self) -> &str;

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Release held resources. Called once per agent run on every exit path.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput>;

    /// Providers that run whole agents are bounded by their children's own
    /// limits instead of the per-invocation timeout. They also watch `cancel`
    /// themselves rather than being dropped when it fires, so their children
    /// get to release sandboxes and servers first.
    fn runs_agents(&self) -> bool {
        false
    }
}

/// The closed set of provider variants a server name can resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    FileSystem,
    CodeExecutor,
    SplitTask,
    Remote(String),
}

impl ProviderKind {
    pub fn from_server(server: &str) -> Self {
        match server {
            FILE_SYSTEM => ProviderKind::FileSystem,
            CODE_EXECUTOR => ProviderKind::CodeExecutor,
            SPLIT_TASK => ProviderKind::SplitTask,
            other => ProviderKind::Remote(other.to_string()),
        }
    }

    /// Instantiate the provider for this variant.
    pub fn build(&self, ctx: &ResolveContext) -> Result<Arc<dyn ToolProvider>> {
        let config = &ctx.config;
        let provider: Arc<dyn ToolProvider> = match self {
            ProviderKind::FileSystem => Arc::new(file_system::FileSystemProvider::new(
                ctx.output_dir.clone(),
                ctx.task.tag(),
            )),
            ProviderKind::CodeExecutor => {
                let exec = config.tools.code_executor.clone().unwrap_or_default();
                Arc::new(code_executor::CodeExecutorProvider::new(
                    ctx.runtime.sandbox_factory.clone(),
                    &exec,
                    ctx.output_dir.clone(),
                    ctx.task.tag(),
                ))
            }
            ProviderKind::SplitTask => Arc::new(split_task::SplitTaskProvider::new(ctx)),
            ProviderKind::Remote(server) => {
                let declared = config.tools.remote.get(server).cloned().unwrap_or_default();
                Arc::new(remote::RemoteProvider::new(
                    server,
                    declared,
                    ctx.runtime.remote_handlers.get(server).cloned(),
                ))
            }
        };
        Ok(provider)
    }
}

/// Fetch a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        crate::Error::Validation(format!("missing required string argument: {}", key))
    })
}
