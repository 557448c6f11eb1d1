//! Tool registry: which tools one agent may call, and dispatch.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ProviderKind, ToolOutput, ToolProvider, ToolSpec};
use crate::agent::Runtime;
use crate::config::AgentConfig;
use crate::core::Task;
use crate::llm::ToolCall;
use crate::util::{cancellable, with_timeout};
use crate::workflow::RunId;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Everything a provider may need when it is instantiated for an agent.
#[derive(Clone)]
pub struct ResolveContext {
    pub runtime: Arc<Runtime>,
    pub task: Task,
    pub config: Arc<AgentConfig>,
    pub output_dir: PathBuf,
    pub run_id: RunId,
}

/// Tools resolved for one agent instantiation. Read-only after resolution.
pub struct ToolRegistry {
    providers: Vec<Arc<dyn ToolProvider>>,
    /// Qualified name -> (provider index, spec).
    index: BTreeMap<String, (usize, ToolSpec)>,
    timeout: Duration,
}

impl ToolRegistry {
    /// Instantiate, connect and index every provider `ctx.config` enables.
    pub async fn resolve(ctx: ResolveContext) -> Result<Self> {
        let mut providers = Vec::new();
        for server in ctx.config.enabled_servers() {
            providers.push(ProviderKind::from_server(&server).build(&ctx)?);
        }
        let timeout = Duration::from_secs(ctx.config.tool_timeout_secs());
        Self::from_providers(providers, &ctx.config, timeout).await
    }

    /// Connect `providers` and keep the tools `config` permits.
    ///
    /// On error, providers connected so far are cleaned up.
    pub async fn from_providers(
        providers: Vec<Arc<dyn ToolProvider>>,
        config: &AgentConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let mut registry = Self {
            providers: Vec::new(),
            index: BTreeMap::new(),
            timeout,
        };

        for provider in providers {
            if let Err(e) = registry.add_provider(provider, config).await {
                registry.cleanup().await;
                return Err(e);
            }
        }

        mlog_debug!(
            "ToolRegistry resolved {} tools from {} providers",
            registry.index.len(),
            registry.providers.len()
        );
        Ok(registry)
    }

    async fn add_provider(
        &mut self,
        provider: Arc<dyn ToolProvider>,
        config: &AgentConfig,
    ) -> Result<()> {
        provider.connect().await?;
        let slot = self.providers.len();
        self.providers.push(provider.clone());

        for spec in provider.get_tools().await? {
            if !config.permits(&spec.name) {
                mlog_debug!("Tool {} excluded by configuration", spec.name);
                continue;
            }
            if self.index.contains_key(&spec.name) {
                return Err(Error::Config(format!("duplicate tool name: {}", spec.name)));
            }
            self.index.insert(spec.name.clone(), (slot, spec));
        }
        Ok(())
    }

    /// Specs of every callable tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.index.values().map(|(_, spec)| spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check that `name` was resolved for this agent.
    pub fn validate(&self, name: &str) -> Result<&ToolSpec> {
        self.index
            .get(name)
            .map(|(_, spec)| spec)
            .ok_or_else(|| self.not_allowed(name))
    }

    fn not_allowed(&self, name: &str) -> Error {
        Error::ToolNotAllowed {
            tool: name.to_string(),
            available: self.names(),
        }
    }

    /// Validate and execute one call under the invocation timeout and `cancel`.
    pub async fn call(&self, call: &ToolCall, cancel: &CancellationToken) -> Result<ToolOutput> {
        let (slot, spec) = self
            .index
            .get(&call.name)
            .ok_or_else(|| self.not_allowed(&call.name))?;
        let provider = &self.providers[*slot];
        let args = decode_arguments(call.arguments.clone())?;
        mlog_debug!("Calling tool {} args={}", spec.name, args);

        let invocation = provider.call_tool(&spec.tool, args, cancel);
        if provider.runs_agents() {
            return invocation.await;
        }
        cancellable(cancel, with_timeout(self.timeout, invocation)).await
    }

    /// Release every provider. Errors are logged, not returned.
    pub async fn cleanup(&self) {
        for provider in &self.providers {
            if let Err(e) = provider.cleanup().await {
                mlog_warn!("Cleanup of {} failed: {}", provider.key(), e);
            }
        }
    }
}

/// Decode model-supplied arguments into a JSON object.
///
/// Models sometimes encode the object as a JSON string, occasionally twice.
pub fn decode_arguments(mut args: Value) -> Result<Value> {
    loop {
        match args {
            Value::Null => return Ok(Value::Object(Default::default())),
            Value::Object(_) => return Ok(args),
            Value::String(s) => {
                args = serde_json::from_str(&s).map_err(|e| {
                    Error::Validation(format!("tool arguments are not valid JSON: {}", e))
                })?;
            }
            other => {
                return Err(Error::Validation(format!(
                    "tool arguments must be an object, got {}",
                    other
                )))
            }
        }
    }
}
