//! Agent configuration documents and least-privilege narrowing.
//!
//! Tools are addressed by qualified name `"<server>:<tool>"`. A bare
//! `"<server>"` names every tool of that provider.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use super::env::{substitute, EnvMap};
use super::DEFAULT_TOOL_TIMEOUT_SECS;
use crate::{mlog_debug, Error, Result};

pub const FILE_SYSTEM: &str = "file_system";
pub const CODE_EXECUTOR: &str = "code_executor";
pub const SPLIT_TASK: &str = "split_task";

pub const BUILTIN_SERVERS: [&str; 3] = [FILE_SYSTEM, CODE_EXECUTOR, SPLIT_TASK];

pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
pub const DEFAULT_SYSTEM: &str = "You are a helpful assistant.";

/// Split a qualified tool name into server and optional tool part.
pub fn split_qualified(name: &str) -> (&str, Option<&str>) {
    match name.split_once(':') {
        Some((server, tool)) => (server, Some(tool)),
        None => (name, None),
    }
}

/// An opaque credential. Never serialized and never printed.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", crate::log::redact(&self.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub model: String,
    pub base_url: Option<String>,
    /// Inline key, usually a `<NAME>` placeholder.
    #[serde(default, skip_serializing)]
    pub api_key: Option<Secret>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

fn default_service() -> String {
    "openai".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            model: String::new(),
            base_url: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PromptConfig {
    pub system: Option<String>,
    pub query: Option<String>,
}

/// Include/exclude list for one provider. At most one may be set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl ToolFilter {
    pub fn validate(&self, server: &str) -> Result<()> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(Error::Config(format!(
                "tools.{}: include and exclude cannot both be set",
                server
            )));
        }
        Ok(())
    }

    pub fn allows(&self, tool: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|t| t == tool);
        }
        !self.exclude.iter().any(|t| t == tool)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeExecutorConfig {
    #[serde(flatten)]
    pub filter: ToolFilter,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_max_resets() -> u32 {
    1
}

impl Default for CodeExecutorConfig {
    fn default() -> Self {
        Self {
            filter: ToolFilter::default(),
            shell: default_shell(),
            timeout_secs: default_exec_timeout(),
            max_resets: default_max_resets(),
        }
    }
}

/// Order in which subtask results are reported back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Ordering {
    #[default]
    Submission,
    Completion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitTaskConfig {
    #[serde(flatten)]
    pub filter: ToolFilter,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    #[serde(default = "default_split_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub ordering: Ordering,
    #[serde(default)]
    pub require_all: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_tag_prefix() -> String {
    "worker-".to_string()
}

fn default_split_concurrency() -> usize {
    4
}

fn default_max_depth() -> u32 {
    1
}

impl Default for SplitTaskConfig {
    fn default() -> Self {
        Self {
            filter: ToolFilter::default(),
            tag_prefix: default_tag_prefix(),
            max_concurrency: default_split_concurrency(),
            ordering: Ordering::default(),
            require_all: false,
            max_depth: default_max_depth(),
        }
    }
}

/// A tool declared by description only; calls are bridged to a handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteToolDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RemoteServerConfig {
    #[serde(flatten)]
    pub filter: ToolFilter,
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Vec<RemoteToolDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolsConfig {
    pub file_system: Option<ToolFilter>,
    pub code_executor: Option<CodeExecutorConfig>,
    pub split_task: Option<SplitTaskConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote: BTreeMap<String, RemoteServerConfig>,
    /// Per-invocation timeout.
    pub timeout_secs: Option<u64>,
    /// Allow-list of qualified or bare server names. Normally set by narrowing.
    pub allow: Option<BTreeSet<String>>,
}

/// Overrides a child task applies to its parent's configuration.
///
/// Overrides can only take capabilities away; see [`AgentConfig::narrow`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.tools.is_none() && self.max_iterations.is_none() && self.tool_timeout_secs.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub callbacks: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    pub output_dir: Option<String>,
    pub help: Option<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            prompt: PromptConfig::default(),
            tools: ToolsConfig::default(),
            callbacks: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            output_dir: None,
            help: None,
        }
    }
}

impl AgentConfig {
    /// Parse a document, substituting `<NAME>` placeholders from `env`.
    pub fn from_toml_str(content: &str, env: &EnvMap) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(content)?;
        let replaced = substitute(&mut value, env);
        if replaced > 0 {
            mlog_debug!("Substituted {} placeholder(s) in agent config", replaced);
        }
        let config: Self = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path, env: &EnvMap) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::Config(format!(
                "agent config not found: {}",
                path.display()
            )));
        }
        mlog_debug!("AgentConfig::load path={}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?, env).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            Error::TomlParse(err) => Error::Config(format!("{}: {}", path.display(), err)),
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be at least 1".into()));
        }
        if let Some(filter) = &self.tools.file_system {
            filter.validate(FILE_SYSTEM)?;
        }
        if let Some(exec) = &self.tools.code_executor {
            exec.filter.validate(CODE_EXECUTOR)?;
        }
        if let Some(split) = &self.tools.split_task {
            split.filter.validate(SPLIT_TASK)?;
            if split.max_concurrency == 0 {
                return Err(Error::Config(
                    "tools.split_task.max_concurrency must be at least 1".into(),
                ));
            }
        }
        for (server, remote) in &self.tools.remote {
            if BUILTIN_SERVERS.contains(&server.as_str()) || server.contains(':') {
                return Err(Error::Config(format!(
                    "tools.remote.{}: reserved or invalid server name",
                    server
                )));
            }
            remote.filter.validate(server)?;
        }
        Ok(())
    }

    pub fn system_prompt(&self) -> &str {
        self.prompt.system.as_deref().unwrap_or(DEFAULT_SYSTEM)
    }

    pub fn tool_timeout_secs(&self) -> u64 {
        self.tools.timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
    }

    /// Names of every enabled provider, built-ins first.
    pub fn enabled_servers(&self) -> Vec<String> {
        let mut servers = Vec::new();
        if self.tools.file_system.is_some() {
            servers.push(FILE_SYSTEM.to_string());
        }
        if self.tools.code_executor.is_some() {
            servers.push(CODE_EXECUTOR.to_string());
        }
        if self.tools.split_task.is_some() {
            servers.push(SPLIT_TASK.to_string());
        }
        servers.extend(self.tools.remote.keys().cloned());
        servers
    }

    fn filter_for(&self, server: &str) -> Option<&ToolFilter> {
        match server {
            FILE_SYSTEM => self.tools.file_system.as_ref(),
            CODE_EXECUTOR => self.tools.code_executor.as_ref().map(|c| &c.filter),
            SPLIT_TASK => self.tools.split_task.as_ref().map(|c| &c.filter),
            other => self.tools.remote.get(other).map(|c| &c.filter),
        }
    }

    /// Whether this configuration grants `name` (qualified or bare server).
    pub fn permits(&self, name: &str) -> bool {
        let (server, tool) = split_qualified(name);
        let Some(filter) = self.filter_for(server) else {
            return false;
        };
        let filter_ok = match tool {
            Some(tool) => filter.allows(tool),
            None => filter.is_unrestricted(),
        };
        if !filter_ok {
            return false;
        }
        match &self.tools.allow {
            None => true,
            Some(allow) => match tool {
                Some(_) => allow.contains(name) || allow.contains(server),
                None => allow.contains(server),
            },
        }
    }

    /// Apply `overrides`, producing a configuration that grants no more
    /// than `self` does.
    pub fn narrow(&self, overrides: &ConfigOverrides) -> Result<AgentConfig> {
        let mut child = self.clone();

        if let Some(tools) = &overrides.tools {
            if let Some(denied) = tools.iter().find(|t| !self.permits(t)) {
                return Err(Error::Config(format!(
                    "override grants {} which the parent does not permit",
                    denied
                )));
            }
            child.tools.allow = Some(tools.clone());
        }

        if let Some(max_iterations) = overrides.max_iterations {
            if max_iterations == 0 || max_iterations > self.max_iterations {
                return Err(Error::Config(format!(
                    "override max_iterations {} exceeds parent limit {}",
                    max_iterations, self.max_iterations
                )));
            }
            child.max_iterations = max_iterations;
        }

        if let Some(timeout) = overrides.tool_timeout_secs {
            if timeout > self.tool_timeout_secs() {
                return Err(Error::Config(format!(
                    "override tool_timeout_secs {} exceeds parent limit {}",
                    timeout,
                    self.tool_timeout_secs()
                )));
            }
            child.tools.timeout_secs = Some(timeout);
        }

        Ok(child)
    }

    /// Drop the split provider once `depth` reaches the configured limit.
    pub fn at_depth(&self, depth: u32) -> AgentConfig {
        let mut config = self.clone();
        let exhausted = config
            .tools
            .split_task
            .as_ref()
            .is_some_and(|s| depth >= s.max_depth);
        if exhausted {
            config.tools.split_task = None;
        }
        config
    }
}
