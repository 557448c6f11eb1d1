//! Workflow documents and their resolution into a runnable graph.
//!
//! A workflow directory holds `workflow.toml`, which names the steps, their
//! successors and the agent document each step runs with. A directory with
//! only `agent.toml` (or a path to any agent document) is a one-step
//! workflow whose step is called `agent`.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::agent::AgentKind;
use crate::config::env::{substitute, EnvMap};
use crate::config::AgentConfig;
use crate::core::{StepGraph, Task};
use crate::{mlog_debug, Error, Result};

pub const WORKFLOW_FILE: &str = "workflow.toml";
pub const AGENT_FILE: &str = "agent.toml";
/// Step name used for single-agent runs.
pub const SINGLE_STEP: &str = "agent";

/// `next` may be one name or a list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Next {
    One(String),
    Many(Vec<String>),
}

impl Default for Next {
    fn default() -> Self {
        Next::Many(Vec::new())
    }
}

impl Next {
    pub fn names(&self) -> Vec<String> {
        match self {
            Next::One(name) => vec![name.clone()],
            Next::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentKwargs {
    /// Registered code step, for `CodeAgent`.
    pub code: Option<String>,
    /// Task tag; defaults to the step name.
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentRef {
    #[serde(default)]
    pub name: AgentKind,
    #[serde(default)]
    pub kwargs: AgentKwargs,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    pub next: Next,
    pub agent_config: Option<String>,
    #[serde(default)]
    pub agent: AgentRef,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub steps: BTreeMap<String, StepDefinition>,
}

impl WorkflowDefinition {
    pub fn from_toml_str(content: &str, env: &EnvMap) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(content)?;
        substitute(&mut value, env);
        Ok(value.try_into()?)
    }
}

/// A step with its configuration resolved.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: AgentKind,
    pub tag: String,
    pub code: Option<String>,
    pub config: Arc<AgentConfig>,
    pub retries: u32,
    pub critical: bool,
}

impl Step {
    /// The task this step hands its agent.
    pub fn task(&self) -> Task {
        Task::new(
            &self.tag,
            self.config.prompt.system.clone().unwrap_or_default(),
            self.config.prompt.query.clone().unwrap_or_default(),
        )
    }
}

fn without_query(config: &Arc<AgentConfig>) -> Arc<AgentConfig> {
    if config.prompt.query.is_none() {
        return config.clone();
    }
    let mut inherited = AgentConfig::clone(config);
    inherited.prompt.query = None;
    Arc::new(inherited)
}

/// A loaded, validated workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub dir: PathBuf,
    graph: StepGraph,
    steps: BTreeMap<String, Step>,
    order: Vec<String>,
}

impl Workflow {
    /// Load a workflow directory, a single-agent directory or an agent document.
    pub fn load(path: &Path, env: &EnvMap) -> Result<Self> {
        if path.is_file() {
            let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            return Self::single(dir, AgentConfig::load(path, env)?);
        }
        let workflow_file = path.join(WORKFLOW_FILE);
        if workflow_file.is_file() {
            mlog_debug!("Workflow::load path={}", workflow_file.display());
            let definition =
                WorkflowDefinition::from_toml_str(&fs::read_to_string(&workflow_file)?, env)
                    .map_err(|e| match e {
                        Error::TomlParse(err) => {
                            Error::Config(format!("{}: {}", workflow_file.display(), err))
                        }
                        other => other,
                    })?;
            return Self::from_definition(path, definition, env);
        }
        let agent_file = path.join(AGENT_FILE);
        if agent_file.is_file() {
            return Self::single(path.to_path_buf(), AgentConfig::load(&agent_file, env)?);
        }
        Err(Error::Config(format!(
            "no {} or {} found in {}",
            WORKFLOW_FILE,
            AGENT_FILE,
            path.display()
        )))
    }

    /// A one-step workflow running `config` as an LLM agent.
    pub fn single(dir: PathBuf, config: AgentConfig) -> Result<Self> {
        let mut graph = StepGraph::new();
        graph.add_step(SINGLE_STEP);
        let mut steps = BTreeMap::new();
        steps.insert(
            SINGLE_STEP.to_string(),
            Step {
                name: SINGLE_STEP.to_string(),
                kind: AgentKind::Llm,
                tag: SINGLE_STEP.to_string(),
                code: None,
                config: Arc::new(config),
                retries: 0,
                critical: true,
            },
        );
        Ok(Self {
            dir,
            graph,
            steps,
            order: vec![SINGLE_STEP.to_string()],
        })
    }

    /// Build the graph and resolve every step's configuration.
    ///
    /// Agent documents are read relative to `dir`. A step without one
    /// inherits the configuration of its first predecessor by name, less
    /// the query: the predecessor has already asked it.
    pub fn from_definition(dir: &Path, definition: WorkflowDefinition, env: &EnvMap) -> Result<Self> {
        if definition.steps.is_empty() {
            return Err(Error::Config("workflow defines no steps".into()));
        }

        let mut graph = StepGraph::new();
        for name in definition.steps.keys() {
            graph.add_step(name);
        }
        for (name, step) in &definition.steps {
            for next in step.next.names() {
                graph.add_edge(name, &next)?;
            }
        }
        let order = graph.topological_order()?;

        let mut loaded: HashMap<PathBuf, Arc<AgentConfig>> = HashMap::new();
        let mut steps: BTreeMap<String, Step> = BTreeMap::new();
        for name in &order {
            let Some(def) = definition.steps.get(name) else {
                continue;
            };

            let config = match &def.agent_config {
                Some(rel) => {
                    let path = dir.join(rel);
                    match loaded.get(&path) {
                        Some(config) => config.clone(),
                        None => {
                            let config = Arc::new(AgentConfig::load(&path, env)?);
                            loaded.insert(path, config.clone());
                            config
                        }
                    }
                }
                None => match graph.predecessors(name).first() {
                    Some(pred) => steps
                        .get(pred)
                        .map(|s| without_query(&s.config))
                        .ok_or_else(|| Error::Config(format!("unresolved step: {}", pred)))?,
                    None if def.agent.name == AgentKind::Code => Arc::new(AgentConfig::default()),
                    None => {
                        return Err(Error::Config(format!(
                            "step '{}' has no agent_config and no predecessor to inherit from",
                            name
                        )))
                    }
                },
            };

            if def.agent.name == AgentKind::Code && def.agent.kwargs.code.is_none() {
                return Err(Error::Config(format!(
                    "CodeAgent step '{}' must set agent.kwargs.code",
                    name
                )));
            }

            steps.insert(
                name.clone(),
                Step {
                    name: name.clone(),
                    kind: def.agent.name,
                    tag: def.agent.kwargs.tag.clone().unwrap_or_else(|| name.clone()),
                    code: def.agent.kwargs.code.clone(),
                    config,
                    retries: def.retries,
                    critical: def.critical,
                },
            );
        }

        mlog_debug!(
            "Workflow resolved: {} steps, {} edges",
            steps.len(),
            graph.edge_count()
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            graph,
            steps,
            order,
        })
    }

    /// Replace every step's configuration with `f` applied to it.
    pub fn map_configs<F>(mut self, f: F) -> Self
    where
        F: Fn(&AgentConfig) -> AgentConfig,
    {
        for step in self.steps.values_mut() {
            step.config = Arc::new(f(&step.config));
        }
        self
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    /// Step names, each after all its predecessors.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Predecessors of `name` in topological order.
    pub fn ordered_predecessors(&self, name: &str) -> Vec<String> {
        let preds = self.graph.predecessors(name);
        self.order
            .iter()
            .filter(|s| preds.contains(s))
            .cloned()
            .collect()
    }
}
