//! Task descriptor.
//!
//! A task pairs a system prompt with a query. Tasks are created when a
//! workflow step starts or when a step splits its work, and do not change
//! after dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigOverrides;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a subtask inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed {
        error: String,
    },
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// One child description as requested by the model: `{system, query}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub system: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ConfigOverrides>,
}

impl TaskSpec {
    pub fn new(system: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            query: query.into(),
            overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    tag: String,
    system: String,
    query: String,
    overrides: ConfigOverrides,
    depth: u32,
    created_at: DateTime<Utc>,
}

impl Task {
    /// Create a root task for a workflow step.
    pub fn new(tag: impl Into<String>, system: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            tag: tag.into(),
            system: system.into(),
            query: query.into(),
            overrides: ConfigOverrides::default(),
            depth: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Derive the `index`-th child of split round `round`.
    ///
    /// The child inherits this task's overrides unless `spec` carries its own.
    pub fn child(&self, index: usize, round: u32, prefix: &str, spec: &TaskSpec) -> Task {
        Task {
            id: TaskId::new(),
            tag: format!("{}-r{}-{}{}", self.tag, round, prefix, index),
            system: spec.system.clone(),
            query: spec.query.clone(),
            overrides: spec
                .overrides
                .clone()
                .unwrap_or_else(|| self.overrides.clone()),
            depth: self.depth + 1,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn overrides(&self) -> &ConfigOverrides {
        &self.overrides
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
