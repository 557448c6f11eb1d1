//! Per-run execution context and the artifacts steps produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

use crate::llm::{Message, Role};
use crate::workflow::RunId;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Report,
    ToolCall,
    Subtasks,
    Note,
}

/// A recorded side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub kind: ArtifactKind,
    pub name: String,
    /// Tag of the step or subtask that produced it.
    pub step: String,
    #[serde(default)]
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        kind: ArtifactKind,
        name: impl Into<String>,
        step: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            step: step.into(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

/// Mutable state of one workflow run.
///
/// Each step receives its own copy and hands back an updated one; copies
/// are combined only at join points with [`ExecutionContext::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: RunId,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Run-scoped root under which artifacts are written.
    pub output_dir: PathBuf,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id,
            messages: Vec::new(),
            artifacts: Vec::new(),
            vars: BTreeMap::new(),
            output_dir: output_dir.into(),
        }
    }

    /// A context for a child task: same run and output root, nothing else.
    pub fn fork_empty(&self) -> Self {
        Self::new(self.run_id, self.output_dir.clone())
    }

    pub fn record_artifact(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Content of the last assistant message without tool calls.
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.has_tool_calls())
            .map(|m| m.content.as_str())
    }

    /// Combine the outputs of several predecessors, given in order.
    ///
    /// Each branch starts with its own system prompt, so a leading system
    /// message is set aside before comparing histories; the first input's
    /// one is kept. Messages past the prefix all inputs then share are
    /// appended in input order. Artifacts keep their first occurrence by
    /// id. For `vars`, the last context to set a key wins.
    pub fn merge(contexts: Vec<ExecutionContext>) -> Result<ExecutionContext> {
        let mut iter = contexts.into_iter();
        let Some(first) = iter.next() else {
            return Err(Error::Validation("cannot merge zero contexts".into()));
        };
        let rest: Vec<ExecutionContext> = iter.collect();
        if rest.is_empty() {
            return Ok(first);
        }

        let first_body = conversation(&first.messages);
        let prefix = rest.iter().fold(first_body.len(), |len, ctx| {
            common_prefix_len(&first_body[..len], conversation(&ctx.messages))
        });

        let mut messages: Vec<Message> = first
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned()
            .into_iter()
            .collect();
        messages.extend_from_slice(&first_body[..prefix]);

        let mut merged = ExecutionContext {
            run_id: first.run_id,
            messages,
            artifacts: Vec::new(),
            vars: BTreeMap::new(),
            output_dir: first.output_dir.clone(),
        };
        let mut seen = HashSet::new();

        for ctx in std::iter::once(first).chain(rest) {
            let skip = ctx.messages.len() - conversation(&ctx.messages).len() + prefix;
            merged.messages.extend(ctx.messages.into_iter().skip(skip));
            for artifact in ctx.artifacts {
                if seen.insert(artifact.id) {
                    merged.artifacts.push(artifact);
                }
            }
            merged.vars.extend(ctx.vars);
        }
        Ok(merged)
    }
}

/// `messages` without a leading system prompt.
fn conversation(messages: &[Message]) -> &[Message] {
    match messages.split_first() {
        Some((head, rest)) if head.role == Role::System => rest,
        _ => messages,
    }
}

fn common_prefix_len(a: &[Message], b: &[Message]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
