//! Code steps: deterministic transforms of the execution context.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::context::ExecutionContext;
use crate::core::Task;
use crate::{mlog, Error, Result};

/// A registered code step.
pub type CodeFn = Arc<dyn Fn(ExecutionContext) -> Result<ExecutionContext> + Send + Sync>;

struct Entry {
    f: CodeFn,
    external: bool,
}

/// Code steps a workflow may name.
pub struct CodeRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CodeRegistry {
    pub fn with_builtins() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "passthrough".to_string(),
            Entry {
                f: Arc::new(passthrough),
                external: false,
            },
        );
        Self { entries }
    }

    /// Add a host step. Host entries need `trust_remote_code`.
    pub fn register(&mut self, name: &str, f: CodeFn) {
        self.entries
            .insert(name.to_string(), Entry { f, external: true });
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str, trust_remote_code: bool) -> Result<CodeFn> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown code step: {}", name)))?;
        if entry.external && !trust_remote_code {
            return Err(Error::Config(format!(
                "code step '{}' is host code; enable trust_remote_code to use it",
                name
            )));
        }
        Ok(entry.f.clone())
    }
}

/// The built-in `passthrough` step.
pub fn passthrough(ctx: ExecutionContext) -> Result<ExecutionContext> {
    Ok(ctx)
}

pub struct CodeAgent {
    tag: String,
    code: CodeFn,
}

impl CodeAgent {
    pub fn new(tag: impl Into<String>, code: CodeFn) -> Self {
        Self {
            tag: tag.into(),
            code,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn run(
        &self,
        task: &Task,
        ctx: ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ExecutionContext> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        mlog!("[{}] running code step for {}", self.tag, task.tag());
        (self.code)(ctx)
    }
}
