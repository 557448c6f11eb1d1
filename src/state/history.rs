//! On-disk step cache.
//!
//! Each completed step leaves `<output_dir>/memory/<step>.json` holding the
//! digest of the input it ran on and the context it produced. A later run
//! with `load_cache` reuses that output when the input digest matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::ExecutionContext;
use crate::{mlog_debug, Result};

pub const MEMORY_DIR: &str = "memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub digest: String,
    pub saved_at: DateTime<Utc>,
    pub output: ExecutionContext,
}

/// Digest of what a step would see: its name, its task and the input
/// context minus run-specific fields (run id, output root, timestamps).
pub fn input_digest(step: &str, system: &str, query: &str, input: &ExecutionContext) -> Result<String> {
    let artifacts: Vec<_> = input
        .artifacts
        .iter()
        .map(|a| json!([a.id, a.kind, a.name, a.step, a.detail]))
        .collect();
    let canonical = json!({
        "step": step,
        "system": system,
        "query": query,
        "messages": input.messages,
        "artifacts": artifacts,
        "vars": input.vars,
    });
    let digest = Sha256::digest(serde_json::to_vec(&canonical)?);
    Ok(format!("{:x}", digest))
}

pub struct StepHistory {
    dir: PathBuf,
}

impl StepHistory {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            dir: output_dir.join(MEMORY_DIR),
        }
    }

    pub fn path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{}.json", step))
    }

    pub fn load(&self, step: &str) -> Result<Option<HistoryEntry>> {
        let path = self.path(step);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Cached output for `step`, if it was produced from the same input.
    pub fn lookup(&self, step: &str, digest: &str) -> Result<Option<ExecutionContext>> {
        match self.load(step)? {
            Some(entry) if entry.digest == digest => Ok(Some(entry.output)),
            Some(_) => {
                mlog_debug!("History for {} is stale", step);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, step: &str, digest: &str, output: &ExecutionContext) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let entry = HistoryEntry {
            step: step.to_string(),
            digest: digest.to_string(),
            saved_at: Utc::now(),
            output: output.clone(),
        };
        fs::write(self.path(step), serde_json::to_string_pretty(&entry)?)?;
        Ok(())
    }
}
