//! Run state with step transition validation.
//!
//! `RunState` records where every step of a run stands and rejects moves
//! the scheduler must never make, such as re-entering a completed step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::{RunId, RunStatus, StepStatus};
use crate::error::{Error, Result};

/// What happened to one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Executions started, retries included. Zero for cached steps.
    pub attempts: u32,
    #[serde(default)]
    pub cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Progress of one run, serialized as the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new<I, S>(run_id: RunId, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            run_id,
            status: RunStatus::Running,
            steps: steps
                .into_iter()
                .map(|s| (s.into(), StepRecord::default()))
                .collect(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Valid moves:
    /// - Pending -> Running
    /// - Pending -> Completed (cache hit)
    /// - Running -> Completed | Failed
    pub fn can_transition(from: StepStatus, to: StepStatus) -> bool {
        matches!(
            (from, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }

    pub fn transition(&mut self, step: &str, to: StepStatus) -> Result<()> {
        let record = self
            .steps
            .get_mut(step)
            .ok_or_else(|| Error::Config(format!("unknown step: {}", step)))?;
        if !Self::can_transition(record.status, to) {
            return Err(Error::InvalidStepTransition {
                step: step.to_string(),
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        match to {
            StepStatus::Running => record.started_at = Some(now),
            StepStatus::Completed | StepStatus::Failed => record.finished_at = Some(now),
            StepStatus::Pending => {}
        }
        record.status = to;
        Ok(())
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.steps.get(step).map(|r| r.status)
    }

    pub fn record(&self, step: &str) -> Option<&StepRecord> {
        self.steps.get(step)
    }

    pub fn record_attempt(&mut self, step: &str) {
        if let Some(record) = self.steps.get_mut(step) {
            record.attempts += 1;
        }
    }

    pub fn mark_cached(&mut self, step: &str) -> Result<()> {
        self.transition(step, StepStatus::Completed)?;
        if let Some(record) = self.steps.get_mut(step) {
            record.cached = true;
        }
        Ok(())
    }

    pub fn fail(&mut self, step: &str, error: &Error) -> Result<()> {
        self.transition(step, StepStatus::Failed)?;
        if let Some(record) = self.steps.get_mut(step) {
            record.error = Some(error.to_string());
        }
        Ok(())
    }

    /// Steps whose successors may run.
    pub fn finished_steps(&self) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|r| r.status == status).count()
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
