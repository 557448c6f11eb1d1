//! Retry bookkeeping for workflow steps.

use std::collections::HashMap;

/// Tracks how many times each step has been retried in a run.
///
/// # Example
///
/// ```
/// use mosaic::orchestration::RetryTracker;
///
/// let mut tracker = RetryTracker::new();
/// assert!(tracker.can_retry("coding", 1));
/// tracker.increment("coding");
/// assert!(!tracker.can_retry("coding", 1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<String, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the step has not been retried.
    pub fn get_retries(&self, step: &str) -> u32 {
        self.retries.get(step).copied().unwrap_or(0)
    }

    /// Increment the retry count for a step, returning the new count.
    pub fn increment(&mut self, step: &str) -> u32 {
        let count = self.retries.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Whether another attempt fits within `max_retries`.
    pub fn can_retry(&self, step: &str, max_retries: u32) -> bool {
        self.get_retries(step) < max_retries
    }

    pub fn reset(&mut self, step: &str) {
        self.retries.remove(step);
    }

    /// Total retries across all steps.
    pub fn total(&self) -> u32 {
        self.retries.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}
