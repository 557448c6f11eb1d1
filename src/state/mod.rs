//! Persistent run state.

pub mod history;

pub use history::{input_digest, HistoryEntry, StepHistory};
