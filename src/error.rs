use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tool not allowed: {tool} (available: {})", available.join(", "))]
    ToolNotAllowed { tool: String, available: Vec<String> },

    #[error("Agent {tag} exceeded max iterations ({max_iterations})")]
    MaxIterationsExceeded { tag: String, max_iterations: u32 },

    #[error("{failed} of {total} subtasks failed")]
    SubtaskFailure { failed: usize, total: usize },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid transition for step {step}: {from} -> {to}")]
    InvalidStepTransition {
        step: String,
        from: String,
        to: String,
    },

    #[error("Step {step} failed")]
    StepFailed {
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    /// Errors the LLM loop hands back to the model instead of failing the step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ToolNotAllowed { .. }
                | Error::Tool(_)
                | Error::Sandbox(_)
                | Error::Timeout(_)
                | Error::Validation(_)
                | Error::Json(_)
        )
    }

    /// Render this error followed by every `source` in its chain.
    pub fn cause_chain(&self) -> String {
        let mut out = self.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);
        while let Some(cause) = current {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            current = cause.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, Error>;
