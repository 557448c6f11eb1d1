//! Configuration for mosaic runs.
//!
//! Global settings live in `~/.mosaic/mosaic.toml`. Agent documents
//! (`agent.toml`) are described in [`agent`], and environment loading with
//! `<NAME>` placeholder substitution in [`env`].

pub mod agent;
pub mod env;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{mlog_debug, Error, Result};

pub use agent::{
    AgentConfig, CodeExecutorConfig, ConfigOverrides, LlmConfig, Ordering, PromptConfig,
    RemoteServerConfig, RemoteToolDecl, Secret, SplitTaskConfig, ToolFilter, ToolsConfig,
};

pub const DEFAULT_OUTPUT_DIR: &str = "./output";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Allow host-registered code steps and callbacks to run.
    #[serde(default)]
    pub trust_remote_code: bool,
    pub output_dir: Option<String>,
    pub max_concurrency: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
}

impl Config {
    pub fn mosaic_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".mosaic"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::mosaic_dir()?.join("mosaic.toml"))
    }

    pub fn effective_output_dir(&self) -> PathBuf {
        expand_tilde(self.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR))
    }

    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
            .max(1)
    }

    pub fn effective_tool_timeout_secs(&self) -> u64 {
        self.tool_timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
    }

    /// Fill an agent's unset tool timeout from these settings and cap its
    /// split concurrency at the global limit.
    pub fn apply_to(&self, agent: &AgentConfig) -> AgentConfig {
        let mut agent = agent.clone();
        agent
            .tools
            .timeout_secs
            .get_or_insert(self.effective_tool_timeout_secs());
        if let Some(split) = agent.tools.split_task.as_mut() {
            split.max_concurrency = split.max_concurrency.min(self.effective_max_concurrency());
        }
        agent
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        mlog_debug!(
            "Config loaded: trust_remote_code={}, output_dir={:?}, max_concurrency={:?}",
            config.trust_remote_code,
            config.output_dir,
            config.max_concurrency
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let mosaic_dir = Self::mosaic_dir()?;
        if !mosaic_dir.exists() {
            mlog_debug!("Creating mosaic directory");
            fs::create_dir_all(&mosaic_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let mosaic_dir = Self::mosaic_dir()?;
        let output_dir = self.effective_output_dir();
        mlog_debug!(
            "Config::ensure_dirs mosaic={} output={}",
            mosaic_dir.display(),
            output_dir.display()
        );
        fs::create_dir_all(&mosaic_dir)?;
        fs::create_dir_all(&output_dir)?;
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
