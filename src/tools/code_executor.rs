//! Sandboxed code execution.
//!
//! The provider owns one [`Sandbox`] session per agent run. When the
//! sandbox fails (crash, resource exhaustion, timeout) it is stopped and
//! recreated, and the call retried, up to `max_resets` times.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{required_str, ToolOutput, ToolProvider, ToolSpec};
use crate::agent::{Artifact, ArtifactKind};
use crate::config::agent::CODE_EXECUTOR;
use crate::config::CodeExecutorConfig;
use crate::{mlog_debug, mlog_warn, Error, Result};

/// Output of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn render(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "exit code: {}\nstdout:\n{}\nstderr:\n{}",
            code, self.stdout, self.stderr
        )
    }
}

/// How to build a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub shell: String,
    pub workdir: PathBuf,
}

/// An isolated, stateful execution environment.
///
/// Implementations report crashes, exhaustion and timeouts as
/// `Error::Sandbox`; other errors are not retried.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn start(&mut self) -> Result<()>;

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecOutput>;

    async fn stop(&mut self) -> Result<()>;
}

pub type SandboxFactory = Arc<dyn Fn(&SandboxSpec) -> Box<dyn Sandbox> + Send + Sync>;

pub fn process_sandbox_factory() -> SandboxFactory {
    Arc::new(|spec: &SandboxSpec| Box::new(ProcessSandbox::new(spec.clone())) as Box<dyn Sandbox>)
}

/// Runs code with `<shell> -c` in the working directory.
pub struct ProcessSandbox {
    spec: SandboxSpec,
    shell: Option<PathBuf>,
}

impl ProcessSandbox {
    pub fn new(spec: SandboxSpec) -> Self {
        Self { spec, shell: None }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn start(&mut self) -> Result<()> {
        let shell = which::which(&self.spec.shell)
            .map_err(|_| Error::Sandbox(format!("shell not found: {}", self.spec.shell)))?;
        tokio::fs::create_dir_all(&self.spec.workdir).await?;
        mlog_debug!(
            "ProcessSandbox started shell={} workdir={}",
            shell.display(),
            self.spec.workdir.display()
        );
        self.shell = Some(shell);
        Ok(())
    }

    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecOutput> {
        let shell = self
            .shell
            .as_ref()
            .ok_or_else(|| Error::Sandbox("sandbox not started".into()))?;

        // kill_on_drop terminates the child when the timeout drops the future
        let output = tokio::time::timeout(
            timeout,
            Command::new(shell)
                .arg("-c")
                .arg(code)
                .current_dir(&self.spec.workdir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Sandbox(format!("execution timed out after {:?}", timeout)))?
        .map_err(|e| Error::Sandbox(format!("failed to spawn {}: {}", shell.display(), e)))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.shell = None;
        Ok(())
    }
}

pub struct CodeExecutorProvider {
    factory: SandboxFactory,
    spec: SandboxSpec,
    timeout: Duration,
    max_resets: u32,
    sandbox: Mutex<Option<Box<dyn Sandbox>>>,
    resets: AtomicU32,
    tag: String,
}

impl CodeExecutorProvider {
    pub fn new(
        factory: SandboxFactory,
        config: &CodeExecutorConfig,
        workdir: PathBuf,
        tag: &str,
    ) -> Self {
        Self {
            factory,
            spec: SandboxSpec {
                shell: config.shell.clone(),
                workdir,
            },
            timeout: Duration::from_secs(config.timeout_secs),
            max_resets: config.max_resets,
            sandbox: Mutex::new(None),
            resets: AtomicU32::new(0),
            tag: tag.to_string(),
        }
    }

    /// Number of times the sandbox has been recreated.
    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    async fn fresh_sandbox(&self) -> Result<Box<dyn Sandbox>> {
        let mut sandbox = (self.factory)(&self.spec);
        sandbox.start().await?;
        Ok(sandbox)
    }

    async fn stop_current(slot: &mut Option<Box<dyn Sandbox>>) {
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.stop().await {
                mlog_warn!("Failed to stop sandbox: {}", e);
            }
        }
    }

    async fn execute(&self, code: &str) -> Result<ExecOutput> {
        let mut slot = self.sandbox.lock().await;
        let mut attempt = 0;
        loop {
            if slot.is_none() {
                *slot = Some(self.fresh_sandbox().await?);
            }
            let result = match slot.as_mut() {
                Some(sandbox) => sandbox.execute(code, self.timeout).await,
                None => Err(Error::Sandbox("sandbox unavailable".into())),
            };
            match result {
                Err(Error::Sandbox(msg)) if attempt < self.max_resets => {
                    attempt += 1;
                    self.resets.fetch_add(1, Ordering::SeqCst);
                    mlog_warn!(
                        "[{}] sandbox failed ({}), recreating (reset {}/{})",
                        self.tag,
                        msg,
                        attempt,
                        self.max_resets
                    );
                    Self::stop_current(&mut slot).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ToolProvider for CodeExecutorProvider {
    fn key(&self) -> &str {
        CODE_EXECUTOR
    }

    async fn connect(&self) -> Result<()> {
        let sandbox = self.fresh_sandbox().await?;
        *self.sandbox.lock().await = Some(sandbox);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let mut slot = self.sandbox.lock().await;
        if let Some(mut sandbox) = slot.take() {
            sandbox.stop().await?;
        }
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(vec![
            ToolSpec::new(
                CODE_EXECUTOR,
                "shell_executor",
                "Execute shell code in the sandbox. State persists between calls until reset.",
                json!({
                    "type": "object",
                    "properties": {"code": {"type": "string"}},
                    "required": ["code"]
                }),
            ),
            ToolSpec::new(
                CODE_EXECUTOR,
                "reset_executor",
                "Discard the sandbox and start a fresh one.",
                json!({"type": "object", "properties": {}}),
            ),
        ])
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        match tool {
            "shell_executor" => {
                let code = required_str(&args, "code")?;
                let output = self.execute(code).await?;
                let detail = format!("exit code {:?}", output.exit_code);
                Ok(ToolOutput::text(output.render()).with_artifact(Artifact::new(
                    ArtifactKind::Note,
                    "shell_executor",
                    &self.tag,
                    detail,
                )))
            }
            "reset_executor" => {
                let mut slot = self.sandbox.lock().await;
                Self::stop_current(&mut slot).await;
                *slot = Some(self.fresh_sandbox().await?);
                self.resets.fetch_add(1, Ordering::SeqCst);
                Ok(ToolOutput::text("executor reset"))
            }
            other => Err(Error::Tool(format!("unknown code_executor tool: {}", other))),
        }
    }
}
