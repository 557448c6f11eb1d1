//! File tools confined to the run output directory.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::{required_str, ToolOutput, ToolProvider, ToolSpec};
use crate::agent::{Artifact, ArtifactKind};
use crate::config::agent::FILE_SYSTEM;
use crate::util::blocking;
use crate::{mlog_debug, Error, Result};

pub struct FileSystemProvider {
    root: PathBuf,
    tag: String,
}

impl FileSystemProvider {
    pub fn new(root: PathBuf, tag: &str) -> Self {
        Self {
            root,
            tag: tag.to_string(),
        }
    }
}

/// Resolve `relative` under `root`, rejecting absolute paths and `..`.
fn confine(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::Validation(format!(
            "path {} escapes the output directory",
            relative
        )));
    }
    Ok(root.join(path))
}

#[async_trait]
impl ToolProvider for FileSystemProvider {
    fn key(&self) -> &str {
        FILE_SYSTEM
    }

    async fn get_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(vec![
            ToolSpec::new(
                FILE_SYSTEM,
                "write_file",
                "Write text content to a file in the output directory.",
                json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "Relative file path"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            ToolSpec::new(
                FILE_SYSTEM,
                "read_file",
                "Read a text file from the output directory.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            ),
            ToolSpec::new(
                FILE_SYSTEM,
                "list_files",
                "List files under a directory of the output directory.",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string", "description": "Defaults to the root"}}
                }),
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
            "write_file" => {
                let relative = required_str(&args, "path")?.to_string();
                let content = required_str(&args, "content")?.to_string();
                let path = confine(&self.root, &relative)?;
                let bytes = content.len();
                blocking(move || {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, content)?;
                    Ok(())
                })
                .await?;
                mlog_debug!("[{}] wrote {} ({} bytes)", self.tag, relative, bytes);
                Ok(ToolOutput::text(format!("Wrote {} bytes to {}", bytes, relative))
                    .with_artifact(Artifact::new(
                        ArtifactKind::File,
                        relative,
                        &self.tag,
                        format!("{} bytes", bytes),
                    )))
            }
            "read_file" => {
                let path = confine(&self.root, required_str(&args, "path")?)?;
                let content = blocking(move || {
                    fs::read_to_string(&path).map_err(|e| {
                        Error::Tool(format!("cannot read {}: {}", path.display(), e))
                    })
                })
                .await?;
                Ok(ToolOutput::text(content))
            }
            "list_files" => {
                let relative = args.get("path").and_then(Value::as_str).unwrap_or("");
                let dir = confine(&self.root, relative)?;
                let mut names = blocking(move || {
                    let mut names = Vec::new();
                    if dir.is_dir() {
                        for entry in fs::read_dir(&dir)? {
                            let entry = entry?;
                            let mut name = entry.file_name().to_string_lossy().to_string();
                            if entry.file_type()?.is_dir() {
                                name.push('/');
                            }
                            names.push(name);
                        }
                    }
                    Ok(names)
                })
                .await?;
                names.sort();
                Ok(ToolOutput::text(names.join("\n")))
            }
            other => Err(Error::Tool(format!("unknown file_system tool: {}", other))),
        }
    }
}
