//! Remote tool servers declared in configuration.
//!
//! The agent document lists the server's tools by description. Calls are
//! forwarded to a [`RemoteToolHandler`] the host registers under the same
//! server name; the wire protocol behind the handler is the host's concern.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ToolOutput, ToolProvider, ToolSpec};
use crate::config::RemoteServerConfig;
use crate::{Error, Result};

#[async_trait]
pub trait RemoteToolHandler: Send + Sync {
    async fn connect(&self, _server: &str) -> Result<()> {
        Ok(())
    }

    async fn call(&self, server: &str, tool: &str, args: Value) -> Result<String>;

    async fn cleanup(&self, _server: &str) -> Result<()> {
        Ok(())
    }
}

pub struct RemoteProvider {
    server: String,
    declared: RemoteServerConfig,
    handler: Option<Arc<dyn RemoteToolHandler>>,
}

impl RemoteProvider {
    pub fn new(
        server: &str,
        declared: RemoteServerConfig,
        handler: Option<Arc<dyn RemoteToolHandler>>,
    ) -> Self {
        Self {
            server: server.to_string(),
            declared,
            handler,
        }
    }

    fn handler(&self) -> Result<&Arc<dyn RemoteToolHandler>> {
        self.handler.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "no handler registered for remote tool server {}",
                self.server
            ))
        })
    }
}

#[async_trait]
impl ToolProvider for RemoteProvider {
    fn key(&self) -> &str {
        &self.server
    }

    async fn connect(&self) -> Result<()> {
        self.handler()?.connect(&self.server).await
    }

    async fn cleanup(&self) -> Result<()> {
        match &self.handler {
            Some(handler) => handler.cleanup(&self.server).await,
            None => Ok(()),
        }
    }

    async fn get_tools(&self) -> Result<Vec<ToolSpec>> {
        let fallback = self.declared.description.clone().unwrap_or_default();
        Ok(self
            .declared
            .tools
            .iter()
            .map(|decl| {
                let description = if decl.description.is_empty() {
                    &fallback
                } else {
                    &decl.description
                };
                ToolSpec::new(&self.server, &decl.name, description, decl.parameters.clone())
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        args: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let content = self.handler()?.call(&self.server, tool, args).await?;
        Ok(ToolOutput::text(content))
    }
}
