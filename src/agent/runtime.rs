//! Host-provided collaborators shared by every agent in a run.

use std::collections::HashMap;
use std::sync::Arc;

use super::callbacks::{Callback, CallbackRegistry};
use super::code_agent::{CodeFn, CodeRegistry};
use crate::llm::{self, LlmFactory};
use crate::tools::code_executor::process_sandbox_factory;
use crate::tools::{RemoteToolHandler, SandboxFactory};

/// Factories and registries agents draw on.
///
/// Built once per process with [`RuntimeBuilder`] and shared behind an
/// `Arc`; nothing in it changes during a run.
pub struct Runtime {
    pub llm_factory: LlmFactory,
    pub sandbox_factory: SandboxFactory,
    pub callbacks: CallbackRegistry,
    pub code: CodeRegistry,
    pub remote_handlers: HashMap<String, Arc<dyn RemoteToolHandler>>,
    /// Allow host-registered code steps and callbacks.
    pub trust_remote_code: bool,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("callbacks", &self.callbacks.names())
            .field("code", &self.code.names())
            .field("remote_handlers", &self.remote_handlers.keys().collect::<Vec<_>>())
            .field("trust_remote_code", &self.trust_remote_code)
            .finish()
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    llm_factory: Option<LlmFactory>,
    sandbox_factory: Option<SandboxFactory>,
    callbacks: Vec<(String, Arc<dyn Callback>)>,
    code: Vec<(String, CodeFn)>,
    remote_handlers: HashMap<String, Arc<dyn RemoteToolHandler>>,
    trust_remote_code: bool,
}

impl RuntimeBuilder {
    pub fn llm_factory(mut self, factory: LlmFactory) -> Self {
        self.llm_factory = Some(factory);
        self
    }

    pub fn sandbox_factory(mut self, factory: SandboxFactory) -> Self {
        self.sandbox_factory = Some(factory);
        self
    }

    /// Register a host callback. Usable only with `trust_remote_code`.
    pub fn callback(mut self, name: &str, callback: Arc<dyn Callback>) -> Self {
        self.callbacks.push((name.to_string(), callback));
        self
    }

    /// Register a host code step. Usable only with `trust_remote_code`.
    pub fn code(mut self, name: &str, f: CodeFn) -> Self {
        self.code.push((name.to_string(), f));
        self
    }

    pub fn remote_handler(mut self, server: &str, handler: Arc<dyn RemoteToolHandler>) -> Self {
        self.remote_handlers.insert(server.to_string(), handler);
        self
    }

    pub fn trust_remote_code(mut self, trust: bool) -> Self {
        self.trust_remote_code = trust;
        self
    }

    pub fn build(self) -> Arc<Runtime> {
        let mut callbacks = CallbackRegistry::with_builtins();
        for (name, callback) in self.callbacks {
            callbacks.register(&name, callback);
        }
        let mut code = CodeRegistry::with_builtins();
        for (name, f) in self.code {
            code.register(&name, f);
        }
        Arc::new(Runtime {
            llm_factory: self.llm_factory.unwrap_or_else(llm::default_factory),
            sandbox_factory: self.sandbox_factory.unwrap_or_else(process_sandbox_factory),
            callbacks,
            code,
            remote_handlers: self.remote_handlers,
            trust_remote_code: self.trust_remote_code,
        })
    }
}
