//! Runtime Builder
//!
//! Typed builder for constructing an [`AgentRuntime`] with its extension
//! points: chat client (required), tool registry, execution backend,
//! workspace backend, hooks, settings file, chat-client factory, and the
//! retry policy wrapped around the chat client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::backends::{ExecutionBackend, InlineBackend};
use crate::config::LocalSettings;
use crate::engine::{AgentRuntime, ChatClientFactory, RuntimeInner};
use crate::hooks::{HookManager, RuntimeHook};
use crate::llm::ChatClient;
use crate::retry::{RetryPolicy, RetryingChatClient};
use crate::tools::{build_default_registry, BackgroundSessions, ToolRegistry};
use crate::workspace::WorkspaceBackend;

pub struct RuntimeBuilder {
    chat_client: Arc<dyn ChatClient>,
    retry_policy: Option<RetryPolicy>,
    registry: Option<ToolRegistry>,
    execution_backend: Option<Arc<dyn ExecutionBackend>>,
    workspace_backend: Option<Arc<dyn WorkspaceBackend>>,
    default_workspace: Option<PathBuf>,
    settings_file: Option<PathBuf>,
    settings: Option<LocalSettings>,
    default_backend: Option<String>,
    chat_client_factory: Option<Arc<dyn ChatClientFactory>>,
    hooks: Vec<Box<dyn RuntimeHook>>,
    log_preview_chars: usize,
}

impl RuntimeBuilder {
    pub fn new(chat_client: Arc<dyn ChatClient>) -> Self {
        Self {
            chat_client,
            retry_policy: None,
            registry: None,
            execution_backend: None,
            workspace_backend: None,
            default_workspace: None,
            settings_file: None,
            settings: None,
            default_backend: None,
            chat_client_factory: None,
            hooks: Vec::new(),
            log_preview_chars: 220,
        }
    }

    /// Wrap the chat client with retry-on-transient-failure semantics.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Replace the default tool registry.
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.execution_backend = Some(backend);
        self
    }

    /// Override the workspace backend (default: local filesystem under
    /// the run's workspace directory).
    pub fn with_workspace_backend(mut self, backend: Arc<dyn WorkspaceBackend>) -> Self {
        self.workspace_backend = Some(backend);
        self
    }

    pub fn with_default_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_workspace = Some(path.into());
        self
    }

    /// Load local settings from a TOML file at build time.
    pub fn with_settings_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    /// Provide settings directly (wins over `with_settings_file`).
    pub fn with_settings(mut self, settings: LocalSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Backend name used when tasks and settings name none.
    pub fn with_default_backend(mut self, name: impl Into<String>) -> Self {
        self.default_backend = Some(name.into());
        self
    }

    pub fn with_chat_client_factory(mut self, factory: Arc<dyn ChatClientFactory>) -> Self {
        self.chat_client_factory = Some(factory);
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn RuntimeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_log_preview_chars(mut self, chars: usize) -> Self {
        self.log_preview_chars = chars.max(40);
        self
    }

    pub fn build(self) -> Result<AgentRuntime> {
        let settings = match (self.settings, &self.settings_file) {
            (Some(settings), _) => Some(settings),
            (None, Some(path)) => Some(LocalSettings::load(path)?),
            (None, None) => None,
        };
        let default_backend = self
            .default_backend
            .or_else(|| settings.as_ref().and_then(|s| s.default_backend.clone()));

        let chat_client = match self.retry_policy {
            Some(policy) => Arc::new(RetryingChatClient::new(self.chat_client, policy)) as Arc<dyn ChatClient>,
            None => self.chat_client,
        };

        Ok(AgentRuntime::from_inner(RuntimeInner {
            chat_client,
            registry: Arc::new(self.registry.unwrap_or_else(build_default_registry)),
            execution_backend: self
                .execution_backend
                .unwrap_or_else(|| Arc::new(InlineBackend::new())),
            workspace_backend: self.workspace_backend,
            default_workspace: self.default_workspace,
            settings,
            settings_file: self.settings_file,
            default_backend,
            chat_client_factory: self.chat_client_factory,
            hooks: HookManager::new(self.hooks),
            background: Arc::new(BackgroundSessions::new()),
            log_preview_chars: self.log_preview_chars,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatCompletion, ScriptedChatClient};
    use crate::tools::names::TASK_FINISH;

    #[test]
    fn defaults_give_inline_runtime_with_builtin_tools() {
        let client = Arc::new(ScriptedChatClient::new(vec![ChatCompletion::text("hi")]));
        let runtime = AgentRuntime::builder(client).build().unwrap();
        assert!(runtime.registry().has_tool(TASK_FINISH));
        assert!(runtime.settings().is_none());
    }

    #[test]
    fn settings_provide_the_default_backend() {
        let mut settings = LocalSettings::default();
        settings.default_backend = None;
        settings.memory_summary.model = Some("mini".into());

        let client = Arc::new(ScriptedChatClient::new(vec![]));
        let runtime = AgentRuntime::builder(client)
            .with_settings(settings)
            .with_default_backend("main")
            .build()
            .unwrap();
        assert!(runtime.settings().is_some());
    }

    #[test]
    fn missing_settings_file_fails_the_build() {
        let client = Arc::new(ScriptedChatClient::new(vec![]));
        let result = AgentRuntime::builder(client)
            .with_settings_file("/definitely/not/here.toml")
            .build();
        assert!(result.is_err());
    }
}
