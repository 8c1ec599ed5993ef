//! Tool Protocol and Registry
//!
//! Handlers implement [`ToolHandler`]; the registry maps tool name →
//! (schema, handler) and is read-only after construction. The dispatcher
//! in [`dispatcher`] normalizes arguments, invokes the handler, and maps
//! failures into the protocol error taxonomy.

pub mod bash;
pub mod control;
pub mod dispatcher;
pub mod gated;
pub mod image;
pub mod memory_tool;
pub mod names;
pub mod search;
pub mod sub_agents;
pub mod todo;
pub mod workspace_io;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::types::{JsonMap, SubTaskOutcome, SubTaskRequest, ToolDirective, ToolResultStatus};
use crate::workspace::WorkspaceBackend;

pub use bash::BackgroundSessions;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// JSON-valued state shared by all tools of a task (todo list, memory
/// notes, pending flags). Travels inside checkpoints.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<JsonMap>>,
}

impl SharedState {
    pub fn new(map: JsonMap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().unwrap().insert(key.into(), value);
    }

    /// Remove and return a key.
    pub fn take(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn snapshot(&self) -> JsonMap {
        self.inner.lock().unwrap().clone()
    }

    /// The task's TODO list (empty when unset or malformed).
    pub fn todo_list(&self) -> Vec<Value> {
        match self.get("todo_list") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler output
// ---------------------------------------------------------------------------

/// Structured handler result. The dispatcher serializes `payload` into the
/// tool message content and fills in the tool-call id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub payload: Value,
    pub status_code: ToolResultStatus,
    pub directive: ToolDirective,
    pub error_code: Option<String>,
    pub metadata: JsonMap,
    pub image_url: Option<String>,
    pub image_path: Option<String>,
}

impl ToolOutput {
    pub fn success(payload: Value) -> Self {
        Self {
            payload,
            status_code: ToolResultStatus::Success,
            directive: ToolDirective::Continue,
            error_code: None,
            metadata: JsonMap::new(),
            image_url: None,
            image_path: None,
        }
    }

    /// Domain error with a stable `error_code`; the model sees the payload
    /// and may self-correct.
    pub fn error(message: impl Into<String>, error_code: impl Into<String>) -> Self {
        let message = message.into();
        let error_code = error_code.into();
        let payload = serde_json::json!({
            "ok": false,
            "error": message,
            "error_code": error_code,
        });
        Self {
            payload,
            status_code: ToolResultStatus::Error,
            directive: ToolDirective::Continue,
            error_code: Some(error_code),
            metadata: JsonMap::new(),
            image_url: None,
            image_path: None,
        }
    }

    pub fn with_status(mut self, status: ToolResultStatus) -> Self {
        self.status_code = status;
        self
    }

    pub fn with_directive(mut self, directive: ToolDirective) -> Self {
        self.directive = directive;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        self.image_path = Some(path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tool context
// ---------------------------------------------------------------------------

/// Runs sub-agent tasks on behalf of the delegation tools. Implemented by
/// the runtime; absent when the task has no sub-agents configured.
#[async_trait]
pub trait SubTaskRunner: Send + Sync {
    async fn run(&self, request: SubTaskRequest) -> SubTaskOutcome;

    /// Run several requests in parallel. Outcomes are returned in request
    /// order regardless of completion order.
    async fn run_batch(&self, requests: Vec<SubTaskRequest>) -> Vec<SubTaskOutcome>;
}

/// Everything a handler sees about the running task.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub workspace: Arc<dyn WorkspaceBackend>,
    pub shared_state: SharedState,
    pub cycle_index: u32,
    pub sub_tasks: Option<Arc<dyn SubTaskRunner>>,
    pub background: Arc<BackgroundSessions>,
    pub exec: ExecutionContext,
    /// Whether the task's model accepts inline image payloads.
    pub native_multimodal: bool,
    pub task_metadata: JsonMap,
}

// ---------------------------------------------------------------------------
// Handler trait and registry
// ---------------------------------------------------------------------------

/// A registered tool: one method plus the schema descriptor held by the
/// registry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool. `args` is always a normalized JSON object. An
    /// `Err` here is caught by the dispatcher and reported as
    /// `tool_execution_failed`.
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput>;
}

struct RegisteredTool {
    schema: Value,
    handler: Arc<dyn ToolHandler>,
}

/// Tool name → (schema, handler) registry. Built once at runtime
/// construction; read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.tools.contains_key(&name) {
            bail!("tool already registered: {name}");
        }
        self.order.push(name.clone());
        self.tools.insert(name, RegisteredTool { schema, handler });
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|t| t.handler.clone())
    }

    pub fn schema(&self, name: &str) -> Option<Value> {
        self.tools.get(name).map(|t| t.schema.clone())
    }

    /// Schemas for `names`, in the given order, skipping unregistered
    /// names. This is the planner's projection for one cycle.
    pub fn list_schemas(&self, names: &[String]) -> Vec<Value> {
        names
            .iter()
            .filter_map(|name| self.schema(name))
            .collect()
    }

    /// All schemas in registration order.
    pub fn all_schemas(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.schema(name))
            .collect()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }
}

/// Build the default registry with every built-in tool.
pub fn build_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    control::register(&mut registry);
    todo::register(&mut registry);
    memory_tool::register(&mut registry);
    workspace_io::register(&mut registry);
    search::register(&mut registry);
    bash::register(&mut registry);
    image::register(&mut registry);
    sub_agents::register(&mut registry);
    gated::register(&mut registry);
    registry
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::workspace::LocalWorkspaceBackend;

    /// Tool context over a throwaway workspace directory.
    pub fn context() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            workspace_root: dir.path().to_path_buf(),
            workspace: Arc::new(LocalWorkspaceBackend::new(dir.path())),
            shared_state: SharedState::default(),
            cycle_index: 1,
            sub_tasks: None,
            background: Arc::new(BackgroundSessions::new()),
            exec: ExecutionContext::new(),
            native_multimodal: false,
            task_metadata: JsonMap::new(),
        };
        (dir, ctx)
    }

    pub fn args(value: serde_json::Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture arguments must be an object"),
        }
    }
}
