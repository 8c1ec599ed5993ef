//! Core Data Types
//!
//! Shared message, tool, task, and result types used across the runtime.
//! Everything here is serde-serializable so it can travel through state
//! stores and distributed cycle dispatch unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object map used for tool arguments, metadata, and shared state.
pub type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool-call stub carried on an assistant message.
///
/// `arguments` is the serialized JSON argument string exactly as the
/// provider produced it; the dispatcher re-parses it at execution time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallStub {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A message in the conversation.
///
/// Invariant: an assistant message with `tool_calls` must be followed by
/// one tool message per stub, in declared order. Every transformation of
/// the message list (including memory compaction) preserves this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallStub>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant message carrying tool-call stubs.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallStub>) -> Self {
        Self {
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Tool-result message paired to a tool-call stub by id.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
            image_url: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Whether this assistant message carries tool-call stubs.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Tool protocol
// ---------------------------------------------------------------------------

/// A tool call requested by the model.
///
/// `arguments` may be a JSON string or an already-parsed object; the
/// dispatcher normalizes both to an object before invoking the handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// The wire stub for this call, as carried on the assistant message.
    pub fn to_stub(&self) -> ToolCallStub {
        ToolCallStub {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: match &self.arguments {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Status code reported by a tool execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolResultStatus {
    Success,
    Error,
    WaitResponse,
    Running,
    BatchRunning,
    PendingCompress,
}

/// Per-cycle terminal signal derived from tool results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolDirective {
    #[default]
    Continue,
    WaitUser,
    Finish,
}

/// Result of executing a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    /// JSON-encoded payload the model sees as the tool message content.
    pub content: String,
    pub status_code: ToolResultStatus,
    #[serde(default)]
    pub directive: ToolDirective,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl ToolExecutionResult {
    /// The tool message this result appends to the conversation.
    pub fn to_tool_message(&self) -> Message {
        Message::tool(&self.tool_call_id, &self.content)
    }

    pub fn is_error(&self) -> bool {
        self.status_code == ToolResultStatus::Error
    }
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token usage for a single model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn has_usage(&self) -> bool {
        self.prompt_tokens > 0 || self.completion_tokens > 0 || self.total_tokens > 0
    }

    /// Total tokens, derived from the parts when the provider omitted it.
    pub fn effective_total(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// Usage of one cycle, kept for the per-task breakdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleTokenUsage {
    pub cycle_index: u32,
    pub usage: TokenUsage,
}

/// Aggregate usage across all cycles of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cycles: Vec<CycleTokenUsage>,
}

impl TaskTokenUsage {
    /// Record a cycle's usage. Cycles without reported usage are skipped.
    pub fn add_cycle(&mut self, cycle_index: u32, usage: TokenUsage) {
        if !usage.has_usage() {
            return;
        }
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.effective_total();
        self.cycles.push(CycleTokenUsage { cycle_index, usage });
    }

    pub fn from_cycles(cycles: &[CycleRecord]) -> Self {
        let mut summary = Self::default();
        for cycle in cycles {
            summary.add_cycle(cycle.index, cycle.token_usage);
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Cycle record
// ---------------------------------------------------------------------------

/// Immutable record of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleRecord {
    /// 1-based cycle ordinal.
    pub index: u32,
    pub assistant_message: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolExecutionResult>,
    /// Terminal directive this cycle converged to.
    #[serde(default)]
    pub directive: ToolDirective,
    #[serde(default)]
    pub memory_compacted: bool,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl CycleRecord {
    pub fn new(index: u32, assistant_message: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            index,
            assistant_message: assistant_message.into(),
            tool_calls,
            tool_results: Vec::new(),
            directive: ToolDirective::Continue,
            memory_compacted: false,
            token_usage: TokenUsage::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    WaitUser,
    Completed,
    Failed,
    MaxCycles,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::WaitUser => "wait_user",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::MaxCycles => "max_cycles",
        };
        f.write_str(text)
    }
}

/// Policy applied when a cycle produces no tool calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoToolPolicy {
    /// Inject a continue-hint user message and run another cycle.
    #[default]
    Continue,
    /// Suspend the task waiting for user input.
    WaitUser,
    /// Treat the assistant text as the final answer.
    Finish,
}

/// Template for a named sub-agent a parent task may delegate to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubAgentConfig {
    pub model: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_sub_agent_max_cycles")]
    pub max_cycles: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

fn default_sub_agent_max_cycles() -> u32 {
    8
}

impl SubAgentConfig {
    pub fn new(model: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            description: description.into(),
            backend: None,
            system_prompt: None,
            max_cycles: default_sub_agent_max_cycles(),
            exclude_tools: Vec::new(),
            metadata: JsonMap::new(),
        }
    }
}

/// A task handed to the runtime. Created by the caller; mutated only
/// through the runtime while running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub task_id: String,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Character/token budget above which memory compaction runs.
    #[serde(default = "default_memory_compact_threshold")]
    pub memory_compact_threshold: u64,
    /// Usage percentage at which `compress_memory` becomes visible.
    #[serde(default = "default_memory_threshold_percentage")]
    pub memory_threshold_percentage: u8,
    #[serde(default)]
    pub no_tool_policy: NoToolPolicy,
    #[serde(default = "default_true")]
    pub allow_interruption: bool,
    #[serde(default = "default_true")]
    pub use_workspace: bool,
    /// Coarse agent family; `"computer"` enables bash and image tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub native_multimodal: bool,
    #[serde(default)]
    pub enable_document_tools: bool,
    #[serde(default)]
    pub enable_workflow_tools: bool,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub sub_agents: std::collections::BTreeMap<String, SubAgentConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_tool_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tools: Vec<String>,
    /// Workspace directory override for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<std::path::PathBuf>,
    /// Opaque knobs: memory tuning, language, summary model overrides, …
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

fn default_max_cycles() -> u32 {
    20
}

fn default_memory_compact_threshold() -> u64 {
    128_000
}

fn default_memory_threshold_percentage() -> u8 {
    90
}

fn default_true() -> bool {
    true
}

impl AgentTask {
    pub fn new(
        task_id: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            max_cycles: default_max_cycles(),
            memory_compact_threshold: default_memory_compact_threshold(),
            memory_threshold_percentage: default_memory_threshold_percentage(),
            no_tool_policy: NoToolPolicy::Continue,
            allow_interruption: true,
            use_workspace: true,
            agent_type: None,
            native_multimodal: false,
            enable_document_tools: false,
            enable_workflow_tools: false,
            sub_agents: std::collections::BTreeMap::new(),
            extra_tool_names: Vec::new(),
            exclude_tools: Vec::new(),
            workspace: None,
            metadata: JsonMap::new(),
        }
    }

    pub fn sub_agents_enabled(&self) -> bool {
        !self.sub_agents.is_empty()
    }

    /// Read an integer knob from task metadata, clamped to `minimum`.
    pub fn metadata_int(&self, key: &str, default: u64, minimum: u64) -> u64 {
        let value = match self.metadata.get(key) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        };
        value.max(minimum)
    }

    /// Read a non-empty string knob from task metadata.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-task delegation
// ---------------------------------------------------------------------------

/// Request to run a named sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTaskRequest {
    pub agent_name: String,
    pub task_description: String,
    #[serde(default)]
    pub output_requirements: String,
    #[serde(default)]
    pub include_main_summary: bool,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

impl SubTaskRequest {
    pub fn new(agent_name: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            task_description: task_description.into(),
            output_requirements: String::new(),
            include_main_summary: false,
            metadata: JsonMap::new(),
        }
    }
}

/// Outcome of a sub-agent run, reported back to the delegating tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTaskOutcome {
    pub task_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cycles: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todo_list: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Final outcome of a task run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub task_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub messages: Vec<Message>,
    pub cycles: Vec<CycleRecord>,
    #[serde(default)]
    pub shared_state: JsonMap,
    #[serde(default)]
    pub token_usage: TaskTokenUsage,
}

impl AgentResult {
    /// The TODO list carried in shared state, if any.
    pub fn todo_list(&self) -> Vec<Value> {
        match self.shared_state.get("todo_list") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
