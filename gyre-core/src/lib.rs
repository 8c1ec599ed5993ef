//! # Gyre Core
//!
//! Cycle-driven agent runtime: a state machine that drives a chat model
//! through repeated turns of context → decision → tool invocation →
//! state transition until a tool signals a terminal state. Provides the
//! tool protocol and registry, the memory-compaction engine, pluggable
//! execution backends (inline / worker-pool / distributed-queue),
//! hierarchical cancellation, checkpointing, and sub-agent delegation.

pub mod backends;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod context;
pub mod cycle;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod llm;
pub mod memory;
pub mod planner;
pub mod retry;
pub mod state;
pub mod tool_calls;
pub mod tools;
pub mod types;
pub mod workspace;

// Re-export key types
pub use backends::{
    run_single_cycle, submit_task, CycleDispatchOutcome, CycleDispatcher, CycleDriver,
    ExecutionBackend, InProcessDispatcher, InlineBackend, QueueBackend, RuntimeRecipe,
    TaskLoopState, ThreadBackend,
};
pub use builder::RuntimeBuilder;
pub use cancel::CancelToken;
pub use config::{BackendConfig, LocalSettings, MemorySummaryDefaults};
pub use context::{ExecutionContext, StreamSink};
pub use cycle::{CycleRunner, ToolCallAggregator};
pub use engine::{AgentRuntime, BeforeCycleProvider, ChatClientFactory, RunOptions};
pub use errors::RuntimeError;
pub use hooks::{
    AfterLlmEvent, AfterMemoryCompactEvent, AfterToolCallEvent, BeforeLlmEvent, BeforeLlmPatch,
    BeforeMemoryCompactEvent, BeforeToolCallEvent, BeforeToolCallPatch, HookManager, RuntimeHook,
};
pub use llm::{
    ChatClient, ChatCompletion, ChatDelta, ChatRequest, RecordedRequest, ScriptedChatClient,
    ToolCallDelta,
};
pub use memory::{CompactionInput, MemoryManager, MemorySummarizer};
pub use planner::{plan_tool_names, plan_tool_schemas};
pub use retry::{RetryPolicy, RetryingChatClient};
pub use state::{
    Checkpoint, InMemoryStateStore, KeyValue, KvStateStore, StateStore, StateStoreError,
    VersionedCheckpoint,
};
pub use tool_calls::{converge_directives, InterruptionProvider, ToolCallRunner, ToolRunOutcome};
pub use tools::{
    build_default_registry, BackgroundSessions, SharedState, SubTaskRunner, ToolContext,
    ToolHandler, ToolOutput, ToolRegistry,
};
pub use types::{
    AgentResult, AgentStatus, AgentTask, CycleRecord, CycleTokenUsage, JsonMap, Message,
    NoToolPolicy, Role, SubAgentConfig, SubTaskOutcome, SubTaskRequest, TaskTokenUsage,
    TokenUsage, ToolCall, ToolCallStub, ToolDirective, ToolExecutionResult, ToolResultStatus,
};
pub use workspace::{FileInfo, LocalWorkspaceBackend, WorkspaceBackend};
