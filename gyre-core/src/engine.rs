//! Agent Runtime
//!
//! The top-level task state machine: builds the initial message list,
//! hands the task to the execution backend, and drives each cycle through
//! the memory manager, cycle runner, and tool-call runner until a tool
//! directive, the cycle budget, cancellation, or a fatal LLM failure ends
//! the task. Also orchestrates sub-agent delegation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::backends::{
    cancelled_result, result_from_state, CycleDriver, ExecutionBackend, TaskLoopState,
};
use crate::config::LocalSettings;
use crate::context::ExecutionContext;
use crate::cycle::CycleRunner;
use crate::errors::RuntimeError;
use crate::hooks::HookManager;
use crate::llm::{ChatClient, ChatRequest};
use crate::memory::{CompactionInput, MemoryManager, MemorySummarizer};
use crate::state::Checkpoint;
use crate::tool_calls::{InterruptionProvider, ToolCallRunner};
use crate::tools::names::{BATCH_SUB_TASKS, CREATE_SUB_TASK, TASK_FINISH};
use crate::tools::{
    BackgroundSessions, SharedState, SubTaskRunner, ToolContext, ToolRegistry,
};
use crate::types::{
    AgentResult, AgentStatus, AgentTask, JsonMap, Message, SubAgentConfig, SubTaskOutcome,
    SubTaskRequest, ToolDirective, ToolExecutionResult,
};
use crate::workspace::{LocalWorkspaceBackend, WorkspaceBackend};

/// Key in shared state that schedules compaction for the next cycle.
const PENDING_COMPACT_KEY: &str = "pending_memory_compact";

/// Builds chat clients from settings for sub-agents and memory
/// summarization. The transport itself stays outside the runtime.
#[async_trait]
pub trait ChatClientFactory: Send + Sync {
    async fn build(
        &self,
        settings: &LocalSettings,
        backend: &str,
        model: &str,
    ) -> Result<Arc<dyn ChatClient>>;
}

/// Messages injected at the start of each cycle (skill reminders, queued
/// context, …).
pub type BeforeCycleProvider = Arc<dyn Fn(u32, &[Message]) -> Vec<Message> + Send + Sync>;

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Per-run knobs. `Default` runs the task fresh with a private context.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub workspace: Option<PathBuf>,
    pub shared_state: Option<JsonMap>,
    /// Prior conversation when resuming (e.g. after `wait_user`).
    pub initial_messages: Option<Vec<Message>>,
    /// Overrides the task's `user_prompt` as the appended user message.
    pub user_message: Option<String>,
    pub ctx: Option<ExecutionContext>,
    pub before_cycle_messages: Option<BeforeCycleProvider>,
    pub interruption_messages: Option<InterruptionProvider>,
}

impl RunOptions {
    pub fn with_ctx(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn resuming(mut self, messages: Vec<Message>, user_message: impl Into<String>) -> Self {
        self.initial_messages = Some(messages);
        self.user_message = Some(user_message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub(crate) struct RuntimeInner {
    pub(crate) chat_client: Arc<dyn ChatClient>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) execution_backend: Arc<dyn ExecutionBackend>,
    pub(crate) workspace_backend: Option<Arc<dyn WorkspaceBackend>>,
    pub(crate) default_workspace: Option<PathBuf>,
    pub(crate) settings: Option<LocalSettings>,
    pub(crate) settings_file: Option<PathBuf>,
    pub(crate) default_backend: Option<String>,
    pub(crate) chat_client_factory: Option<Arc<dyn ChatClientFactory>>,
    pub(crate) hooks: HookManager,
    pub(crate) background: Arc<BackgroundSessions>,
    pub(crate) log_preview_chars: usize,
}

/// The runtime. Cheap to clone; all clones share the same components.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub(crate) fn from_inner(inner: RuntimeInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start building a runtime around a chat client.
    pub fn builder(chat_client: Arc<dyn ChatClient>) -> crate::builder::RuntimeBuilder {
        crate::builder::RuntimeBuilder::new(chat_client)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    /// Run a task to a terminal state on the configured backend.
    pub async fn run(&self, task: AgentTask, options: RunOptions) -> AgentResult {
        let ctx = options.ctx.clone().unwrap_or_default();
        let workspace = match self.prepare_workspace(&task, options.workspace.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                return failed_result(&task, format!("workspace setup failed: {err:#}"));
            }
        };

        let mut shared = options.shared_state.clone().unwrap_or_default();
        shared
            .entry("todo_list".to_string())
            .or_insert_with(|| json!([]));
        let shared_state = SharedState::new(shared);

        let messages = build_initial_messages(
            &task,
            options.initial_messages.clone(),
            options.user_message.as_deref(),
        );

        info!(
            task_id = %task.task_id,
            model = %task.model,
            workspace = %workspace.display(),
            max_cycles = task.max_cycles,
            "run started"
        );

        let driver = self.build_driver(
            &task,
            workspace,
            options.before_cycle_messages.clone(),
            options.interruption_messages.clone(),
        );
        let state = TaskLoopState::new(messages, shared_state);
        let result = self
            .inner
            .execution_backend
            .run_task(task, state, driver, ctx)
            .await;

        info!(
            task_id = %result.task_id,
            status = %result.status,
            cycles = result.cycles.len(),
            "run finished"
        );
        result
    }

    /// Non-blocking run on the configured backend.
    pub fn submit(&self, task: AgentTask, options: RunOptions) -> tokio::task::JoinHandle<AgentResult> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run(task, options).await })
    }

    /// Cycle driver for this task, as used by distributed-queue workers
    /// around [`crate::backends::run_single_cycle`].
    pub fn cycle_driver(&self, task: &AgentTask) -> Result<Arc<dyn CycleDriver>> {
        let workspace = self.prepare_workspace(task, None)?;
        Ok(self.build_driver(task, workspace, None, None))
    }

    /// The settings file this runtime was built from, as referenced by
    /// `RuntimeRecipe`s for distributed workers.
    pub fn settings_file(&self) -> Option<&Path> {
        self.inner.settings_file.as_deref()
    }

    pub fn settings(&self) -> Option<&LocalSettings> {
        self.inner.settings.as_ref()
    }

    // -- internals ----------------------------------------------------------

    fn build_driver(
        &self,
        task: &AgentTask,
        workspace: PathBuf,
        before_cycle: Option<BeforeCycleProvider>,
        interruptions: Option<InterruptionProvider>,
    ) -> Arc<dyn CycleDriver> {
        let workspace_backend = self
            .inner
            .workspace_backend
            .clone()
            .unwrap_or_else(|| Arc::new(LocalWorkspaceBackend::new(workspace.clone())));
        let memory = self.build_memory_manager(task, workspace_backend.clone());

        Arc::new(EngineCycleDriver {
            runtime: self.clone(),
            task: task.clone(),
            workspace_root: workspace,
            workspace_backend,
            memory,
            cycle_runner: CycleRunner::new(self.inner.chat_client.clone(), self.inner.hooks.clone()),
            tool_runner: ToolCallRunner::new(self.inner.hooks.clone()),
            before_cycle,
            interruptions,
            checkpoint_version: tokio::sync::Mutex::new(None),
        })
    }

    fn prepare_workspace(&self, task: &AgentTask, override_path: Option<&Path>) -> Result<PathBuf> {
        let target = override_path
            .map(Path::to_path_buf)
            .or_else(|| task.workspace.clone())
            .or_else(|| self.inner.default_workspace.clone())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join(".gyre-workspace"));
        std::fs::create_dir_all(&target)?;
        Ok(target)
    }

    fn build_memory_manager(
        &self,
        task: &AgentTask,
        workspace_backend: Arc<dyn WorkspaceBackend>,
    ) -> MemoryManager {
        let mut memory = MemoryManager::new(task.memory_compact_threshold);
        memory.keep_recent_messages = task.metadata_int("memory_keep_recent_messages", 10, 1) as usize;
        memory.warning_threshold_percentage = task.memory_threshold_percentage.clamp(1, 100);
        memory.include_memory_warning = matches!(
            task.metadata.get("include_memory_warning"),
            Some(Value::Bool(true))
        );
        memory.tool_result_compact_threshold =
            task.metadata_int("tool_result_compact_threshold", 2_000, 0) as usize;
        memory.tool_result_keep_last = task.metadata_int("tool_result_keep_last", 3, 0) as usize;
        memory.tool_result_excerpt_head =
            task.metadata_int("tool_result_excerpt_head", 200, 0) as usize;
        memory.tool_result_excerpt_tail =
            task.metadata_int("tool_result_excerpt_tail", 200, 0) as usize;
        memory.tool_calls_keep_last = task.metadata_int("tool_calls_keep_last", 3, 0) as usize;
        memory.assistant_no_tool_keep_last =
            task.metadata_int("assistant_no_tool_keep_last", 1, 0) as usize;
        memory.tool_result_artifact_dir = task
            .metadata_str("tool_result_artifact_dir")
            .unwrap_or(".memory/tool_results")
            .to_string();
        memory.summary_event_limit = task.metadata_int("summary_event_limit", 40, 1) as usize;
        if task.use_workspace {
            memory.workspace = Some(workspace_backend);
        }

        let (backend, model) = resolve_summary_selection(
            task,
            self.inner.settings.as_ref(),
            self.inner.default_backend.as_deref(),
        );
        memory.summary_backend = backend;
        memory.summary_model = model;
        memory.summarizer = Some(Arc::new(EngineSummarizer {
            factory: self.inner.chat_client_factory.clone(),
            settings: self.inner.settings.clone(),
            fallback_client: self.inner.chat_client.clone(),
            fallback_model: task.model.clone(),
            cache: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }));
        memory
    }

    fn preview(&self, text: &str) -> String {
        let cleaned = text.replace('\n', " ");
        let cleaned = cleaned.trim();
        let limit = self.inner.log_preview_chars.max(40);
        if cleaned.len() <= limit {
            cleaned.to_string()
        } else {
            let mut cut = limit - 3;
            while cut > 0 && !cleaned.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &cleaned[..cut])
        }
    }
}

/// Summary model selection: task metadata override → local-settings
/// global default → runtime default backend + the task's own model.
pub(crate) fn resolve_summary_selection(
    task: &AgentTask,
    settings: Option<&LocalSettings>,
    default_backend: Option<&str>,
) -> (Option<String>, Option<String>) {
    let metadata_backend = ["memory_summary_backend", "compress_memory_summary_backend", "memory_compress_backend"]
        .iter()
        .find_map(|key| task.metadata_str(key));
    let metadata_model = ["memory_summary_model", "compress_memory_summary_model", "memory_compress_model"]
        .iter()
        .find_map(|key| task.metadata_str(key));

    let settings_defaults = settings.map(|s| &s.memory_summary);
    let backend = metadata_backend
        .map(str::to_string)
        .or_else(|| settings_defaults.and_then(|d| d.backend.clone()))
        .or_else(|| default_backend.map(str::to_string));
    let model = metadata_model
        .map(str::to_string)
        .or_else(|| settings_defaults.and_then(|d| d.model.clone()))
        .or_else(|| Some(task.model.clone()));
    (backend, model)
}

fn build_initial_messages(
    task: &AgentTask,
    initial_messages: Option<Vec<Message>>,
    user_message: Option<&str>,
) -> Vec<Message> {
    if let Some(mut prepared) = initial_messages {
        if prepared.first().map(|m| m.role) != Some(crate::types::Role::System) {
            prepared.insert(0, Message::system(&task.system_prompt));
        }
        let appended = user_message.unwrap_or(&task.user_prompt);
        if !appended.is_empty() {
            prepared.push(Message::user(appended));
        }
        return prepared;
    }

    vec![
        Message::system(&task.system_prompt),
        Message::user(user_message.unwrap_or(&task.user_prompt)),
    ]
}

fn failed_result(task: &AgentTask, error: String) -> AgentResult {
    AgentResult {
        task_id: task.task_id.clone(),
        status: AgentStatus::Failed,
        final_answer: None,
        wait_reason: None,
        error: Some(error),
        messages: Vec::new(),
        cycles: Vec::new(),
        shared_state: JsonMap::new(),
        token_usage: Default::default(),
    }
}

/// `final_answer` extraction: the finish tool's reported message, falling
/// back to the result payload. Never inferred from raw assistant text.
fn extract_final_answer(result: &ToolExecutionResult) -> String {
    if let Some(Value::String(answer)) = result.metadata.get("final_message") {
        if !answer.is_empty() {
            return answer.clone();
        }
    }
    if let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(&result.content) {
        for key in ["answer", "message"] {
            if let Some(Value::String(answer)) = payload.get(key) {
                if !answer.is_empty() {
                    return answer.clone();
                }
            }
        }
    }
    result.content.clone()
}

fn extract_wait_reason(result: &ToolExecutionResult) -> String {
    match result.metadata.get("question") {
        Some(Value::String(question)) if !question.is_empty() => question.clone(),
        _ => result.content.clone(),
    }
}

fn continue_hint() -> String {
    format!(
        "No tool call was produced. Continue the task and call `{TASK_FINISH}` when all todo items are done."
    )
}

// ---------------------------------------------------------------------------
// Cycle driver
// ---------------------------------------------------------------------------

struct EngineCycleDriver {
    runtime: AgentRuntime,
    task: AgentTask,
    workspace_root: PathBuf,
    workspace_backend: Arc<dyn WorkspaceBackend>,
    memory: MemoryManager,
    cycle_runner: CycleRunner,
    tool_runner: ToolCallRunner,
    before_cycle: Option<BeforeCycleProvider>,
    interruptions: Option<InterruptionProvider>,
    /// Version of the last checkpoint this driver wrote.
    checkpoint_version: tokio::sync::Mutex<Option<u64>>,
}

impl EngineCycleDriver {
    fn tool_context(&self, state: &TaskLoopState, ctx: &ExecutionContext, cycle_index: u32) -> ToolContext {
        let sub_tasks: Option<Arc<dyn SubTaskRunner>> = if self.task.sub_agents_enabled() {
            Some(Arc::new(EngineSubTaskRunner {
                runtime: self.runtime.clone(),
                parent_task: self.task.clone(),
                workspace: self.workspace_root.clone(),
                parent_shared: state.shared_state.clone(),
                ctx: ctx.clone(),
            }))
        } else {
            None
        };

        ToolContext {
            workspace_root: self.workspace_root.clone(),
            workspace: self.workspace_backend.clone(),
            shared_state: state.shared_state.clone(),
            cycle_index,
            sub_tasks,
            background: self.runtime.inner.background.clone(),
            exec: ctx.clone(),
            native_multimodal: self.task.native_multimodal,
            task_metadata: self.task.metadata.clone(),
        }
    }

    /// Persist the loop state if this run checkpoints (state store on the
    /// context). Conflicts are logged, not fatal: the in-process loop is
    /// the only writer unless an operator intervened.
    async fn persist_checkpoint(&self, state: &TaskLoopState, ctx: &ExecutionContext, cycle_index: u32) {
        let Some(store) = &ctx.state_store else { return };
        let checkpoint = Checkpoint {
            task: self.task.clone(),
            cycle_index,
            status: AgentStatus::Running,
            messages: state.messages.clone(),
            cycles: state.cycles.clone(),
            shared_state: state.shared_state.snapshot(),
        };

        let mut version = self.checkpoint_version.lock().await;
        let expected = match *version {
            Some(v) => Some(v),
            None => store
                .load(self.task.task_id.as_str())
                .await
                .ok()
                .flatten()
                .map(|v| v.version),
        };
        match store.save(&checkpoint, expected).await {
            Ok(new_version) => *version = Some(new_version),
            Err(err) => {
                warn!(task_id = %self.task.task_id, cycle = cycle_index, err = %err, "checkpoint save failed");
            }
        }
    }
}

#[async_trait]
impl CycleDriver for EngineCycleDriver {
    async fn run_cycle(
        &self,
        cycle_index: u32,
        state: &mut TaskLoopState,
        ctx: &ExecutionContext,
    ) -> Option<AgentResult> {
        let task = &self.task;
        if let Some(provider) = &self.before_cycle {
            let injected = provider(cycle_index, &state.messages);
            if !injected.is_empty() {
                info!(task_id = %task.task_id, cycle = cycle_index, count = injected.len(), "cycle messages injected");
                state.messages.extend(injected);
            }
        }

        info!(
            task_id = %task.task_id,
            cycle = cycle_index,
            max_cycles = task.max_cycles,
            message_count = state.messages.len(),
            "cycle started"
        );

        // The previous cycle's usage feeds the effective-length estimate.
        let (previous_total_tokens, recent_tool_call_ids) = match state.cycles.last() {
            Some(last) => {
                let total = last.token_usage.effective_total();
                let ids: std::collections::HashSet<String> =
                    last.tool_calls.iter().map(|c| c.id.clone()).collect();
                (
                    (total > 0).then_some(total),
                    (!ids.is_empty()).then_some(ids),
                )
            }
            None => (None, None),
        };
        let force = state.shared_state.take(PENDING_COMPACT_KEY).is_some();
        let compaction = CompactionInput {
            cycle_index: Some(cycle_index),
            previous_total_tokens,
            recent_tool_call_ids,
            force,
        };

        let cycle_result = self
            .cycle_runner
            .run_cycle(
                task,
                &self.runtime.inner.registry,
                &self.memory,
                state.messages.clone(),
                cycle_index,
                &compaction,
                ctx,
            )
            .await;
        let (messages, mut record) = match cycle_result {
            Ok(output) => output,
            Err(err) => {
                warn!(task_id = %task.task_id, cycle = cycle_index, err = %err, "cycle failed");
                let mut result = result_from_state(task, AgentStatus::Failed, state);
                result.error = Some(match err.downcast_ref::<RuntimeError>() {
                    Some(runtime_err) => runtime_err.reason_code().to_string(),
                    None => format!("LLM call failed in cycle {cycle_index}: {err:#}"),
                });
                return Some(result);
            }
        };
        state.messages = messages;

        info!(
            task_id = %task.task_id,
            cycle = cycle_index,
            assistant_preview = %self.runtime.preview(&record.assistant_message),
            tool_call_count = record.tool_calls.len(),
            "cycle model response"
        );

        if record.tool_calls.is_empty() {
            state.cycles.push(record.clone());
            self.persist_checkpoint(state, ctx, cycle_index).await;
            return match task.no_tool_policy {
                crate::types::NoToolPolicy::Finish => {
                    let mut result = result_from_state(task, AgentStatus::Completed, state);
                    result.final_answer = Some(record.assistant_message);
                    Some(result)
                }
                crate::types::NoToolPolicy::WaitUser => {
                    let mut result = result_from_state(task, AgentStatus::WaitUser, state);
                    result.wait_reason = Some(if record.assistant_message.is_empty() {
                        "No tool call and runtime is waiting for user.".to_string()
                    } else {
                        record.assistant_message
                    });
                    Some(result)
                }
                crate::types::NoToolPolicy::Continue => {
                    if cycle_index < task.max_cycles {
                        state.messages.push(Message::user(continue_hint()));
                    }
                    None
                }
            };
        }

        let calls = record.tool_calls.clone();
        let context = self.tool_context(state, ctx, cycle_index);
        let run_outcome = self
            .tool_runner
            .run(
                task,
                &self.runtime.inner.registry,
                &calls,
                &context,
                &mut state.messages,
                &mut record,
                self.interruptions.as_ref(),
            )
            .await;
        let outcome = match run_outcome {
            Ok(outcome) => outcome,
            Err(RuntimeError::Cancelled) => {
                state.cycles.push(record);
                return Some(cancelled_result(task, state));
            }
            Err(err) => {
                state.cycles.push(record);
                let mut result = result_from_state(task, AgentStatus::Failed, state);
                result.error = Some(err.to_string());
                return Some(result);
            }
        };

        state.cycles.push(record);
        if !outcome.interruption_messages.is_empty() {
            info!(
                task_id = %task.task_id,
                cycle = cycle_index,
                steering_count = outcome.interruption_messages.len(),
                "run steered"
            );
            state.messages.extend(outcome.interruption_messages);
        }
        if outcome.pending_compress {
            state
                .shared_state
                .insert(PENDING_COMPACT_KEY, json!(true));
        }

        self.persist_checkpoint(state, ctx, cycle_index).await;

        match outcome.directive {
            ToolDirective::Finish => {
                let final_answer = outcome
                    .directive_result
                    .as_ref()
                    .map(extract_final_answer)
                    .unwrap_or_default();
                info!(
                    task_id = %task.task_id,
                    cycle = cycle_index,
                    final_answer = %self.runtime.preview(&final_answer),
                    "run completed"
                );
                let mut result = result_from_state(task, AgentStatus::Completed, state);
                result.final_answer = Some(final_answer);
                Some(result)
            }
            ToolDirective::WaitUser => {
                let wait_reason = outcome
                    .directive_result
                    .as_ref()
                    .map(extract_wait_reason)
                    .unwrap_or_default();
                info!(
                    task_id = %task.task_id,
                    cycle = cycle_index,
                    wait_reason = %self.runtime.preview(&wait_reason),
                    "run waiting for user"
                );
                let mut result = result_from_state(task, AgentStatus::WaitUser, state);
                result.wait_reason = Some(wait_reason);
                Some(result)
            }
            ToolDirective::Continue => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-agent delegation
// ---------------------------------------------------------------------------

struct EngineSubTaskRunner {
    runtime: AgentRuntime,
    parent_task: AgentTask,
    workspace: PathBuf,
    parent_shared: SharedState,
    ctx: ExecutionContext,
}

impl EngineSubTaskRunner {
    async fn resolve_client(
        &self,
        sub_agent: &SubAgentConfig,
    ) -> Result<Arc<dyn ChatClient>> {
        let needs_own_client =
            sub_agent.backend.is_some() || sub_agent.model != self.parent_task.model;
        if !needs_own_client {
            return Ok(self.runtime.inner.chat_client.clone());
        }

        let factory = self
            .runtime
            .inner
            .chat_client_factory
            .as_ref()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "sub-agent model resolution requires a chat client factory when the sub-agent model differs from the parent model"
                )
            })?;
        let settings = self
            .runtime
            .inner
            .settings
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("sub-agent model resolution requires runtime settings"))?;
        let backend = sub_agent
            .backend
            .as_deref()
            .or(self.runtime.inner.default_backend.as_deref())
            .ok_or_else(|| anyhow::anyhow!("sub-agent backend is required"))?;
        factory.build(settings, backend, &sub_agent.model).await
    }

    fn build_sub_task(
        &self,
        sub_task_id: String,
        agent_name: &str,
        sub_agent: &SubAgentConfig,
        request: &SubTaskRequest,
    ) -> AgentTask {
        let parent = &self.parent_task;
        let system_prompt = sub_agent.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are the `{agent_name}` sub-agent. {}\nWork autonomously and call `{TASK_FINISH}` with your final answer when done.",
                sub_agent.description
            )
        });

        let mut user_prompt = request.task_description.clone();
        if !request.output_requirements.is_empty() {
            user_prompt.push_str(&format!(
                "\n\n<Output Requirements>\n{}\n</Output Requirements>",
                request.output_requirements
            ));
        }
        if request.include_main_summary {
            let summary = self.build_parent_summary();
            if !summary.is_empty() {
                user_prompt.push_str(&format!(
                    "\n\n<Main Task Summary>\n{summary}\n</Main Task Summary>"
                ));
            }
        }

        let mut excluded: std::collections::BTreeSet<String> =
            parent.exclude_tools.iter().cloned().collect();
        excluded.extend(sub_agent.exclude_tools.iter().cloned());
        excluded.insert(CREATE_SUB_TASK.to_string());
        excluded.insert(BATCH_SUB_TASKS.to_string());

        let mut metadata = JsonMap::new();
        metadata.insert("is_sub_task".into(), json!(true));
        metadata.insert("parent_task_id".into(), json!(parent.task_id));
        metadata.insert("sub_agent_name".into(), json!(agent_name));
        for (key, value) in &request.metadata {
            metadata.insert(key.clone(), value.clone());
        }

        let mut task = AgentTask::new(sub_task_id, &sub_agent.model, system_prompt, user_prompt);
        task.max_cycles = sub_agent.max_cycles.max(1);
        task.memory_compact_threshold = parent.memory_compact_threshold;
        task.memory_threshold_percentage = parent.memory_threshold_percentage;
        task.allow_interruption = false;
        task.use_workspace = parent.use_workspace;
        task.agent_type = parent.agent_type.clone();
        task.native_multimodal = parent.native_multimodal;
        task.extra_tool_names = parent.extra_tool_names.clone();
        task.exclude_tools = excluded.into_iter().collect();
        task.workspace = Some(self.workspace.clone());
        task.metadata = metadata;
        task
    }

    fn build_parent_summary(&self) -> String {
        let mut lines = vec![format!("Parent task goal: {}", self.parent_task.user_prompt)];
        let todo_list = self.parent_shared.todo_list();
        if !todo_list.is_empty() {
            lines.push("Parent TODO status:".to_string());
            for item in todo_list {
                let title = item
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Untitled");
                let status = item
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending");
                lines.push(format!("- [{status}] {title}"));
            }
        }
        lines.join("\n")
    }

    fn failed_outcome(&self, sub_task_id: String, agent_name: &str, error: String) -> SubTaskOutcome {
        SubTaskOutcome {
            task_id: sub_task_id,
            agent_name: agent_name.to_string(),
            status: AgentStatus::Failed,
            final_answer: None,
            wait_reason: None,
            error: Some(error),
            cycles: 0,
            todo_list: Vec::new(),
        }
    }
}

#[async_trait]
impl SubTaskRunner for EngineSubTaskRunner {
    async fn run(&self, request: SubTaskRequest) -> SubTaskOutcome {
        let sub_task_id = format!(
            "{}_sub_{}_{}",
            self.parent_task.task_id,
            request.agent_name,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let Some(sub_agent) = self.parent_task.sub_agents.get(&request.agent_name) else {
            let available: Vec<&str> = self
                .parent_task
                .sub_agents
                .keys()
                .map(String::as_str)
                .collect();
            return self.failed_outcome(
                sub_task_id,
                &request.agent_name,
                format!(
                    "Unknown sub-agent '{}'. Available: {}",
                    request.agent_name,
                    available.join(", ")
                ),
            );
        };

        let client = match self.resolve_client(sub_agent).await {
            Ok(client) => client,
            Err(err) => {
                return self.failed_outcome(sub_task_id, &request.agent_name, format!("{err:#}"))
            }
        };

        let sub_task = self.build_sub_task(sub_task_id.clone(), &request.agent_name, sub_agent, &request);

        // Children run inline on a derived runtime and hold only a child
        // of the parent's cancellation token.
        let sub_runtime = AgentRuntime::from_inner(RuntimeInner {
            chat_client: client,
            registry: self.runtime.inner.registry.clone(),
            execution_backend: Arc::new(crate::backends::InlineBackend::new()),
            workspace_backend: self.runtime.inner.workspace_backend.clone(),
            default_workspace: Some(self.workspace.clone()),
            settings: self.runtime.inner.settings.clone(),
            settings_file: self.runtime.inner.settings_file.clone(),
            default_backend: self.runtime.inner.default_backend.clone(),
            chat_client_factory: self.runtime.inner.chat_client_factory.clone(),
            hooks: self.runtime.inner.hooks.clone(),
            background: self.runtime.inner.background.clone(),
            log_preview_chars: self.runtime.inner.log_preview_chars,
        });

        let options = RunOptions {
            workspace: Some(self.workspace.clone()),
            shared_state: Some({
                let mut shared = JsonMap::new();
                shared.insert("todo_list".into(), json!([]));
                shared
            }),
            ctx: Some(self.ctx.child()),
            ..RunOptions::default()
        };
        let result = sub_runtime.run(sub_task, options).await;

        SubTaskOutcome {
            task_id: result.task_id.clone(),
            agent_name: request.agent_name,
            status: result.status,
            final_answer: result.final_answer.clone(),
            wait_reason: result.wait_reason.clone(),
            error: result.error.clone(),
            cycles: result.cycles.len() as u32,
            todo_list: result.todo_list(),
        }
    }

    async fn run_batch(&self, requests: Vec<SubTaskRequest>) -> Vec<SubTaskOutcome> {
        // join_all preserves request order regardless of completion order.
        futures::future::join_all(requests.into_iter().map(|request| self.run(request))).await
    }
}

// ---------------------------------------------------------------------------
// Memory summarizer
// ---------------------------------------------------------------------------

struct EngineSummarizer {
    factory: Option<Arc<dyn ChatClientFactory>>,
    settings: Option<LocalSettings>,
    fallback_client: Arc<dyn ChatClient>,
    fallback_model: String,
    cache: tokio::sync::Mutex<std::collections::HashMap<(String, String), Arc<dyn ChatClient>>>,
}

#[async_trait]
impl MemorySummarizer for EngineSummarizer {
    async fn summarize(
        &self,
        prompt: &str,
        backend: Option<&str>,
        model: Option<&str>,
    ) -> Result<Option<String>> {
        let client: Arc<dyn ChatClient> = match (backend, model, &self.factory, &self.settings) {
            (Some(backend), Some(model), Some(factory), Some(settings))
                if settings.backend(backend).is_some() =>
            {
                let key = (backend.to_string(), model.to_string());
                let mut cache = self.cache.lock().await;
                match cache.get(&key) {
                    Some(client) => client.clone(),
                    None => {
                        let client = factory.build(settings, backend, model).await?;
                        cache.insert(key, client.clone());
                        client
                    }
                }
            }
            _ => self.fallback_client.clone(),
        };

        let messages = [Message::user(prompt)];
        let options = JsonMap::new();
        let completion = client
            .complete(ChatRequest {
                model: model.unwrap_or(&self.fallback_model),
                messages: &messages,
                tool_schemas: &[],
                options: &options,
            })
            .await?;
        let content = completion.content.trim().to_string();
        Ok((!content.is_empty()).then_some(content))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySummaryDefaults;

    #[test]
    fn initial_messages_fresh() {
        let task = AgentTask::new("t1", "m", "be helpful", "say hi");
        let messages = build_initial_messages(&task, None, None);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "be helpful");
        assert_eq!(messages[1].content, "say hi");
    }

    #[test]
    fn initial_messages_resume_appends_user_and_keeps_system() {
        let task = AgentTask::new("t1", "m", "sys", "orig");
        let prior = vec![
            Message::system("sys"),
            Message::user("orig"),
            Message::assistant("asking"),
        ];
        let messages = build_initial_messages(&task, Some(prior), Some("Ada"));
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].content, "Ada");
    }

    #[test]
    fn initial_messages_resume_inserts_missing_system() {
        let task = AgentTask::new("t1", "m", "sys", "orig");
        let prior = vec![Message::user("hello")];
        let messages = build_initial_messages(&task, Some(prior), Some("next"));
        assert_eq!(messages[0].role, crate::types::Role::System);
        assert_eq!(messages[0].content, "sys");
    }

    #[test]
    fn summary_selection_priority() {
        let mut task = AgentTask::new("t1", "task-model", "s", "u");
        let mut settings = LocalSettings::default();
        settings.memory_summary = MemorySummaryDefaults {
            backend: Some("settings-backend".into()),
            model: Some("settings-model".into()),
        };

        // Metadata override wins.
        task.metadata
            .insert("memory_summary_backend".into(), json!("meta-backend"));
        task.metadata
            .insert("memory_summary_model".into(), json!("meta-model"));
        let (backend, model) =
            resolve_summary_selection(&task, Some(&settings), Some("default-backend"));
        assert_eq!(backend.as_deref(), Some("meta-backend"));
        assert_eq!(model.as_deref(), Some("meta-model"));

        // Settings defaults next.
        task.metadata.clear();
        let (backend, model) =
            resolve_summary_selection(&task, Some(&settings), Some("default-backend"));
        assert_eq!(backend.as_deref(), Some("settings-backend"));
        assert_eq!(model.as_deref(), Some("settings-model"));

        // Runtime default backend + task model last.
        let (backend, model) =
            resolve_summary_selection(&task, None, Some("default-backend"));
        assert_eq!(backend.as_deref(), Some("default-backend"));
        assert_eq!(model.as_deref(), Some("task-model"));
    }

    #[test]
    fn final_answer_extraction_prefers_metadata() {
        let mut metadata = JsonMap::new();
        metadata.insert("final_message".into(), json!("from metadata"));
        let result = ToolExecutionResult {
            tool_call_id: "tc1".into(),
            content: "{\"answer\":\"from payload\"}".into(),
            status_code: crate::types::ToolResultStatus::Success,
            directive: ToolDirective::Finish,
            error_code: None,
            metadata,
            image_url: None,
            image_path: None,
        };
        assert_eq!(extract_final_answer(&result), "from metadata");

        let mut without_meta = result.clone();
        without_meta.metadata = JsonMap::new();
        assert_eq!(extract_final_answer(&without_meta), "from payload");
    }
}
