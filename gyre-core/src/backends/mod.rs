//! Execution Backends
//!
//! A backend schedules the cycles of a task: inline on the caller's task,
//! on a bounded worker pool, or cycle-by-cycle through a distributed
//! queue. Cycles of a given task are strictly sequential on every
//! backend; parallelism comes from running different tasks concurrently.

pub mod inline;
pub mod queue;
pub mod thread;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::errors::RuntimeError;
use crate::tools::SharedState;
use crate::types::{
    AgentResult, AgentStatus, AgentTask, CycleRecord, Message, TaskTokenUsage,
};

pub use inline::InlineBackend;
pub use queue::{
    run_single_cycle, CycleDispatchOutcome, CycleDispatcher, InProcessDispatcher, QueueBackend,
    RuntimeRecipe,
};
pub use thread::ThreadBackend;

// ---------------------------------------------------------------------------
// Loop state and driver
// ---------------------------------------------------------------------------

/// Mutable loop state threaded through a task's cycles. Checkpoints
/// serialize exactly this plus the task itself.
pub struct TaskLoopState {
    pub messages: Vec<Message>,
    pub cycles: Vec<CycleRecord>,
    pub shared_state: SharedState,
}

impl TaskLoopState {
    pub fn new(messages: Vec<Message>, shared_state: SharedState) -> Self {
        Self {
            messages,
            cycles: Vec::new(),
            shared_state,
        }
    }
}

/// Executes one cycle of a task. Implemented by the runtime; backends
/// only decide where and when cycles run.
#[async_trait]
pub trait CycleDriver: Send + Sync {
    /// Run cycle `cycle_index` (1-based). `Some` is a terminal result;
    /// `None` means continue with the next cycle.
    async fn run_cycle(
        &self,
        cycle_index: u32,
        state: &mut TaskLoopState,
        ctx: &ExecutionContext,
    ) -> Option<AgentResult>;
}

/// Scheduling strategy for a task's cycle loop.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run_task(
        &self,
        task: AgentTask,
        state: TaskLoopState,
        driver: Arc<dyn CycleDriver>,
        ctx: ExecutionContext,
    ) -> AgentResult;
}

/// Non-blocking submit: the task runs on the backend while the caller
/// keeps the handle.
pub fn submit_task(
    backend: Arc<dyn ExecutionBackend>,
    task: AgentTask,
    state: TaskLoopState,
    driver: Arc<dyn CycleDriver>,
    ctx: ExecutionContext,
) -> tokio::task::JoinHandle<AgentResult> {
    tokio::spawn(async move { backend.run_task(task, state, driver, ctx).await })
}

// ---------------------------------------------------------------------------
// Shared loop plumbing
// ---------------------------------------------------------------------------

/// The sequential cycle loop shared by the in-process backends.
pub(crate) async fn drive_loop(
    task: &AgentTask,
    mut state: TaskLoopState,
    driver: &dyn CycleDriver,
    ctx: &ExecutionContext,
) -> AgentResult {
    for cycle_index in 1..=task.max_cycles {
        if ctx.check_cancelled().is_err() {
            return cancelled_result(task, &state);
        }
        if let Some(result) = driver.run_cycle(cycle_index, &mut state, ctx).await {
            return result;
        }
    }
    max_cycles_result(task, &state)
}

pub(crate) fn result_from_state(
    task: &AgentTask,
    status: AgentStatus,
    state: &TaskLoopState,
) -> AgentResult {
    AgentResult {
        task_id: task.task_id.clone(),
        status,
        final_answer: None,
        wait_reason: None,
        error: None,
        messages: state.messages.clone(),
        cycles: state.cycles.clone(),
        shared_state: state.shared_state.snapshot(),
        token_usage: TaskTokenUsage::from_cycles(&state.cycles),
    }
}

pub(crate) fn cancelled_result(task: &AgentTask, state: &TaskLoopState) -> AgentResult {
    let mut result = result_from_state(task, AgentStatus::Failed, state);
    result.error = Some(RuntimeError::Cancelled.reason_code().to_string());
    result
}

pub(crate) fn max_cycles_result(task: &AgentTask, state: &TaskLoopState) -> AgentResult {
    let mut result = result_from_state(task, AgentStatus::MaxCycles, state);
    result.final_answer = Some("Reached max cycles without finish signal.".to_string());
    result
}
