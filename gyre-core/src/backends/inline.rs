//! Inline Backend
//!
//! Default backend: the caller's task drives the cycle loop to a terminal
//! state before `run_task` returns.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{drive_loop, CycleDriver, ExecutionBackend, TaskLoopState};
use crate::context::ExecutionContext;
use crate::types::{AgentResult, AgentTask};

#[derive(Debug, Clone, Copy, Default)]
pub struct InlineBackend;

impl InlineBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for InlineBackend {
    async fn run_task(
        &self,
        task: AgentTask,
        state: TaskLoopState,
        driver: Arc<dyn CycleDriver>,
        ctx: ExecutionContext,
    ) -> AgentResult {
        drive_loop(&task, state, driver.as_ref(), &ctx).await
    }
}
