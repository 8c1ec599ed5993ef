//! Worker-Pool Backend
//!
//! Runs cycle loops on worker tasks bounded by a concurrency limit.
//! `run_task` waits for a slot, so combining it with [`submit_task`]
//! gives non-blocking submission with bounded parallelism across tasks.
//!
//! [`submit_task`]: crate::backends::submit_task

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::backends::{drive_loop, CycleDriver, ExecutionBackend, TaskLoopState};
use crate::context::ExecutionContext;
use crate::types::{AgentResult, AgentTask};

pub struct ThreadBackend {
    slots: Arc<Semaphore>,
    max_workers: usize,
}

impl ThreadBackend {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl ExecutionBackend for ThreadBackend {
    async fn run_task(
        &self,
        task: AgentTask,
        state: TaskLoopState,
        driver: Arc<dyn CycleDriver>,
        ctx: ExecutionContext,
    ) -> AgentResult {
        let permit = self
            .slots
            .acquire()
            .await
            .expect("worker-pool semaphore never closes");
        debug!(task_id = %task.task_id, "worker slot acquired");
        let result = drive_loop(&task, state, driver.as_ref(), &ctx).await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::submit_task;
    use crate::tools::SharedState;
    use crate::types::{AgentStatus, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver that records its peak concurrency.
    struct ConcurrencyProbe {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CycleDriver for ConcurrencyProbe {
        async fn run_cycle(
            &self,
            _cycle_index: u32,
            state: &mut TaskLoopState,
            _ctx: &ExecutionContext,
        ) -> Option<AgentResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let task = AgentTask::new("t", "m", "s", "u");
            let mut result =
                crate::backends::result_from_state(&task, AgentStatus::Completed, state);
            result.final_answer = Some("done".into());
            Some(result)
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let backend: Arc<dyn ExecutionBackend> = Arc::new(ThreadBackend::new(2));
        let probe = Arc::new(ConcurrencyProbe {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let handles: Vec<_> = (0..6)
            .map(|index| {
                submit_task(
                    backend.clone(),
                    AgentTask::new(format!("t{index}"), "m", "s", "u"),
                    TaskLoopState::new(vec![Message::system("s")], SharedState::default()),
                    probe.clone(),
                    ExecutionContext::new(),
                )
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.status, AgentStatus::Completed);
        }
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }
}
