//! End-to-end runtime scenarios driven by scripted chat clients.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use gyre_core::{
    AgentRuntime, AgentStatus, AgentTask, CancelToken, ChatClient, ChatCompletion, ChatRequest,
    ExecutionContext, InMemoryStateStore, InProcessDispatcher, QueueBackend, Role, RunOptions,
    RuntimeRecipe, ScriptedChatClient, StateStore, SubAgentConfig, ToolCall, ToolDirective,
};

fn task(task_id: &str, user_prompt: &str) -> AgentTask {
    let mut task = AgentTask::new(task_id, "test-model", "you are helpful", user_prompt);
    task.use_workspace = false;
    task
}

fn finish_call(answer: &str) -> ToolCall {
    ToolCall::new("tc_finish", "task_finish", json!({"answer": answer}))
}

fn runtime_with_script(responses: Vec<ChatCompletion>) -> (AgentRuntime, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::builder(Arc::new(ScriptedChatClient::new(responses)))
        .with_default_workspace(dir.path())
        .build()
        .unwrap();
    (runtime, dir)
}

// ---------------------------------------------------------------------------
// Scenario 1: simple completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_completion() {
    let (runtime, _dir) = runtime_with_script(vec![
        ChatCompletion::text("").with_tool_call(finish_call("hi"))
    ]);

    let result = runtime
        .run(task("t1", "say hi then finish"), RunOptions::default())
        .await;

    assert_eq!(result.status, AgentStatus::Completed);
    assert_eq!(result.final_answer.as_deref(), Some("hi"));
    assert_eq!(result.cycles.len(), 1);
    assert_eq!(result.cycles[0].directive, ToolDirective::Finish);
}

// ---------------------------------------------------------------------------
// Scenario 2: wait-user then resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_user_then_resume() {
    let (runtime, dir) = runtime_with_script(vec![ChatCompletion::text("").with_tool_call(
        ToolCall::new("tc_ask", "ask_user", json!({"question": "what is your name?"})),
    )]);

    let first = runtime
        .run(task("t2", "ask my name"), RunOptions::default())
        .await;
    assert_eq!(first.status, AgentStatus::WaitUser);
    assert_eq!(first.wait_reason.as_deref(), Some("what is your name?"));

    // Resume with the user's answer on a fresh script.
    let resumed_runtime = AgentRuntime::builder(Arc::new(ScriptedChatClient::new(vec![
        ChatCompletion::text("").with_tool_call(finish_call("hi Ada")),
    ])))
    .with_default_workspace(dir.path())
    .build()
    .unwrap();

    let second = resumed_runtime
        .run(
            task("t2", "ask my name"),
            RunOptions::default().resuming(first.messages, "Ada"),
        )
        .await;
    assert_eq!(second.status, AgentStatus::Completed);
    assert_eq!(second.final_answer.as_deref(), Some("hi Ada"));
    // The resumed conversation still carries the original question.
    assert!(second
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content == "Ada"));
}

// ---------------------------------------------------------------------------
// Scenario 3: max cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_cycles_with_noop_tool_calls() {
    let noop = || {
        ChatCompletion::text("")
            .with_tool_call(ToolCall::new("tc_noop", "todo_write", json!({"todos": []})))
    };
    let (runtime, _dir) = runtime_with_script(vec![noop(), noop(), noop()]);

    let mut task = task("t3", "spin");
    task.max_cycles = 2;
    let result = runtime.run(task, RunOptions::default()).await;

    assert_eq!(result.status, AgentStatus::MaxCycles);
    assert_eq!(result.cycles.len(), 2);
}

// ---------------------------------------------------------------------------
// Scenario 4: todo guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn todo_guard_blocks_finish_until_done() {
    let (runtime, _dir) = runtime_with_script(vec![
        // Cycle 1: open a todo, then try to finish in the same cycle.
        ChatCompletion::text("")
            .with_tool_call(ToolCall::new(
                "tc_todo",
                "todo_write",
                json!({"todos": [{"id": "x1", "title": "x", "status": "pending"}]}),
            ))
            .with_tool_call(ToolCall::new("tc_f1", "task_finish", json!({"answer": "early"}))),
        // Cycle 2: complete the todo and finish properly.
        ChatCompletion::text("")
            .with_tool_call(ToolCall::new(
                "tc_todo2",
                "todo_write",
                json!({"todos": [{"id": "x1", "title": "x", "status": "completed"}]}),
            ))
            .with_tool_call(ToolCall::new("tc_f2", "task_finish", json!({"answer": "done"}))),
    ]);

    let result = runtime.run(task("t4", "do x then finish"), RunOptions::default()).await;

    assert_eq!(result.status, AgentStatus::Completed);
    assert_eq!(result.final_answer.as_deref(), Some("done"));
    assert_eq!(result.cycles.len(), 2);

    let guarded = &result.cycles[0].tool_results[1];
    assert_eq!(guarded.error_code.as_deref(), Some("todo_incomplete"));
    assert_eq!(result.cycles[0].directive, ToolDirective::Continue);
}

// ---------------------------------------------------------------------------
// Scenario 5: sub-agent batch preserves call order
// ---------------------------------------------------------------------------

/// Routes completions by conversation shape: the parent's first turn
/// issues the batch, its second turn finishes; children answer from their
/// prompt.
struct RoutedClient;

#[async_trait]
impl ChatClient for RoutedClient {
    async fn complete(&self, request: ChatRequest<'_>) -> Result<ChatCompletion> {
        let user_prompt = request
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let has_tool_result = request.messages.iter().any(|m| m.role == Role::Tool);

        if user_prompt.starts_with("fan out") {
            if has_tool_result {
                return Ok(ChatCompletion::text("").with_tool_call(finish_call("batch done")));
            }
            return Ok(ChatCompletion::text("").with_tool_call(ToolCall::new(
                "tc_batch",
                "batch_sub_tasks",
                json!({
                    "agent_name": "a",
                    "tasks": [{"task_description": "p1"}, {"task_description": "p2"}]
                }),
            )));
        }

        // Child turns: answer r1/r2 based on the prompt.
        let answer = if user_prompt.contains("p1") { "r1" } else { "r2" };
        Ok(ChatCompletion::text("").with_tool_call(finish_call(answer)))
    }
}

#[tokio::test]
async fn batch_sub_tasks_preserve_call_order() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::builder(Arc::new(RoutedClient))
        .with_default_workspace(dir.path())
        .build()
        .unwrap();

    let mut task = task("t5", "fan out to the workers");
    task.sub_agents
        .insert("a".into(), SubAgentConfig::new("test-model", "echo worker"));

    let result = runtime.run(task, RunOptions::default()).await;
    assert_eq!(result.status, AgentStatus::Completed);

    let batch_result = &result.cycles[0].tool_results[0];
    let payload: Value = serde_json::from_str(&batch_result.content).unwrap();
    let answers: Vec<&str> = payload["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["final_answer"].as_str().unwrap())
        .collect();
    assert_eq!(answers, vec!["r1", "r2"]);
    assert_eq!(payload["summary"]["completed"], 2);
}

// ---------------------------------------------------------------------------
// Streaming equivalence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_and_non_streaming_runs_agree() {
    let script = || {
        vec![ChatCompletion::text("let me finish").with_tool_call(finish_call("answer"))]
    };

    let (runtime, _dir) = runtime_with_script(script());
    let plain = runtime.run(task("t6", "go"), RunOptions::default()).await;

    let (runtime, _dir2) = runtime_with_script(script());
    let streamed_text = Arc::new(std::sync::Mutex::new(String::new()));
    let sink_target = streamed_text.clone();
    let ctx = ExecutionContext::new()
        .with_stream(Arc::new(move |s: &str| sink_target.lock().unwrap().push_str(s)));
    let streamed = runtime
        .run(task("t6", "go"), RunOptions::default().with_ctx(ctx))
        .await;

    assert_eq!(plain.status, streamed.status);
    assert_eq!(plain.final_answer, streamed.final_answer);
    assert_eq!(
        plain.cycles[0].assistant_message,
        streamed.cycles[0].assistant_message
    );
    assert_eq!(plain.cycles[0].tool_calls, streamed.cycles[0].tool_calls);
    assert_eq!(*streamed_text.lock().unwrap(), "let me finish");
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels the run's token during its second completion call.
struct CancellingClient {
    cancel: CancelToken,
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl ChatClient for CancellingClient {
    async fn complete(&self, _request: ChatRequest<'_>) -> Result<ChatCompletion> {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call >= 1 {
            self.cancel.cancel();
        }
        Ok(ChatCompletion::text("")
            .with_tool_call(ToolCall::new("tc_noop", "todo_write", json!({"todos": []}))))
    }
}

#[tokio::test]
async fn cancellation_mid_run_fails_with_cancelled() {
    let cancel = CancelToken::new();
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::builder(Arc::new(CancellingClient {
        cancel: cancel.clone(),
        calls: std::sync::atomic::AtomicU32::new(0),
    }))
    .with_default_workspace(dir.path())
    .build()
    .unwrap();

    let ctx = ExecutionContext::new().with_cancel(cancel);
    let result = runtime
        .run(task("t7", "loop"), RunOptions::default().with_ctx(ctx))
        .await;

    assert_eq!(result.status, AgentStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
    // Cycle 1 completed; cancellation landed during cycle 2.
    assert!(result.cycles.len() <= 2);
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpoints_persist_per_cycle_when_store_is_configured() {
    let (runtime, _dir) = runtime_with_script(vec![
        ChatCompletion::text("")
            .with_tool_call(ToolCall::new("tc_noop", "todo_write", json!({"todos": []}))),
        ChatCompletion::text("").with_tool_call(finish_call("done")),
    ]);

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let ctx = ExecutionContext::new().with_state_store(store.clone());
    let result = runtime
        .run(task("t8", "two cycles"), RunOptions::default().with_ctx(ctx))
        .await;
    assert_eq!(result.status, AgentStatus::Completed);

    // One save per cycle: the version counter advanced monotonically.
    let checkpoint = store.load("t8").await.unwrap().unwrap();
    assert_eq!(checkpoint.version, 2);
    assert_eq!(checkpoint.checkpoint.cycle_index, 2);
    assert_eq!(checkpoint.checkpoint.cycles.len(), 2);
}

// ---------------------------------------------------------------------------
// Distributed queue with the engine driver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn distributed_queue_runs_cycles_through_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let script = vec![
        ChatCompletion::text("")
            .with_tool_call(ToolCall::new("tc_noop", "todo_write", json!({"todos": []}))),
        ChatCompletion::text("").with_tool_call(finish_call("distributed done")),
    ];
    let base = AgentRuntime::builder(Arc::new(ScriptedChatClient::new(script)))
        .with_default_workspace(dir.path())
        .build()
        .unwrap();

    let queue_task = task("t9", "work remotely");
    let driver = base.cycle_driver(&queue_task).unwrap();
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let dispatcher = Arc::new(InProcessDispatcher::new(driver, store.clone()));
    let recipe = RuntimeRecipe {
        settings_file: "settings.toml".into(),
        backend: "main".into(),
        model: "test-model".into(),
        workspace: dir.path().display().to_string(),
        timeout_seconds: 90.0,
        log_preview_chars: None,
    };
    let backend = Arc::new(QueueBackend::new(dispatcher, store.clone(), Some(recipe)));

    let runtime = AgentRuntime::builder(Arc::new(ScriptedChatClient::new(vec![])))
        .with_backend(backend)
        .with_default_workspace(dir.path())
        .build()
        .unwrap();

    let result = runtime.run(queue_task, RunOptions::default()).await;
    assert_eq!(result.status, AgentStatus::Completed);
    assert_eq!(result.final_answer.as_deref(), Some("distributed done"));
    assert_eq!(result.cycles.len(), 2);
    // The terminal worker removed the checkpoint.
    assert!(store.load("t9").await.unwrap().is_none());
}
