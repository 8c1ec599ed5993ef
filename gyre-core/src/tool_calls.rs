//! Tool Call Runner
//!
//! Executes a cycle's tool calls in declared order, appends the resulting
//! tool messages, and converges the per-cycle directive. Once a call
//! yields a terminal directive the remaining calls are skipped (each with
//! an explanatory ERROR result so the assistant/tool pairing holds), and
//! queued steering messages likewise short-circuit the rest of the cycle.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::errors::RuntimeError;
use crate::hooks::HookManager;
use crate::tools::dispatcher::dispatch_tool_call;
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{
    AgentTask, CycleRecord, JsonMap, Message, ToolCall, ToolDirective, ToolExecutionResult,
    ToolResultStatus,
};

/// Supplies user messages queued while the cycle was running (steering).
pub type InterruptionProvider = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// What one cycle's tool execution produced.
#[derive(Debug, Default)]
pub struct ToolRunOutcome {
    /// The result whose directive decided the cycle, if terminal.
    pub directive_result: Option<ToolExecutionResult>,
    /// Converged cycle directive: finish dominates wait_user dominates
    /// continue.
    pub directive: ToolDirective,
    /// A result asked for compaction at the next cycle start.
    pub pending_compress: bool,
    /// Steering messages to append after this cycle.
    pub interruption_messages: Vec<Message>,
}

/// Converge executed results into the cycle directive.
pub fn converge_directives(results: &[ToolExecutionResult]) -> ToolDirective {
    if results
        .iter()
        .any(|r| r.directive == ToolDirective::Finish)
    {
        ToolDirective::Finish
    } else if results
        .iter()
        .any(|r| r.directive == ToolDirective::WaitUser)
    {
        ToolDirective::WaitUser
    } else {
        ToolDirective::Continue
    }
}

pub struct ToolCallRunner {
    hooks: HookManager,
}

impl ToolCallRunner {
    pub fn new(hooks: HookManager) -> Self {
        Self { hooks }
    }

    pub async fn run(
        &self,
        task: &AgentTask,
        registry: &ToolRegistry,
        tool_calls: &[ToolCall],
        context: &ToolContext,
        messages: &mut Vec<Message>,
        record: &mut CycleRecord,
        interruptions: Option<&InterruptionProvider>,
    ) -> Result<ToolRunOutcome, RuntimeError> {
        let mut outcome = ToolRunOutcome::default();

        for (index, call) in tool_calls.iter().enumerate() {
            // Cancellation point between tool calls; the in-flight call is
            // never interrupted from here.
            context.exec.check_cancelled()?;

            let (patched_call, short_circuit) = self
                .hooks
                .apply_before_tool_call(task, record.index, call.clone())
                .await;

            let result = match short_circuit {
                Some(result) => result,
                None => dispatch_tool_call(registry, context, &patched_call).await,
            };
            let mut result = self
                .hooks
                .apply_after_tool_call(task, record.index, &patched_call, result)
                .await;
            if needs_call_id(&result.tool_call_id) {
                result.tool_call_id = patched_call.id.clone();
            }

            info!(
                task_id = %task.task_id,
                cycle = record.index,
                tool = %patched_call.name,
                tool_call_id = %result.tool_call_id,
                status = ?result.status_code,
                directive = ?result.directive,
                error_code = result.error_code.as_deref().unwrap_or(""),
                "tool executed"
            );

            if result.status_code == ToolResultStatus::PendingCompress {
                outcome.pending_compress = true;
            }

            messages.push(result.to_tool_message());
            append_image_notification(&result, messages);
            let directive = result.directive;
            if directive != ToolDirective::Continue {
                outcome.directive_result = Some(result.clone());
            }
            record.tool_results.push(result);

            if directive != ToolDirective::Continue {
                let (code, reason) = if directive == ToolDirective::Finish {
                    (
                        "skipped_due_to_finish",
                        "Tool skipped because a previous tool finished the task.",
                    )
                } else {
                    (
                        "skipped_due_to_wait_user",
                        "Tool skipped because a previous tool requested user input.",
                    )
                };
                skip_remaining(&tool_calls[index + 1..], code, reason, messages, record);
                break;
            }

            if task.allow_interruption {
                if let Some(provider) = interruptions {
                    let pending = provider();
                    if !pending.is_empty() {
                        debug!(
                            task_id = %task.task_id,
                            cycle = record.index,
                            steering_count = pending.len(),
                            "steering messages queued, skipping remaining calls"
                        );
                        outcome.interruption_messages = pending;
                        skip_remaining(
                            &tool_calls[index + 1..],
                            "skipped_due_to_steering",
                            "Tool skipped due to queued steering message.",
                            messages,
                            record,
                        );
                        break;
                    }
                }
            }
        }

        outcome.directive = converge_directives(&record.tool_results);
        record.directive = outcome.directive;
        Ok(outcome)
    }
}

fn needs_call_id(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed == "pending"
}

/// Announce a produced image so the next turn can reference it.
fn append_image_notification(result: &ToolExecutionResult, messages: &mut Vec<Message>) {
    if let Some(url) = &result.image_url {
        let reference = result.image_path.as_deref().unwrap_or(url);
        messages.push(Message::user(format!("[Image loaded] {reference}")).with_image_url(url));
    } else if let Some(path) = &result.image_path {
        messages.push(Message::user(format!("[Image loaded] {path}")));
    }
}

fn skip_remaining(
    skipped_calls: &[ToolCall],
    error_code: &str,
    reason: &str,
    messages: &mut Vec<Message>,
    record: &mut CycleRecord,
) {
    for call in skipped_calls {
        let payload = json!({
            "ok": false,
            "error": reason,
            "error_code": error_code,
        });
        let result = ToolExecutionResult {
            tool_call_id: call.id.clone(),
            content: payload.to_string(),
            status_code: ToolResultStatus::Error,
            directive: ToolDirective::Continue,
            error_code: Some(error_code.to_string()),
            metadata: JsonMap::new(),
            image_url: None,
            image_path: None,
        };
        messages.push(result.to_tool_message());
        record.tool_results.push(result);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
