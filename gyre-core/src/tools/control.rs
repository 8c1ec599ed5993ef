//! Control Tools
//!
//! `task_finish` ends the task (guarded by TODO completion) and
//! `ask_user` suspends it for user input.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::{ASK_USER, TASK_FINISH, TODO_INCOMPLETE_ERROR_CODE};
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::{JsonMap, ToolDirective};

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(TASK_FINISH, task_finish_schema(), Arc::new(TaskFinish))
        .expect("task_finish registers once");
    registry
        .register(ASK_USER, ask_user_schema(), Arc::new(AskUser))
        .expect("ask_user registers once");
}

fn task_finish_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": TASK_FINISH,
            "description": "Finish the task and report the final answer. Refused while TODO items are incomplete unless require_all_todos_completed is false.",
            "parameters": {
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "Final answer presented to the caller."
                    },
                    "require_all_todos_completed": {
                        "type": "boolean",
                        "description": "Refuse to finish while TODO items are open (default true)."
                    }
                },
                "required": ["answer"]
            }
        }
    })
}

fn ask_user_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": ASK_USER,
            "description": "Suspend the task and ask the user a question. The task resumes when the user answers.",
            "parameters": {
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "options": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional answer choices."
                    },
                    "selection_type": {
                        "type": "string",
                        "enum": ["single", "multi"]
                    },
                    "allow_custom_options": {"type": "boolean"}
                },
                "required": ["question"]
            }
        }
    })
}

struct TaskFinish;

#[async_trait]
impl ToolHandler for TaskFinish {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let answer = args
            .get("answer")
            .or_else(|| args.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Task completed")
            .to_string();
        let require_all_done = args
            .get("require_all_todos_completed")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let incomplete: Vec<String> = ctx
            .shared_state
            .todo_list()
            .iter()
            .filter_map(|item| item.as_object())
            .filter(|item| {
                let status = item
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending")
                    .to_ascii_lowercase();
                !matches!(status.as_str(), "completed" | "done" | "finished")
            })
            .map(|item| {
                item.get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Untitled TODO")
                    .to_string()
            })
            .collect();

        if require_all_done && !incomplete.is_empty() {
            let mut output = ToolOutput::error(
                "Cannot finish task while todo items are incomplete",
                TODO_INCOMPLETE_ERROR_CODE,
            );
            output.payload["incomplete_todos"] = json!(incomplete);
            return Ok(output);
        }

        let mut metadata = JsonMap::new();
        metadata.insert("final_message".into(), json!(answer));
        Ok(
            ToolOutput::success(json!({"ok": true, "answer": answer}))
                .with_directive(ToolDirective::Finish)
                .with_metadata(metadata),
        )
    }
}

struct AskUser;

#[async_trait]
impl ToolHandler for AskUser {
    async fn handle(&self, _ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("Need user input")
            .to_string();
        let selection_type = match args.get("selection_type").and_then(Value::as_str) {
            Some("multi") => "multi",
            _ => "single",
        };
        let allow_custom_options = args
            .get("allow_custom_options")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let options: Option<Vec<String>> = args.get("options").and_then(Value::as_array).map(|raw| {
            let mut seen = std::collections::HashSet::new();
            raw.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|opt| !opt.is_empty() && seen.insert(opt.to_string()))
                .map(str::to_string)
                .collect()
        });

        let mut payload = json!({
            "question": question,
            "selection_type": selection_type,
            "allow_custom_options": allow_custom_options,
        });
        if let Some(options) = options.filter(|opts| !opts.is_empty()) {
            payload["options"] = json!(options);
        }

        let metadata = match &payload {
            Value::Object(map) => map.clone(),
            _ => JsonMap::new(),
        };
        Ok(ToolOutput::success(payload)
            .with_directive(ToolDirective::WaitUser)
            .with_metadata(metadata))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{args, context};
    use crate::types::ToolResultStatus;

    #[tokio::test]
    async fn task_finish_reports_answer() {
        let (_dir, ctx) = context();
        let output = TaskFinish
            .handle(&ctx, args(json!({"answer": "hi"})))
            .await
            .unwrap();
        assert_eq!(output.directive, ToolDirective::Finish);
        assert_eq!(output.metadata["final_message"], "hi");
        assert_eq!(output.payload["answer"], "hi");
    }

    #[tokio::test]
    async fn task_finish_guards_incomplete_todos() {
        let (_dir, ctx) = context();
        ctx.shared_state.insert(
            "todo_list",
            json!([{"title": "x", "status": "pending"}]),
        );

        let output = TaskFinish
            .handle(&ctx, args(json!({"answer": "done"})))
            .await
            .unwrap();
        assert_eq!(
            output.error_code.as_deref(),
            Some(TODO_INCOMPLETE_ERROR_CODE)
        );
        assert_eq!(output.directive, ToolDirective::Continue);
        assert_eq!(output.payload["incomplete_todos"], json!(["x"]));
    }

    #[tokio::test]
    async fn task_finish_override_skips_guard() {
        let (_dir, ctx) = context();
        ctx.shared_state.insert(
            "todo_list",
            json!([{"title": "x", "status": "pending"}]),
        );

        let output = TaskFinish
            .handle(
                &ctx,
                args(json!({"answer": "done", "require_all_todos_completed": false})),
            )
            .await
            .unwrap();
        assert_eq!(output.directive, ToolDirective::Finish);
    }

    #[tokio::test]
    async fn completed_todos_do_not_block() {
        let (_dir, ctx) = context();
        ctx.shared_state.insert(
            "todo_list",
            json!([{"title": "x", "status": "completed"}]),
        );
        let output = TaskFinish
            .handle(&ctx, args(json!({"answer": "done"})))
            .await
            .unwrap();
        assert_eq!(output.directive, ToolDirective::Finish);
    }

    #[tokio::test]
    async fn ask_user_waits_with_question() {
        let (_dir, ctx) = context();
        let output = AskUser
            .handle(&ctx, args(json!({"question": "what is your name?"})))
            .await
            .unwrap();
        assert_eq!(output.directive, ToolDirective::WaitUser);
        assert_eq!(output.status_code, ToolResultStatus::Success);
        assert_eq!(output.metadata["question"], "what is your name?");
    }

    #[tokio::test]
    async fn ask_user_normalizes_options() {
        let (_dir, ctx) = context();
        let output = AskUser
            .handle(
                &ctx,
                args(json!({
                    "question": "pick",
                    "options": ["a", " a ", "", "b"],
                    "selection_type": "bogus"
                })),
            )
            .await
            .unwrap();
        assert_eq!(output.payload["options"], json!(["a", "b"]));
        assert_eq!(output.payload["selection_type"], "single");
    }
}
