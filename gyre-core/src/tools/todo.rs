//! TODO Tool
//!
//! `todo_write` replaces the task's full TODO list. Items are validated;
//! at most one item may be `in_progress` at a time.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::tools::names::TODO_WRITE;
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::JsonMap;

const ALLOWED_STATUS: &[&str] = &["pending", "in_progress", "completed"];
const ALLOWED_PRIORITY: &[&str] = &["low", "medium", "high"];

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(TODO_WRITE, schema(), Arc::new(TodoWrite))
        .expect("todo_write registers once");
}

fn schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": TODO_WRITE,
            "description": "Replace the full TODO list. Send every item each time; omitted items are removed.",
            "parameters": {
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "title": {"type": "string"},
                                "status": {"type": "string", "enum": ALLOWED_STATUS},
                                "priority": {"type": "string", "enum": ALLOWED_PRIORITY}
                            },
                            "required": ["title", "status"]
                        }
                    }
                },
                "required": ["todos"]
            }
        }
    })
}

struct TodoWrite;

#[async_trait]
impl ToolHandler for TodoWrite {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let todos = match args.get("todos") {
            Some(Value::Array(items)) => items.clone(),
            _ => return Ok(ToolOutput::error("`todos` must be an array", "invalid_todos_payload")),
        };

        let existing = ctx.shared_state.todo_list();
        let existing_by_id: std::collections::HashMap<String, &Value> = existing
            .iter()
            .filter_map(|item| {
                item.get("id")
                    .and_then(Value::as_str)
                    .map(|id| (id.to_string(), item))
            })
            .collect();

        let now = Utc::now().to_rfc3339();
        let mut new_list: Vec<Value> = Vec::with_capacity(todos.len());

        for (index, raw) in todos.iter().enumerate() {
            let item = match raw.as_object() {
                Some(item) => item,
                None => {
                    return Ok(ToolOutput::error(
                        format!("TODO item at index {index} must be an object"),
                        "invalid_todo_item",
                    ))
                }
            };

            let title = item
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if title.is_empty() {
                return Ok(ToolOutput::error(
                    format!("TODO item at index {index} is missing `title`"),
                    "todo_title_required",
                ));
            }

            let status = item
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_ascii_lowercase();
            if !ALLOWED_STATUS.contains(&status.as_str()) {
                return Ok(ToolOutput::error(
                    format!("TODO item {title} has invalid status {status}"),
                    "invalid_todo_status",
                ));
            }

            let priority = item
                .get("priority")
                .and_then(Value::as_str)
                .unwrap_or("medium")
                .to_ascii_lowercase();
            if !ALLOWED_PRIORITY.contains(&priority.as_str()) {
                return Ok(ToolOutput::error(
                    format!("TODO item {title} has invalid priority {priority}"),
                    "invalid_todo_priority",
                ));
            }

            let id = item
                .get("id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

            let created_at = existing_by_id
                .get(&id)
                .and_then(|prev| prev.get("created_at"))
                .and_then(Value::as_str)
                .unwrap_or(&now)
                .to_string();

            new_list.push(json!({
                "id": id,
                "title": title,
                "status": status,
                "priority": priority,
                "created_at": created_at,
                "updated_at": now,
            }));
        }

        let in_progress = new_list
            .iter()
            .filter(|item| item.get("status").and_then(Value::as_str) == Some("in_progress"))
            .count();
        if in_progress > 1 {
            return Ok(ToolOutput::error(
                "Only one TODO item can be in_progress at a time",
                "multiple_in_progress_todos",
            ));
        }

        let count = new_list.len();
        ctx.shared_state.insert("todo_list", json!(new_list));

        Ok(ToolOutput::success(json!({
            "action": "write",
            "todos": new_list,
            "count": count,
            "message": format!("TODO list updated successfully with {count} items"),
        })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
