//! Sub-Agent Delegation Tools
//!
//! `create_sub_task` runs one named sub-agent to a terminal state;
//! `batch_sub_tasks` fans several out in parallel. Batch results are
//! aggregated in call order regardless of completion order.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::{BATCH_SUB_TASKS, CREATE_SUB_TASK};
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::{AgentStatus, JsonMap, SubTaskOutcome, SubTaskRequest};

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(CREATE_SUB_TASK, create_schema(), Arc::new(CreateSubTask))
        .expect("create_sub_task registers once");
    registry
        .register(BATCH_SUB_TASKS, batch_schema(), Arc::new(BatchSubTasks))
        .expect("batch_sub_tasks registers once");
}

fn create_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": CREATE_SUB_TASK,
            "description": "Delegate a task to a named sub-agent and wait for its final answer.",
            "parameters": {
                "type": "object",
                "properties": {
                    "agent_name": {"type": "string"},
                    "task_description": {"type": "string"},
                    "output_requirements": {"type": "string"},
                    "include_main_summary": {"type": "boolean"}
                },
                "required": ["agent_name", "task_description"]
            }
        }
    })
}

fn batch_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": BATCH_SUB_TASKS,
            "description": "Run several sub-agent tasks in parallel. Results are reported in call order.",
            "parameters": {
                "type": "object",
                "properties": {
                    "agent_name": {"type": "string"},
                    "tasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "task_description": {"type": "string"},
                                "output_requirements": {"type": "string"}
                            },
                            "required": ["task_description"]
                        }
                    },
                    "include_main_summary": {"type": "boolean"}
                },
                "required": ["agent_name", "tasks"]
            }
        }
    })
}

fn resolve_agent_name(args: &JsonMap) -> String {
    for key in ["agent_name", "agent_id"] {
        if let Some(value) = args.get(key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn outcome_payload(outcome: &SubTaskOutcome) -> Value {
    serde_json::to_value(outcome).unwrap_or_else(|_| json!({}))
}

fn outcome_metadata(payload: &Value) -> JsonMap {
    match payload {
        Value::Object(map) => map.clone(),
        _ => JsonMap::new(),
    }
}

struct CreateSubTask;

#[async_trait]
impl ToolHandler for CreateSubTask {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let runner = match &ctx.sub_tasks {
            Some(runner) => runner.clone(),
            None => {
                return Ok(ToolOutput::error(
                    "Sub-agent runtime is not available for this task",
                    "sub_agents_not_enabled",
                ))
            }
        };

        let agent_name = resolve_agent_name(&args);
        if agent_name.is_empty() {
            return Ok(ToolOutput::error(
                "`agent_name` is required",
                "agent_name_required",
            ));
        }
        let task_description = args
            .get("task_description")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if task_description.is_empty() {
            return Ok(ToolOutput::error(
                "`task_description` is required",
                "task_description_required",
            ));
        }

        let mut request = SubTaskRequest::new(agent_name, task_description);
        request.output_requirements = args
            .get("output_requirements")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        request.include_main_summary = args
            .get("include_main_summary")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let outcome = runner.run(request).await;
        let payload = outcome_payload(&outcome);
        let metadata = outcome_metadata(&payload);

        if outcome.status == AgentStatus::Completed {
            return Ok(ToolOutput::success(payload).with_metadata(metadata));
        }
        let error_code = if outcome.status == AgentStatus::WaitUser {
            "sub_task_wait_user"
        } else {
            "sub_task_failed"
        };
        let mut output = ToolOutput::error(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("sub-agent ended with status {}", outcome.status)),
            error_code,
        );
        output.payload = payload;
        output.metadata = metadata;
        Ok(output)
    }
}

struct BatchSubTasks;

#[async_trait]
impl ToolHandler for BatchSubTasks {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let runner = match &ctx.sub_tasks {
            Some(runner) => runner.clone(),
            None => {
                return Ok(ToolOutput::error(
                    "Sub-agent runtime is not available for this task",
                    "sub_agents_not_enabled",
                ))
            }
        };

        let agent_name = resolve_agent_name(&args);
        if agent_name.is_empty() {
            return Ok(ToolOutput::error(
                "`agent_name` is required",
                "agent_name_required",
            ));
        }
        let raw_tasks = match args.get("tasks").and_then(Value::as_array) {
            Some(tasks) if !tasks.is_empty() => tasks.clone(),
            _ => {
                return Ok(ToolOutput::error(
                    "`tasks` must be a non-empty array",
                    "invalid_tasks_payload",
                ))
            }
        };
        let include_main_summary = args
            .get("include_main_summary")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Validate up front; invalid entries keep their slot in the report.
        let mut slots: Vec<std::result::Result<SubTaskRequest, String>> = Vec::new();
        for (index, item) in raw_tasks.iter().enumerate() {
            let Some(item) = item.as_object() else {
                slots.push(Err("Task item must be an object".to_string()));
                continue;
            };
            let description = item
                .get("task_description")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if description.is_empty() {
                slots.push(Err("`task_description` is required".to_string()));
                continue;
            }
            let mut request = SubTaskRequest::new(agent_name.clone(), description);
            request.output_requirements = item
                .get("output_requirements")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            request.include_main_summary = include_main_summary;
            request
                .metadata
                .insert("batch_index".into(), json!(index));
            slots.push(Ok(request));
        }

        let requests: Vec<SubTaskRequest> = slots
            .iter()
            .filter_map(|slot| slot.as_ref().ok().cloned())
            .collect();
        let mut outcomes = runner.run_batch(requests).await.into_iter();

        let mut results: Vec<Value> = Vec::with_capacity(slots.len());
        let mut completed = 0usize;
        let mut failed = 0usize;
        for (index, slot) in slots.iter().enumerate() {
            match slot {
                Err(error) => {
                    failed += 1;
                    results.push(json!({
                        "index": index,
                        "status": AgentStatus::Failed,
                        "error": error,
                    }));
                }
                Ok(_) => {
                    let outcome = outcomes
                        .next()
                        .expect("one outcome per valid batch request");
                    if outcome.status == AgentStatus::Completed {
                        completed += 1;
                    } else {
                        failed += 1;
                    }
                    let mut payload = outcome_payload(&outcome);
                    payload["index"] = json!(index);
                    results.push(payload);
                }
            }
        }

        let payload = json!({
            "summary": {
                "total": slots.len(),
                "completed": completed,
                "failed": failed,
            },
            "results": results,
        });
        let metadata = outcome_metadata(&payload);

        if completed == 0 {
            let mut output =
                ToolOutput::error("all batch sub-tasks failed", "batch_sub_tasks_failed");
            output.payload = payload;
            output.metadata = metadata;
            return Ok(output);
        }
        Ok(ToolOutput::success(payload).with_metadata(metadata))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
