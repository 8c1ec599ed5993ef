//! Cycle Runner
//!
//! One model turn: compact memory if due, plan the visible tools, call the
//! chat client (streaming or not), and capture the assistant message plus
//! its tool-call list as a cycle record. Streaming tool-call fragments are
//! aggregated here so every client speaks the same delta dialect.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::hooks::HookManager;
use crate::llm::{ChatClient, ChatCompletion, ChatDelta, ChatRequest, ToolCallDelta};
use crate::memory::{CompactionInput, MemoryManager};
use crate::planner::plan_tool_schemas;
use crate::tools::ToolRegistry;
use crate::types::{AgentTask, CycleRecord, JsonMap, Message, TokenUsage, ToolCall};

// ---------------------------------------------------------------------------
// Tool-call delta aggregation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments into complete calls.
///
/// Tolerates both provider dialects: deltas carrying `{name, fragment}`
/// every chunk, and deltas carrying only an argument fragment identified
/// by the provider index or implicitly by the last active call. Fragments
/// are concatenated in arrival order and JSON-parsed at finalization.
#[derive(Default)]
pub struct ToolCallAggregator {
    slots: BTreeMap<u32, Slot>,
    last_active: Option<u32>,
    synthetic_index: u32,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: ToolCallDelta) {
        let named = delta.name.as_deref().is_some_and(|n| !n.trim().is_empty());
        if named {
            let index = delta.index.unwrap_or_else(|| {
                let index = self.synthetic_index;
                self.synthetic_index += 1;
                index
            });
            let slot = self.slots.entry(index).or_default();
            if slot.name.is_empty() {
                slot.name = delta.name.unwrap_or_default().trim().to_string();
            }
            if slot.id.is_none() {
                slot.id = delta.id.filter(|id| !id.trim().is_empty());
            }
            slot.arguments.push_str(&delta.arguments_fragment);
            self.last_active = Some(index);
            return;
        }

        if delta.arguments_fragment.is_empty() {
            return;
        }

        // Bare fragment: route by explicit index, then by id, then to the
        // last active call.
        let target = delta
            .index
            .filter(|index| self.slots.contains_key(index))
            .or_else(|| {
                delta.id.as_deref().and_then(|id| {
                    self.slots
                        .iter()
                        .find(|(_, slot)| slot.id.as_deref() == Some(id))
                        .map(|(index, _)| *index)
                })
            })
            .or(self.last_active);
        if let Some(index) = target {
            if let Some(slot) = self.slots.get_mut(&index) {
                slot.arguments.push_str(&delta.arguments_fragment);
                self.last_active = Some(index);
            }
        }
    }

    /// Complete calls in provider index order. Unparseable argument
    /// payloads are kept as raw strings so the dispatcher can surface the
    /// protocol error.
    pub fn finalize(self) -> Vec<ToolCall> {
        self.slots
            .into_values()
            .filter(|slot| !slot.name.is_empty())
            .map(|slot| {
                let id = slot
                    .id
                    .unwrap_or_else(|| format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));
                let arguments = if slot.arguments.trim().is_empty() {
                    Value::Object(JsonMap::new())
                } else {
                    match serde_json::from_str::<Value>(&slot.arguments) {
                        Ok(Value::Object(map)) => Value::Object(map),
                        Ok(other) => other,
                        Err(_) => Value::String(slot.arguments),
                    }
                };
                ToolCall {
                    id,
                    name: slot.name,
                    arguments,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Cycle runner
// ---------------------------------------------------------------------------

pub struct CycleRunner {
    chat_client: Arc<dyn ChatClient>,
    hooks: HookManager,
}

impl CycleRunner {
    pub fn new(chat_client: Arc<dyn ChatClient>, hooks: HookManager) -> Self {
        Self { chat_client, hooks }
    }

    /// Run one turn. Returns the updated message list (compacted history +
    /// new assistant message) and the cycle record skeleton; tool
    /// execution happens afterwards in the tool-call runner.
    pub async fn run_cycle(
        &self,
        task: &AgentTask,
        registry: &ToolRegistry,
        memory: &MemoryManager,
        messages: Vec<Message>,
        cycle_index: u32,
        compaction: &CompactionInput,
        ctx: &ExecutionContext,
    ) -> Result<(Vec<Message>, CycleRecord)> {
        // Memory compaction, bracketed by its hooks.
        let messages = self
            .hooks
            .apply_before_memory_compact(task, cycle_index, messages)
            .await;
        let (messages, compacted) = memory.compact(messages, compaction).await;
        self.hooks
            .fire_after_memory_compact(task, cycle_index, &messages, compacted)
            .await;

        let memory_usage = memory.usage_percentage(&messages, compaction);
        let tool_schemas = plan_tool_schemas(registry, task, memory_usage);

        let (messages, tool_schemas) = self
            .hooks
            .apply_before_llm(task, cycle_index, messages, tool_schemas)
            .await;

        let options = chat_options(task);
        let request = ChatRequest {
            model: &task.model,
            messages: &messages,
            tool_schemas: &tool_schemas,
            options: &options,
        };

        info!(
            task_id = %task.task_id,
            cycle = cycle_index,
            message_count = messages.len(),
            tool_count = tool_schemas.len(),
            memory_usage,
            "calling chat client"
        );

        let response = if ctx.stream.is_some() {
            self.stream_completion(request, ctx).await?
        } else {
            self.chat_client.complete(request).await?
        };
        let response = self
            .hooks
            .apply_after_llm(task, cycle_index, &messages, response)
            .await;

        // Null arguments confuse strict providers on the next turn.
        let tool_calls: Vec<ToolCall> = response
            .tool_calls
            .into_iter()
            .map(|mut call| {
                if call.arguments.is_null() {
                    call.arguments = Value::Object(JsonMap::new());
                }
                call
            })
            .collect();

        debug!(
            task_id = %task.task_id,
            cycle = cycle_index,
            tool_calls = tool_calls.len(),
            content_len = response.content.len(),
            "chat client answered"
        );

        let mut messages = messages;
        messages.push(Message::assistant_with_calls(
            response.content.clone(),
            tool_calls.iter().map(ToolCall::to_stub).collect(),
        ));

        let mut record = CycleRecord::new(cycle_index, response.content, tool_calls);
        record.memory_compacted = compacted;
        record.token_usage = response.usage;
        Ok((messages, record))
    }

    async fn stream_completion(
        &self,
        request: ChatRequest<'_>,
        ctx: &ExecutionContext,
    ) -> Result<ChatCompletion> {
        let mut content = String::new();
        let mut aggregator = ToolCallAggregator::new();
        let mut usage = TokenUsage::default();

        {
            let mut on_delta = |delta: ChatDelta| match delta {
                ChatDelta::Text(fragment) => {
                    ctx.emit(&fragment);
                    content.push_str(&fragment);
                }
                // Tool-call argument fragments are never streamed to the sink.
                ChatDelta::ToolCall(delta) => aggregator.apply(delta),
                ChatDelta::Usage(reported) => usage = reported,
            };
            self.chat_client
                .complete_streaming(request, &mut on_delta)
                .await?;
        }

        Ok(ChatCompletion {
            content,
            tool_calls: aggregator.finalize(),
            usage,
        })
    }
}

/// Opaque provider options carried in task metadata.
fn chat_options(task: &AgentTask) -> JsonMap {
    match task.metadata.get("chat_options") {
        Some(Value::Object(map)) => map.clone(),
        _ => JsonMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
