//! Runtime Hooks
//!
//! User-provided callbacks at named lifecycle points. Hooks observe, and
//! for certain phases mutate, the runtime's inputs: a `before_llm` hook
//! may rewrite messages or schemas, a `before_tool_call` hook may patch
//! the call or short-circuit it with a ready result. Invocations for a
//! given phase are sequential, in registration order.

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ChatCompletion;
use crate::types::{AgentTask, Message, ToolCall, ToolExecutionResult};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub struct BeforeMemoryCompactEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub messages: &'a [Message],
}

pub struct AfterMemoryCompactEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub messages: &'a [Message],
    pub compacted: bool,
}

pub struct BeforeLlmEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub messages: &'a [Message],
    pub tool_schemas: &'a [Value],
}

pub struct AfterLlmEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub messages: &'a [Message],
    pub response: &'a ChatCompletion,
}

pub struct BeforeToolCallEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub call: &'a ToolCall,
}

pub struct AfterToolCallEvent<'a> {
    pub task: &'a AgentTask,
    pub cycle_index: u32,
    pub call: &'a ToolCall,
    pub result: &'a ToolExecutionResult,
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// Replacement inputs produced by a `before_llm` hook. `None` fields keep
/// the current value.
#[derive(Debug, Default)]
pub struct BeforeLlmPatch {
    pub messages: Option<Vec<Message>>,
    pub tool_schemas: Option<Vec<Value>>,
}

/// Patch produced by a `before_tool_call` hook. A `result` short-circuits
/// the dispatcher entirely.
#[derive(Debug, Default)]
pub struct BeforeToolCallPatch {
    pub call: Option<ToolCall>,
    pub result: Option<ToolExecutionResult>,
}

// ---------------------------------------------------------------------------
// Hook trait
// ---------------------------------------------------------------------------

/// Override only the phases you need; defaults observe nothing.
#[async_trait]
pub trait RuntimeHook: Send + Sync {
    async fn before_memory_compact(
        &self,
        _event: BeforeMemoryCompactEvent<'_>,
    ) -> Option<Vec<Message>> {
        None
    }

    async fn after_memory_compact(&self, _event: AfterMemoryCompactEvent<'_>) {}

    async fn before_llm(&self, _event: BeforeLlmEvent<'_>) -> Option<BeforeLlmPatch> {
        None
    }

    async fn after_llm(&self, _event: AfterLlmEvent<'_>) -> Option<ChatCompletion> {
        None
    }

    async fn before_tool_call(
        &self,
        _event: BeforeToolCallEvent<'_>,
    ) -> Option<BeforeToolCallPatch> {
        None
    }

    async fn after_tool_call(&self, _event: AfterToolCallEvent<'_>) -> Option<ToolExecutionResult> {
        None
    }
}

// ---------------------------------------------------------------------------
// Hook manager
// ---------------------------------------------------------------------------

/// Dispatches hook phases over the registered hooks. Safe to share across
/// tasks; hook state is the implementor's concern.
#[derive(Clone, Default)]
pub struct HookManager {
    hooks: std::sync::Arc<Vec<Box<dyn RuntimeHook>>>,
}

impl HookManager {
    pub fn new(hooks: Vec<Box<dyn RuntimeHook>>) -> Self {
        Self {
            hooks: std::sync::Arc::new(hooks),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn apply_before_memory_compact(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        messages: Vec<Message>,
    ) -> Vec<Message> {
        let mut current = messages;
        for hook in self.hooks.iter() {
            if let Some(replacement) = hook
                .before_memory_compact(BeforeMemoryCompactEvent {
                    task,
                    cycle_index,
                    messages: &current,
                })
                .await
            {
                current = replacement;
            }
        }
        current
    }

    pub async fn fire_after_memory_compact(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        messages: &[Message],
        compacted: bool,
    ) {
        for hook in self.hooks.iter() {
            hook.after_memory_compact(AfterMemoryCompactEvent {
                task,
                cycle_index,
                messages,
                compacted,
            })
            .await;
        }
    }

    pub async fn apply_before_llm(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        messages: Vec<Message>,
        tool_schemas: Vec<Value>,
    ) -> (Vec<Message>, Vec<Value>) {
        let mut current_messages = messages;
        let mut current_schemas = tool_schemas;
        for hook in self.hooks.iter() {
            let patch = hook
                .before_llm(BeforeLlmEvent {
                    task,
                    cycle_index,
                    messages: &current_messages,
                    tool_schemas: &current_schemas,
                })
                .await;
            if let Some(patch) = patch {
                if let Some(messages) = patch.messages {
                    current_messages = messages;
                }
                if let Some(schemas) = patch.tool_schemas {
                    current_schemas = schemas;
                }
            }
        }
        (current_messages, current_schemas)
    }

    pub async fn apply_after_llm(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        messages: &[Message],
        response: ChatCompletion,
    ) -> ChatCompletion {
        let mut current = response;
        for hook in self.hooks.iter() {
            if let Some(patched) = hook
                .after_llm(AfterLlmEvent {
                    task,
                    cycle_index,
                    messages,
                    response: &current,
                })
                .await
            {
                current = patched;
            }
        }
        current
    }

    /// Returns the (possibly patched) call, or a short-circuit result that
    /// replaces dispatch. The first hook to short-circuit wins.
    pub async fn apply_before_tool_call(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        call: ToolCall,
    ) -> (ToolCall, Option<ToolExecutionResult>) {
        let mut current = call;
        for hook in self.hooks.iter() {
            let patch = hook
                .before_tool_call(BeforeToolCallEvent {
                    task,
                    cycle_index,
                    call: &current,
                })
                .await;
            if let Some(patch) = patch {
                if let Some(call) = patch.call {
                    current = call;
                }
                if let Some(mut result) = patch.result {
                    if result.tool_call_id.is_empty() {
                        result.tool_call_id = current.id.clone();
                    }
                    return (current, Some(result));
                }
            }
        }
        (current, None)
    }

    pub async fn apply_after_tool_call(
        &self,
        task: &AgentTask,
        cycle_index: u32,
        call: &ToolCall,
        result: ToolExecutionResult,
    ) -> ToolExecutionResult {
        let mut current = result;
        for hook in self.hooks.iter() {
            if let Some(patched) = hook
                .after_tool_call(AfterToolCallEvent {
                    task,
                    cycle_index,
                    call,
                    result: &current,
                })
                .await
            {
                current = patched;
            }
        }
        current
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonMap, ToolDirective, ToolResultStatus};
    use serde_json::json;

    struct InjectContext;

    #[async_trait]
    impl RuntimeHook for InjectContext {
        async fn before_llm(&self, event: BeforeLlmEvent<'_>) -> Option<BeforeLlmPatch> {
            let mut messages = event.messages.to_vec();
            messages.push(Message::user("injected"));
            Some(BeforeLlmPatch {
                messages: Some(messages),
                tool_schemas: None,
            })
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl RuntimeHook for ShortCircuit {
        async fn before_tool_call(
            &self,
            event: BeforeToolCallEvent<'_>,
        ) -> Option<BeforeToolCallPatch> {
            if event.call.name == "blocked" {
                return Some(BeforeToolCallPatch {
                    call: None,
                    result: Some(ToolExecutionResult {
                        tool_call_id: String::new(),
                        content: "{\"ok\":false}".into(),
                        status_code: ToolResultStatus::Error,
                        directive: ToolDirective::Continue,
                        error_code: Some("blocked_by_hook".into()),
                        metadata: JsonMap::new(),
                        image_url: None,
                        image_path: None,
                    }),
                });
            }
            None
        }
    }

    fn task() -> AgentTask {
        AgentTask::new("t1", "m", "s", "u")
    }

    #[tokio::test]
    async fn before_llm_hooks_compose_in_order() {
        let manager = HookManager::new(vec![Box::new(InjectContext), Box::new(InjectContext)]);
        let (messages, _schemas) = manager
            .apply_before_llm(&task(), 1, vec![Message::user("hi")], vec![])
            .await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "injected");
        assert_eq!(messages[2].content, "injected");
    }

    #[tokio::test]
    async fn before_tool_call_short_circuit_fills_call_id() {
        let manager = HookManager::new(vec![Box::new(ShortCircuit)]);
        let call = ToolCall::new("tc9", "blocked", json!({}));
        let (_call, result) = manager.apply_before_tool_call(&task(), 1, call).await;
        let result = result.expect("hook short-circuits");
        assert_eq!(result.tool_call_id, "tc9");
        assert_eq!(result.error_code.as_deref(), Some("blocked_by_hook"));
    }

    #[tokio::test]
    async fn non_matching_calls_pass_through() {
        let manager = HookManager::new(vec![Box::new(ShortCircuit)]);
        let call = ToolCall::new("tc1", "echo", json!({}));
        let (call, result) = manager.apply_before_tool_call(&task(), 1, call).await;
        assert!(result.is_none());
        assert_eq!(call.name, "echo");
    }
}
