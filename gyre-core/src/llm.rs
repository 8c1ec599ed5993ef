//! Chat Client Contract
//!
//! The model transport is an injected collaborator: one operation taking
//! (messages, model, tool schemas, opaque options) and returning an
//! assistant message, tool calls, and token usage — or a stream of deltas.
//! Endpoint selection, retry across endpoints, and model-specific option
//! resolution are the client's concern; the runtime passes options through.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::types::{JsonMap, Message, TokenUsage, ToolCall};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single completion request.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tool_schemas: &'a [Value],
    /// Opaque provider options (reasoning effort, temperature, …).
    pub options: &'a JsonMap,
}

/// Aggregated response from a completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

impl ChatCompletion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// One streamed fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    /// Assistant text fragment.
    Text(String),
    /// Tool-call fragment; see [`ToolCallDelta`].
    ToolCall(ToolCallDelta),
    /// Usage report, typically on the final chunk.
    Usage(TokenUsage),
}

/// A tool-call stream fragment. Providers either repeat `{name, fragment}`
/// per chunk or send the name once and then bare argument fragments
/// identified by `index` (or implicitly by the last active call).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: String,
}

/// Callback receiving deltas as they arrive.
pub type DeltaHandler<'a> = &'a mut (dyn FnMut(ChatDelta) + Send);

// ---------------------------------------------------------------------------
// ChatClient trait
// ---------------------------------------------------------------------------

/// The injected chat transport.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Non-streaming completion.
    async fn complete(&self, request: ChatRequest<'_>) -> Result<ChatCompletion>;

    /// Streaming completion: invoke `on_delta` for each fragment as it
    /// arrives. Clients without native streaming inherit this fallback,
    /// which completes non-streaming and replays the response as coarse
    /// deltas so callers observe one code path.
    async fn complete_streaming(
        &self,
        request: ChatRequest<'_>,
        on_delta: DeltaHandler<'_>,
    ) -> Result<()> {
        let completion = self.complete(request).await?;
        if !completion.content.is_empty() {
            on_delta(ChatDelta::Text(completion.content.clone()));
        }
        for (index, call) in completion.tool_calls.iter().enumerate() {
            on_delta(ChatDelta::ToolCall(ToolCallDelta {
                index: Some(index as u32),
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_fragment: match &call.arguments {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                },
            }));
        }
        if completion.usage.has_usage() {
            on_delta(ChatDelta::Usage(completion.usage));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

/// Deterministic client replaying a fixed script of completions. Used by
/// the runtime tests; exported because embedders drive their own harnesses
/// with it.
pub struct ScriptedChatClient {
    script: std::sync::Mutex<std::collections::VecDeque<ChatCompletion>>,
    requests: std::sync::Mutex<Vec<RecordedRequest>>,
}

/// Snapshot of one request the scripted client received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

impl ScriptedChatClient {
    pub fn new(responses: Vec<ChatCompletion>) -> Self {
        Self {
            script: std::sync::Mutex::new(responses.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: &ChatRequest<'_>) {
        let tool_names = request
            .tool_schemas
            .iter()
            .filter_map(schema_tool_name)
            .collect();
        self.requests.lock().unwrap().push(RecordedRequest {
            model: request.model.to_string(),
            messages: request.messages.to_vec(),
            tool_names,
        });
    }
}

/// Extract the function name from an OpenAI-style tool schema.
pub fn schema_tool_name(schema: &Value) -> Option<String> {
    schema
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn complete(&self, request: ChatRequest<'_>) -> Result<ChatCompletion> {
        self.record(&request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted chat client exhausted"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
