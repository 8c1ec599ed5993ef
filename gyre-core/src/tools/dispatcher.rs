//! Tool Dispatcher
//!
//! Normalizes tool-call arguments, invokes the registered handler, and
//! maps every failure mode into the protocol result taxonomy. Dispatch
//! never returns an error: protocol failures become ERROR results the
//! model can read and correct.

use serde_json::Value;

use crate::tools::{ToolContext, ToolOutput, ToolRegistry};
use crate::types::{JsonMap, ToolCall, ToolDirective, ToolExecutionResult, ToolResultStatus};

fn error_result(tool_call_id: &str, message: String, error_code: &str) -> ToolExecutionResult {
    let payload = serde_json::json!({
        "ok": false,
        "error": message,
        "error_code": error_code,
    });
    ToolExecutionResult {
        tool_call_id: tool_call_id.to_string(),
        content: payload.to_string(),
        status_code: ToolResultStatus::Error,
        directive: ToolDirective::Continue,
        error_code: Some(error_code.to_string()),
        metadata: JsonMap::new(),
        image_url: None,
        image_path: None,
    }
}

/// Normalize raw arguments into an object. Accepts an object, a JSON
/// string encoding one, `null`, or an empty string.
fn parse_arguments(tool_call_id: &str, raw: &Value) -> Result<JsonMap, ToolExecutionResult> {
    match raw {
        Value::Null => Ok(JsonMap::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(JsonMap::new());
            }
            let parsed: Value = serde_json::from_str(trimmed).map_err(|err| {
                error_result(
                    tool_call_id,
                    format!("Invalid tool arguments JSON: {err}"),
                    "invalid_arguments_json",
                )
            })?;
            match parsed {
                Value::Object(map) => Ok(map),
                _ => Err(error_result(
                    tool_call_id,
                    "Tool arguments must decode to an object".to_string(),
                    "invalid_arguments_payload",
                )),
            }
        }
        other => Err(error_result(
            tool_call_id,
            format!("Unsupported tool argument type: {}", type_name(other)),
            "invalid_arguments_type",
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert a handler's structured output into the wire result.
fn to_execution_result(tool_call_id: &str, output: ToolOutput) -> ToolExecutionResult {
    let mut result = ToolExecutionResult {
        tool_call_id: tool_call_id.to_string(),
        content: output.payload.to_string(),
        status_code: output.status_code,
        directive: output.directive,
        error_code: output.error_code,
        metadata: output.metadata,
        image_url: output.image_url,
        image_path: output.image_path,
    };
    // A wait_user directive implies the WAIT_RESPONSE status unless the
    // handler reported a failure.
    if result.directive == ToolDirective::WaitUser
        && result.status_code == ToolResultStatus::Success
    {
        result.status_code = ToolResultStatus::WaitResponse;
    }
    result
}

/// Dispatch one tool call against the registry.
pub async fn dispatch_tool_call(
    registry: &ToolRegistry,
    context: &ToolContext,
    call: &ToolCall,
) -> ToolExecutionResult {
    let arguments = match parse_arguments(&call.id, &call.arguments) {
        Ok(map) => map,
        Err(result) => return result,
    };

    let handler = match registry.handler(&call.name) {
        Some(handler) => handler,
        None => {
            return error_result(
                &call.id,
                format!("Unknown tool: {}", call.name),
                "tool_not_found",
            )
        }
    };

    match handler.handle(context, arguments).await {
        Ok(output) => to_execution_result(&call.id, output),
        Err(err) => error_result(
            &call.id,
            format!("Tool execution failed ({}): {err:#}", call.name),
            "tool_execution_failed",
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
