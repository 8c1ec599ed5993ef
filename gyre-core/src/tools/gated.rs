//! Capability-Gated Tool Stubs
//!
//! Document and workflow tools are registered for every runtime so the
//! planner can expose them when their capability flags are set, but this
//! build ships no implementation: invoking one answers with the
//! standardized `not_enabled` error.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::{DOCUMENT_NAVIGATION_TOOLS, WORKFLOW_TOOLS};
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::JsonMap;

pub(crate) fn register(registry: &mut ToolRegistry) {
    for &name in DOCUMENT_NAVIGATION_TOOLS.iter().chain(WORKFLOW_TOOLS) {
        registry
            .register(name, stub_schema(name), Arc::new(NotEnabled { name }))
            .expect("gated tools register once");
    }
}

fn stub_schema(name: &str) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": "Available only when the corresponding capability is enabled for the task.",
            "parameters": {"type": "object", "properties": {}}
        }
    })
}

struct NotEnabled {
    name: &'static str,
}

#[async_trait]
impl ToolHandler for NotEnabled {
    async fn handle(&self, _ctx: &ToolContext, _args: JsonMap) -> Result<ToolOutput> {
        Ok(ToolOutput::error(
            format!("Tool `{}` is not enabled for this task", self.name),
            "not_enabled",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{args, context};

    #[tokio::test]
    async fn gated_tool_reports_not_enabled() {
        let (_dir, ctx) = context();
        let handler = NotEnabled {
            name: "document_grep",
        };
        let output = handler.handle(&ctx, args(json!({}))).await.unwrap();
        assert_eq!(output.error_code.as_deref(), Some("not_enabled"));
        assert!(output.payload["error"]
            .as_str()
            .unwrap()
            .contains("document_grep"));
    }
}
