//! Memory Tool
//!
//! `compress_memory` lets the model record the information it must keep,
//! then schedules compaction for the start of the next cycle via the
//! `PENDING_COMPRESS` status.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::COMPRESS_MEMORY;
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::{JsonMap, ToolResultStatus};

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(COMPRESS_MEMORY, schema(), Arc::new(CompressMemory))
        .expect("compress_memory registers once");
}

fn schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": COMPRESS_MEMORY,
            "description": "Record the information that must survive memory compaction, then compact the conversation before the next cycle.",
            "parameters": {
                "type": "object",
                "properties": {
                    "core_information": {
                        "type": "string",
                        "description": "Key facts, decisions, and context to preserve."
                    }
                },
                "required": ["core_information"]
            }
        }
    })
}

struct CompressMemory;

#[async_trait]
impl ToolHandler for CompressMemory {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let core_information = args
            .get("core_information")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if core_information.is_empty() {
            return Ok(ToolOutput::error(
                "`core_information` is required",
                "core_information_required",
            ));
        }

        let mut notes = match ctx.shared_state.get("memory_notes") {
            Some(Value::Array(notes)) => notes,
            _ => Vec::new(),
        };
        notes.push(json!({
            "cycle_index": ctx.cycle_index,
            "core_information": core_information,
        }));
        let saved = notes.len();
        ctx.shared_state.insert("memory_notes", json!(notes));

        Ok(
            ToolOutput::success(json!({"ok": true, "saved_notes": saved}))
                .with_status(ToolResultStatus::PendingCompress),
        )
    }
}
