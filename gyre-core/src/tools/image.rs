//! Image Tool
//!
//! `read_image` loads an image for the next turn. URLs pass through
//! untouched; workspace files are validated by extension and size, and
//! inlined as a base64 data URL when the task's model is natively
//! multimodal. The tool-call runner appends the `[Image loaded]` user
//! notification when a result carries an image reference.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use crate::tools::names::READ_IMAGE;
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::JsonMap;

const MAX_INLINE_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const EXTENSION_TO_MIME: &[(&str, &str)] = &[
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".webp", "image/webp"),
    (".bmp", "image/bmp"),
];

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(READ_IMAGE, schema(), Arc::new(ReadImage))
        .expect("read_image registers once");
}

fn schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": READ_IMAGE,
            "description": "Load an image (workspace path or http(s) URL) so the next turn can reference it.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Workspace-relative image path or URL."}
                },
                "required": ["path"]
            }
        }
    })
}

fn mime_for(path: &str) -> Option<&'static str> {
    let lowered = path.to_ascii_lowercase();
    EXTENSION_TO_MIME
        .iter()
        .find(|(ext, _)| lowered.ends_with(ext))
        .map(|(_, mime)| *mime)
}

struct ReadImage;

#[async_trait]
impl ToolHandler for ReadImage {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let raw_path = match args.get("path").and_then(Value::as_str).map(str::trim) {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => return Ok(ToolOutput::error("`path` is required", "path_required")),
        };

        let lowered = raw_path.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            let payload = json!({
                "status": "loaded",
                "source": "url",
                "image_url": raw_path,
            });
            return Ok(ToolOutput::success(payload).with_image_url(raw_path));
        }

        let mime = match mime_for(&raw_path) {
            Some(mime) => mime,
            None => {
                return Ok(ToolOutput::error(
                    format!("unsupported image extension: {raw_path}"),
                    "unsupported_image_type",
                ))
            }
        };

        if !ctx.workspace.is_file(&raw_path).await.unwrap_or(false) {
            return Ok(ToolOutput::error(
                format!("image not found: {raw_path}"),
                "file_not_found",
            ));
        }

        let bytes = match ctx.workspace.read_bytes(&raw_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Ok(ToolOutput::error(
                    format!("failed to read image: {err:#}"),
                    "io_error",
                ))
            }
        };
        if bytes.len() > MAX_INLINE_IMAGE_BYTES {
            return Ok(ToolOutput::error(
                format!(
                    "image exceeds the {} byte inline limit",
                    MAX_INLINE_IMAGE_BYTES
                ),
                "image_too_large",
            ));
        }

        let payload = json!({
            "status": "loaded",
            "source": "workspace",
            "path": raw_path,
            "bytes": bytes.len(),
        });
        let mut output = ToolOutput::success(payload).with_image_path(raw_path);
        if ctx.native_multimodal {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            output = output.with_image_url(format!("data:{mime};base64,{encoded}"));
        }
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
