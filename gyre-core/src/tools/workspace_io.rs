//! Workspace File Tools
//!
//! `read_file`, `write_file`, `list_files`, `file_info`, and
//! `file_str_replace`, all routed through the task's workspace backend so
//! the same handlers work against any storage.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::{FILE_INFO, FILE_STR_REPLACE, LIST_FILES, READ_FILE, WRITE_FILE};
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::JsonMap;

/// Read limits per request.
const READ_MAX_LINES: usize = 2000;
const READ_MAX_CHARS: usize = 50_000;

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(READ_FILE, read_file_schema(), Arc::new(ReadFile))
        .expect("read_file registers once");
    registry
        .register(WRITE_FILE, write_file_schema(), Arc::new(WriteFile))
        .expect("write_file registers once");
    registry
        .register(LIST_FILES, list_files_schema(), Arc::new(ListFiles))
        .expect("list_files registers once");
    registry
        .register(FILE_INFO, file_info_schema(), Arc::new(FileInfoTool))
        .expect("file_info registers once");
    registry
        .register(
            FILE_STR_REPLACE,
            file_str_replace_schema(),
            Arc::new(FileStrReplace),
        )
        .expect("file_str_replace registers once");
}

/// Map a workspace backend failure to a domain error output.
fn workspace_error(err: anyhow::Error) -> ToolOutput {
    let text = format!("{err:#}");
    if text.contains("escapes workspace") {
        ToolOutput::error(text, "path_escape")
    } else {
        ToolOutput::error(text, "io_error")
    }
}

fn required_path(args: &JsonMap) -> Result<String, ToolOutput> {
    match args.get("path").and_then(Value::as_str).map(str::trim) {
        Some(path) if !path.is_empty() => Ok(path.to_string()),
        _ => Err(ToolOutput::error("`path` is required", "path_required")),
    }
}

fn read_file_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": READ_FILE,
            "description": "Read file contents from the workspace. Returns at most 2000 lines or 50000 characters per request; use start_line/end_line to page.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer", "minimum": 1},
                    "end_line": {"type": "integer", "minimum": 1}
                },
                "required": ["path"]
            }
        }
    })
}

fn write_file_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": WRITE_FILE,
            "description": "Write text to a workspace file, creating parent directories. Set append to add to the end instead of overwriting.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "append": {"type": "boolean"}
                },
                "required": ["path", "content"]
            }
        }
    })
}

fn list_files_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": LIST_FILES,
            "description": "List workspace files under a base directory matching a glob (max 500 results; dependency roots are summarized).",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Base directory, default '.'"},
                    "glob": {"type": "string", "description": "Glob pattern, default '**/*'"}
                }
            }
        }
    })
}

fn file_info_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": FILE_INFO,
            "description": "Size, timestamps, and type of a workspace path.",
            "parameters": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        }
    })
}

fn file_str_replace_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": FILE_STR_REPLACE,
            "description": "Replace occurrences of old_str with new_str in a workspace file.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_str": {"type": "string"},
                    "new_str": {"type": "string"},
                    "replace_all": {"type": "boolean"},
                    "max_replacements": {"type": "integer", "minimum": 1}
                },
                "required": ["path", "old_str"]
            }
        }
    })
}

struct ReadFile;

#[async_trait]
impl ToolHandler for ReadFile {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let path = match required_path(&args) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };
        if !ctx.workspace.is_file(&path).await.unwrap_or(false) {
            return Ok(ToolOutput::error(
                format!("file not found: {path}"),
                "file_not_found",
            ));
        }
        let text = match ctx.workspace.read_text(&path).await {
            Ok(text) => text,
            Err(err) => return Ok(workspace_error(err)),
        };
        let lines: Vec<&str> = text.lines().collect();

        let start_line = args
            .get("start_line")
            .and_then(Value::as_u64)
            .map(|n| n.max(1) as usize)
            .unwrap_or(1);
        let end_line = args
            .get("end_line")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(lines.len());

        let start_idx = start_line - 1;
        let end_idx = end_line.max(start_idx).min(lines.len());
        let mut selected: Vec<&str> = lines
            .get(start_idx..end_idx)
            .unwrap_or(&[])
            .iter()
            .take(READ_MAX_LINES)
            .copied()
            .collect();

        let mut content = selected.join("\n");
        let mut truncated = false;
        if content.len() > READ_MAX_CHARS {
            content.truncate(READ_MAX_CHARS);
            // Drop a partially-cut trailing line.
            if let Some(cut) = content.rfind('\n') {
                content.truncate(cut);
            }
            selected = content.lines().collect();
            truncated = true;
        }

        Ok(ToolOutput::success(json!({
            "path": path,
            "start_line": start_idx + 1,
            "end_line": start_idx + selected.len(),
            "total_lines": lines.len(),
            "truncated": truncated,
            "content": content,
        })))
    }
}

struct WriteFile;

#[async_trait]
impl ToolHandler for WriteFile {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let path = match required_path(&args) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        let append = args.get("append").and_then(Value::as_bool).unwrap_or(false);

        match ctx.workspace.write_text(&path, content, append).await {
            Ok(written) => Ok(ToolOutput::success(json!({
                "ok": true,
                "path": path,
                "written_bytes": written,
                "append": append,
            }))),
            Err(err) => Ok(workspace_error(err)),
        }
    }
}

struct ListFiles;

#[async_trait]
impl ToolHandler for ListFiles {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let base = args
            .get("path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(".");
        let glob = args
            .get("glob")
            .and_then(Value::as_str)
            .filter(|g| !g.is_empty())
            .unwrap_or("**/*");

        match ctx.workspace.list_files(base, glob).await {
            Ok(files) => {
                let count = files.len();
                Ok(ToolOutput::success(json!({
                    "files": files,
                    "count": count,
                })))
            }
            Err(err) => Ok(workspace_error(err)),
        }
    }
}

struct FileInfoTool;

#[async_trait]
impl ToolHandler for FileInfoTool {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let path = match required_path(&args) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };
        match ctx.workspace.file_info(&path).await {
            Ok(Some(info)) => Ok(ToolOutput::success(serde_json::to_value(info)?)),
            Ok(None) => Ok(ToolOutput::error(
                format!("path not found: {path}"),
                "file_not_found",
            )),
            Err(err) => Ok(workspace_error(err)),
        }
    }
}

struct FileStrReplace;

#[async_trait]
impl ToolHandler for FileStrReplace {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let path = match required_path(&args) {
            Ok(path) => path,
            Err(output) => return Ok(output),
        };
        let old_str = args.get("old_str").and_then(Value::as_str).unwrap_or("");
        if old_str.is_empty() {
            return Ok(ToolOutput::error(
                "`old_str` cannot be empty",
                "old_str_required",
            ));
        }
        let new_str = args.get("new_str").and_then(Value::as_str).unwrap_or("");
        let replace_all = args
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let max_replacements = args
            .get("max_replacements")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize;

        if !ctx.workspace.is_file(&path).await.unwrap_or(false) {
            return Ok(ToolOutput::error(
                format!("file not found: {path}"),
                "file_not_found",
            ));
        }
        let text = match ctx.workspace.read_text(&path).await {
            Ok(text) => text,
            Err(err) => return Ok(workspace_error(err)),
        };

        let occurrences = text.matches(old_str).count();
        if occurrences == 0 {
            return Ok(ToolOutput::error(
                "`old_str` not found in file",
                "old_str_not_found",
            ));
        }

        let (replaced_text, replaced_count) = if replace_all {
            (text.replace(old_str, new_str), occurrences)
        } else {
            (
                text.replacen(old_str, new_str, max_replacements),
                occurrences.min(max_replacements),
            )
        };

        if let Err(err) = ctx.workspace.write_text(&path, &replaced_text, false).await {
            return Ok(workspace_error(err));
        }
        Ok(ToolOutput::success(json!({
            "ok": true,
            "path": path,
            "replaced_count": replaced_count,
        })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
