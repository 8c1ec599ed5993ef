//! Workspace Search Tool
//!
//! `workspace_grep`: regex search over workspace text files with the
//! ripgrep-style output modes (content, files_with_matches, count).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::names::WORKSPACE_GREP;
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::JsonMap;

const MAX_RESULT_LINES: usize = 500;
const MAX_RESULT_CHARS: usize = 30_000;

const BINARY_SUFFIXES: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp", ".ico", ".pdf", ".zip", ".tar", ".gz",
    ".bz2", ".xz", ".7z", ".rar", ".mp3", ".wav", ".mp4", ".mov", ".avi", ".mkv", ".exe", ".dll",
    ".so", ".dylib", ".bin",
];

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(WORKSPACE_GREP, schema(), Arc::new(WorkspaceGrep))
        .expect("workspace_grep registers once");
}

fn schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": WORKSPACE_GREP,
            "description": "Regex search across workspace files. Limit broad searches with path/glob and max_results.",
            "parameters": {
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression to search for."},
                    "path": {"type": "string", "description": "Base directory, default '.'"},
                    "glob": {"type": "string", "description": "File filter glob, default '**/*'"},
                    "output_mode": {
                        "type": "string",
                        "enum": ["content", "files_with_matches", "count"]
                    },
                    "case_insensitive": {"type": "boolean"},
                    "max_results": {"type": "integer", "minimum": 1}
                },
                "required": ["pattern"]
            }
        }
    })
}

fn is_binary_path(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    BINARY_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix))
}

struct WorkspaceGrep;

#[async_trait]
impl ToolHandler for WorkspaceGrep {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let pattern = match args.get("pattern").and_then(Value::as_str) {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(ToolOutput::error("`pattern` is required", "pattern_required")),
        };
        let case_insensitive = args
            .get("case_insensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let regex = match regex::RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(re) => re,
            Err(err) => {
                return Ok(ToolOutput::error(
                    format!("invalid regex pattern: {err}"),
                    "invalid_pattern",
                ))
            }
        };

        let base = args
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or(".");
        let glob = args
            .get("glob")
            .and_then(Value::as_str)
            .filter(|g| !g.is_empty())
            .unwrap_or("**/*");
        let output_mode = match args.get("output_mode").and_then(Value::as_str) {
            Some(mode @ ("content" | "files_with_matches" | "count")) => mode.to_string(),
            Some(other) => {
                return Ok(ToolOutput::error(
                    format!("unsupported output_mode: {other}"),
                    "invalid_output_mode",
                ))
            }
            None => "content".to_string(),
        };
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(MAX_RESULT_LINES)
            .min(MAX_RESULT_LINES);

        let files = ctx.workspace.list_files(base, glob).await.unwrap_or_default();

        let mut content_lines: Vec<String> = Vec::new();
        let mut files_with_matches: Vec<String> = Vec::new();
        let mut counts: Vec<(String, usize)> = Vec::new();
        let mut total_matches = 0usize;
        let mut budget = MAX_RESULT_CHARS;
        let mut truncated = false;

        'files: for file in &files {
            if file.ends_with('/') || is_binary_path(file) {
                continue;
            }
            let text = match ctx.workspace.read_text(file).await {
                Ok(text) => text,
                Err(_) => continue,
            };

            let mut file_count = 0usize;
            for (line_no, line) in text.lines().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                file_count += 1;
                total_matches += 1;
                if output_mode == "content" {
                    let rendered = format!("{file}:{}:{line}", line_no + 1);
                    if content_lines.len() >= max_results || rendered.len() > budget {
                        truncated = true;
                        break 'files;
                    }
                    budget -= rendered.len();
                    content_lines.push(rendered);
                }
            }
            if file_count > 0 {
                files_with_matches.push(file.clone());
                counts.push((file.clone(), file_count));
                if output_mode == "files_with_matches" && files_with_matches.len() >= max_results {
                    truncated = true;
                    break;
                }
            }
        }

        let payload = match output_mode.as_str() {
            "content" => json!({
                "mode": "content",
                "matches": content_lines,
                "total_matches": total_matches,
                "truncated": truncated,
            }),
            "files_with_matches" => json!({
                "mode": "files_with_matches",
                "files": files_with_matches,
                "truncated": truncated,
            }),
            _ => json!({
                "mode": "count",
                "counts": counts
                    .iter()
                    .map(|(file, count)| json!({"file": file, "count": count}))
                    .collect::<Vec<_>>(),
                "total_matches": total_matches,
            }),
        };
        Ok(ToolOutput::success(payload))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{args, context};

    async fn seed(ctx: &ToolContext) {
        ctx.workspace
            .write_text("a.rs", "fn main() {}\nlet x = 1;", false)
            .await
            .unwrap();
        ctx.workspace
            .write_text("sub/b.rs", "fn helper() {}\nfn main2() {}", false)
            .await
            .unwrap();
        ctx.workspace
            .write_text("notes.md", "plain prose only", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn content_mode_reports_lines() {
        let (_dir, ctx) = context();
        seed(&ctx).await;

        let output = WorkspaceGrep
            .handle(&ctx, args(json!({"pattern": "fn \\w+"})))
            .await
            .unwrap();
        assert_eq!(output.payload["total_matches"], 3);
        let matches = output.payload["matches"].as_array().unwrap();
        assert!(matches[0].as_str().unwrap().starts_with("a.rs:1:"));
    }

    #[tokio::test]
    async fn files_with_matches_mode() {
        let (_dir, ctx) = context();
        seed(&ctx).await;

        let output = WorkspaceGrep
            .handle(
                &ctx,
                args(json!({"pattern": "fn", "output_mode": "files_with_matches"})),
            )
            .await
            .unwrap();
        assert_eq!(output.payload["files"], json!(["a.rs", "sub/b.rs"]));
    }

    #[tokio::test]
    async fn count_mode_and_glob_filter() {
        let (_dir, ctx) = context();
        seed(&ctx).await;

        let output = WorkspaceGrep
            .handle(
                &ctx,
                args(json!({"pattern": "fn", "output_mode": "count", "glob": "**/*.rs"})),
            )
            .await
            .unwrap();
        assert_eq!(output.payload["total_matches"], 3);
        let counts = output.payload["counts"].as_array().unwrap();
        assert_eq!(counts.len(), 2);
    }

    #[tokio::test]
    async fn invalid_regex_is_a_domain_error() {
        let (_dir, ctx) = context();
        let output = WorkspaceGrep
            .handle(&ctx, args(json!({"pattern": "("})))
            .await
            .unwrap();
        assert_eq!(output.error_code.as_deref(), Some("invalid_pattern"));
    }

    #[tokio::test]
    async fn case_insensitive_search() {
        let (_dir, ctx) = context();
        ctx.workspace
            .write_text("a.txt", "Hello World", false)
            .await
            .unwrap();
        let output = WorkspaceGrep
            .handle(
                &ctx,
                args(json!({"pattern": "hello", "case_insensitive": true})),
            )
            .await
            .unwrap();
        assert_eq!(output.payload["total_matches"], 1);
    }
}
