//! Shell Tools
//!
//! `bash` runs a command in the workspace (foreground with timeout, or
//! background with a session id) and `check_background_command` polls a
//! background session. Background polling reports the RUNNING status so
//! the model keeps issuing polling calls until completion.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tools::names::{BASH, CHECK_BACKGROUND_COMMAND};
use crate::tools::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
use crate::types::{JsonMap, ToolResultStatus};

const OUTPUT_LIMIT: usize = 50_000;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 600;

const DANGEROUS_SNIPPETS: &[&str] = &[
    "rm -rf /",
    "shutdown",
    "reboot",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
];

pub(crate) fn register(registry: &mut ToolRegistry) {
    registry
        .register(BASH, bash_schema(), Arc::new(Bash))
        .expect("bash registers once");
    registry
        .register(
            CHECK_BACKGROUND_COMMAND,
            check_schema(),
            Arc::new(CheckBackgroundCommand),
        )
        .expect("check_background_command registers once");
}

fn bash_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": BASH,
            "description": "Run a shell command in the workspace. Long commands should set background=true and be polled with check_background_command.",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_seconds": {"type": "integer", "minimum": 1, "maximum": MAX_TIMEOUT_SECS},
                    "background": {"type": "boolean"}
                },
                "required": ["command"]
            }
        }
    })
}

fn check_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": CHECK_BACKGROUND_COMMAND,
            "description": "Poll a background command session started by bash.",
            "parameters": {
                "type": "object",
                "properties": {
                    "session_id": {"type": "string"}
                },
                "required": ["session_id"]
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Background sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SessionState {
    Running,
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Failed {
        error: String,
    },
}

/// Registry of background command sessions, shared by a runtime so polls
/// from later cycles can find sessions started earlier.
#[derive(Default)]
pub struct BackgroundSessions {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl BackgroundSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), SessionState::Running);
    }

    fn finish(&self, session_id: &str, state: SessionState) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), state);
    }

    fn check(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn truncate_output(raw: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if text.len() > OUTPUT_LIMIT {
        text.truncate(OUTPUT_LIMIT);
        text.push_str("\n...<output truncated>...");
    }
    text
}

fn build_command(command: &str, workdir: &std::path::Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn run_to_completion(
    command: String,
    workdir: std::path::PathBuf,
) -> std::result::Result<(i32, String, String), String> {
    let output = build_command(&command, &workdir)
        .output()
        .await
        .map_err(|err| format!("failed to spawn command: {err}"))?;
    Ok((
        output.status.code().unwrap_or(-1),
        truncate_output(output.stdout),
        truncate_output(output.stderr),
    ))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct Bash;

#[async_trait]
impl ToolHandler for Bash {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let command = match args.get("command").and_then(Value::as_str).map(str::trim) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => return Ok(ToolOutput::error("`command` is required", "command_required")),
        };

        if DANGEROUS_SNIPPETS
            .iter()
            .any(|snippet| command.contains(snippet))
        {
            return Ok(ToolOutput::error(
                "Command rejected by safety policy",
                "command_rejected",
            ));
        }

        let timeout_secs = args
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);
        let background = args
            .get("background")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let workdir = ctx.workspace_root.clone();

        if background {
            let session_id = format!("bg_{}", uuid::Uuid::new_v4().simple());
            ctx.background.begin(&session_id);
            let sessions = ctx.background.clone();
            let id = session_id.clone();
            tokio::spawn(async move {
                let state = match tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    run_to_completion(command, workdir),
                )
                .await
                {
                    Ok(Ok((exit_code, stdout, stderr))) => SessionState::Completed {
                        exit_code,
                        stdout,
                        stderr,
                    },
                    Ok(Err(error)) => SessionState::Failed { error },
                    Err(_) => SessionState::Failed {
                        error: format!("command timed out after {timeout_secs}s"),
                    },
                };
                sessions.finish(&id, state);
            });
            debug!(session_id = %session_id, "background command started");
            return Ok(ToolOutput::success(json!({
                "status": "running",
                "session_id": session_id,
            }))
            .with_status(ToolResultStatus::Running));
        }

        let cancel = ctx.exec.cancel.clone();
        let run = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            run_to_completion(command, workdir),
        );
        let outcome = tokio::select! {
            outcome = run => outcome,
            _ = cancel.cancelled() => {
                return Ok(ToolOutput::error("command cancelled", "cancelled"));
            }
        };

        match outcome {
            Ok(Ok((exit_code, stdout, stderr))) => {
                let payload = json!({
                    "exit_code": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                });
                if exit_code == 0 {
                    Ok(ToolOutput::success(payload))
                } else {
                    let mut output =
                        ToolOutput::error("command exited non-zero", "command_failed");
                    output.payload = payload;
                    Ok(output)
                }
            }
            Ok(Err(error)) => Ok(ToolOutput::error(error, "command_spawn_failed")),
            Err(_) => Ok(ToolOutput::error(
                format!("command timed out after {timeout_secs}s"),
                "bash_timeout",
            )),
        }
    }
}

struct CheckBackgroundCommand;

#[async_trait]
impl ToolHandler for CheckBackgroundCommand {
    async fn handle(&self, ctx: &ToolContext, args: JsonMap) -> Result<ToolOutput> {
        let session_id = match args.get("session_id").and_then(Value::as_str).map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Ok(ToolOutput::error(
                    "`session_id` is required",
                    "session_id_required",
                ))
            }
        };

        match ctx.background.check(&session_id) {
            None => Ok(ToolOutput::error(
                format!("unknown background session: {session_id}"),
                "background_session_not_found",
            )),
            Some(SessionState::Running) => Ok(ToolOutput::success(json!({
                "status": "running",
                "session_id": session_id,
            }))
            .with_status(ToolResultStatus::Running)),
            Some(SessionState::Completed {
                exit_code,
                stdout,
                stderr,
            }) => Ok(ToolOutput::success(json!({
                "status": "completed",
                "session_id": session_id,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }))),
            Some(SessionState::Failed { error }) => Ok(ToolOutput::error(
                error,
                "background_command_failed",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
