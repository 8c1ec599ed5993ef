//! Memory Manager
//!
//! Keeps the conversation inside the context budget. Compaction runs at
//! cycle start when the effective length exceeds the threshold, in two
//! stages: structural cleanup (stale tool-call stubs, orphan tool
//! messages, collapsed assistant runs, artifact-ized tool results), then
//! recency-preserving summarization that replaces the middle window with
//! one synthesized assistant summary.
//!
//! Invariants: the system message stays at index 0, and every assistant
//! message with tool-call stubs keeps its paired tool messages.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{Message, Role};
use crate::workspace::WorkspaceBackend;

pub const MEMORY_SUMMARY_NAME: &str = "memory_summary";
const COMPACT_MARKER: &str = "<Tool Result Compact>";

/// Produces the synthesized summary for the middle window. Implemented by
/// the runtime over a chat client; absent summarizers fall back to the
/// local event-list summary.
#[async_trait]
pub trait MemorySummarizer: Send + Sync {
    async fn summarize(
        &self,
        prompt: &str,
        backend: Option<&str>,
        model: Option<&str>,
    ) -> Result<Option<String>>;
}

/// Custom effective-length estimator, replacing the serialized-length rule
/// used when the previous cycle reported no token usage.
pub type LengthEstimator = Arc<dyn Fn(&[Message]) -> u64 + Send + Sync>;

/// Inputs the compaction decision needs from the cycle loop.
#[derive(Debug, Clone, Default)]
pub struct CompactionInput {
    pub cycle_index: Option<u32>,
    /// Total token usage reported by the previous cycle, if any.
    pub previous_total_tokens: Option<u64>,
    /// Tool-call ids of the previous cycle, whose tool messages are not
    /// yet covered by `previous_total_tokens`.
    pub recent_tool_call_ids: Option<HashSet<String>>,
    /// Run the full pipeline regardless of the threshold (scheduled by a
    /// `PENDING_COMPRESS` tool result).
    pub force: bool,
}

pub struct MemoryManager {
    pub compact_threshold: u64,
    pub keep_recent_messages: usize,
    pub warning_threshold_percentage: u8,
    pub include_memory_warning: bool,
    pub tool_result_compact_threshold: usize,
    pub tool_result_keep_last: usize,
    pub tool_result_excerpt_head: usize,
    pub tool_result_excerpt_tail: usize,
    pub tool_calls_keep_last: usize,
    pub assistant_no_tool_keep_last: usize,
    pub tool_result_artifact_dir: String,
    pub summary_event_limit: usize,
    pub summary_backend: Option<String>,
    pub summary_model: Option<String>,
    pub workspace: Option<Arc<dyn WorkspaceBackend>>,
    pub summarizer: Option<Arc<dyn MemorySummarizer>>,
    pub length_estimator: Option<LengthEstimator>,
}

impl MemoryManager {
    pub fn new(compact_threshold: u64) -> Self {
        Self {
            compact_threshold,
            keep_recent_messages: 10,
            warning_threshold_percentage: 90,
            include_memory_warning: false,
            tool_result_compact_threshold: 2_000,
            tool_result_keep_last: 3,
            tool_result_excerpt_head: 200,
            tool_result_excerpt_tail: 200,
            tool_calls_keep_last: 3,
            assistant_no_tool_keep_last: 1,
            tool_result_artifact_dir: ".memory/tool_results".to_string(),
            summary_event_limit: 40,
            summary_backend: None,
            summary_model: None,
            workspace: None,
            summarizer: None,
            length_estimator: None,
        }
    }

    // -- effective length ---------------------------------------------------

    /// Effective context length: the previous cycle's token total plus the
    /// serialized length of its not-yet-counted tool messages when usage
    /// is known, otherwise the serialized length of everything past the
    /// first two messages.
    pub fn effective_length(&self, messages: &[Message], input: &CompactionInput) -> u64 {
        if let Some(total) = input.previous_total_tokens.filter(|t| *t > 0) {
            return total + self.recent_tool_message_length(messages, input);
        }
        if let Some(estimator) = &self.length_estimator {
            return estimator(messages);
        }
        if messages.len() <= 2 {
            return 0;
        }
        serialized_length(&messages[2..])
    }

    fn recent_tool_message_length(&self, messages: &[Message], input: &CompactionInput) -> u64 {
        let Some(ids) = input.recent_tool_call_ids.as_ref().filter(|ids| !ids.is_empty()) else {
            return 0;
        };
        let recent: Vec<Message> = messages
            .iter()
            .filter(|m| {
                m.role == Role::Tool
                    && m.tool_call_id
                        .as_deref()
                        .is_some_and(|id| ids.contains(id))
            })
            .cloned()
            .collect();
        if recent.is_empty() {
            0
        } else {
            serialized_length(&recent)
        }
    }

    /// Memory pressure as a percentage of the compaction threshold,
    /// saturating at 100.
    pub fn usage_percentage(&self, messages: &[Message], input: &CompactionInput) -> u8 {
        if self.compact_threshold == 0 {
            return 0;
        }
        let used = self.effective_length(messages, input);
        ((used * 100) / self.compact_threshold).min(100) as u8
    }

    // -- compaction entry point --------------------------------------------

    /// Compact the message list when due. Returns the (possibly rewritten)
    /// messages and whether anything changed.
    pub async fn compact(
        &self,
        messages: Vec<Message>,
        input: &CompactionInput,
    ) -> (Vec<Message>, bool) {
        if messages.is_empty() {
            return (messages, false);
        }

        let before = messages.len();
        let cleaned: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.name.as_deref() != Some(MEMORY_SUMMARY_NAME))
            .collect();
        let summary_removed = cleaned.len() != before;

        let (sanitized, was_sanitized) = sanitize_empty_assistant(cleaned);

        let length = self.effective_length(&sanitized, input);
        if length <= self.compact_threshold && !input.force {
            let (warned, warning_inserted) = self.maybe_append_memory_warning(sanitized, length);
            return (warned, summary_removed || was_sanitized || warning_inserted);
        }

        debug!(
            effective_length = length,
            threshold = self.compact_threshold,
            forced = input.force,
            "memory compaction triggered"
        );

        let (structurally_compacted, structural_change) =
            self.structural_compact(sanitized, input.cycle_index).await;

        let length = self.effective_length(&structurally_compacted, input);
        if length <= self.compact_threshold && !input.force {
            return (
                structurally_compacted,
                summary_removed || was_sanitized || structural_change,
            );
        }

        let (summarized, did_summarize) = self.summarize(structurally_compacted).await;
        (
            summarized,
            summary_removed || was_sanitized || structural_change || did_summarize,
        )
    }

    // -- structural cleanup -------------------------------------------------

    async fn structural_compact(
        &self,
        messages: Vec<Message>,
        cycle_index: Option<u32>,
    ) -> (Vec<Message>, bool) {
        let mut changed = false;

        let (messages, stripped) = self.strip_stale_tool_calls(messages);
        changed |= stripped;

        let (messages, normalized) = normalize_orphan_tool_messages(messages);
        changed |= normalized;

        let (messages, collapsed) = self.collapse_assistant_no_tool_runs(messages);
        changed |= collapsed;

        let (messages, images) = compact_processed_image_messages(messages);
        changed |= images;

        let (messages, artifacts) = self.artifactize_tool_results(messages, cycle_index).await;
        changed |= artifacts;

        let (messages, sanitized) = sanitize_empty_assistant(messages);
        changed |= sanitized;

        (messages, changed)
    }

    /// Drop tool-call stubs from all but the last N assistant messages
    /// that carry them. Orphaned tool messages are removed by the
    /// following normalization pass.
    fn strip_stale_tool_calls(&self, messages: Vec<Message>) -> (Vec<Message>, bool) {
        let with_calls: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Assistant && m.has_tool_calls())
            .map(|(i, _)| i)
            .collect();
        let keep: HashSet<usize> = with_calls
            .iter()
            .rev()
            .take(self.tool_calls_keep_last)
            .copied()
            .collect();

        let mut changed = false;
        let mut out = Vec::with_capacity(messages.len());
        for (index, mut message) in messages.into_iter().enumerate() {
            if message.role == Role::Assistant
                && message.has_tool_calls()
                && !keep.contains(&index)
            {
                changed = true;
                message.tool_calls = None;
                if message.content.trim().is_empty() {
                    continue;
                }
            }
            out.push(message);
        }
        (out, changed)
    }

    /// Collapse runs of consecutive tool-less assistant messages to the
    /// last N of each run.
    fn collapse_assistant_no_tool_runs(&self, messages: Vec<Message>) -> (Vec<Message>, bool) {
        let keep_last = self.assistant_no_tool_keep_last;
        if keep_last == 0 {
            return (messages, false);
        }

        let mut changed = false;
        let mut out: Vec<Message> = Vec::with_capacity(messages.len());
        let mut run: Vec<Message> = Vec::new();

        let mut flush = |run: &mut Vec<Message>, out: &mut Vec<Message>, changed: &mut bool| {
            if run.len() > keep_last {
                *changed = true;
                out.extend(run.drain(run.len() - keep_last..));
                run.clear();
            } else {
                out.append(run);
            }
        };

        for message in messages {
            if message.role == Role::Assistant && !message.has_tool_calls() {
                run.push(message);
                continue;
            }
            flush(&mut run, &mut out, &mut changed);
            out.push(message);
        }
        flush(&mut run, &mut out, &mut changed);
        (out, changed)
    }

    /// Replace old oversized tool results with a short descriptor and
    /// persist the full payload to the artifact directory.
    async fn artifactize_tool_results(
        &self,
        messages: Vec<Message>,
        cycle_index: Option<u32>,
    ) -> (Vec<Message>, bool) {
        if self.tool_result_compact_threshold == 0 {
            return (messages, false);
        }

        let stub_names = tool_call_stub_names(&messages);
        let tool_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool)
            .map(|(i, _)| i)
            .collect();
        let keep: HashSet<usize> = tool_indices
            .iter()
            .rev()
            .take(self.tool_result_keep_last)
            .copied()
            .collect();

        let mut changed = false;
        let mut out = Vec::with_capacity(messages.len());
        for (index, mut message) in messages.into_iter().enumerate() {
            let compactable = message.role == Role::Tool
                && !keep.contains(&index)
                && message.content.len() > self.tool_result_compact_threshold
                && !message.content.starts_with(COMPACT_MARKER);
            if !compactable {
                out.push(message);
                continue;
            }

            let tool_name = message
                .tool_call_id
                .as_deref()
                .and_then(|id| stub_names.get(id))
                .cloned();
            let artifact_path = self
                .persist_tool_content(&message.content, message.tool_call_id.as_deref(), cycle_index)
                .await;
            message.content =
                self.build_compacted_tool_content(&message.content, artifact_path.as_deref(), tool_name.as_deref());
            changed = true;
            out.push(message);
        }
        (out, changed)
    }

    async fn persist_tool_content(
        &self,
        content: &str,
        tool_call_id: Option<&str>,
        cycle_index: Option<u32>,
    ) -> Option<String> {
        let workspace = self.workspace.as_ref()?;
        let safe_id: String = tool_call_id
            .filter(|id| !id.trim().is_empty())
            .map(|id| {
                id.trim()
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
                    .collect()
            })
            .unwrap_or_else(|| format!("tool_result_{}", uuid::Uuid::new_v4().simple()));

        let path = match cycle_index {
            Some(cycle) => format!("{}/cycle_{cycle}/{safe_id}.txt", self.tool_result_artifact_dir),
            None => format!("{}/{safe_id}.txt", self.tool_result_artifact_dir),
        };
        match workspace.write_text(&path, content, false).await {
            Ok(_) => Some(path),
            Err(err) => {
                warn!(err = %err, path = %path, "failed to persist tool-result artifact");
                None
            }
        }
    }

    fn build_compacted_tool_content(
        &self,
        content: &str,
        artifact_path: Option<&str>,
        tool_name: Option<&str>,
    ) -> String {
        let head = truncate_chars(content, self.tool_result_excerpt_head);
        let tail = tail_chars(content, self.tool_result_excerpt_tail, head.len());

        let mut excerpt = String::new();
        if !head.is_empty() {
            excerpt.push_str(head);
        }
        if !tail.is_empty() {
            if !head.is_empty() {
                excerpt.push_str("\n...<snip>...\n");
            }
            excerpt.push_str(tail);
        }

        let truncated = content
            .len()
            .saturating_sub(head.len())
            .saturating_sub(tail.len());
        let tool_line = tool_name
            .map(|name| format!("tool_name: {name}\n"))
            .unwrap_or_default();
        format!(
            "{COMPACT_MARKER}\n{tool_line}artifact_path: {}\ntotal_chars: {}\ntruncated_chars: {truncated}\nretrieval_hint: use read_file on artifact_path if needed\nexcerpt:\n{}\n</Tool Result Compact>",
            artifact_path.unwrap_or("N/A"),
            content.len(),
            excerpt.trim(),
        )
    }

    // -- memory warning ------------------------------------------------------

    fn maybe_append_memory_warning(
        &self,
        messages: Vec<Message>,
        length: u64,
    ) -> (Vec<Message>, bool) {
        if !self.include_memory_warning || self.compact_threshold == 0 {
            return (messages, false);
        }
        let usage = ((length * 100) / self.compact_threshold) as u8;
        if usage < self.warning_threshold_percentage {
            return (messages, false);
        }

        let warning = format!(
            "The current memory usage has exceeded {}%. It is recommended to immediately \
             organize and record key information and materials from the conversation, and \
             store them in the workspace to prevent data loss after memory compression.",
            self.warning_threshold_percentage
        );
        let already_warned = messages
            .iter()
            .rev()
            .take(10)
            .any(|m| m.role == Role::User && m.content.contains(&warning));
        if already_warned {
            return (messages, false);
        }

        let mut warned = messages;
        warned.push(Message::user(warning));
        (warned, true)
    }

    // -- summarization -------------------------------------------------------

    /// Replace the middle window with one synthesized assistant summary.
    /// The system message and the last `keep_recent_messages` messages are
    /// preserved verbatim; the recency boundary never splits an assistant
    /// message from its tool results.
    async fn summarize(&self, messages: Vec<Message>) -> (Vec<Message>, bool) {
        if messages.len() <= self.keep_recent_messages + 2 {
            return (messages, false);
        }

        let mut recent_start = messages.len() - self.keep_recent_messages;
        while recent_start > 1 && messages[recent_start].role == Role::Tool {
            recent_start -= 1;
        }
        if recent_start <= 1 {
            return (messages, false);
        }

        let middle = &messages[1..recent_start];
        let stub_names = tool_call_stub_names(&messages);
        let artifacts = collect_compacted_artifacts(middle, &stub_names);

        let prompt = self.build_summary_prompt(middle);
        let mut summary_text = None;
        if let Some(summarizer) = &self.summarizer {
            match summarizer
                .summarize(
                    &prompt,
                    self.summary_backend.as_deref(),
                    self.summary_model.as_deref(),
                )
                .await
            {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    summary_text = Some(strip_markdown_fence(&text));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(err = %err, "memory summarizer failed, using local summary");
                }
            }
        }
        let mut summary = summary_text.unwrap_or_else(|| self.build_local_summary(middle, &artifacts));

        if !artifacts.is_empty() {
            summary.push_str("\n\n<Persisted Artifacts>\n");
            for artifact in &artifacts {
                summary.push_str(&format!(
                    "- {} (tool: {}{})\n",
                    artifact.path,
                    artifact.tool.as_deref().unwrap_or("unknown"),
                    artifact
                        .arguments
                        .as_deref()
                        .map(|args| format!(", arguments: {args}"))
                        .unwrap_or_default(),
                ));
            }
            summary.push_str("</Persisted Artifacts>");
        }

        let original_request = extract_original_user_request(&messages);
        let body = format!(
            "<Original User Request>\n{original_request}\n</Original User Request>\n\n<Compressed Agent Memory>\n{summary}\n</Compressed Agent Memory>"
        );

        let mut rewritten = Vec::with_capacity(self.keep_recent_messages + 2);
        rewritten.push(messages[0].clone());
        rewritten.push(Message::assistant(body).with_name(MEMORY_SUMMARY_NAME));
        rewritten.extend_from_slice(&messages[recent_start..]);
        (rewritten, true)
    }

    fn build_summary_prompt(&self, middle: &[Message]) -> String {
        let serialized = serde_json::to_string(middle).unwrap_or_default();
        format!(
            "<Conversation History>\n{serialized}\n</Conversation History>\n\n\
             Please compress the conversation into a structured JSON \"Task Status Summary\".\n\
             This summary should allow the agent to quickly resume the task\n\
             while preserving user constraints, key decisions, and critical context.\n\n\
             Requirements:\n\
             - Output JSON only, no Markdown.\n\
             - Keep fields concise and searchable; use short sentences.\n\
             - If a field has no data, use [] or \"\" as appropriate.\n\
             - Do not include any file paths in the JSON; artifact information will be automatically appended by the system.\n\n\
             JSON Schema:\n\
             {{\n  \"summary_version\": 1,\n  \"user_constraints\": [\"...\"],\n  \"decisions\": [\"...\"],\n  \"progress\": [\"...\"],\n  \"key_facts\": [\"...\"],\n  \"open_issues\": [\"...\"],\n  \"next_steps\": [\"...\"]\n}}"
        )
    }

    /// Deterministic fallback summary when no summary model is reachable.
    fn build_local_summary(&self, middle: &[Message], artifacts: &[ArtifactRef]) -> String {
        let limit = self.summary_event_limit.max(1);
        let mut events: Vec<String> = Vec::new();
        for (index, message) in middle.iter().take(limit).enumerate() {
            let mut text = message.content.replace('\n', " ").trim().to_string();
            if text.len() > 160 {
                text.truncate(157);
                text.push_str("...");
            }
            let mut note = format!("{:02}. {}: {text}", index + 1, role_label(message.role));
            if let Some(id) = &message.tool_call_id {
                note.push_str(&format!(" (tool_call_id={id})"));
            }
            if let Some(stubs) = &message.tool_calls {
                let names: Vec<&str> = stubs.iter().map(|s| s.name.as_str()).collect();
                if !names.is_empty() {
                    note.push_str(&format!(" (tool_calls={})", names.join(",")));
                }
            }
            events.push(note);
        }
        if middle.len() > limit {
            events.push(format!("... {} more messages omitted ...", middle.len() - limit));
        }

        let artifact_facts: Vec<String> = artifacts
            .iter()
            .map(|a| format!("{} (tool={})", a.path, a.tool.as_deref().unwrap_or("unknown")))
            .collect();
        json!({
            "summary_version": 1,
            "user_constraints": [],
            "decisions": [],
            "progress": events,
            "key_facts": artifact_facts,
            "open_issues": [],
            "next_steps": [],
        })
        .to_string()
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn serialized_length(messages: &[Message]) -> u64 {
    serde_json::to_string(messages).map(|s| s.len() as u64).unwrap_or(0)
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn sanitize_empty_assistant(messages: Vec<Message>) -> (Vec<Message>, bool) {
    let before = messages.len();
    let sanitized: Vec<Message> = messages
        .into_iter()
        .filter(|m| {
            !(m.role == Role::Assistant && !m.has_tool_calls() && m.content.trim().is_empty())
        })
        .collect();
    let changed = sanitized.len() != before;
    (sanitized, changed)
}

fn normalize_orphan_tool_messages(messages: Vec<Message>) -> (Vec<Message>, bool) {
    let allowed: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|stub| stub.id.clone())
        .collect();

    let before = messages.len();
    let normalized: Vec<Message> = messages
        .into_iter()
        .filter(|m| {
            m.role != Role::Tool
                || m.tool_call_id
                    .as_deref()
                    .is_some_and(|id| allowed.contains(id))
        })
        .collect();
    let changed = normalized.len() != before;
    (normalized, changed)
}

/// Drop image payloads from user messages the assistant already consumed.
fn compact_processed_image_messages(messages: Vec<Message>) -> (Vec<Message>, bool) {
    let last_assistant = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant);
    let Some(last_assistant) = last_assistant else {
        return (messages, false);
    };

    let mut changed = false;
    let out = messages
        .into_iter()
        .enumerate()
        .map(|(index, mut message)| {
            if message.role == Role::User && message.image_url.is_some() && index < last_assistant {
                changed = true;
                message.image_url = None;
                message.content = format!("{} [image payload compacted]", message.content)
                    .trim()
                    .to_string();
            }
            message
        })
        .collect();
    (out, changed)
}

/// Map tool-call id → tool name across all assistant stubs.
fn tool_call_stub_names(messages: &[Message]) -> std::collections::HashMap<String, String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|stub| (stub.id.clone(), stub.name.clone()))
        .collect()
}

struct ArtifactRef {
    path: String,
    tool: Option<String>,
    arguments: Option<String>,
}

/// Artifact references parsed back out of compacted tool messages.
fn collect_compacted_artifacts(
    messages: &[Message],
    stub_names: &std::collections::HashMap<String, String>,
) -> Vec<ArtifactRef> {
    let mut artifacts = Vec::new();
    for message in messages {
        if message.role != Role::Tool || !message.content.starts_with(COMPACT_MARKER) {
            continue;
        }
        let mut path = None;
        let mut tool = None;
        for line in message.content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("artifact_path:") {
                let rest = rest.trim();
                if !rest.is_empty() && rest != "N/A" {
                    path = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("tool_name:") {
                tool = Some(rest.trim().to_string());
            }
        }
        if tool.is_none() {
            tool = message
                .tool_call_id
                .as_deref()
                .and_then(|id| stub_names.get(id))
                .cloned();
        }
        if let Some(path) = path {
            artifacts.push(ArtifactRef {
                path,
                tool,
                arguments: None,
            });
        }
    }
    artifacts
}

fn extract_original_user_request(messages: &[Message]) -> String {
    for message in messages.iter().skip(1) {
        if message.role != Role::User {
            continue;
        }
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        if let Some(start) = content.find("<Original User Request>") {
            if let Some(end) = content.find("</Original User Request>") {
                let inner = &content[start + "<Original User Request>".len()..end];
                return inner.trim().to_string();
            }
        }
        return content.to_string();
    }
    String::new()
}

fn strip_markdown_fence(text: &str) -> String {
    let cleaned = text.trim();
    if !cleaned.starts_with("```") {
        return cleaned.to_string();
    }
    let mut lines: Vec<&str> = cleaned.lines().collect();
    if lines.len() < 2 {
        return cleaned.to_string();
    }
    lines.remove(0);
    if lines.last().is_some_and(|last| last.trim().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// First `max` bytes of `text`, backed off to a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Last `max` bytes of `text`, skipped when the text is already covered by
/// the head excerpt.
fn tail_chars(text: &str, max: usize, head_len: usize) -> &str {
    if max == 0 || text.len() <= head_len {
        return "";
    }
    let mut start = text.len().saturating_sub(max);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallStub;
    use crate::workspace::LocalWorkspaceBackend;

    fn pair(index: usize, payload_len: usize) -> [Message; 2] {
        let id = format!("tc{index}");
        [
            Message::assistant_with_calls(
                format!("step {index}"),
                vec![ToolCallStub {
                    id: id.clone(),
                    name: "read_file".into(),
                    arguments: "{\"path\":\"a.txt\"}".into(),
                }],
            ),
            Message::tool(id, "x".repeat(payload_len)),
        ]
    }

    fn seeded_conversation(pairs: usize, payload_len: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("sys"), Message::user("do the thing")];
        for index in 0..pairs {
            messages.extend(pair(index, payload_len));
        }
        messages
    }

    fn assert_pairing_invariant(messages: &[Message]) {
        for (index, message) in messages.iter().enumerate() {
            let Some(stubs) = &message.tool_calls else { continue };
            for (offset, stub) in stubs.iter().enumerate() {
                let tool_msg = messages
                    .get(index + 1 + offset)
                    .unwrap_or_else(|| panic!("missing tool message for stub {}", stub.id));
                assert_eq!(tool_msg.role, Role::Tool);
                assert_eq!(tool_msg.tool_call_id.as_deref(), Some(stub.id.as_str()));
            }
        }
        // No orphan tool messages either.
        let stub_ids: HashSet<&str> = messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().flatten())
            .map(|s| s.id.as_str())
            .collect();
        for message in messages {
            if message.role == Role::Tool {
                assert!(stub_ids.contains(message.tool_call_id.as_deref().unwrap()));
            }
        }
    }

    #[tokio::test]
    async fn below_threshold_is_untouched() {
        let manager = MemoryManager::new(1_000_000);
        let messages = seeded_conversation(3, 50);
        let (out, changed) = manager.compact(messages.clone(), &CompactionInput::default()).await;
        assert!(!changed);
        assert_eq!(out, messages);
    }

    #[tokio::test]
    async fn compaction_preserves_invariants() {
        let mut manager = MemoryManager::new(5_000);
        manager.keep_recent_messages = 10;
        // Keep structural cleanup clear of the recent window so the last
        // ten messages survive byte-identically.
        manager.tool_calls_keep_last = 5;
        manager.tool_result_keep_last = 5;
        let messages = seeded_conversation(100, 1_000);
        let before_recent: Vec<Message> = messages[messages.len() - 10..].to_vec();

        let (out, changed) = manager.compact(messages, &CompactionInput::default()).await;
        assert!(changed);
        assert_eq!(out[0], Message::system("sys"));
        assert_pairing_invariant(&out);
        // Recent window preserved byte-identically (boundary may widen it).
        let tail: Vec<Message> = out[out.len() - 10..].to_vec();
        assert_eq!(tail, before_recent);
        // Summary present as an assistant message named memory_summary.
        assert!(out
            .iter()
            .any(|m| m.role == Role::Assistant && m.name.as_deref() == Some(MEMORY_SUMMARY_NAME)));
    }

    #[tokio::test]
    async fn recency_boundary_never_starts_on_a_tool_message() {
        let mut manager = MemoryManager::new(100);
        manager.keep_recent_messages = 1; // would land on a tool message
        manager.tool_calls_keep_last = 50;
        manager.tool_result_compact_threshold = 0;
        let messages = seeded_conversation(8, 200);

        let (out, _) = manager.compact(messages, &CompactionInput::default()).await;
        assert_pairing_invariant(&out);
        // The message after the summary must not be an orphan tool message.
        assert_ne!(out[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn stale_tool_call_stubs_are_stripped_with_their_results() {
        let mut manager = MemoryManager::new(10);
        manager.tool_calls_keep_last = 2;
        manager.keep_recent_messages = 100; // structural stage only
        let messages = seeded_conversation(5, 20);

        let (out, changed) = manager.compact(messages, &CompactionInput::default()).await;
        assert!(changed);
        assert_pairing_invariant(&out);
        let remaining_stubs = out.iter().filter(|m| m.has_tool_calls()).count();
        assert_eq!(remaining_stubs, 2);
        let remaining_tools = out.iter().filter(|m| m.role == Role::Tool).count();
        assert_eq!(remaining_tools, 2);
    }

    #[tokio::test]
    async fn oversized_old_tool_results_become_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Arc::new(LocalWorkspaceBackend::new(dir.path()));
        let mut manager = MemoryManager::new(10);
        manager.workspace = Some(workspace.clone());
        manager.tool_result_compact_threshold = 100;
        manager.tool_result_keep_last = 1;
        manager.tool_calls_keep_last = 100;
        manager.keep_recent_messages = 100;

        let messages = seeded_conversation(3, 500);
        let input = CompactionInput {
            cycle_index: Some(4),
            ..CompactionInput::default()
        };
        let (out, _) = manager.compact(messages, &input).await;

        let compacted: Vec<&Message> = out
            .iter()
            .filter(|m| m.role == Role::Tool && m.content.starts_with(COMPACT_MARKER))
            .collect();
        assert_eq!(compacted.len(), 2);
        assert!(compacted[0].content.contains("artifact_path: .memory/tool_results/cycle_4/tc0.txt"));
        assert!(compacted[0].content.contains("tool_name: read_file"));

        let persisted = workspace
            .read_text(".memory/tool_results/cycle_4/tc0.txt")
            .await
            .unwrap();
        assert_eq!(persisted.len(), 500);
    }

    #[tokio::test]
    async fn previous_summary_is_replaced() {
        let mut manager = MemoryManager::new(1_000_000);
        manager.keep_recent_messages = 2;
        let mut messages = seeded_conversation(2, 50);
        messages.insert(
            1,
            Message::assistant("old summary").with_name(MEMORY_SUMMARY_NAME),
        );

        let (out, changed) = manager.compact(messages, &CompactionInput::default()).await;
        assert!(changed);
        assert!(!out.iter().any(|m| m.content == "old summary"));
    }

    #[tokio::test]
    async fn memory_warning_inserted_once() {
        let mut manager = MemoryManager::new(1_000);
        manager.include_memory_warning = true;
        manager.warning_threshold_percentage = 10;
        manager.keep_recent_messages = 100;
        let messages = seeded_conversation(2, 80);

        let (out, changed) = manager.compact(messages, &CompactionInput::default()).await;
        assert!(changed);
        let warnings = out
            .iter()
            .filter(|m| m.content.contains("memory usage has exceeded"))
            .count();
        assert_eq!(warnings, 1);

        let (out, _) = manager.compact(out, &CompactionInput::default()).await;
        let warnings = out
            .iter()
            .filter(|m| m.content.contains("memory usage has exceeded"))
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn token_usage_drives_effective_length() {
        let manager = MemoryManager::new(1_000);
        let messages = seeded_conversation(2, 10);
        let ids: HashSet<String> = ["tc1".to_string()].into_iter().collect();

        let input = CompactionInput {
            previous_total_tokens: Some(900),
            recent_tool_call_ids: Some(ids),
            ..CompactionInput::default()
        };
        let length = manager.effective_length(&messages, &input);
        assert!(length > 900);

        // Without usage the serialized rule applies.
        let fallback = manager.effective_length(&messages, &CompactionInput::default());
        assert!(fallback > 0);
        assert_ne!(length, fallback);
    }

    #[tokio::test]
    async fn custom_estimator_overrides_fallback_rule() {
        let mut manager = MemoryManager::new(1_000);
        manager.length_estimator = Some(Arc::new(|_| 42));
        let messages = seeded_conversation(5, 500);
        assert_eq!(
            manager.effective_length(&messages, &CompactionInput::default()),
            42
        );
    }

    #[tokio::test]
    async fn forced_compaction_runs_below_threshold() {
        let mut manager = MemoryManager::new(1_000_000);
        manager.keep_recent_messages = 4;
        let messages = seeded_conversation(10, 50);
        let input = CompactionInput {
            force: true,
            ..CompactionInput::default()
        };
        let (out, changed) = manager.compact(messages, &input).await;
        assert!(changed);
        assert!(out
            .iter()
            .any(|m| m.name.as_deref() == Some(MEMORY_SUMMARY_NAME)));
    }

    #[tokio::test]
    async fn summarizer_output_is_used() {
        struct Fixed;
        #[async_trait]
        impl MemorySummarizer for Fixed {
            async fn summarize(
                &self,
                _prompt: &str,
                _backend: Option<&str>,
                _model: Option<&str>,
            ) -> Result<Option<String>> {
                Ok(Some("```json\n{\"summary_version\":1}\n```".to_string()))
            }
        }

        let mut manager = MemoryManager::new(100);
        manager.keep_recent_messages = 2;
        manager.summarizer = Some(Arc::new(Fixed));
        let messages = seeded_conversation(10, 100);

        let (out, _) = manager.compact(messages, &CompactionInput::default()).await;
        let summary = out
            .iter()
            .find(|m| m.name.as_deref() == Some(MEMORY_SUMMARY_NAME))
            .unwrap();
        // Fence stripped, content embedded in the tagged body.
        assert!(summary.content.contains("{\"summary_version\":1}"));
        assert!(summary.content.contains("<Original User Request>\ndo the thing"));
    }

    #[test]
    fn processed_image_payloads_are_dropped() {
        let messages = vec![
            Message::system("sys"),
            Message::user("look").with_image_url("data:image/png;base64,AAA"),
            Message::assistant("I see a cat"),
            Message::user("and this?").with_image_url("data:image/png;base64,BBB"),
        ];
        let (out, changed) = compact_processed_image_messages(messages);
        assert!(changed);
        assert!(out[1].image_url.is_none());
        assert!(out[1].content.ends_with("[image payload compacted]"));
        // The newest image, not yet seen by the assistant, is kept.
        assert!(out[3].image_url.is_some());
    }
}
