//! Runtime error taxonomy.
//!
//! Tool-level and protocol-level failures are *data* (an ERROR result with
//! a stable `error_code`, reported back to the model); only the failures
//! here are terminal for a task.

use thiserror::Error;

/// Terminal runtime failures.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("LLM endpoint retries exhausted: {0}")]
    LlmEndpointExhausted(String),
    #[error("LLM call failed: {0}")]
    Llm(String),
    #[error("Checkpoint version conflict for task '{task_id}': expected {expected}, found {found}")]
    CheckpointConflict {
        task_id: String,
        expected: u64,
        found: u64,
    },
    #[error("No checkpoint found for task '{0}'")]
    CheckpointMissing(String),
    #[error("State store error: {0}")]
    StateStore(String),
    #[error("Sub-agent error: {0}")]
    SubAgent(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Stable reason identifier surfaced on a failed `AgentResult`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RuntimeError::Cancelled => "cancelled",
            RuntimeError::LlmEndpointExhausted(_) => "llm_endpoint_exhausted",
            RuntimeError::Llm(_) => "llm_error",
            RuntimeError::CheckpointConflict { .. } => "checkpoint_conflict",
            RuntimeError::CheckpointMissing(_) => "checkpoint_missing",
            RuntimeError::StateStore(_) => "state_store_error",
            RuntimeError::SubAgent(_) => "sub_agent_error",
            RuntimeError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(RuntimeError::Cancelled.reason_code(), "cancelled");
        assert_eq!(
            RuntimeError::LlmEndpointExhausted("503".into()).reason_code(),
            "llm_endpoint_exhausted"
        );
    }

    #[test]
    fn display_includes_context() {
        let err = RuntimeError::CheckpointConflict {
            task_id: "t1".into(),
            expected: 3,
            found: 4,
        };
        let text = err.to_string();
        assert!(text.contains("t1"));
        assert!(text.contains("expected 3"));
    }
}
