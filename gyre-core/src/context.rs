//! Execution Context
//!
//! Aggregates the cross-cutting facilities a running task carries:
//! cancellation, the optional streaming sink, the optional state store for
//! checkpointing, and opaque metadata.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::errors::RuntimeError;
use crate::state::StateStore;
use crate::types::JsonMap;

/// Receives text fragments as they stream from the model.
///
/// Delivery is best-effort and synchronous from the streaming thread's
/// perspective; sinks must not block.
pub type StreamSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-run execution context.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub cancel: CancelToken,
    pub stream: Option<StreamSink>,
    pub state_store: Option<Arc<dyn StateStore>>,
    pub metadata: JsonMap,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("streaming", &self.stream.is_some())
            .field("checkpointing", &self.state_store.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_stream(mut self, sink: StreamSink) -> Self {
        self.stream = Some(sink);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Error when the run has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), RuntimeError> {
        self.cancel.check()
    }

    /// Emit a streamed text fragment, if a sink is attached.
    pub fn emit(&self, fragment: &str) {
        if let Some(sink) = &self.stream {
            sink(fragment);
        }
    }

    /// Context for a child runtime: descendant cancellation token, shared
    /// sink and store. Children hold no other reference to the parent.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child(),
            stream: self.stream.clone(),
            state_store: self.state_store.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
