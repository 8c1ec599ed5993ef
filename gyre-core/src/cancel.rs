//! Cooperative Cancellation
//!
//! A hierarchical cancellation primitive. Cancelling a token cancels all
//! of its descendants; a child never cancels its parent. Cancellation is
//! observed at cycle boundaries, between tool calls, and inside any tool
//! handler that accepts the token.

use crate::errors::RuntimeError;

/// Hierarchical cancellation token.
///
/// Thin wrapper over `tokio_util::sync::CancellationToken` adding the
/// non-blocking `check()` observation used at runtime cancellation points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and every descendant.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Non-blocking observation: error when cancelled.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.inner.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Create a descendant token, cancelled when this one is.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Resolve when the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}
