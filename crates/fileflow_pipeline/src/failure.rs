//! Terminal per-file failures and the cancellation signal that
//! produces one of them.

use fileflow_protocol::LoadErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A pipeline-terminal failure: the taxonomy kind plus human detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {detail}", .kind.as_str())]
pub struct LoadFailure {
    pub kind: LoadErrorKind,
    pub detail: String,
}

impl LoadFailure {
    pub fn new(kind: LoadErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(LoadErrorKind::Cancelled, "cancelled")
    }
}

/// Cooperative cancellation of pipeline execution, shared across the
/// dispatcher and every worker. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. In-flight statements finish; every stage
    /// boundary after this observes the signal.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Stage-boundary check: a pending cancellation becomes the
    /// pipeline's terminal `Cancelled` failure, which takes the same
    /// cleanup path as any other failure.
    pub fn checkpoint(&self) -> Result<(), LoadFailure> {
        if self.is_cancelled() {
            Err(LoadFailure::cancelled())
        } else {
            Ok(())
        }
    }
}
