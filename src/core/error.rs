// ============================================================================
// spark-reactor - Errors
// Everything that can go wrong while reading, writing or flushing the graph
// ============================================================================

use std::error::Error;
use std::sync::Arc;

use super::types::NodeId;

/// Errors raised by the reactive runtime.
///
/// The type is `Clone + Send` so it can travel through shared async results
/// and serve as a panic payload (`std::panic::panic_any`) for the panicking
/// accessors like `Derived::get`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A derived or effect was re-entered while it was still running.
    #[error("circular dependency: node {node} was read while it was computing")]
    CircularDependency { node: NodeId },

    /// Effects kept invalidating each other across chained flush passes.
    #[error("maximum update depth exceeded: more than {limit} chained flush passes")]
    MaxUpdateDepth { limit: u32 },

    /// An async derived was read before its first computation settled.
    #[error("async derived {node} has not resolved yet")]
    NotInitialized { node: NodeId },

    /// The last computation of an async derived failed.
    #[error("async derived rejected: {0}")]
    AsyncRejected(Arc<dyn Error + Send + Sync>),

    /// The node was disposed and can no longer be read.
    #[error("node {node} has been destroyed")]
    Destroyed { node: NodeId },

    /// A source was written while a derived was computing.
    #[error("source {target} was written while derived {derived} was computing")]
    UnsafeMutation { target: NodeId, derived: NodeId },
}

impl ReactiveError {
    /// Fatal errors abort the current flush pass instead of being contained
    /// to the effect that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReactiveError::CircularDependency { .. } | ReactiveError::MaxUpdateDepth { .. }
        )
    }

    /// Wrap a user error from an async computation.
    pub fn rejected<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        ReactiveError::AsyncRejected(Arc::new(err))
    }

    /// Panic with this error as the payload.
    pub(crate) fn raise(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<ReactiveError>() {
        err.to_string()
    } else if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================
