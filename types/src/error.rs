use thiserror::Error;

use crate::{ContextId, RequestId};

/// Every recoverable failure the dispatch core reports.
///
/// None of these are fatal: the caller may retry against another context or
/// abandon the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The queue owned by `context` no longer accepts tasks.
    #[error("task queue of {context} is closed")]
    QueueClosed { context: ContextId },
    /// `context` has begun or completed shutdown.
    #[error("thread context {context} has stopped")]
    ContextStopped { context: ContextId },
    /// The target of a dispatch is not accepting work; nothing was posted.
    #[error("dispatch target {context} is unavailable")]
    TargetUnavailable { context: ContextId },
    /// The response binding of `request` was already consumed or dropped.
    #[error("no pending response binding for {request}")]
    NoPendingBinding { request: RequestId },
    /// The response binding of `request` has already been invoked.
    #[error("response binding for {request} was already invoked")]
    AlreadyInvoked { request: RequestId },
    /// The calling thread is already bound to `context`.
    #[error("thread is already attached to {context}")]
    AlreadyAttached { context: ContextId },
}

impl DispatchError {
    /// Re-label a queue failure as a context failure.
    ///
    /// The queue reports in its own terms; callers posting through a
    /// context handle expect context terms.
    #[must_use]
    pub fn into_context_stopped(self) -> Self {
        match self {
            Self::QueueClosed { context } => Self::ContextStopped { context },
            other => other,
        }
    }

    /// Re-label a queue or context failure as a dispatch-time failure.
    #[must_use]
    pub fn into_target_unavailable(self) -> Self {
        match self {
            Self::QueueClosed { context } | Self::ContextStopped { context } => {
                Self::TargetUnavailable { context }
            }
            other => other,
        }
    }

    /// The context the failure concerns, if any.
    #[must_use]
    pub fn context(&self) -> Option<ContextId> {
        match self {
            Self::QueueClosed { context }
            | Self::ContextStopped { context }
            | Self::TargetUnavailable { context }
            | Self::AlreadyAttached { context } => Some(*context),
            Self::NoPendingBinding { .. } | Self::AlreadyInvoked { .. } => None,
        }
    }
}
