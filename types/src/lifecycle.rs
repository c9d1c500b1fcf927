//! Lifecycle enums shared by contexts and requests.

use serde::{Deserialize, Serialize};

/// How a context treats work still queued when it is asked to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Run everything already queued, then stop.
    #[default]
    Drain,
    /// Stop immediately; queued tasks are dropped without running.
    Discard,
}

impl ShutdownMode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Discard => "discard",
        }
    }
}

/// Where a request is in its lifecycle.
///
/// ```text
/// Posted -> Executing -> Invoked -> ContinuationPosted -> Delivered
///                    \-> Dropped
/// ```
///
/// `Delivered` and `Dropped` are terminal and both count as success: a worker
/// that never answers is a legitimate outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// The request task sits in the target queue.
    Posted,
    /// The worker routine is running on the target thread.
    Executing,
    /// The worker answered before a response callback was registered; the
    /// values are parked in the binding.
    Invoked,
    /// The continuation task sits in the receiving queue.
    ContinuationPosted,
    /// The response callback ran on the receiving thread.
    Delivered,
    /// The binding was released without an answer, or the answer could not
    /// be delivered.
    Dropped,
}

impl RequestState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Dropped)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Posted => "posted",
            Self::Executing => "executing",
            Self::Invoked => "invoked",
            Self::ContinuationPosted => "continuation_posted",
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
        }
    }
}
