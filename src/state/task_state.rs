/// Fetch task lifecycle
///
/// A task is created `Queued`, moves to `Dispatched` once a worker has taken it
/// and passed the rate limiter, and ends in exactly one terminal state.
/// Retries never revive a task: a retry is a new task.
use std::fmt;

/// Represents the current state of a fetch task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting in the engine queue
    Queued,

    /// Taken by a worker; the request is in flight or its callback is running
    Dispatched,

    /// The fetch succeeded and the success callback ran
    Succeeded,

    /// The request failed and the error callback ran
    Failed,

    /// Dropped from the queue by a cancellation before any I/O happened
    Cancelled,
}

impl TaskState {
    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the task still counts toward the engine's liveness counter
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Checks whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Dispatched)
                | (Self::Queued, Self::Cancelled)
                | (Self::Dispatched, Self::Succeeded)
                | (Self::Dispatched, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
