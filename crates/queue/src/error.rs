//! Queue error types

use thiserror::Error;

/// Error type for queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was shut down and no longer accepts events
    #[error("queue closed")]
    Closed,
}
