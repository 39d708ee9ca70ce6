use fieldmon_common::CollectionTask;
use fieldmon_protocol::ProtocolError;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The per-device circuit breaker is not admitting traffic. Not a
    /// device failure; the task retries at its next due time.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The device names a protocol tag with no registered implementation.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollectError {
    /// True when the error is attributable to the device itself, as opposed
    /// to local resource pressure or gating.
    pub fn is_device_failure(&self) -> bool {
        match self {
            CollectError::CircuitOpen | CollectError::UnsupportedProtocol(_) => false,
            CollectError::Protocol(e) => !e.is_resource_pressure(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Drop-newest: the scheduler resubmits at the next tick because only a
    /// recorded outcome advances `next_run`.
    #[error("task queue is full")]
    QueueFull,

    #[error("worker pool is closed")]
    Closed,
}

/// A failed collection, surfaced on the worker pool's error channel.
#[derive(Debug)]
pub struct TaskError {
    pub task: Arc<CollectionTask>,
    pub error: CollectError,
}
