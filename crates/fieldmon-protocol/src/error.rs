use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The pool is at `max_open` live connections. A local resource signal,
    /// never counted against the device.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed; only expected during shutdown.
    #[error("connection pool closed")]
    PoolClosed,

    /// The device has no readable node ids configured.
    #[error("no valid node ids to read")]
    NoNodes,

    /// Transport-level session failure: connect, read or auth.
    #[error("session error: {0}")]
    Session(String),

    /// The collect did not finish within the per-task deadline.
    #[error("collect timed out after {0:?}")]
    Timeout(Duration),
}

impl ProtocolError {
    /// True for errors that signal local resource pressure rather than a
    /// device fault; these bypass circuit breaker and health accounting.
    pub fn is_resource_pressure(&self) -> bool {
        matches!(self, ProtocolError::PoolExhausted | ProtocolError::PoolClosed)
    }
}
