//! Error types for the producer.

use thiserror::Error;

/// Errors surfaced to user callbacks and to `send_async`/`close_async` callers.
///
/// Every accepted `send_async` call resolves its future with exactly one of
/// these, or with success — never both, never neither.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    /// The producer has entered `Closing` or `Closed` and no longer accepts sends.
    #[error("producer is already closed")]
    AlreadyClosed,

    /// The producer has never connected, or is `Failed`.
    #[error("producer is not connected")]
    NotConnected,

    /// The in-flight window is full and `block_if_queue_full` is false.
    #[error("producer send queue is full")]
    QueueFull,

    /// Pre-send validation failed (e.g. a message was reused, or had an empty payload).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The message exceeded `send_timeout_ms` while in the in-flight window.
    #[error("send timed out")]
    Timeout,

    /// The broker (or a local backlog quota) rejected further sends.
    ///
    /// `exceeded = true` is terminal for pending messages; `exceeded = false`
    /// ("blocked") means the caller should keep retrying.
    #[error("backlog quota exceeded (exceeded={exceeded})")]
    BacklogQuotaExceeded { exceeded: bool },

    /// The caller's wait for a backpressure permit was cancelled.
    #[error("interrupted while waiting for a send slot")]
    Interrupted,

    /// Catch-all for unexpected failures from the connection layer.
    #[error("producer error: {0}")]
    Producer(String),
}

impl ProducerError {
    /// Whether this error is safe to retry the underlying reconnect attempt for.
    ///
    /// Used by the reconnect orchestrator (spec.md §4.9) to decide whether to
    /// keep retrying broker "create producer" failures within `operation_timeout`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProducerError::NotConnected
                | ProducerError::Timeout
                | ProducerError::BacklogQuotaExceeded { exceeded: false }
                | ProducerError::Producer(_)
        )
    }
}
