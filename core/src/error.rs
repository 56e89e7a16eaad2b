//! Failure vocabulary of the queue's pluggable edges.

use thiserror::Error;

/// Failure of one store attempt against the remote endpoint.
///
/// The disposition of a batch hinges entirely on which variant the client
/// returns: recoverable errors are retried with backoff for as long as it
/// takes, fatal errors drop the batch, and cancellation is the shutdown
/// path cutting a send short.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Transient failure; the sender retries with backoff, without bound.
    ///
    /// `retry_after` is the server-provided minimum wait in milliseconds,
    /// when one was given. Servers resolving an absolute `Retry-After` date
    /// can produce a non-positive value; those are ignored by the retry
    /// loop.
    #[error("recoverable send failure: {reason}")]
    Recoverable {
        /// Human-readable cause, for logs.
        reason: String,
        /// Server-requested minimum wait in milliseconds.
        retry_after: Option<i64>,
    },

    /// Permanent failure; the batch is dropped and counted as failed.
    #[error("send failed: {0}")]
    Fatal(String),

    /// The send was interrupted by a shutdown or reshard.
    #[error("send canceled by shutdown")]
    Canceled,
}

impl SendError {
    /// A recoverable error with no server-provided wait.
    pub fn recoverable(reason: impl Into<String>) -> Self {
        Self::Recoverable {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// A recoverable error carrying a `Retry-After` hint in milliseconds.
    pub fn recoverable_after(reason: impl Into<String>, retry_after_ms: i64) -> Self {
        Self::Recoverable {
            reason: reason.into(),
            retry_after: Some(retry_after_ms),
        }
    }

    /// A permanent failure.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// True when the error permits a retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }
}

/// Failure to serialize an outgoing request.
///
/// Always non-recoverable: encoding the same batch again cannot succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request encoding failed: {0}")]
pub struct EncodeError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            SendError::recoverable("503 from remote").to_string(),
            "recoverable send failure: 503 from remote"
        );
        assert_eq!(
            SendError::fatal("400 bad request").to_string(),
            "send failed: 400 bad request"
        );
        assert_eq!(SendError::Canceled.to_string(), "send canceled by shutdown");
    }

    #[test]
    fn recoverable_classification() {
        assert!(SendError::recoverable("x").is_recoverable());
        assert!(SendError::recoverable_after("x", 100).is_recoverable());
        assert!(!SendError::fatal("x").is_recoverable());
        assert!(!SendError::Canceled.is_recoverable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SendError>();
        assert_send_sync::<EncodeError>();
    }
}
