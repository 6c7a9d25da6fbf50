//! Error types for dhub client operations.
//!
//! Every failure a producer can surface is a [`ClientError`]. Failures that come
//! back from the service are [`TransportError`]s, each carrying a
//! [`TransportErrorKind`]; the kind decides how the send path reacts through
//! [`ErrorClass`].
//!
//! ## Error Classes
//!
//! | class         | kinds                                            | reaction                          |
//! |---------------|--------------------------------------------------|-----------------------------------|
//! | `Fatal`       | InvalidParameter, Unauthorized, MalformedRecord, NotFound | surfaced after one attempt |
//! | `Retryable`   | ServiceError, ServiceUnavailable                 | retried every `retry_interval`    |
//! | `Network`     | Network                                          | retried every `retry_interval`    |
//! | `RateLimited` | LimitExceeded                                    | retried after a fixed 100 ms      |
//! | `ShardSealed` | ShardSealed                                      | topology refresh, batch resubmitted |
//!
//! ## Examples
//!
//! ```ignore
//! use dhub_client::{ClientError, ErrorClass};
//!
//! match producer.send(record).await {
//!     Ok(()) => {}
//!     Err(ClientError::ProducerClosed) => eprintln!("producer already closed"),
//!     Err(e) if e.class() == ErrorClass::Fatal => eprintln!("giving up: {e}"),
//!     Err(e) => eprintln!("transient: {e}"),
//! }
//! ```

use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// How the send path treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Fatal,
    Retryable,
    Network,
    RateLimited,
    ShardSealed,
}

impl ErrorClass {
    /// Whether another attempt against the same shard may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Retryable | ErrorClass::Network | ErrorClass::RateLimited
        )
    }
}

/// Service-side error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    InvalidParameter,
    Unauthorized,
    MalformedRecord,
    NotFound,
    ServiceError,
    ServiceUnavailable,
    LimitExceeded,
    ShardSealed,
    Network,
}

impl TransportErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            TransportErrorKind::InvalidParameter
            | TransportErrorKind::Unauthorized
            | TransportErrorKind::MalformedRecord
            | TransportErrorKind::NotFound => ErrorClass::Fatal,
            TransportErrorKind::ServiceError | TransportErrorKind::ServiceUnavailable => {
                ErrorClass::Retryable
            }
            TransportErrorKind::Network => ErrorClass::Network,
            TransportErrorKind::LimitExceeded => ErrorClass::RateLimited,
            TransportErrorKind::ShardSealed => ErrorClass::ShardSealed,
        }
    }
}

/// A failed call to the service.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// Request id reported by the service, if the request reached it.
    pub request_id: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_shard_sealed(&self) -> bool {
        self.kind == TransportErrorKind::ShardSealed
    }
}

/// Error type for dhub producer operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service rejected or failed a request.
    ///
    /// Inspect [`TransportError::class`] to see whether the send path
    /// already retried it.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding, schema or compression failure.
    ///
    /// These are deterministic: resending the same records fails the same way.
    #[error("Codec error: {0}")]
    Core(#[from] dhub_core::Error),

    /// Invalid producer configuration.
    ///
    /// Raised by [`crate::ProducerConfig::validate`] and the builders, before
    /// any task is spawned.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The producer is closing or closed.
    ///
    /// Returned by `send` after `close()`, and reported for batches that hit a
    /// sealed shard after the retry path was shut.
    #[error("Producer is closed")]
    ProducerClosed,

    /// The producer was created but `init()` has not completed.
    #[error("Producer is not initialized")]
    NotInitialized,

    /// The topic has no ACTIVE shard to write to, even after a refresh.
    #[error("Topic '{0}' has no active shard")]
    NoActiveShard(String),

    /// A record named a shard the topic does not have.
    #[error("Shard '{shard_id}' does not exist in topic '{topic}'")]
    InvalidShard { shard_id: String, topic: String },

    /// Record rejected before encoding.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A background task ended unexpectedly.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Transport(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_shard_sealed(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_shard_sealed())
    }
}

/// An item handed back because the queue it was submitted to is closed.
#[derive(Debug)]
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<Closed<T>> for ClientError {
    fn from(_: Closed<T>) -> Self {
        ClientError::ProducerClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        use TransportErrorKind::*;
        for kind in [InvalidParameter, Unauthorized, MalformedRecord, NotFound] {
            assert_eq!(kind.class(), ErrorClass::Fatal, "{kind:?}");
            assert!(!kind.class().is_retryable());
        }
        assert_eq!(ServiceError.class(), ErrorClass::Retryable);
        assert_eq!(ServiceUnavailable.class(), ErrorClass::Retryable);
        assert_eq!(Network.class(), ErrorClass::Network);
        assert_eq!(LimitExceeded.class(), ErrorClass::RateLimited);
        assert_eq!(ShardSealed.class(), ErrorClass::ShardSealed);
        assert!(!ShardSealed.class().is_retryable());
        assert!(LimitExceeded.class().is_retryable());
    }

    #[test]
    fn test_client_error_class() {
        let sealed: ClientError =
            TransportError::new(TransportErrorKind::ShardSealed, "shard 0 sealed").into();
        assert!(sealed.is_shard_sealed());
        assert_eq!(sealed.class(), ErrorClass::ShardSealed);

        assert_eq!(ClientError::ProducerClosed.class(), ErrorClass::Fatal);
        let core: ClientError = dhub_core::Error::InvalidMagic.into();
        assert_eq!(core.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_closed_hands_back_item() {
        let closed = Closed(vec![1, 2, 3]);
        assert_eq!(closed.into_inner(), vec![1, 2, 3]);
        let err: ClientError = Closed(5u8).into();
        assert!(matches!(err, ClientError::ProducerClosed));
    }

    #[test]
    fn test_display() {
        let err = TransportError::new(TransportErrorKind::LimitExceeded, "slow down")
            .with_request_id("req-1");
        assert_eq!(err.to_string(), "LimitExceeded: slow down");
        assert_eq!(err.request_id.as_deref(), Some("req-1"));
    }
}
