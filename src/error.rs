//! Error types for wirecall.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all wirecall operations.
///
/// The enum is `Clone` so that a call connection can latch its first
/// fatal error and hand the same value back from every subsequent
/// operation. Foreign causes that are not `Clone` (io, serde) are held
/// behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No address was provided to connect or bind to.
    #[error("no address provided")]
    NoAddress,

    /// An unexpected frame kind was observed on a call.
    #[error("protocol violation")]
    ProtocolViolation,

    /// The request value encoded to the codec's nil.
    #[error("nil request")]
    NilRequest,

    /// A frame could not be decoded as a wire message.
    #[error("invalid message")]
    InvalidMessage,

    /// The peer reported an error on this call (ERROR frame payload).
    #[error("{0}")]
    Remote(String),

    /// The operation is not supported by this call kind.
    #[error("operation not supported")]
    Unsupported,

    /// The call or transport has been closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// A deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Invalid endpoint configuration (malformed URL, bad protocol tag).
    #[error("configuration error: {0}")]
    Config(String),

    /// Session multiplexer failure (open refused, session reset).
    #[error("multiplexer error: {0}")]
    Mux(String),

    /// Broker client failure (not connected, publish/subscribe refused).
    #[error("broker error: {0}")]
    Broker(String),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error on the underlying carrier.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(Arc<rmp_serde::encode::Error>),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(Arc<rmp_serde::decode::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::MsgPackEncode(Arc::new(e))
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::MsgPackDecode(Arc::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DeadlineExceeded
    }
}

impl From<yamux::ConnectionError> for Error {
    fn from(e: yamux::ConnectionError) -> Self {
        Error::Mux(e.to_string())
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_preserves_display() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone").into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[tokio::test]
    async fn test_elapsed_maps_to_deadline() {
        let elapsed =
            tokio::time::timeout(std::time::Duration::from_millis(1), std::future::pending::<()>())
                .await
                .unwrap_err();
        let err: Error = elapsed.into();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn test_remote_error_text() {
        let err = Error::Remote("server exploded".into());
        assert_eq!(err.to_string(), "server exploded");
    }
}
