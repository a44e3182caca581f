//! Error types for remlink.
//!
//! The taxonomy keeps four things apart that must never be conflated:
//! protocol violations (fatal, close the connection), authentication
//! failures (recoverable up to a retry budget), remote application failures
//! (connection stays healthy), and indeterminate outcomes (the true result
//! is unknown). Cancellation is a terminal outcome, not a failure.

use thiserror::Error;

/// Main error type for all remlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation: malformed frame, unexpected frame for the current
    /// state, or a buffer-bounds violation. Always fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed. Recoverable by retrying mechanism negotiation
    /// until the retry budget is exhausted, fatal beyond it.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The peer refused a channel open request.
    #[error("channel open refused: {0}")]
    Refused(String),

    /// The remote handler resolved the request with a failure. The
    /// connection stays healthy.
    #[error("remote failure: {0}")]
    Remote(String),

    /// The true outcome of the operation could not be determined:
    /// interruption, abrupt disconnect, or a handler that never resolved.
    #[error("indeterminate outcome: {0}")]
    Indeterminate(String),

    /// The invocation was cancelled and the cancellation was acknowledged.
    #[error("invocation cancelled")]
    Cancelled,

    /// An inbound message stream was cancelled before completion.
    #[error("message cancelled")]
    MessageCancelled,

    /// A terminal action was invoked on a request that already has one.
    #[error("request already resolved")]
    AlreadyResolved,

    /// The endpoint, connection, or channel is closed.
    #[error("closed")]
    Closed,

    /// The peer transmitted more bytes than its granted window credit.
    /// Fatal to the connection.
    #[error("flow control window overrun on channel {channel_id}")]
    WindowOverrun {
        /// Channel on which the overrun was observed.
        channel_id: u32,
    },

    /// Write queue saturated and did not drain within the timeout.
    #[error("write backpressure timeout")]
    Backpressure,

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl Error {
    /// Whether this error is fatal to the connection that produced it.
    ///
    /// Fatal errors are broadcast to every resource owned by the connection
    /// (channels fail, pending requests resolve indeterminate) before the
    /// connection transitions to closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Protocol(_) | Error::WindowOverrun { .. }
        )
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol("bad frame".into()).is_fatal());
        assert!(Error::WindowOverrun { channel_id: 7 }.is_fatal());
        assert!(!Error::Remote("handler blew up".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::Indeterminate("connection lost".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::WindowOverrun { channel_id: 3 }.to_string(),
            "flow control window overrun on channel 3"
        );
        assert_eq!(Error::Cancelled.to_string(), "invocation cancelled");
    }
}
