//! Error types for the AMI client

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors produced by the AMI client.
///
/// Failed responses (`Response: Error` / `Response: Failed`) are not errors by
/// themselves: they arrive as a [`Message`](crate::Message) whose
/// [`success()`](crate::Message::success) is `false`. Use
/// [`Message::into_result()`](crate::Message::into_result) to convert them
/// into [`AmiError::ActionFailed`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Elapsed deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The connection was closed before, or while, the operation ran.
    #[error("connection closed")]
    ConnectionClosed,

    /// No connection has been established yet.
    #[error("not connected")]
    NotConnected,

    /// A protocol block could not be parsed.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// What was wrong with the block.
        reason: String,
    },

    /// The client was asked to produce something the protocol cannot carry.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// Description of the violation.
        message: String,
    },

    /// The receive buffer grew past its limit without a block terminator.
    #[error("receive buffer overflow: {size} bytes exceeds limit {limit}")]
    BufferOverflow {
        /// Buffered byte count.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The server answered with `Response: Error` or `Response: Failed`.
    #[error("action failed ({response}): {message}")]
    ActionFailed {
        /// Raw `Response` header value.
        response: String,
        /// `Message` header value, empty if absent.
        message: String,
    },

    /// `Login` was rejected.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Server-provided reason.
        reason: String,
    },

    /// The transport could not be reached.
    #[error("transport unavailable: {reason}")]
    TransportUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The operation does not exist in the configured execution mode.
    #[error("operation requires {required} execution mode")]
    WrongMode {
        /// Name of the mode the operation needs.
        required: &'static str,
    },

    /// The configured HTTP endpoint is not a valid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AmiError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AmiError::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        AmiError::AuthFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport_unavailable(reason: impl Into<String>) -> Self {
        AmiError::TransportUnavailable {
            reason: reason.into(),
        }
    }

    /// Whether the error means the connection is gone and will not recover
    /// without reconnecting.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
                | AmiError::BufferOverflow { .. }
                | AmiError::TransportUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(AmiError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(
            AmiError::malformed("empty block").to_string(),
            "malformed message: empty block"
        );
        assert_eq!(
            AmiError::ActionFailed {
                response: "Error".into(),
                message: "Permission denied".into(),
            }
            .to_string(),
            "action failed (Error): Permission denied"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(AmiError::ConnectionClosed.is_connection_error());
        assert!(AmiError::transport_unavailable("refused").is_connection_error());
        assert!(!AmiError::malformed("x").is_connection_error());
        assert!(!AmiError::auth_failed("bad secret").is_connection_error());
    }
}
