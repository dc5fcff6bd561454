//! Error types for the Cortex client.
//!
//! Callers of [`Client::call`](crate::Client::call) only ever see the four
//! [`CortexError`] kinds. [`MalformedFrame`] never reaches a caller: the
//! router publishes it on the `unrecognized` channel and carries on.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteErrorBody;

/// Errors surfaced to callers of the blocking call API.
#[derive(Debug, Error)]
pub enum CortexError {
    /// The request could not be handed to the transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The service answered the request with a JSON-RPC error object.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
        /// Optional additional data
        data: Option<serde_json::Value>,
    },

    /// No matching response arrived within the window.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection ended while the call was outstanding.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

impl CortexError {
    /// Whether retrying the same call on this connection may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CortexError::Remote { .. } | CortexError::Timeout(_))
    }
}

impl From<RemoteErrorBody> for CortexError {
    fn from(err: RemoteErrorBody) -> Self {
        CortexError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Failures at the transport boundary.
///
/// Fatal to the in-flight call, not to the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Channel is not open (never connected, or already torn down).
    #[error("channel not open")]
    NotOpen,

    /// Connection establishment failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The endpoint could not be understood.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Request could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A blocking call was made from inside a bus handler, which runs on the
    /// thread that delivers replies.
    #[error("blocking call from the frame delivery thread")]
    OnDeliveryThread,

    /// The peer replied on a request's channel with something other than a
    /// result or an error.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Why an inbound frame could not be routed to a waiting caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedFrame {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    /// Carries an id that no outstanding request owns (late, duplicate or garbled).
    #[error("no outstanding request for id {0}")]
    UnknownId(serde_json::Value),

    #[error("unrecognized frame shape")]
    UnknownShape,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cortex_error_display() {
        let timeout_err = CortexError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout_err.to_string(), "Request timed out after 30s");

        let remote_err = CortexError::Remote {
            code: -32,
            message: "invalid token".to_string(),
            data: None,
        };
        assert_eq!(remote_err.to_string(), "Remote error -32: invalid token");

        let transport_err: CortexError = TransportError::NotOpen.into();
        assert_eq!(transport_err.to_string(), "Transport error: channel not open");

        let closed = CortexError::ConnectionClosed("server went away".to_string());
        assert_eq!(closed.to_string(), "Connection closed: server went away");
    }

    #[test]
    fn test_cortex_error_from_remote_body() {
        let body = RemoteErrorBody {
            code: -32601,
            message: "Method not found".to_string(),
            data: Some(serde_json::json!({"method": "unknown"})),
        };

        match CortexError::from(body) {
            CortexError::Remote { code, message, data } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
                assert!(data.is_some());
            }
            other => panic!("Expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(CortexError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(!CortexError::ConnectionClosed("eof".into()).is_recoverable());
        assert!(!CortexError::Transport(TransportError::NotOpen).is_recoverable());
    }
}
