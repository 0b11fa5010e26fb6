//! Error Taxonomy
//!
//! - **Connection-fatal**: [`RpcError::ConnectionClosed`] is delivered once to
//!   every live caller when the reader task exits.
//! - **Scoped**: [`RpcError::Server`] and [`RpcError::Protocol`] affect a single
//!   correlation only.
//! - **Local**: codec, timeout and sink errors raised on the caller's side.
//!
//! Frames addressed to an unknown id or token are not errors; the reader drops
//! them.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally via [`close`](crate::Connection::close) or by dropping
    /// the last connection handle.
    Shutdown,
    /// The peer closed the socket or the stream ended.
    PeerClosed,
    /// A socket read or write failed.
    Transport(String),
    /// An inbound frame could not be decoded under the fatal decode policy.
    Protocol(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shut down"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Transport(msg) => write!(f, "transport failure: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol failure: {msg}"),
        }
    }
}

/// Error payload reported by the server for one correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    /// Numeric error code, when the server sends one.
    pub code: Option<i64>,
    /// Human readable message.
    pub message: String,
    /// Extra structured data, when present.
    pub data: Option<Value>,
}

impl ServerError {
    /// Interpret an `error` payload.
    ///
    /// Objects with `code`/`message` (or `msg`) are read field by field; any
    /// other shape becomes the message verbatim.
    #[must_use]
    pub fn from_payload(payload: Value) -> Self {
        match payload {
            Value::Object(map) => {
                let code = map.get("code").and_then(Value::as_i64);
                let message = map
                    .get("message")
                    .or_else(|| map.get("msg"))
                    .and_then(Value::as_str)
                    .map_or_else(|| Value::Object(map.clone()).to_string(), ToString::to_string);
                let data = map.get("data").cloned();
                Self {
                    code,
                    message,
                    data,
                }
            }
            Value::String(message) => Self {
                code: None,
                message,
                data: None,
            },
            other => Self {
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors surfaced by requests, subscriptions and streamers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The connection is gone; no further frames will arrive.
    #[error("connection closed: {0}")]
    ConnectionClosed(CloseReason),

    /// The server answered this correlation with an error.
    #[error("server error: {0}")]
    Server(ServerError),

    /// A frame for this correlation had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encoding params or decoding a payload failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// No response arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The subscription was closed locally.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// A server-streaming call finished without error.
    #[error("end of stream")]
    EndOfStream,

    /// The consumer dropped the receiving end of a forwarding channel.
    #[error("sink closed by consumer")]
    SinkClosed,

    /// A gRPC call failed.
    #[error("gRPC status: {0}")]
    Status(#[from] tonic::Status),
}

impl RpcError {
    /// True when the error means the whole connection is unusable.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_error_from_jsonrpc_object() {
        let err = ServerError::from_payload(json!({
            "code": -32601,
            "message": "method not found",
            "data": {"method": "Nope"}
        }));
        assert_eq!(err.code, Some(-32601));
        assert_eq!(err.message, "method not found");
        assert_eq!(err.data, Some(json!({"method": "Nope"})));
        assert_eq!(err.to_string(), "method not found (code -32601)");
    }

    #[test]
    fn server_error_from_msg_field() {
        let err = ServerError::from_payload(json!({"code": 401, "msg": "not authenticated"}));
        assert_eq!(err.code, Some(401));
        assert_eq!(err.message, "not authenticated");
    }

    #[test]
    fn server_error_from_string() {
        let err = ServerError::from_payload(json!("insufficient margin"));
        assert_eq!(err.code, None);
        assert_eq!(err.message, "insufficient margin");
    }

    #[test]
    fn server_error_from_unknown_object_keeps_payload() {
        let err = ServerError::from_payload(json!({"reason": "halted"}));
        assert_eq!(err.message, r#"{"reason":"halted"}"#);
    }

    #[test]
    fn only_connection_closed_is_fatal() {
        assert!(RpcError::ConnectionClosed(CloseReason::PeerClosed).is_connection_fatal());
        assert!(!RpcError::SubscriptionClosed.is_connection_fatal());
        assert!(!RpcError::Protocol("x".to_string()).is_connection_fatal());
    }

    #[test]
    fn close_reason_display() {
        let err = RpcError::ConnectionClosed(CloseReason::Transport("reset".to_string()));
        assert_eq!(err.to_string(), "connection closed: transport failure: reset");
    }
}
