//! Port Interfaces
//!
//! Defines the interfaces (ports) the connection core depends on. The
//! infrastructure layer supplies the adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FrameSource` / `FrameSink`: the two halves of a duplex text connection
//! - `FrameEncoder` / `FrameDecoder`: the wire codec
//! - `StreamRecv`: the receive side of a server-streaming RPC

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::frame::Frame;
use crate::domain::ids::RequestId;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by a transport half.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The other half of the transport is gone.
    #[error("transport closed")]
    Closed,
}

/// Errors raised by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed but does not have a recognised shape.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// Codec Ports
// =============================================================================

/// Builds outgoing request frames.
pub trait FrameEncoder: Send + Sync {
    /// Encode a request with correlation id `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be serialized.
    fn encode_request(
        &self,
        id: RequestId,
        method: &str,
        params: &Value,
    ) -> Result<String, CodecError>;
}

/// Parses inbound text into a [`Frame`].
pub trait FrameDecoder: Send + Sync {
    /// Decode one inbound message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    fn decode(&self, text: &str) -> Result<Frame, CodecError>;
}

// =============================================================================
// Transport Ports
// =============================================================================

/// Read half of a duplex connection. Owned by the reader task only.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next text frame.
    ///
    /// `Ok(None)` means the peer closed the connection cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying socket fails.
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError>;
}

/// Write half of a duplex connection. Owned by the writer task only.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the write; the connection
    /// treats this as fatal.
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the write half.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn close(&mut self) -> Result<(), TransportError>;
}

// =============================================================================
// Streaming RPC Port
// =============================================================================

/// Receive side of a server-streaming RPC.
#[async_trait]
pub trait StreamRecv: Send {
    /// Message type yielded by the stream.
    type Message: Send;

    /// Wait for the next message; `Ok(None)` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the call's status if the server ended it with an error.
    async fn recv(&mut self) -> Result<Option<Self::Message>, tonic::Status>;
}
