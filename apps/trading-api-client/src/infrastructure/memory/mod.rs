//! In-Memory Transport
//!
//! A channel-backed duplex pair for driving a [`Connection`](crate::Connection)
//! without a socket. The [`MemoryServer`] end reads the client's requests and
//! scripts responses, pushes, malformed frames and transport failures.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::application::ports::{FrameSink, FrameSource, TransportError};
use crate::domain::frame::SUBSCRIPTION_ID_FIELD;

enum Inbound {
    Text(String),
    Fail(String),
}

/// Client read half.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

/// Client write half.
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Scripted peer.
pub struct MemoryServer {
    requests: mpsc::UnboundedReceiver<String>,
    frames: Option<mpsc::UnboundedSender<Inbound>>,
}

/// A request as seen by the peer.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRequest {
    /// Correlation id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Params payload.
    #[serde(default)]
    pub params: Value,
}

/// Create a connected client/server pair.
#[must_use]
pub fn memory_pair() -> (MemorySource, MemorySink, MemoryServer) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    (
        MemorySource { rx: frames_rx },
        MemorySink {
            tx: Some(requests_tx),
        },
        MemoryServer {
            requests: requests_rx,
            frames: Some(frames_tx),
        },
    )
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(text)),
            Some(Inbound::Fail(reason)) => Err(TransportError::ConnectionFailed(reason)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

impl MemoryServer {
    /// Next raw frame written by the client; `None` once the client closed
    /// its write half.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.requests.recv().await
    }

    /// Next request written by the client, parsed.
    ///
    /// Frames that are not requests are skipped.
    pub async fn recv_request(&mut self) -> Option<ServerRequest> {
        loop {
            let text = self.recv_text().await?;
            match serde_json::from_str(&text) {
                Ok(request) => return Some(request),
                Err(e) => tracing::debug!(error = %e, "memory server skipped frame"),
            }
        }
    }

    /// Send a raw text frame to the client.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Text(text.into())).is_ok())
    }

    /// Send a JSON frame to the client.
    pub fn send_json(&self, frame: &Value) -> bool {
        self.send_text(frame.to_string())
    }

    /// Answer request `id` with `result`.
    pub fn respond(&self, id: u64, result: Value) -> bool {
        self.send_json(&json!({"id": id, "result": result}))
    }

    /// Answer request `id` with `error`.
    pub fn fail(&self, id: u64, error: Value) -> bool {
        self.send_json(&json!({"id": id, "error": error}))
    }

    /// Confirm subscribe request `id` with `token`.
    pub fn confirm(&self, id: u64, token: &str) -> bool {
        self.respond(id, json!({ SUBSCRIPTION_ID_FIELD: token }))
    }

    /// Push `payload` to the subscription bound to `token`.
    pub fn push(&self, token: &str, payload: Value) -> bool {
        self.send_json(&json!({ SUBSCRIPTION_ID_FIELD: token, "result": payload }))
    }

    /// Make the client's next read fail with a transport error.
    pub fn break_transport(&self, reason: impl Into<String>) -> bool {
        self.frames
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Fail(reason.into())).is_ok())
    }

    /// Close the server-to-client direction; the client reads end of stream
    /// after any frames already sent.
    pub fn hang_up(&mut self) {
        self.frames = None;
    }

    /// Stop accepting client frames; the client's next write fails.
    pub fn stop_reading(&mut self) {
        self.requests.close();
    }
}
