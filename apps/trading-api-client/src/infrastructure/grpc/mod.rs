//! gRPC Server-Streaming Receivers
//!
//! Wraps the receive side of a server-streaming RPC as a
//! [`Streamer`](crate::Streamer), so pushed gRPC messages are consumed the same
//! way as WebSocket subscriptions.
//!
//! ```ignore
//! let response = client.stream_quotes(request).await?;
//! let mut quotes = RecvStreamer::new(response.into_inner()).channel(64);
//! while let Some(quote) = quotes.recv().await {
//!     // ...
//! }
//! ```

pub mod streaming;

pub use streaming::{RecvStreamer, StreamAdapter};
