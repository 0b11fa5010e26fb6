//! Streamer Abstraction
//!
//! A [`Streamer`] is a pull primitive: each [`next`](Streamer::next) call waits
//! for one item or a terminal failure. The same contract is implemented by
//! WebSocket subscriptions and by server-streaming gRPC receivers, so callers
//! consume both the same way.
//!
//! Two push conveniences are derived from `next`:
//!
//! - [`into_sink`](Streamer::into_sink) forwards every item into a caller's
//!   channel and drops the sender on the first failure.
//! - [`channel`](Streamer::channel) allocates that channel and returns the
//!   receiving end.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::error::RpcError;

/// Pull-based source of items that ends with exactly one error.
#[async_trait]
pub trait Streamer: Send + Sized + 'static {
    /// Item yielded on success.
    type Item: Send + 'static;

    /// Wait for the next item.
    ///
    /// # Errors
    ///
    /// Returns the terminal failure of the underlying producer. Once an error
    /// has been returned, later calls keep failing.
    async fn next(&mut self) -> Result<Self::Item, RpcError>;

    /// Forward every item into `sink` from a background task.
    ///
    /// Items are sent in order, each exactly once. On the first failure the
    /// sink is dropped (closing it for the receiver) and the task completes
    /// with that failure. If the receiver goes away first, the task completes
    /// with [`RpcError::SinkClosed`].
    fn into_sink(self, sink: mpsc::Sender<Self::Item>) -> JoinHandle<RpcError> {
        tokio::spawn(forward(self, sink))
    }

    /// Start forwarding into a fresh channel of capacity `buffer`.
    ///
    /// Tokio channels need room for at least one item, so `0` behaves as `1`.
    /// Capacity only affects how far the producer may run ahead.
    fn channel(self, buffer: usize) -> mpsc::Receiver<Self::Item> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        drop(self.into_sink(tx));
        rx
    }

    /// Like [`channel`](Streamer::channel), wrapped as a `Stream`.
    fn into_stream(self, buffer: usize) -> ReceiverStream<Self::Item> {
        ReceiverStream::new(self.channel(buffer))
    }
}

async fn forward<S: Streamer>(mut streamer: S, sink: mpsc::Sender<S::Item>) -> RpcError {
    let mut forwarded: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = sink.closed() => {
                tracing::debug!(forwarded, "streamer consumer went away");
                return RpcError::SinkClosed;
            }
            next = streamer.next() => next,
        };

        match next {
            Ok(item) => {
                if sink.send(item).await.is_err() {
                    tracing::debug!(forwarded, "streamer consumer went away");
                    return RpcError::SinkClosed;
                }
                forwarded += 1;
            }
            Err(e) => {
                drop(sink);
                tracing::debug!(forwarded, error = %e, "streamer finished");
                return e;
            }
        }
    }
}
