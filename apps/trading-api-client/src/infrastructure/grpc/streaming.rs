//! Streaming Receivers
//!
//! [`StreamRecv`] implementations for tonic's `Streaming<T>` and for any
//! `Stream` of `Result<T, Status>`, plus the [`RecvStreamer`] that turns one
//! into a [`Streamer`].

use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use tonic::Status;

use crate::application::ports::StreamRecv;
use crate::application::streamer::Streamer;
use crate::domain::error::RpcError;

#[async_trait]
impl<T: Send + 'static> StreamRecv for tonic::Streaming<T> {
    type Message = T;

    async fn recv(&mut self) -> Result<Option<T>, Status> {
        self.message().await
    }
}

/// Adapts any `Stream<Item = Result<T, Status>>` to [`StreamRecv`].
#[derive(Debug)]
pub struct StreamAdapter<S>(pub S);

#[async_trait]
impl<S, T> StreamRecv for StreamAdapter<S>
where
    S: Stream<Item = Result<T, Status>> + Unpin + Send,
    T: Send,
{
    type Message = T;

    async fn recv(&mut self) -> Result<Option<T>, Status> {
        self.0.next().await.transpose()
    }
}

/// [`Streamer`] over a server-streaming receiver.
///
/// A clean end of stream surfaces as [`RpcError::EndOfStream`]; a failed call
/// as [`RpcError::Status`]. Either is returned again on every later `next`.
#[derive(Debug)]
pub struct RecvStreamer<R> {
    recv: R,
    finished: Option<RpcError>,
}

impl<R: StreamRecv> RecvStreamer<R> {
    /// Wrap a receiver.
    pub const fn new(recv: R) -> Self {
        Self {
            recv,
            finished: None,
        }
    }

    /// Give back the receiver.
    pub fn into_inner(self) -> R {
        self.recv
    }
}

impl<S, T> RecvStreamer<StreamAdapter<S>>
where
    S: Stream<Item = Result<T, Status>> + Unpin + Send,
    T: Send,
{
    /// Wrap a plain `Stream` of gRPC results.
    pub const fn from_stream(stream: S) -> Self {
        Self::new(StreamAdapter(stream))
    }
}

#[async_trait]
impl<R> Streamer for RecvStreamer<R>
where
    R: StreamRecv + 'static,
    R::Message: 'static,
{
    type Item = R::Message;

    async fn next(&mut self) -> Result<R::Message, RpcError> {
        if let Some(error) = &self.finished {
            return Err(error.clone());
        }

        let error = match self.recv.recv().await {
            Ok(Some(message)) => return Ok(message),
            Ok(None) => RpcError::EndOfStream,
            Err(status) => {
                tracing::debug!(code = ?status.code(), message = status.message(), "stream failed");
                RpcError::Status(status)
            }
        };
        self.finished = Some(error.clone());
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn streamer(
        items: Vec<Result<u32, Status>>,
    ) -> RecvStreamer<StreamAdapter<tokio_stream::Iter<std::vec::IntoIter<Result<u32, Status>>>>>
    {
        RecvStreamer::from_stream(tokio_stream::iter(items))
    }

    #[tokio::test]
    async fn next_yields_then_end_of_stream() {
        let mut s = streamer(vec![Ok(1), Ok(2)]);
        assert_eq!(s.next().await.unwrap(), 1);
        assert_eq!(s.next().await.unwrap(), 2);
        assert!(matches!(s.next().await, Err(RpcError::EndOfStream)));
        assert!(matches!(s.next().await, Err(RpcError::EndOfStream)));
    }

    #[tokio::test]
    async fn status_is_terminal() {
        let mut s = streamer(vec![Ok(1), Err(Status::unavailable("upstream gone")), Ok(3)]);
        assert_eq!(s.next().await.unwrap(), 1);

        match s.next().await {
            Err(RpcError::Status(status)) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The item after the failure is never yielded.
        assert!(matches!(s.next().await, Err(RpcError::Status(_))));
    }

    #[test_case(0 ; "minimal buffer")]
    #[test_case(8 ; "buffered")]
    #[tokio::test]
    async fn channel_forwards_until_failure(buffer: usize) {
        let s = streamer(vec![Ok(1), Ok(2), Ok(3), Err(Status::internal("boom")), Ok(4)]);
        let mut rx = s.channel(buffer);

        let mut received = Vec::new();
        while let Some(item) = rx.recv().await {
            received.push(item);
        }
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn into_sink_reports_end_of_stream() {
        let s = streamer(vec![Ok(5)]);
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let handle = s.into_sink(tx);

        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, None);
        assert!(matches!(handle.await.unwrap(), RpcError::EndOfStream));
    }
}
