//! WebSocket Transport
//!
//! Adapts a `tokio-tungstenite` stream to the [`FrameSource`]/[`FrameSink`]
//! ports. The stream is split so the reader and writer tasks each own one
//! half. Ping frames are answered by tungstenite while reading.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{FrameSink, FrameSource, TransportError};
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::rpc::{Connection, ConnectionOptions};

/// Stream type produced by [`connect`].
pub type ClientStream = MaybeTlsStream<TcpStream>;

/// Read half of a WebSocket.
pub struct WsFrameSource<S> {
    read: SplitStream<WebSocketStream<S>>,
}

/// Write half of a WebSocket.
pub struct WsFrameSink<S> {
    write: SplitSink<WebSocketStream<S>, Message>,
}

/// Split an established WebSocket into its two halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (WsFrameSource<S>, WsFrameSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (write, read) = ws.split();
    (WsFrameSource { read }, WsFrameSink { write })
}

/// Open a client WebSocket to `url`.
///
/// # Errors
///
/// Returns an error if the handshake fails.
pub async fn connect(
    url: &str,
) -> Result<(WsFrameSource<ClientStream>, WsFrameSink<ClientStream>), TransportError> {
    let (ws, response) = tokio_tungstenite::connect_async(url).await?;
    tracing::info!(url, status = %response.status(), "WebSocket connected");
    Ok(split(ws))
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.read.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => return Ok(Some(text.to_owned())),
                    Err(_) => tracing::debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "server sent close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, text: String) -> Result<(), TransportError> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.write.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Connection {
    /// Connect to `url` and start a connection with the JSON codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(url: &str, options: ConnectionOptions) -> Result<Self, TransportError> {
        let (source, sink) = connect(url).await?;
        Ok(Self::start(source, sink, options))
    }

    /// Connect using a loaded [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect_with_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let (source, sink) = connect(&config.url).await?;
        Ok(Self::start_with_codec(
            source,
            sink,
            config.codec(),
            config.connection.clone(),
        ))
    }
}
