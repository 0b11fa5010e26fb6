//! Connection Facade
//!
//! A [`Connection`] multiplexes unary requests and push subscriptions over
//! one duplex transport. Starting a connection spawns two tasks:
//!
//! ```text
//!  callers ──► outbound queue ──► writer task ──► FrameSink
//!                                                    │
//!  callers ◄── pending / subscription sinks ◄── reader task ◄── FrameSource
//! ```
//!
//! Lifecycle: `Open → Closing → Closed`. `Closed` is terminal and is reached
//! once the reader has resolved every outstanding sink.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::reader::ConnectionReader;
use super::registry::{PendingRequests, ResponseReceiver, SubscriptionRegistry, SubscriptionSink};
use super::subscription::Subscription;
use super::writer::run_writer;
use crate::application::ports::{FrameDecoder, FrameEncoder, FrameSink, FrameSource};
use crate::domain::error::{CloseReason, RpcError};
use crate::domain::frame::SUBSCRIPTION_ID_FIELD;
use crate::domain::ids::{RequestId, RequestIdAllocator};
use crate::domain::subscription::SubscriptionCell;
use crate::infrastructure::codec::JsonRpcCodec;
use crate::infrastructure::metrics::{self, RequestOutcome};

// =============================================================================
// Options
// =============================================================================

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting requests.
    Open,
    /// Shutdown requested; teardown in progress.
    Closing,
    /// Terminal; every sink has been resolved.
    Closed,
}

/// What the reader does with a frame it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Close the whole connection with `CloseReason::Protocol`.
    #[default]
    Fatal,
    /// Log, count and skip the frame.
    Skip,
}

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline applied by [`Connection::request`]; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Capacity of the outbound frame queue.
    pub outbound_queue: usize,
    /// Handling of undecodable inbound frames.
    pub decode_errors: DecodeErrorPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            outbound_queue: 256,
            decode_errors: DecodeErrorPolicy::Fatal,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by the facade, the reader and the writer.
pub(crate) struct Shared {
    pub(crate) pending: PendingRequests,
    pub(crate) subscriptions: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    failure: Mutex<Option<CloseReason>>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl Shared {
    fn new(cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        Self {
            pending: PendingRequests::new(),
            subscriptions: SubscriptionRegistry::new(),
            state,
            failure: Mutex::new(None),
            close_reason: OnceLock::new(),
            cancel,
        }
    }

    /// Record the first failure and stop the connection.
    pub(crate) fn fail(&self, reason: CloseReason) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        self.begin_close();
    }

    pub(crate) fn recorded_failure(&self) -> Option<CloseReason> {
        self.failure.lock().clone()
    }

    fn begin_close(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }

    /// Resolve every sink with `ConnectionClosed(reason)` and enter `Closed`.
    pub(crate) fn teardown(&self, reason: CloseReason) {
        let reason = self.close_reason.get_or_init(|| reason).clone();
        self.begin_close();

        let requests = self.pending.close_all(&reason);
        let subscriptions = self.subscriptions.close_all(&reason);
        metrics::record_connection_closed(close_label(&reason));
        info!(%reason, requests, subscriptions, "connection closed");

        self.state.send_replace(ConnectionState::Closed);
    }

    pub(crate) fn closed_error(&self) -> RpcError {
        let reason = self
            .close_reason
            .get()
            .cloned()
            .or_else(|| self.recorded_failure())
            .unwrap_or(CloseReason::Shutdown);
        RpcError::ConnectionClosed(reason)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

const fn close_label(reason: &CloseReason) -> &'static str {
    match reason {
        CloseReason::Shutdown => "shutdown",
        CloseReason::PeerClosed => "peer_closed",
        CloseReason::Transport(_) => "transport",
        CloseReason::Protocol(_) => "protocol",
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// =============================================================================
// Connection
// =============================================================================

struct ConnectionInner {
    shared: Arc<Shared>,
    ids: RequestIdAllocator,
    encoder: Arc<dyn FrameEncoder>,
    outbound: mpsc::Sender<String>,
    options: ConnectionOptions,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shared.begin_close();
    }
}

/// Multiplexed request/subscription client over one duplex transport.
///
/// Cheap to clone; all clones share the same transport. Dropping the last
/// clone shuts the connection down.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending", &self.inner.shared.pending.len())
            .field("subscriptions", &self.inner.shared.subscriptions.active_count())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Start a connection over `source`/`sink` with the JSON codec.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<S, K>(source: S, sink: K, options: ConnectionOptions) -> Self
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
    {
        Self::start_with_codec(source, sink, JsonRpcCodec::new(), options)
    }

    /// Start a connection with a custom codec.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_with_codec<S, K, C>(source: S, sink: K, codec: C, options: ConnectionOptions) -> Self
    where
        S: FrameSource + 'static,
        K: FrameSink + 'static,
        C: FrameEncoder + FrameDecoder + 'static,
    {
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::new(cancel.clone()));
        let codec = Arc::new(codec);
        let (outbound, queue) = mpsc::channel(options.outbound_queue.max(1));

        let reader = ConnectionReader::new(
            source,
            Arc::clone(&codec),
            Arc::clone(&shared),
            options.decode_errors,
            cancel.clone(),
        );
        tokio::spawn(reader.run());
        tokio::spawn(run_writer(sink, queue, Arc::clone(&shared), cancel));

        debug!(?options, "connection started");
        Self {
            inner: Arc::new(ConnectionInner {
                shared,
                ids: RequestIdAllocator::new(),
                encoder: codec,
                outbound,
                options,
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Options the connection was started with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.pending.len()
    }

    /// Number of confirmed, live subscriptions.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.shared.subscriptions.active_count()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Call `method` and decode its result.
    ///
    /// Applies the configured default timeout, if any.
    ///
    /// # Errors
    ///
    /// Returns the server's error, a codec error, a timeout, or
    /// `ConnectionClosed` if the connection ends first.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self
            .call(method, params, self.inner.options.request_timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`request`](Self::request) with an explicit deadline.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(method, params, Some(timeout)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method` with raw JSON params and return the raw result.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_raw(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call(method, params, self.inner.options.request_timeout)
            .await
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let started = Instant::now();
        let result = self.call_inner(method, params, timeout).await;
        let outcome = match &result {
            Ok(_) => RequestOutcome::Ok,
            Err(RpcError::Server(_)) => RequestOutcome::ServerError,
            Err(RpcError::Timeout(_)) => RequestOutcome::Timeout,
            Err(RpcError::ConnectionClosed(_)) => RequestOutcome::ConnectionClosed,
            Err(_) => RequestOutcome::Codec,
        };
        metrics::record_request(method, outcome, started.elapsed());
        result
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let shared = &self.inner.shared;
        self.ensure_open()?;

        let id = self.inner.ids.next_id();
        let text = self
            .inner
            .encoder
            .encode_request(id, method, &params)
            .map_err(|e| RpcError::Codec(e.to_string()))?;

        let rx = shared.pending.register(id)?;
        let _guard = PendingGuard {
            pending: &shared.pending,
            id,
        };

        // One deadline covers queueing behind a stalled writer and the wait
        // for the response.
        let exchange = self.exchange(id, method, text, rx);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| RpcError::Timeout(limit))?,
            None => exchange.await,
        }
    }

    async fn exchange(
        &self,
        id: RequestId,
        method: &str,
        text: String,
        rx: ResponseReceiver,
    ) -> Result<Value, RpcError> {
        self.send_frame(text).await?;
        trace!(id = %id, method, "request sent");
        rx.await
            .unwrap_or_else(|_| Err(self.inner.shared.closed_error()))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Open a push subscription whose payloads decode into `T`.
    ///
    /// Returns as soon as the subscribe frame is queued; use
    /// [`Subscription::active`] to wait for the server's confirmation.
    ///
    /// # Errors
    ///
    /// Returns a codec error or `ConnectionClosed`.
    pub async fn subscribe<T, P>(&self, method: &str, params: &P) -> Result<Subscription<T>, RpcError>
    where
        T: DeserializeOwned + Send + 'static,
        P: Serialize + ?Sized,
    {
        self.subscribe_with(method, params, |value| {
            serde_json::from_value(value).map_err(RpcError::from)
        })
        .await
    }

    /// Open a push subscription with a caller-supplied payload decoder.
    ///
    /// # Errors
    ///
    /// Returns a codec error or `ConnectionClosed`.
    pub async fn subscribe_with<T, P, F>(
        &self,
        method: &str,
        params: &P,
        decode: F,
    ) -> Result<Subscription<T>, RpcError>
    where
        T: Send + 'static,
        P: Serialize + ?Sized,
        F: Fn(Value) -> Result<T, RpcError> + Send + Sync + 'static,
    {
        let shared = &self.inner.shared;
        self.ensure_open()?;

        let params = serde_json::to_value(params)?;
        let id = self.inner.ids.next_id();
        let text = self
            .inner
            .encoder
            .encode_request(id, method, &params)
            .map_err(|e| RpcError::Codec(e.to_string()))?;

        let cell = Arc::new(SubscriptionCell::new());
        let (tx, rx) = mpsc::unbounded_channel();
        shared
            .subscriptions
            .stage(id, SubscriptionSink::new(Arc::clone(&cell), tx))?;
        let subscription = Subscription::new(id, cell, rx, Box::new(decode), Arc::clone(shared));

        // Dropping `subscription` on failure discards the staged entry.
        self.send_frame(text).await?;
        debug!(id = %id, method, "subscribe sent");
        Ok(subscription)
    }

    /// Close `subscription` locally and ask the server to stop it.
    ///
    /// Sends `{"subscriptionId": token}` to `method`. A subscription that was
    /// never confirmed has nothing to cancel server-side and yields `Null`.
    ///
    /// # Errors
    ///
    /// Returns the server's answer to the unsubscribe request, if it failed.
    pub async fn unsubscribe<T>(
        &self,
        mut subscription: Subscription<T>,
        method: &str,
    ) -> Result<Value, RpcError>
    where
        T: Send + 'static,
    {
        let token = subscription.token().cloned();
        subscription.close();
        drop(subscription);

        match token {
            Some(token) => {
                let mut params = serde_json::Map::new();
                params.insert(
                    SUBSCRIPTION_ID_FIELD.to_string(),
                    Value::String(token.as_str().to_owned()),
                );
                self.request_raw(method, Value::Object(params)).await
            }
            None => {
                debug!(method, "unsubscribe before confirmation, nothing to cancel");
                Ok(Value::Null)
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Shut the connection down and wait until every sink is resolved.
    pub async fn close(&self) -> CloseReason {
        self.inner.shared.begin_close();
        self.closed().await
    }

    /// Wait until the connection reaches `Closed` and return why it closed.
    pub async fn closed(&self) -> CloseReason {
        let shared = &self.inner.shared;
        let mut state = shared.state.subscribe();
        // The sender lives in `shared`, which we hold.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        shared
            .close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::Shutdown)
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.state() == ConnectionState::Open {
            Ok(())
        } else {
            Err(self.inner.shared.closed_error())
        }
    }

    async fn send_frame(&self, text: String) -> Result<(), RpcError> {
        let shared = &self.inner.shared;
        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => Err(shared.closed_error()),
            sent = self.inner.outbound.send(text) => sent.map_err(|_| shared.closed_error()),
        }
    }
}
