//! Connection Reader
//!
//! The only task that reads from the transport. Each decoded frame is routed
//! to exactly one sink, in arrival order:
//!
//! 1. error with a pending id → that request fails with the server error
//! 2. pending id → that request receives the result
//! 3. staged id → the subscription is confirmed (or rejected)
//! 4. committed token → the payload is queued for that subscription
//! 5. anything else → dropped
//!
//! Whatever ends the loop, every outstanding sink is resolved with
//! `ConnectionClosed` before the task exits.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::{DecodeErrorPolicy, Shared};
use super::registry::{Delivery, PendingRequests, Promotion, SubscriptionRegistry};
use crate::application::ports::{FrameDecoder, FrameSource};
use crate::domain::error::{CloseReason, RpcError, ServerError};
use crate::domain::frame::Frame;
use crate::infrastructure::metrics::{self, DropReason};

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Result delivered to a pending request.
    Response,
    /// Server error delivered to a pending request.
    Failure,
    /// Staged subscription promoted.
    Confirmed,
    /// Staged subscription closed with an error.
    Rejected,
    /// Payload queued for a committed subscription.
    Push,
    /// Discarded.
    Dropped(DropReason),
}

/// Route one decoded frame through the registries.
pub fn route_frame(
    pending: &PendingRequests,
    subscriptions: &SubscriptionRegistry,
    frame: Frame,
) -> Route {
    if let Some(id) = frame.id {
        if let Some(sender) = pending.take(id) {
            let (outcome, route) = match frame.error {
                Some(error) => (
                    Err(RpcError::Server(ServerError::from_payload(error))),
                    Route::Failure,
                ),
                None => (Ok(frame.result.unwrap_or(Value::Null)), Route::Response),
            };
            trace!(id = %id, ?route, "response routed");
            let _ = sender.send(outcome);
            return route;
        }

        if subscriptions.is_staged(id) {
            if let Some(error) = &frame.error {
                let error = RpcError::Server(ServerError::from_payload(error.clone()));
                if subscriptions.fail_staged(id, error) {
                    debug!(id = %id, "subscription rejected by server");
                    return Route::Rejected;
                }
            } else if let Some(token) = frame.confirmation_token() {
                match subscriptions.promote(id, token.clone()) {
                    Promotion::Promoted => {
                        debug!(id = %id, token = %token, "subscription confirmed");
                        return Route::Confirmed;
                    }
                    Promotion::DuplicateToken => {
                        warn!(id = %id, token = %token, "server reused a live subscription token");
                        return Route::Rejected;
                    }
                    Promotion::NotStaged => {}
                }
            } else if subscriptions.fail_staged(
                id,
                RpcError::Protocol("subscribe confirmation carries no subscription token".into()),
            ) {
                warn!(id = %id, "subscribe confirmation without token");
                return Route::Rejected;
            }
        }
    }

    if let Some(token) = &frame.subscription {
        match subscriptions.deliver(token, frame.result.unwrap_or(Value::Null)) {
            Delivery::Delivered => {
                trace!(token = %token, "push routed");
                return Route::Push;
            }
            Delivery::ConsumerGone => {
                debug!(token = %token, "push for dropped subscription consumer");
                return Route::Dropped(DropReason::ConsumerGone);
            }
            Delivery::UnknownToken => {}
        }
    }

    debug!(
        id = ?frame.id.map(|id| id.get()),
        token = ?frame.subscription.as_ref().map(|t| t.as_str().to_owned()),
        "dropping unroutable frame"
    );
    Route::Dropped(DropReason::Unroutable)
}

/// Inbound half of a connection.
pub(crate) struct ConnectionReader<S, D> {
    source: S,
    decoder: Arc<D>,
    shared: Arc<Shared>,
    policy: DecodeErrorPolicy,
    cancel: CancellationToken,
}

impl<S, D> ConnectionReader<S, D>
where
    S: FrameSource,
    D: FrameDecoder,
{
    pub(crate) const fn new(
        source: S,
        decoder: Arc<D>,
        shared: Arc<Shared>,
        policy: DecodeErrorPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            decoder,
            shared,
            policy,
            cancel,
        }
    }

    /// Read and route frames until the connection ends, then tear down.
    pub(crate) async fn run(mut self) {
        let reason = loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    break self.shared.recorded_failure().unwrap_or(CloseReason::Shutdown);
                }
                read = self.source.read_frame() => read,
            };

            match read {
                Ok(Some(text)) => {
                    metrics::record_frame_received();
                    if let Err(reason) = self.handle_text(&text) {
                        break reason;
                    }
                }
                Ok(None) => break CloseReason::PeerClosed,
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    break CloseReason::Transport(e.to_string());
                }
            }
        };

        self.shared.teardown(reason);
    }

    fn handle_text(&self, text: &str) -> Result<(), CloseReason> {
        let frame = match self.decoder.decode(text) {
            Ok(frame) => frame,
            Err(e) => match self.policy {
                DecodeErrorPolicy::Fatal => {
                    warn!(error = %e, "undecodable frame, closing connection");
                    return Err(CloseReason::Protocol(e.to_string()));
                }
                DecodeErrorPolicy::Skip => {
                    warn!(error = %e, "skipping undecodable frame");
                    metrics::record_frame_dropped(DropReason::Undecodable);
                    return Ok(());
                }
            },
        };

        if let Route::Dropped(reason) =
            route_frame(&self.shared.pending, &self.shared.subscriptions, frame)
        {
            metrics::record_frame_dropped(reason);
        }
        Ok(())
    }
}
