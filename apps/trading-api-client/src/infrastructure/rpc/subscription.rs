//! Subscription Handle
//!
//! Caller-side end of a push subscription. Payloads queued by the reader are
//! decoded on the caller's task, so a slow or failing decoder never stalls
//! other correlations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::connection::Shared;
use crate::application::streamer::Streamer;
use crate::domain::error::RpcError;
use crate::domain::ids::{RequestId, SubscriptionToken};
use crate::domain::subscription::{SubscriptionCell, SubscriptionState};

type Decode<T> = Box<dyn Fn(Value) -> Result<T, RpcError> + Send + Sync>;

/// Live push subscription yielding decoded items.
///
/// Dropping the handle removes its registry entry; frames that arrive for it
/// afterwards are dropped by the reader.
pub struct Subscription<T> {
    id: RequestId,
    cell: Arc<SubscriptionCell>,
    rx: mpsc::UnboundedReceiver<Value>,
    decode: Decode<T>,
    shared: Arc<Shared>,
    failed: Option<RpcError>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: RequestId,
        cell: Arc<SubscriptionCell>,
        rx: mpsc::UnboundedReceiver<Value>,
        decode: Decode<T>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            cell,
            rx,
            decode,
            shared,
            failed: None,
        }
    }

    /// Id of the subscribe request that created this subscription.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.id
    }

    /// Server-assigned token, once confirmed.
    #[must_use]
    pub fn token(&self) -> Option<&SubscriptionToken> {
        self.cell.token()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.cell.state()
    }

    /// Wait for the server's confirmation and return the assigned token.
    ///
    /// # Errors
    ///
    /// Returns the close reason if the subscription closed before it was
    /// confirmed (rejected by the server, or the connection ended).
    pub async fn active(&self) -> Result<SubscriptionToken, RpcError> {
        let mut watch = self.cell.watch();
        let state = watch
            .wait_for(|state| *state != SubscriptionState::Pending)
            .await
            .map(|state| *state)
            .map_err(|_| RpcError::SubscriptionClosed)?;

        match (state, self.cell.token()) {
            (SubscriptionState::Active, Some(token)) => Ok(token.clone()),
            _ => Err(self.close_reason()),
        }
    }

    /// Close locally. Items already queued can still be read; after them
    /// [`next`](Streamer::next) fails with [`RpcError::SubscriptionClosed`].
    pub fn close(&mut self) {
        self.cell.close(RpcError::SubscriptionClosed);
        self.shared.subscriptions.discard(self.id, &self.cell);
    }

    fn close_reason(&self) -> RpcError {
        self.cell
            .close_reason()
            .cloned()
            .unwrap_or(RpcError::SubscriptionClosed)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("token", &self.cell.token())
            .field("state", &self.cell.state())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cell.close(RpcError::SubscriptionClosed);
        self.shared.subscriptions.discard(self.id, &self.cell);
    }
}

#[async_trait]
impl<T: Send + 'static> Streamer for Subscription<T> {
    type Item = T;

    async fn next(&mut self) -> Result<T, RpcError> {
        if let Some(error) = &self.failed {
            return Err(error.clone());
        }

        let error = match self.rx.recv().await {
            Some(payload) => match (self.decode)(payload) {
                Ok(item) => return Ok(item),
                Err(error) => {
                    tracing::warn!(id = %self.id, error = %error, "subscription payload rejected");
                    self.cell.close(error.clone());
                    self.shared.subscriptions.discard(self.id, &self.cell);
                    error
                }
            },
            None => self.close_reason(),
        };

        self.failed = Some(error.clone());
        Err(error)
    }
}
