//! Correlation Registries
//!
//! Two lock-guarded tables route inbound frames to their waiting callers:
//!
//! - [`PendingRequests`]: request id → one-shot response sink.
//! - [`SubscriptionRegistry`]: staging (request id → sink) until the server
//!   confirms, then committed (token → sink).
//!
//! Lookups on unknown keys report absence; they are never errors. After
//! `close_all` both tables refuse new entries, so a caller racing teardown
//! gets [`RpcError::ConnectionClosed`] instead of waiting forever.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::domain::error::{CloseReason, RpcError};
use crate::domain::ids::{RequestId, SubscriptionToken};
use crate::domain::subscription::SubscriptionCell;
use crate::infrastructure::metrics;

/// One-shot sink for a unary response.
pub type ResponseSender = oneshot::Sender<Result<Value, RpcError>>;

/// One-shot receiver for a unary response.
pub type ResponseReceiver = oneshot::Receiver<Result<Value, RpcError>>;

// =============================================================================
// Pending Requests
// =============================================================================

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, ResponseSender>,
    closed: Option<CloseReason>,
}

/// Requests awaiting a response, keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<PendingTable>,
}

impl PendingRequests {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` and return its receiving end.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] once the registry is closed,
    /// and [`RpcError::Protocol`] if `id` is already registered.
    pub fn register(&self, id: RequestId) -> Result<ResponseReceiver, RpcError> {
        let mut table = self.table.lock();
        if let Some(reason) = &table.closed {
            return Err(RpcError::ConnectionClosed(reason.clone()));
        }
        if table.entries.contains_key(&id) {
            return Err(RpcError::Protocol(format!("request id {id} already in flight")));
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(id, tx);
        metrics::set_pending_requests(table.entries.len());
        Ok(rx)
    }

    /// Remove and return the sink for `id`.
    pub fn take(&self, id: RequestId) -> Option<ResponseSender> {
        let mut table = self.table.lock();
        let sender = table.entries.remove(&id);
        if sender.is_some() {
            metrics::set_pending_requests(table.entries.len());
        }
        sender
    }

    /// Deliver `outcome` to the waiter for `id`.
    ///
    /// Returns `false` when nobody is waiting on `id`.
    #[cfg(test)]
    pub(crate) fn complete(&self, id: RequestId, outcome: Result<Value, RpcError>) -> bool {
        match self.take(id) {
            Some(sender) => {
                // The caller may have given up between take and send.
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the waiter for `id` without delivering anything.
    pub fn remove(&self, id: RequestId) -> bool {
        self.take(id).is_some()
    }

    /// True if a waiter is registered for `id`.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.table.lock().entries.contains_key(&id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// True when no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every waiter with `ConnectionClosed(reason)` and refuse new
    /// entries from now on. Returns how many waiters were resolved.
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        let drained: Vec<ResponseSender> = {
            let mut table = self.table.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.clone());
            }
            table.entries.drain().map(|(_, tx)| tx).collect()
        };
        metrics::set_pending_requests(0);

        let count = drained.len();
        for sender in drained {
            let _ = sender.send(Err(RpcError::ConnectionClosed(reason.clone())));
        }
        count
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Registry-side handle of one subscription: its shared state and the
/// unbounded delivery channel. Dropping the sink ends the consumer's stream
/// once buffered items are read.
#[derive(Debug)]
pub struct SubscriptionSink {
    cell: Arc<SubscriptionCell>,
    tx: mpsc::UnboundedSender<Value>,
}

impl SubscriptionSink {
    /// Bundle a state cell with its delivery channel.
    #[must_use]
    pub const fn new(cell: Arc<SubscriptionCell>, tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { cell, tx }
    }

    fn close(self, reason: RpcError) {
        self.cell.close(reason);
    }
}

/// Result of a confirmation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Moved from staging to committed.
    Promoted,
    /// No staged subscription for this id.
    NotStaged,
    /// The token is already bound to another subscription; the staged one
    /// was closed.
    DuplicateToken,
}

/// Result of routing one push payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the consumer.
    Delivered,
    /// No committed subscription for this token.
    UnknownToken,
    /// The consumer is gone; the entry was removed.
    ConsumerGone,
}

#[derive(Default)]
struct SubscriptionTables {
    staging: HashMap<RequestId, SubscriptionSink>,
    committed: HashMap<SubscriptionToken, SubscriptionSink>,
    closed: Option<CloseReason>,
}

/// Two-phase subscription table.
#[derive(Default)]
pub struct SubscriptionRegistry {
    tables: Mutex<SubscriptionTables>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a subscription under the id of its subscribe request.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] once the registry is closed,
    /// and [`RpcError::Protocol`] if `id` is already staged.
    pub fn stage(&self, id: RequestId, sink: SubscriptionSink) -> Result<(), RpcError> {
        let mut tables = self.tables.lock();
        if let Some(reason) = &tables.closed {
            let error = RpcError::ConnectionClosed(reason.clone());
            sink.close(error.clone());
            return Err(error);
        }
        if tables.staging.contains_key(&id) {
            return Err(RpcError::Protocol(format!("request id {id} already staged")));
        }
        tables.staging.insert(id, sink);
        Ok(())
    }

    /// True if a subscribe request with `id` awaits confirmation.
    #[must_use]
    pub fn is_staged(&self, id: RequestId) -> bool {
        self.tables.lock().staging.contains_key(&id)
    }

    /// True if `token` is bound to a live subscription.
    #[cfg(test)]
    pub(crate) fn is_committed(&self, token: &SubscriptionToken) -> bool {
        self.tables.lock().committed.contains_key(token)
    }

    /// Move the staged entry for `id` to the committed table under `token`.
    pub fn promote(&self, id: RequestId, token: SubscriptionToken) -> Promotion {
        let mut tables = self.tables.lock();
        let Some(sink) = tables.staging.remove(&id) else {
            return Promotion::NotStaged;
        };
        if tables.committed.contains_key(&token) {
            sink.close(RpcError::Protocol(format!(
                "subscription token {token} already in use"
            )));
            return Promotion::DuplicateToken;
        }
        if !sink.cell.activate(token.clone()) {
            // Closed locally while the confirmation was in flight.
            return Promotion::NotStaged;
        }
        tables.committed.insert(token, sink);
        metrics::set_active_subscriptions(tables.committed.len());
        Promotion::Promoted
    }

    /// Close the staged entry for `id` with `error`.
    ///
    /// Returns `false` when nothing is staged under `id`.
    pub fn fail_staged(&self, id: RequestId, error: RpcError) -> bool {
        let sink = self.tables.lock().staging.remove(&id);
        match sink {
            Some(sink) => {
                sink.close(error);
                true
            }
            None => false,
        }
    }

    /// Queue `payload` for the subscription bound to `token`.
    pub fn deliver(&self, token: &SubscriptionToken, payload: Value) -> Delivery {
        let mut tables = self.tables.lock();
        let Some(sink) = tables.committed.get(token) else {
            return Delivery::UnknownToken;
        };
        if sink.tx.send(payload).is_ok() {
            return Delivery::Delivered;
        }
        if let Some(sink) = tables.committed.remove(token) {
            sink.close(RpcError::SubscriptionClosed);
        }
        metrics::set_active_subscriptions(tables.committed.len());
        Delivery::ConsumerGone
    }

    /// Remove whichever entry belongs to the subscription created by
    /// request `id` with state `cell`.
    pub fn discard(&self, id: RequestId, cell: &SubscriptionCell) -> bool {
        let mut tables = self.tables.lock();
        let mut removed = tables.staging.remove(&id).is_some();
        if let Some(token) = cell.token()
            && tables
                .committed
                .get(token)
                .is_some_and(|sink| std::ptr::eq(Arc::as_ptr(&sink.cell), cell))
        {
            tables.committed.remove(token);
            removed = true;
            metrics::set_active_subscriptions(tables.committed.len());
        }
        removed
    }

    /// Number of committed subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tables.lock().committed.len()
    }

    /// Number of subscriptions awaiting confirmation.
    #[cfg(test)]
    pub(crate) fn staged_count(&self) -> usize {
        self.tables.lock().staging.len()
    }

    /// Close every staged and committed subscription with
    /// `ConnectionClosed(reason)` and refuse new entries from now on.
    /// Returns how many subscriptions were closed.
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        let drained: Vec<SubscriptionSink> = {
            let mut tables = self.tables.lock();
            if tables.closed.is_none() {
                tables.closed = Some(reason.clone());
            }
            let staged = tables.staging.drain().map(|(_, sink)| sink);
            let mut drained: Vec<_> = staged.collect();
            drained.extend(tables.committed.drain().map(|(_, sink)| sink));
            drained
        };
        metrics::set_active_subscriptions(0);

        let count = drained.len();
        for sink in drained {
            sink.close(RpcError::ConnectionClosed(reason.clone()));
        }
        count
    }
}
