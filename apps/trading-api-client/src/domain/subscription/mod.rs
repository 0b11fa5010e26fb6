//! Subscription Lifecycle
//!
//! Every subscription moves through `Pending → Active → Closed`:
//!
//! - **Pending**: the subscribe request is staged under its request id.
//! - **Active**: the server confirmed it and assigned a token.
//! - **Closed**: terminal, reached by local close, server rejection or
//!   connection teardown.
//!
//! The [`SubscriptionCell`] is shared between the registry entry and the
//! caller's handle. Transitions happen under the watch channel's write lock,
//! so the close reason is visible to anyone who observes `Closed`, and only
//! the first close wins.

use std::sync::OnceLock;

use tokio::sync::watch;

use super::error::RpcError;
use super::ids::SubscriptionToken;

/// Lifecycle state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Staged, awaiting server confirmation.
    Pending,
    /// Token assigned, receiving pushes.
    Active,
    /// Terminal.
    Closed,
}

/// Shared state of one subscription.
#[derive(Debug)]
pub struct SubscriptionCell {
    token: OnceLock<SubscriptionToken>,
    close_reason: OnceLock<RpcError>,
    state: watch::Sender<SubscriptionState>,
}

impl Default for SubscriptionCell {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionCell {
    /// Create a cell in the `Pending` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SubscriptionState::Pending);
        Self {
            token: OnceLock::new(),
            close_reason: OnceLock::new(),
            state,
        }
    }

    /// Move `Pending → Active` and record the token.
    ///
    /// Returns `false` (and changes nothing) unless the cell was `Pending`.
    pub fn activate(&self, token: SubscriptionToken) -> bool {
        self.state.send_if_modified(|state| {
            if *state != SubscriptionState::Pending {
                return false;
            }
            if self.token.set(token).is_err() {
                return false;
            }
            *state = SubscriptionState::Active;
            true
        })
    }

    /// Move to `Closed` with `reason`.
    ///
    /// Only the first call has an effect; it returns `true`.
    pub fn close(&self, reason: RpcError) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Closed {
                return false;
            }
            let _ = self.close_reason.set(reason);
            *state = SubscriptionState::Closed;
            true
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Assigned token, once confirmed.
    #[must_use]
    pub fn token(&self) -> Option<&SubscriptionToken> {
        self.token.get()
    }

    /// Why the subscription closed, once closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<&RpcError> {
        self.close_reason.get()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::CloseReason;

    #[test]
    fn starts_pending() {
        let cell = SubscriptionCell::new();
        assert_eq!(cell.state(), SubscriptionState::Pending);
        assert!(cell.token().is_none());
        assert!(cell.close_reason().is_none());
    }

    #[test]
    fn activate_assigns_token_once() {
        let cell = SubscriptionCell::new();
        assert!(cell.activate(SubscriptionToken::from("abc")));
        assert!(!cell.activate(SubscriptionToken::from("other")));
        assert_eq!(cell.state(), SubscriptionState::Active);
        assert_eq!(cell.token().unwrap().as_str(), "abc");
    }

    #[test]
    fn close_is_guarded() {
        let cell = SubscriptionCell::new();
        assert!(cell.activate(SubscriptionToken::from("abc")));
        assert!(cell.close(RpcError::SubscriptionClosed));
        assert!(!cell.close(RpcError::ConnectionClosed(CloseReason::PeerClosed)));

        assert_eq!(cell.state(), SubscriptionState::Closed);
        assert!(matches!(
            cell.close_reason(),
            Some(RpcError::SubscriptionClosed)
        ));
        // Token survives the close.
        assert_eq!(cell.token().unwrap().as_str(), "abc");
    }

    #[test]
    fn closed_cannot_activate() {
        let cell = SubscriptionCell::new();
        assert!(cell.close(RpcError::SubscriptionClosed));
        assert!(!cell.activate(SubscriptionToken::from("late")));
        assert!(cell.token().is_none());
    }

    #[tokio::test]
    async fn watchers_see_transitions() {
        let cell = SubscriptionCell::new();
        let mut rx = cell.watch();

        cell.activate(SubscriptionToken::from("abc"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SubscriptionState::Active);

        cell.close(RpcError::SubscriptionClosed);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SubscriptionState::Closed);
    }
}
