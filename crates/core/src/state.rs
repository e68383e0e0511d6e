//! Shared connection and authentication state.
//!
//! State lives inside `tokio::sync::watch` cells: writers use
//! [`SharedState::update_connection`] / [`SharedState::update_auth`], readers
//! get snapshot copies, and waiters block on the watch channel instead of
//! polling. Invariants (`authenticated ⇒ connected`,
//! `reconnecting ⇒ ¬connected`) are enforced at the update seam.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Point-in-time view of the transport connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub authenticated: bool,
    pub reconnecting: bool,
    /// Monotonically increasing until a successful connect resets it to 0.
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Point-in-time view of the authentication handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSnapshot {
    pub authenticated: bool,
    pub wallet_address: Option<String>,
    /// The pending challenge text, if one was issued and not yet answered.
    pub challenge: Option<String>,
    /// Rooms granted by the server on auth success.
    pub rooms: Vec<String>,
}

/// Cloneable handle to the client's shared state.
#[derive(Clone)]
pub struct SharedState {
    conn_tx: watch::Sender<ConnectionSnapshot>,
    auth_tx: watch::Sender<AuthSnapshot>,
}

impl SharedState {
    pub fn new() -> Self {
        let (conn_tx, _) = watch::channel(ConnectionSnapshot::default());
        let (auth_tx, _) = watch::channel(AuthSnapshot::default());
        Self { conn_tx, auth_tx }
    }

    /// Copy of the current connection snapshot.
    pub fn connection(&self) -> ConnectionSnapshot {
        self.conn_tx.borrow().clone()
    }

    /// Copy of the current auth snapshot.
    pub fn auth(&self) -> AuthSnapshot {
        self.auth_tx.borrow().clone()
    }

    /// Mutate the connection snapshot and publish the new value.
    ///
    /// Disconnection clears `authenticated` on both snapshots so the
    /// `authenticated ⇒ connected` invariant can never be observed broken.
    pub fn update_connection(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        let mut lost_auth = false;
        self.conn_tx.send_modify(|snapshot| {
            f(snapshot);
            if snapshot.reconnecting {
                snapshot.connected = false;
            }
            if !snapshot.connected && snapshot.authenticated {
                snapshot.authenticated = false;
                lost_auth = true;
            }
        });
        if lost_auth {
            self.auth_tx.send_modify(|auth| {
                auth.authenticated = false;
                auth.challenge = None;
            });
        }
    }

    /// Mutate the auth snapshot and publish the new value.
    pub fn update_auth(&self, f: impl FnOnce(&mut AuthSnapshot)) {
        let mut authenticated = false;
        self.auth_tx.send_modify(|snapshot| {
            f(snapshot);
            authenticated = snapshot.authenticated;
        });
        // Mirror onto the connection snapshot (single writer for both).
        self.conn_tx.send_modify(|snapshot| {
            snapshot.authenticated = authenticated && snapshot.connected;
        });
    }

    /// Subscribe to connection snapshot changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.conn_tx.subscribe()
    }

    /// Subscribe to auth snapshot changes.
    pub fn watch_auth(&self) -> watch::Receiver<AuthSnapshot> {
        self.auth_tx.subscribe()
    }

    /// Block until `authenticated` flips true, the connection drops, or the
    /// deadline passes. Returns whether authentication was observed.
    pub async fn wait_authenticated(&self, timeout: Duration) -> bool {
        let mut auth_rx = self.auth_tx.subscribe();
        let mut conn_rx = self.conn_tx.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        if auth_rx.borrow().authenticated {
            return true;
        }
        loop {
            tokio::select! {
                changed = auth_rx.changed() => {
                    if changed.is_err() || auth_rx.borrow().authenticated {
                        return auth_rx.borrow().authenticated;
                    }
                }
                changed = conn_rx.changed() => {
                    // A drop or a recorded transport error ends the wait.
                    if changed.is_err() {
                        return false;
                    }
                    let snapshot = conn_rx.borrow();
                    if !snapshot.connected || snapshot.last_error.is_some() {
                        return false;
                    }
                }
                _ = &mut deadline => return false,
            }
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
