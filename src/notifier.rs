//! # Notifier
//!
//! Typed pub/sub between the satellite process and its embedder, built on
//! broadcast channels. Four event streams:
//!
//! - **connectivity**: the embedder (or transport) reports the link state;
//!   the satellite drives its connect/close state machine off it.
//! - **auth**: token refreshes, picked up on the next connect.
//! - **potential changes**: a hint that local writes may have happened;
//!   triggers a throttled snapshot.
//! - **actual changes**: emitted by the satellite after a database
//!   transaction commits, naming the affected tables.
//!
//! Receivers that lag past the channel capacity miss events (`Lagged`);
//! every stream here is either a hint that is safely re-derived or a state
//! that is re-read, so lag is not fatal.

use tokio::sync::broadcast;

use crate::types::QualifiedTablename;

/// Buffered events per stream before slow receivers lag.
const CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Events
// =============================================================================

/// Link state reported by the embedder or transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// The network is usable; the satellite should (re)connect.
    Available,
    /// The transport is up. Informational; no action.
    Connected,
    /// The transport dropped; the satellite closes the client.
    Disconnected,
    /// The transport failed; treated like a disconnect.
    Error,
}

/// A committed local or applied remote change, by table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub changes: Vec<QualifiedTablename>,
}

/// A refreshed auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub token: String,
}

// =============================================================================
// Notifier
// =============================================================================

/// Cloneable pub/sub hub. All clones share the same channels.
#[derive(Debug, Clone)]
pub struct Notifier {
    connectivity_tx: broadcast::Sender<ConnectivityState>,
    potential_tx: broadcast::Sender<()>,
    actual_tx: broadcast::Sender<ChangeNotification>,
    auth_tx: broadcast::Sender<AuthChange>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            connectivity_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            potential_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            actual_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            auth_tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    /// Reports a connectivity transition. No receivers is fine.
    pub fn connectivity_changed(&self, state: ConnectivityState) {
        let _ = self.connectivity_tx.send(state);
    }

    /// Hints that local writes may have happened.
    pub fn potentially_changed(&self) {
        let _ = self.potential_tx.send(());
    }

    /// Announces committed changes to the named tables.
    pub fn actually_changed(&self, changes: Vec<QualifiedTablename>) {
        if changes.is_empty() {
            return;
        }
        let _ = self.actual_tx.send(ChangeNotification { changes });
    }

    /// Publishes a refreshed auth token.
    pub fn auth_changed(&self, token: impl Into<String>) {
        let _ = self.auth_tx.send(AuthChange {
            token: token.into(),
        });
    }

    // -------------------------------------------------------------------------
    // Subscribe
    // -------------------------------------------------------------------------

    pub fn subscribe_to_connectivity(&self) -> broadcast::Receiver<ConnectivityState> {
        self.connectivity_tx.subscribe()
    }

    pub fn subscribe_to_potential_changes(&self) -> broadcast::Receiver<()> {
        self.potential_tx.subscribe()
    }

    pub fn subscribe_to_data_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.actual_tx.subscribe()
    }

    pub fn subscribe_to_auth_changes(&self) -> broadcast::Receiver<AuthChange> {
        self.auth_tx.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================
