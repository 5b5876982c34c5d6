//! # Test Support
//!
//! In-memory stand-ins for the replication service, used by the crate's own
//! tests and by embedders' integration tests:
//!
//! - [`DuplexConnect`]: hands a [`WireClient`] one half of an in-memory
//!   duplex pipe; the test drives the other half as the server.
//! - [`MockClient`]: a scripted [`ReplicationClient`] that records every
//!   call and lets tests inject inbound traffic through the handlers the
//!   satellite installed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::client::{ClientHandlers, Connect, OutboundPositions, ReplicationClient};
use crate::config::AuthState;
use crate::error::{Error, Result};
use crate::subscriptions::{ShapeRequest, SubscriptionData, SubscriptionId};
use crate::types::{AckType, Lsn, Relation, RowId, Transaction};

/// In-memory pipe capacity for duplex test streams.
const DUPLEX_CAPACITY: usize = 64 * 1024;

// =============================================================================
// Duplex Connector
// =============================================================================

/// A [`Connect`] impl backed by pre-created in-memory duplex streams. Each
/// `connect` consumes one queued stream, so tests can also exercise
/// reconnects by queueing several.
pub struct DuplexConnect {
    streams: StdMutex<VecDeque<DuplexStream>>,
}

impl DuplexConnect {
    /// One client connector and the matching server-side stream.
    pub fn pair() -> (Self, DuplexStream) {
        let (client_side, server_side) = tokio::io::duplex(DUPLEX_CAPACITY);
        let connect = Self {
            streams: StdMutex::new(VecDeque::from([client_side])),
        };
        (connect, server_side)
    }

    /// A connector with `count` queued connections and their server sides.
    pub fn with_connections(count: usize) -> (Self, Vec<DuplexStream>) {
        let mut client_sides = VecDeque::new();
        let mut server_sides = Vec::new();
        for _ in 0..count {
            let (c, s) = tokio::io::duplex(DUPLEX_CAPACITY);
            client_sides.push_back(c);
            server_sides.push(s);
        }
        (
            Self {
                streams: StdMutex::new(client_sides),
            },
            server_sides,
        )
    }
}

#[async_trait]
impl Connect for DuplexConnect {
    type Stream = DuplexStream;

    async fn open(&self) -> Result<Self::Stream> {
        self.streams
            .lock()
            .expect("stream queue lock")
            .pop_front()
            .ok_or_else(|| Error::ConnectionFailed("no more test connections".to_string()))
    }
}

// =============================================================================
// Mock Client
// =============================================================================

/// Everything a [`MockClient`] was asked to do, for assertions.
#[derive(Debug, Default)]
pub struct MockCalls {
    pub connects: usize,
    pub closes: usize,
    pub authenticated: Vec<String>,
    /// `(lsn, schema_version, subscription_ids)` per start-replication call.
    pub starts: Vec<(Option<Lsn>, Option<String>, Vec<SubscriptionId>)>,
    pub enqueued: Vec<Transaction>,
    /// `(subscription_id, shapes)` per subscribe call.
    pub subscribes: Vec<(SubscriptionId, Vec<ShapeRequest>)>,
}

struct MockState {
    calls: MockCalls,
    closed: bool,
    positions: OutboundPositions,
    /// Scripted results for successive `start_replication` calls; empty
    /// means success.
    start_results: VecDeque<Result<()>>,
    /// Scripted results for successive `subscribe` calls.
    subscribe_results: VecDeque<Result<()>>,
}

/// A scripted in-process [`ReplicationClient`].
///
/// Tests preload error outcomes with [`MockClient::push_start_result`],
/// then drive inbound traffic with `deliver_*`, which invoke the handlers
/// the satellite installed — the same path real wire traffic takes.
#[derive(Clone)]
pub struct MockClient {
    state: Arc<StdMutex<MockState>>,
    handlers: Arc<StdMutex<Option<Arc<ClientHandlers>>>>,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(MockState {
                calls: MockCalls::default(),
                closed: true,
                positions: OutboundPositions::default(),
                start_results: VecDeque::new(),
                subscribe_results: VecDeque::new(),
            })),
            handlers: Arc::new(StdMutex::new(None)),
        }
    }

    /// Scripts the outcome of the next `start_replication` call.
    pub fn push_start_result(&self, result: Result<()>) {
        self.state
            .lock()
            .expect("mock state")
            .start_results
            .push_back(result);
    }

    /// Scripts the outcome of the next `subscribe` call.
    pub fn push_subscribe_result(&self, result: Result<()>) {
        self.state
            .lock()
            .expect("mock state")
            .subscribe_results
            .push_back(result);
    }

    /// Runs `f` over the recorded calls.
    pub fn with_calls<T>(&self, f: impl FnOnce(&MockCalls) -> T) -> T {
        f(&self.state.lock().expect("mock state").calls)
    }

    fn handlers(&self) -> Option<Arc<ClientHandlers>> {
        self.handlers.lock().expect("mock handlers").clone()
    }

    // -------------------------------------------------------------------------
    // Inbound injection
    // -------------------------------------------------------------------------

    /// Delivers an inbound transaction, as the wire read loop would.
    pub fn deliver_transaction(&self, transaction: Transaction) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_transaction)(transaction);
        }
    }

    pub fn deliver_relation(&self, relation: Relation) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_relation)(relation);
        }
    }

    pub fn deliver_ack(&self, lsn: Lsn, kind: AckType) {
        if kind == AckType::RemoteCommit {
            if let Ok(row_id) = lsn.to_row_id() {
                self.state.lock().expect("mock state").positions.ackd = row_id;
            }
        }
        if let Some(handlers) = self.handlers() {
            (handlers.on_ack)(lsn, kind);
        }
    }

    pub fn deliver_outbound_started(&self) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_outbound_started)();
        }
    }

    pub fn deliver_subscription_data(&self, data: SubscriptionData) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_subscription_data)(data);
        }
    }

    pub fn deliver_subscription_error(&self, id: Option<SubscriptionId>, error: Error) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_subscription_error)(id, error);
        }
    }
}

#[async_trait]
impl ReplicationClient for MockClient {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().expect("mock state");
        state.calls.connects += 1;
        state.closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("mock state");
        state.calls.closes += 1;
        state.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("mock state").closed
    }

    async fn authenticate(&self, auth: &AuthState) -> Result<()> {
        self.state
            .lock()
            .expect("mock state")
            .calls
            .authenticated
            .push(auth.client_id.clone());
        Ok(())
    }

    async fn start_replication(
        &self,
        lsn: Option<Lsn>,
        schema_version: Option<String>,
        subscription_ids: Vec<SubscriptionId>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("mock state");
        state
            .calls
            .starts
            .push((lsn, schema_version, subscription_ids));
        state.start_results.pop_front().unwrap_or(Ok(()))
    }

    fn reset_outbound_log_positions(&self, ackd: RowId, sent: RowId) {
        let mut state = self.state.lock().expect("mock state");
        state.positions.ackd = ackd;
        state.positions.enqueued = sent;
    }

    fn get_outbound_log_positions(&self) -> OutboundPositions {
        self.state.lock().expect("mock state").positions
    }

    async fn enqueue_transaction(&self, transaction: Transaction) -> Result<()> {
        let lsn = transaction.lsn.clone();
        let row_id = lsn.to_row_id()?;
        {
            let mut state = self.state.lock().expect("mock state");
            state.calls.enqueued.push(transaction);
            state.positions.enqueued = row_id;
        }
        if let Some(handlers) = self.handlers() {
            (handlers.on_ack)(lsn, AckType::LocalSend);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription_id: SubscriptionId,
        shapes: Vec<ShapeRequest>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("mock state");
        state.calls.subscribes.push((subscription_id, shapes));
        state.subscribe_results.pop_front().unwrap_or(Ok(()))
    }

    fn install_handlers(&self, handlers: ClientHandlers) {
        *self.handlers.lock().expect("mock handlers") = Some(Arc::new(handlers));
    }
}

// =============================================================================
// Tests
// =============================================================================
