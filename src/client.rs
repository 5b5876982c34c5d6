//! # Replication Client
//!
//! The satellite process talks to the replication service through the
//! [`ReplicationClient`] trait: lifecycle (`connect`/`close`), the auth and
//! start-replication handshakes, outbound transaction enqueue with
//! send/ack position bookkeeping, and shape subscription requests. Inbound
//! traffic is pushed through a [`ClientHandlers`] bundle the satellite
//! installs before connecting — the trait boundary breaks the
//! satellite ↔ client ↔ notifier cycle.
//!
//! [`WireClient`] is the production implementation: length-prefixed
//! protobuf frames over any async byte stream, a write task draining an
//! outbound queue, and a read task demultiplexing inbound frames into
//! pending-response channels and handler callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::AuthState;
use crate::error::{Error, Result};
use crate::notifier::{ConnectivityState, Notifier};
use crate::protocol::{self, Frame};
use crate::subscriptions::{
    InitialDataChange, ShapeRequest, SubscriptionData, SubscriptionId,
};
use crate::tags::Tag;
use crate::types::{
    AckType, Change, DataChange, Lsn, MigrationType, RecordType, Relation, RelationColumn,
    RowId, SchemaChange, TableType, Transaction,
};

/// Outbound frames buffered before enqueue backpressures.
const WRITE_QUEUE_SIZE: usize = 64;

// =============================================================================
// Trait
// =============================================================================

/// Outbound log positions as the client sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboundPositions {
    /// Last oplog row handed to the client.
    pub enqueued: RowId,
    /// Last oplog row the server has durably committed.
    pub ackd: RowId,
}

/// Inbound-traffic callbacks, installed by the satellite before `connect`.
pub struct ClientHandlers {
    pub on_relation: Box<dyn Fn(Relation) + Send + Sync>,
    pub on_transaction: Box<dyn Fn(Transaction) + Send + Sync>,
    pub on_ack: Box<dyn Fn(Lsn, AckType) + Send + Sync>,
    pub on_outbound_started: Box<dyn Fn() + Send + Sync>,
    pub on_subscription_data: Box<dyn Fn(SubscriptionData) + Send + Sync>,
    pub on_subscription_error: Box<dyn Fn(Option<SubscriptionId>, Error) + Send + Sync>,
}

/// Wire-protocol peer for the satellite process.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Establishes the transport.
    async fn connect(&self) -> Result<()>;

    /// Tears the transport down. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Runs the auth handshake.
    async fn authenticate(&self, auth: &AuthState) -> Result<()>;

    /// Asks the server to stream from `lsn` (or the beginning), resuming
    /// the given subscriptions. Protocol error codes surface as their
    /// matching [`Error`] variants.
    async fn start_replication(
        &self,
        lsn: Option<Lsn>,
        schema_version: Option<String>,
        subscription_ids: Vec<SubscriptionId>,
    ) -> Result<()>;

    /// Seeds the outbound position counters from persisted meta.
    fn reset_outbound_log_positions(&self, ackd: RowId, sent: RowId);

    fn get_outbound_log_positions(&self) -> OutboundPositions;

    /// Ships one locally-committed transaction. Emits a `LocalSend` ack
    /// through the handlers once the transaction is on the wire.
    async fn enqueue_transaction(&self, transaction: Transaction) -> Result<()>;

    /// Requests shape subscriptions under `subscription_id`.
    async fn subscribe(
        &self,
        subscription_id: SubscriptionId,
        shapes: Vec<ShapeRequest>,
    ) -> Result<()>;

    /// Installs the inbound callbacks. Must happen before `connect`.
    fn install_handlers(&self, handlers: ClientHandlers);
}

// =============================================================================
// Stream Connector
// =============================================================================

/// Opens the byte stream a [`WireClient`] runs over. Production uses TCP;
/// tests hand out in-memory duplex pipes.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open(&self) -> Result<Self::Stream>;
}

/// TCP connector for a `host:port` endpoint.
pub struct TcpConnect {
    pub addr: String,
}

#[async_trait]
impl Connect for TcpConnect {
    type Stream = tokio::net::TcpStream;

    async fn open(&self) -> Result<Self::Stream> {
        tokio::net::TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", self.addr)))
    }
}

// =============================================================================
// Wire Client
// =============================================================================

#[derive(Default)]
struct PendingResponses {
    auth: Option<oneshot::Sender<protocol::AuthResponse>>,
    start: Option<oneshot::Sender<protocol::StartReplicationResponse>>,
    subscribe: HashMap<String, oneshot::Sender<protocol::SubscribeResponse>>,
}

struct SharedState {
    connected: AtomicBool,
    positions: StdMutex<OutboundPositions>,
    handlers: StdMutex<Option<Arc<ClientHandlers>>>,
    pending: StdMutex<PendingResponses>,
}

struct IoState {
    writer_tx: Option<mpsc::Sender<Frame>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

/// Frame-protocol [`ReplicationClient`] over a [`Connect`]-provided stream.
pub struct WireClient<C: Connect> {
    connector: C,
    notifier: Notifier,
    shared: Arc<SharedState>,
    io: Mutex<IoState>,
}

impl WireClient<TcpConnect> {
    /// Wire client for a `host:port` replication endpoint (the `url`
    /// configuration key).
    pub fn tcp(addr: impl Into<String>, notifier: Notifier) -> Self {
        Self::new(TcpConnect { addr: addr.into() }, notifier)
    }
}

impl<C: Connect> WireClient<C> {
    pub fn new(connector: C, notifier: Notifier) -> Self {
        Self {
            connector,
            notifier,
            shared: Arc::new(SharedState {
                connected: AtomicBool::new(false),
                positions: StdMutex::new(OutboundPositions::default()),
                handlers: StdMutex::new(None),
                pending: StdMutex::new(PendingResponses::default()),
            }),
            io: Mutex::new(IoState {
                writer_tx: None,
                read_task: None,
                write_task: None,
            }),
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let tx = {
            let io = self.io.lock().await;
            io.writer_tx.clone()
        };
        match tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| Error::ConnectionFailed("write task is gone".to_string())),
            None => Err(Error::Internal(
                "client is not connected; call connect first".to_string(),
            )),
        }
    }
}

#[async_trait]
impl<C: Connect> ReplicationClient for WireClient<C> {
    async fn connect(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let stream = self.connector.open().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_SIZE);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = protocol::write_frame(&mut write_half, &frame).await {
                    warn!(error = %e, "outbound frame write failed");
                    break;
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let notifier = self.notifier.clone();
        let loop_writer = writer_tx.clone();
        let read_task = tokio::spawn(async move {
            run_read_loop(read_half, shared.clone(), loop_writer).await;
            // Stream ended or failed: flip state and tell the embedder.
            if shared.connected.swap(false, Ordering::SeqCst) {
                notifier.connectivity_changed(ConnectivityState::Disconnected);
            }
        });

        io.writer_tx = Some(writer_tx);
        io.read_task = Some(read_task);
        io.write_task = Some(write_task);
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        self.shared.connected.store(false, Ordering::SeqCst);
        io.writer_tx = None;
        if let Some(task) = io.read_task.take() {
            task.abort();
        }
        if let Some(task) = io.write_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.shared.connected.load(Ordering::SeqCst)
    }

    async fn authenticate(&self, auth: &AuthState) -> Result<()> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().expect("pending lock").auth = Some(tx);
            rx
        };
        self.send_frame(Frame::AuthRequest(protocol::AuthRequest {
            client_id: auth.client_id.clone(),
            token: auth.token.clone(),
        }))
        .await?;

        let response = rx
            .await
            .map_err(|_| Error::ConnectionFailed("connection closed during auth".to_string()))?;
        match response.error {
            Some(err) => Err(err.into_error(None)),
            None => Ok(()),
        }
    }

    async fn start_replication(
        &self,
        lsn: Option<Lsn>,
        schema_version: Option<String>,
        subscription_ids: Vec<SubscriptionId>,
    ) -> Result<()> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().expect("pending lock").start = Some(tx);
            rx
        };
        self.send_frame(Frame::StartReplicationRequest(
            protocol::StartReplicationRequest {
                lsn: lsn.map(|l| l.as_bytes().to_vec()).unwrap_or_default(),
                schema_version,
                subscription_ids: subscription_ids
                    .into_iter()
                    .map(|id| id.as_str().to_string())
                    .collect(),
            },
        ))
        .await?;

        let response = rx.await.map_err(|_| {
            Error::ConnectionFailed("connection closed during start replication".to_string())
        })?;
        match response.error {
            Some(err) => Err(err.into_error(None)),
            None => Ok(()),
        }
    }

    fn reset_outbound_log_positions(&self, ackd: RowId, sent: RowId) {
        let mut positions = self.shared.positions.lock().expect("positions lock");
        positions.ackd = ackd;
        positions.enqueued = sent;
    }

    fn get_outbound_log_positions(&self) -> OutboundPositions {
        *self.shared.positions.lock().expect("positions lock")
    }

    async fn enqueue_transaction(&self, transaction: Transaction) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Internal(
                "cannot enqueue a transaction before replication starts".to_string(),
            ));
        }
        let lsn = transaction.lsn.clone();
        let row_id = lsn.to_row_id()?;
        let msg = transaction_to_msg(&transaction);
        self.send_frame(Frame::OpLog(protocol::OpLogMsg {
            transactions: vec![msg],
        }))
        .await?;

        self.shared
            .positions
            .lock()
            .expect("positions lock")
            .enqueued = row_id;

        // The transaction is on the wire: report the local send.
        let handlers = self.shared.handlers.lock().expect("handlers lock").clone();
        if let Some(handlers) = handlers {
            (handlers.on_ack)(lsn, AckType::LocalSend);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription_id: SubscriptionId,
        shapes: Vec<ShapeRequest>,
    ) -> Result<()> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.shared
                .pending
                .lock()
                .expect("pending lock")
                .subscribe
                .insert(subscription_id.as_str().to_string(), tx);
            rx
        };
        self.send_frame(Frame::SubscribeRequest(protocol::SubscribeRequest {
            subscription_id: subscription_id.as_str().to_string(),
            shape_requests: shapes
                .into_iter()
                .map(|s| protocol::ShapeRequestMsg {
                    request_id: s.request_id,
                    tablename: s.definition.tablename,
                })
                .collect(),
        }))
        .await?;

        let response = rx.await.map_err(|_| {
            Error::ConnectionFailed("connection closed during subscribe".to_string())
        })?;
        match response.error {
            Some(err) => Err(err.into_error(Some(response.subscription_id))),
            None => Ok(()),
        }
    }

    fn install_handlers(&self, handlers: ClientHandlers) {
        *self.shared.handlers.lock().expect("handlers lock") = Some(Arc::new(handlers));
    }
}

// =============================================================================
// Read Loop
// =============================================================================

async fn run_read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: Arc<SharedState>,
    writer_tx: mpsc::Sender<Frame>,
) {
    // Relation cache for this connection, patched by Relation frames.
    let mut relations: HashMap<u32, Relation> = HashMap::new();

    loop {
        let frame = match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "inbound frame decode failed; dropping connection");
                return;
            }
        };

        let handlers = shared.handlers.lock().expect("handlers lock").clone();
        match frame {
            Frame::AuthResponse(msg) => {
                if let Some(tx) = shared.pending.lock().expect("pending lock").auth.take() {
                    let _ = tx.send(msg);
                }
            }
            Frame::StartReplicationResponse(msg) => {
                if let Some(tx) = shared.pending.lock().expect("pending lock").start.take() {
                    let _ = tx.send(msg);
                }
            }
            Frame::StartReplicationRequest(_) => {
                // The server starts the outbound direction; acknowledge and
                // tell the satellite to flush its backlog.
                let _ = writer_tx
                    .send(Frame::StartReplicationResponse(
                        protocol::StartReplicationResponse { error: None },
                    ))
                    .await;
                if let Some(handlers) = &handlers {
                    (handlers.on_outbound_started)();
                }
            }
            Frame::StopReplication(_) => {
                return;
            }
            Frame::Relation(msg) => {
                let relation = msg_to_relation(msg);
                relations.insert(relation.id, relation.clone());
                if let Some(handlers) = &handlers {
                    (handlers.on_relation)(relation);
                }
            }
            Frame::OpLog(msg) => {
                for tx_msg in msg.transactions {
                    match msg_to_transaction(tx_msg, &relations) {
                        Ok(transaction) => {
                            if let Some(handlers) = &handlers {
                                (handlers.on_transaction)(transaction);
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping undecodable transaction"),
                    }
                }
            }
            Frame::Ack(msg) => {
                let lsn = Lsn::from_bytes(msg.lsn);
                let kind = match protocol::WireAckKind::try_from(msg.kind) {
                    Ok(protocol::WireAckKind::LocalSend) => AckType::LocalSend,
                    Ok(protocol::WireAckKind::RemoteCommit) | Err(_) => AckType::RemoteCommit,
                };
                if kind == AckType::RemoteCommit {
                    if let Ok(row_id) = lsn.to_row_id() {
                        shared.positions.lock().expect("positions lock").ackd = row_id;
                    }
                }
                if let Some(handlers) = &handlers {
                    (handlers.on_ack)(lsn, kind);
                }
            }
            Frame::SubscribeResponse(msg) => {
                let tx = shared
                    .pending
                    .lock()
                    .expect("pending lock")
                    .subscribe
                    .remove(&msg.subscription_id);
                if let Some(tx) = tx {
                    let _ = tx.send(msg);
                }
            }
            Frame::SubscriptionData(msg) => match msg_to_subscription_data(msg, &relations) {
                Ok(data) => {
                    if let Some(handlers) = &handlers {
                        (handlers.on_subscription_data)(data);
                    }
                }
                Err(e) => warn!(error = %e, "dropping undecodable subscription data"),
            },
            Frame::SubscriptionError(msg) => {
                let id = msg.subscription_id.clone().map(SubscriptionId::from);
                let error = msg
                    .error
                    .unwrap_or_else(|| {
                        protocol::ReplicationError::new(
                            protocol::ErrorCode::SubscriptionError,
                            "unspecified subscription error",
                        )
                    })
                    .into_error(msg.subscription_id);
                if let Some(handlers) = &handlers {
                    (handlers.on_subscription_error)(id, error);
                }
            }
            Frame::AuthRequest(_) | Frame::SubscribeRequest(_) => {
                warn!("ignoring client-to-server frame echoed back");
            }
        }
    }
}

// =============================================================================
// Wire ↔ Domain Conversion
// =============================================================================

fn msg_to_relation(msg: protocol::RelationMsg) -> Relation {
    Relation {
        id: msg.id,
        schema: msg.schema,
        table: msg.table,
        table_type: TableType::Table,
        columns: msg
            .columns
            .into_iter()
            .map(|c| RelationColumn {
                name: c.name,
                sqlite_type: c.sqlite_type,
                is_nullable: c.is_nullable,
                primary_key: (c.primary_key > 0).then_some(c.primary_key),
            })
            .collect(),
    }
}

/// Encodes a relation for the wire.
pub fn relation_to_msg(relation: &Relation) -> protocol::RelationMsg {
    protocol::RelationMsg {
        id: relation.id,
        schema: relation.schema.clone(),
        table: relation.table.clone(),
        columns: relation
            .columns
            .iter()
            .map(|c| protocol::RelationColumnMsg {
                name: c.name.clone(),
                sqlite_type: c.sqlite_type.clone(),
                is_nullable: c.is_nullable,
                primary_key: c.primary_key.unwrap_or(0),
            })
            .collect(),
    }
}

fn parse_tags(raw: &[String]) -> Result<Vec<Tag>> {
    raw.iter().map(|s| Tag::parse(s)).collect()
}

fn msg_to_transaction(
    msg: protocol::TransactionMsg,
    relations: &HashMap<u32, Relation>,
) -> Result<Transaction> {
    let mut changes = Vec::with_capacity(msg.changes.len());
    for change in msg.changes {
        let kind = change
            .kind
            .ok_or_else(|| Error::Internal("change frame with no payload".to_string()))?;
        match kind {
            protocol::change_msg::Kind::Data(data) => {
                let relation = relations.get(&data.relation_id).ok_or_else(|| {
                    Error::Internal(format!("unknown relation id {}", data.relation_id))
                })?;
                let record_type = match protocol::WireRecordType::try_from(data.record_type) {
                    Ok(protocol::WireRecordType::Insert) => RecordType::Insert,
                    Ok(protocol::WireRecordType::Update) => RecordType::Update,
                    Ok(protocol::WireRecordType::Delete) => RecordType::Delete,
                    Err(_) => {
                        return Err(Error::Internal(format!(
                            "unknown record type {}",
                            data.record_type
                        )))
                    }
                };
                changes.push(Change::Data(DataChange {
                    relation: relation.clone(),
                    record_type,
                    new_record: data
                        .new_record
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?,
                    old_record: data
                        .old_record
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?,
                    tags: parse_tags(&data.tags)?,
                }));
            }
            protocol::change_msg::Kind::Schema(schema) => {
                let migration_type =
                    match protocol::WireMigrationType::try_from(schema.migration_type) {
                        Ok(protocol::WireMigrationType::CreateTable) => MigrationType::CreateTable,
                        Ok(protocol::WireMigrationType::AlterAdd) | Err(_) => {
                            MigrationType::AlterAdd
                        }
                    };
                changes.push(Change::Schema(SchemaChange {
                    sql: schema.sql,
                    table: schema.table,
                    migration_type,
                    version: schema.version,
                }));
            }
        }
    }

    Ok(Transaction {
        origin: msg.origin,
        commit_timestamp: msg.commit_timestamp,
        lsn: Lsn::from_bytes(msg.lsn),
        changes,
    })
}

/// Encodes a locally-committed transaction for the wire.
pub fn transaction_to_msg(transaction: &Transaction) -> protocol::TransactionMsg {
    let changes = transaction
        .changes
        .iter()
        .map(|change| protocol::ChangeMsg {
            kind: Some(match change {
                Change::Data(data) => protocol::change_msg::Kind::Data(protocol::DataChangeMsg {
                    relation_id: data.relation.id,
                    record_type: match data.record_type {
                        RecordType::Insert => protocol::WireRecordType::Insert as i32,
                        RecordType::Update => protocol::WireRecordType::Update as i32,
                        RecordType::Delete => protocol::WireRecordType::Delete as i32,
                    },
                    new_record: data
                        .new_record
                        .as_ref()
                        .map(|r| serde_json::to_string(r).expect("row maps always serialize")),
                    old_record: data
                        .old_record
                        .as_ref()
                        .map(|r| serde_json::to_string(r).expect("row maps always serialize")),
                    tags: data.tags.iter().map(Tag::to_string).collect(),
                }),
                Change::Schema(schema) => {
                    protocol::change_msg::Kind::Schema(protocol::SchemaChangeMsg {
                        sql: schema.sql.clone(),
                        table: schema.table.clone(),
                        migration_type: match schema.migration_type {
                            MigrationType::CreateTable => {
                                protocol::WireMigrationType::CreateTable as i32
                            }
                            MigrationType::AlterAdd => protocol::WireMigrationType::AlterAdd as i32,
                        },
                        version: schema.version.clone(),
                    })
                }
            }),
        })
        .collect();

    protocol::TransactionMsg {
        origin: transaction.origin.clone(),
        commit_timestamp: transaction.commit_timestamp,
        lsn: transaction.lsn.as_bytes().to_vec(),
        changes,
    }
}

fn msg_to_subscription_data(
    msg: protocol::SubscriptionDataMsg,
    relations: &HashMap<u32, Relation>,
) -> Result<SubscriptionData> {
    let mut data = Vec::with_capacity(msg.data.len());
    for row in msg.data {
        let relation = relations
            .get(&row.relation_id)
            .ok_or_else(|| Error::Internal(format!("unknown relation id {}", row.relation_id)))?;
        data.push(InitialDataChange {
            relation: relation.clone(),
            record: serde_json::from_str(&row.row)?,
            tags: parse_tags(&row.tags)?,
        });
    }
    Ok(SubscriptionData {
        subscription_id: SubscriptionId::from(msg.subscription_id),
        lsn: Lsn::from_bytes(msg.lsn),
        data,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DuplexConnect;
    use crate::types::QualifiedTablename;

    fn relation_msg() -> protocol::RelationMsg {
        protocol::RelationMsg {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            columns: vec![
                protocol::RelationColumnMsg {
                    name: "id".to_string(),
                    sqlite_type: "INTEGER".to_string(),
                    is_nullable: false,
                    primary_key: 1,
                },
                protocol::RelationColumnMsg {
                    name: "value".to_string(),
                    sqlite_type: "TEXT".to_string(),
                    is_nullable: true,
                    primary_key: 0,
                },
            ],
        }
    }

    fn forwarding_handlers(
        events: mpsc::UnboundedSender<String>,
    ) -> ClientHandlers {
        let relation_tx = events.clone();
        let tx_tx = events.clone();
        let ack_tx = events.clone();
        let outbound_tx = events.clone();
        let data_tx = events.clone();
        let err_tx = events;
        ClientHandlers {
            on_relation: Box::new(move |r| {
                let _ = relation_tx.send(format!("relation:{}", r.table));
            }),
            on_transaction: Box::new(move |t| {
                let _ = tx_tx.send(format!("tx:{}", t.changes.len()));
            }),
            on_ack: Box::new(move |lsn, kind| {
                let _ = ack_tx.send(format!(
                    "ack:{:?}:{}",
                    kind,
                    lsn.to_row_id().map(|r| r.as_raw()).unwrap_or(-1)
                ));
            }),
            on_outbound_started: Box::new(move || {
                let _ = outbound_tx.send("outbound".to_string());
            }),
            on_subscription_data: Box::new(move |d| {
                let _ = data_tx.send(format!("data:{}", d.data.len()));
            }),
            on_subscription_error: Box::new(move |id, _| {
                let _ = err_tx.send(format!("suberr:{:?}", id.map(|i| i.to_string())));
            }),
        }
    }

    #[tokio::test]
    async fn test_auth_handshake_roundtrip() {
        let (connect, mut server) = DuplexConnect::pair();
        let client = WireClient::new(connect, Notifier::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();
        assert!(!client.is_closed());

        let auth = AuthState {
            client_id: "c-1".to_string(),
            token: "jwt".to_string(),
        };
        let handshake = tokio::spawn(async move {
            // Server side: expect the auth request, reply ok.
            let frame = protocol::read_frame(&mut server).await.unwrap().unwrap();
            match frame {
                Frame::AuthRequest(req) => {
                    assert_eq!(req.client_id, "c-1");
                    assert_eq!(req.token, "jwt");
                }
                other => panic!("unexpected {other:?}"),
            }
            protocol::write_frame(
                &mut server,
                &Frame::AuthResponse(protocol::AuthResponse { error: None }),
            )
            .await
            .unwrap();
            server
        });

        client.authenticate(&auth).await.unwrap();
        handshake.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_replication_error_mapping() {
        let (connect, mut server) = DuplexConnect::pair();
        let client = WireClient::new(connect, Notifier::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();

        let server_side = tokio::spawn(async move {
            let _req = protocol::read_frame(&mut server).await.unwrap().unwrap();
            protocol::write_frame(
                &mut server,
                &Frame::StartReplicationResponse(protocol::StartReplicationResponse {
                    error: Some(protocol::ReplicationError::new(
                        protocol::ErrorCode::BehindWindow,
                        "log truncated",
                    )),
                }),
            )
            .await
            .unwrap();
            server
        });

        let err = client
            .start_replication(Some(Lsn::from_bytes(vec![9])), None, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BehindWindow));
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handlers() {
        let (connect, mut server) = DuplexConnect::pair();
        let client = WireClient::new(connect, Notifier::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();

        // Relation first so the transaction's relation id resolves.
        protocol::write_frame(&mut server, &Frame::Relation(relation_msg()))
            .await
            .unwrap();
        protocol::write_frame(
            &mut server,
            &Frame::OpLog(protocol::OpLogMsg {
                transactions: vec![protocol::TransactionMsg {
                    origin: Some("remote".to_string()),
                    commit_timestamp: 1_000,
                    lsn: vec![0, 1],
                    changes: vec![protocol::ChangeMsg {
                        kind: Some(protocol::change_msg::Kind::Data(protocol::DataChangeMsg {
                            relation_id: 1,
                            record_type: protocol::WireRecordType::Insert as i32,
                            new_record: Some("{\"id\":1,\"value\":\"x\"}".to_string()),
                            old_record: None,
                            tags: vec!["remote@2024-01-02T03:04:05.678Z".to_string()],
                        })),
                    }],
                }],
            }),
        )
        .await
        .unwrap();
        protocol::write_frame(
            &mut server,
            &Frame::Ack(protocol::AckMsg {
                lsn: Lsn::from_row_id(RowId::from_raw(4)).as_bytes().to_vec(),
                kind: protocol::WireAckKind::RemoteCommit as i32,
            }),
        )
        .await
        .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), "relation:parent");
        assert_eq!(events_rx.recv().await.unwrap(), "tx:1");
        assert_eq!(events_rx.recv().await.unwrap(), "ack:RemoteCommit:4");
        assert_eq!(
            client.get_outbound_log_positions().ackd,
            RowId::from_raw(4)
        );
    }

    #[tokio::test]
    async fn test_enqueue_updates_positions_and_acks_local_send() {
        let (connect, mut server) = DuplexConnect::pair();
        let client = WireClient::new(connect, Notifier::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();
        client.reset_outbound_log_positions(RowId::ZERO, RowId::ZERO);

        let relation = msg_to_relation(relation_msg());
        let transaction = Transaction {
            origin: Some("c-1".to_string()),
            commit_timestamp: 2_000,
            lsn: Lsn::from_row_id(RowId::from_raw(3)),
            changes: vec![Change::Data(DataChange {
                relation,
                record_type: RecordType::Insert,
                new_record: Some(
                    serde_json::from_str("{\"id\":1,\"value\":\"x\"}").unwrap(),
                ),
                old_record: None,
                tags: vec![],
            })],
        };
        client.enqueue_transaction(transaction).await.unwrap();

        assert_eq!(
            client.get_outbound_log_positions().enqueued,
            RowId::from_raw(3)
        );
        assert_eq!(events_rx.recv().await.unwrap(), "ack:LocalSend:3");

        // The transaction arrived framed on the server side.
        let frame = protocol::read_frame(&mut server).await.unwrap().unwrap();
        match frame {
            Frame::OpLog(oplog) => {
                assert_eq!(oplog.transactions.len(), 1);
                assert_eq!(oplog.transactions[0].commit_timestamp, 2_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_outbound_start_triggers_handler() {
        let (connect, mut server) = DuplexConnect::pair();
        let client = WireClient::new(connect, Notifier::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();

        protocol::write_frame(
            &mut server,
            &Frame::StartReplicationRequest(protocol::StartReplicationRequest {
                lsn: vec![],
                schema_version: None,
                subscription_ids: vec![],
            }),
        )
        .await
        .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), "outbound");
        // The client acknowledged the server's start request.
        let frame = protocol::read_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(frame, Frame::StartReplicationResponse(_)));
    }

    #[tokio::test]
    async fn test_disconnect_emits_connectivity_event() {
        let notifier = Notifier::new();
        let mut connectivity = notifier.subscribe_to_connectivity();
        let (connect, server) = DuplexConnect::pair();
        let client = WireClient::new(connect, notifier);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        client.install_handlers(forwarding_handlers(events_tx));
        client.connect().await.unwrap();

        drop(server);

        assert_eq!(
            connectivity.recv().await.unwrap(),
            ConnectivityState::Disconnected
        );
        assert!(client.is_closed());
    }

    #[test]
    fn test_relation_msg_roundtrip() {
        let relation = msg_to_relation(relation_msg());
        assert_eq!(
            relation.qualified_tablename(),
            QualifiedTablename::new("main", "parent")
        );
        assert_eq!(relation.primary_key_columns(), vec!["id"]);
        assert_eq!(relation_to_msg(&relation), relation_msg());
    }
}
