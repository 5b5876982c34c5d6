//! # Satellite Process
//!
//! The orchestrator: one event-loop task owns every piece of mutable
//! replication state and processes, strictly in arrival order,
//!
//! - inbound client traffic (transactions, relations, acks, subscription
//!   data and errors),
//! - notifier events (connectivity, auth refresh, potential-change hints),
//! - the polling timer and throttled snapshot wake-ups,
//! - API commands from the [`Satellite`] handle.
//!
//! ```text
//!  client handlers ──┐
//!  notifier events ──┼── mpsc<LoopEvent> ──► satellite loop ──► adapter
//!  polling timer ────┤                        (all state)       client
//!  Satellite handle ─┘
//! ```
//!
//! Sequential processing gives the concurrency guarantees for free:
//! snapshots never overlap, transactions apply in delivery order, and no
//! state mutation races a suspension point. A boolean still guards against
//! re-entrant snapshots as a programmer-error tripwire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::Adapter;
use crate::client::ClientHandlers;
use crate::client::ReplicationClient;
use crate::config::{AuthConfig, AuthState, SatelliteConfig, TableNames};
use crate::error::{Error, Result};
use crate::merge::{self, ChangeOp};
use crate::migrations;
use crate::notifier::{ConnectivityState, Notifier};
use crate::oplog;
use crate::schema;
use crate::snapshot::{self, SnapshotOutcome, Throttle, ThrottleDecision};
use crate::subscriptions::{
    self, ShapeDefinition, SubscribeOutcome, SubscriptionData, SubscriptionId,
    SubscriptionManager, SyncedFuture,
};
use crate::triggers;
use crate::types::{
    AckType, Change, DataChange, Lsn, QualifiedTablename, Relation, RelationColumn, RowId,
    SchemaChange, TableType, Transaction,
};

/// Positional-parameter ceiling for hosts at or above SQLite 3.32.
const MAX_PARAMETERS_MODERN: usize = 32_766;
/// Ceiling for older hosts.
const MAX_PARAMETERS_LEGACY: usize = 999;

// =============================================================================
// Events and Commands
// =============================================================================

enum LoopEvent {
    /// Run the connect-and-start-replication attempt; the sender receives
    /// the attempt's outcome (fatal errors only — everything else is
    /// swallowed and retried on the next connectivity transition).
    Connect(Option<oneshot::Sender<Result<()>>>),
    Transaction(Transaction),
    Relation(Relation),
    Ack(Lsn, AckType),
    OutboundStarted,
    SubscriptionData(SubscriptionData),
    SubscriptionError(Option<SubscriptionId>, Error),
    Connectivity(ConnectivityState),
    AuthChanged(String),
    PotentialChange,
    /// Trailing edge of the snapshot throttle.
    SnapshotDue,
    Command(Command),
}

enum Command {
    Subscribe {
        shapes: Vec<ShapeDefinition>,
        reply: oneshot::Sender<Result<SyncedFuture>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle to a running satellite process.
///
/// Cheap to share behind the embedder's own `Arc`; dropping every handle
/// does not stop the process — call [`Satellite::stop`].
pub struct Satellite {
    command_tx: mpsc::UnboundedSender<LoopEvent>,
    notifier: Notifier,
    client_id: String,
    connection_rx: Option<oneshot::Receiver<Result<()>>>,
}

impl Satellite {
    /// Boots the satellite process: schema migrations, client identity,
    /// relation cache and trigger installation, counter restore, and an
    /// asynchronous first connection attempt.
    ///
    /// Returns once local state is ready; [`Satellite::wait_connected`]
    /// exposes the connection attempt's outcome.
    pub async fn start(
        adapter: Adapter,
        client: Arc<dyn ReplicationClient>,
        notifier: Notifier,
        auth: AuthConfig,
        config: SatelliteConfig,
    ) -> Result<Satellite> {
        auth.validate()?;
        let names = config.table_names.clone();

        // Local schema first; everything else depends on it.
        adapter.run_batch("PRAGMA foreign_keys = ON").await?;
        {
            let names = names.clone();
            adapter
                .call(move |conn| {
                    migrations::up(conn, &names)?;
                    schema::verify_satellite_tables(conn, &names)
                })
                .await?;
        }

        // Client identity: config override, else persisted, else fresh.
        let client_id = {
            let names = names.clone();
            let configured = auth.client_id.clone();
            adapter
                .call(move |conn| resolve_client_id(conn, &names, configured))
                .await?
        };

        // Restore replication positions and subscription state.
        let names_for_load = names.clone();
        let (last_ackd, last_sent, lsn, serialized_subs) = adapter
            .call(move |conn| {
                Ok((
                    schema::get_meta_row_id(conn, &names_for_load, "lastAckdRowId")?,
                    schema::get_meta_row_id(conn, &names_for_load, "lastSentRowId")?,
                    schema::get_meta_lsn(conn, &names_for_load)?,
                    schema::get_meta(conn, &names_for_load, "subscriptions")?.unwrap_or_default(),
                ))
            })
            .await?;
        let mut subscription_manager = SubscriptionManager::new();
        subscription_manager.restore(&serialized_subs)?;

        // Relation cache from the live schema, with capture triggers
        // (re)installed for every user table.
        let relations = {
            let names = names.clone();
            adapter
                .call(move |conn| {
                    let relations = build_relations(conn, &names)?;
                    for relation in relations.values() {
                        triggers::install_for_relation(conn, &names, relation)?;
                        triggers::install_compensation_triggers(conn, &names, relation)?;
                    }
                    Ok(relations)
                })
                .await?
        };

        let max_sql_parameters = adapter.call(probe_max_parameters).await?;

        client.reset_outbound_log_positions(last_ackd, last_sent);

        // Everything below feeds the loop through one channel.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        client.install_handlers(loop_handlers(events_tx.clone()));

        let mut background = Vec::new();
        background.push(spawn_connectivity_forwarder(&notifier, events_tx.clone()));
        background.push(spawn_potential_forwarder(&notifier, events_tx.clone()));
        background.push(spawn_auth_forwarder(&notifier, events_tx.clone()));
        background.push(spawn_poller(config.polling_interval, events_tx.clone()));

        let satellite_loop = SatelliteLoop {
            adapter,
            client,
            notifier: notifier.clone(),
            names,
            auth_token: auth.token,
            client_id: client_id.clone(),
            relations,
            lsn,
            last_ackd,
            last_sent,
            max_sql_parameters,
            subscriptions: subscription_manager,
            throttle: Throttle::new(config.min_snapshot_window),
            snapshot_in_progress: false,
            replicating: false,
            clear_on_behind_window: config.clear_on_behind_window,
            events_tx: events_tx.clone(),
            background,
        };
        tokio::spawn(satellite_loop.run(events_rx));

        // First connection attempt, asynchronously.
        let (connection_tx, connection_rx) = oneshot::channel();
        let _ = events_tx.send(LoopEvent::Connect(Some(connection_tx)));

        info!(client_id = %client_id, "satellite process started");
        Ok(Satellite {
            command_tx: events_tx,
            notifier,
            client_id,
            connection_rx: Some(connection_rx),
        })
    }

    /// Outcome of the connection attempt kicked off by `start`. Fatal
    /// replication errors (`connection failed`, `invalid position`,
    /// `behind window` with recovery disabled) surface here; everything
    /// else resolves `Ok` and is retried on connectivity transitions.
    pub async fn wait_connected(&mut self) -> Result<()> {
        match self.connection_rx.take() {
            Some(rx) => rx.await.map_err(|_| Error::Stopped)?,
            None => Ok(()),
        }
    }

    /// Subscribes to whole-table shapes. The returned future resolves when
    /// the initial data has been applied; subscription failures surface
    /// there, not here.
    pub async fn subscribe(&self, shapes: Vec<ShapeDefinition>) -> Result<SyncedFuture> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(LoopEvent::Command(Command::Subscribe {
                shapes,
                reply: reply_tx,
            }))
            .map_err(|_| Error::Stopped)?;
        reply_rx.await.map_err(|_| Error::Stopped)?
    }

    /// Forces a snapshot outside the throttle (still serialized with every
    /// other snapshot).
    pub async fn snapshot(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(LoopEvent::Command(Command::Snapshot { reply: reply_tx }))
            .map_err(|_| Error::Stopped)?;
        reply_rx.await.map_err(|_| Error::Stopped)?
    }

    /// Stops the process: cancels the poller and notifier forwarders,
    /// drains the loop, closes the client. In-flight snapshot or apply
    /// work completes first.
    pub async fn stop(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(LoopEvent::Command(Command::Stop { reply: reply_tx }))
            .map_err(|_| Error::Stopped)?;
        reply_rx.await.map_err(|_| Error::Stopped)
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// The stable client identity for this database file.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

// =============================================================================
// Startup Helpers
// =============================================================================

fn resolve_client_id(
    conn: &Connection,
    names: &TableNames,
    configured: Option<String>,
) -> Result<String> {
    if let Some(id) = configured {
        schema::set_meta(conn, names, "clientId", &id)?;
        return Ok(id);
    }
    match schema::get_meta(conn, names, "clientId")? {
        Some(id) if !id.is_empty() => Ok(id),
        _ => {
            let id = uuid::Uuid::new_v4().to_string();
            schema::set_meta(conn, names, "clientId", &id)?;
            Ok(id)
        }
    }
}

/// Rebuilds the relation cache from `pragma_table_info` over every user
/// table, keyed by table name.
fn build_relations(conn: &Connection, names: &TableNames) -> Result<HashMap<String, Relation>> {
    let mut tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };
    tables.retain(|t| !names.is_internal(t));

    let mut relations = HashMap::new();
    for (index, table) in tables.iter().enumerate() {
        let relation = relation_from_table_info(conn, names, table, index as u32 + 1)?;
        relations.insert(table.clone(), relation);
    }
    Ok(relations)
}

fn relation_from_table_info(
    conn: &Connection,
    names: &TableNames,
    table: &str,
    id: u32,
) -> Result<Relation> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
    let columns: Vec<RelationColumn> = stmt
        .query_map(params![table], |row| {
            let name: String = row.get(0)?;
            let sqlite_type: String = row.get(1)?;
            let notnull: i64 = row.get(2)?;
            let pk: i64 = row.get(3)?;
            Ok(RelationColumn {
                name,
                sqlite_type: sqlite_type.to_uppercase(),
                is_nullable: notnull == 0 && pk == 0,
                primary_key: (pk > 0).then_some(pk as u32),
            })
        })?
        .collect::<std::result::Result<_, _>>()?;

    if columns.is_empty() {
        return Err(Error::Internal(format!(
            "table '{table}' has no columns; cannot build a relation"
        )));
    }
    Ok(Relation {
        id,
        schema: names.namespace.clone(),
        table: table.to_string(),
        table_type: TableType::Table,
        columns,
    })
}

/// 999 below SQLite 3.32, 32766 from 3.32 on.
fn probe_max_parameters(conn: &mut Connection) -> Result<usize> {
    let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    Ok(if (major, minor) >= (3, 32) {
        MAX_PARAMETERS_MODERN
    } else {
        MAX_PARAMETERS_LEGACY
    })
}

// =============================================================================
// Event Plumbing
// =============================================================================

fn loop_handlers(events_tx: mpsc::UnboundedSender<LoopEvent>) -> ClientHandlers {
    let tx = events_tx.clone();
    let relation_tx = events_tx.clone();
    let ack_tx = events_tx.clone();
    let outbound_tx = events_tx.clone();
    let data_tx = events_tx.clone();
    let error_tx = events_tx;
    ClientHandlers {
        on_transaction: Box::new(move |t| {
            let _ = tx.send(LoopEvent::Transaction(t));
        }),
        on_relation: Box::new(move |r| {
            let _ = relation_tx.send(LoopEvent::Relation(r));
        }),
        on_ack: Box::new(move |lsn, kind| {
            let _ = ack_tx.send(LoopEvent::Ack(lsn, kind));
        }),
        on_outbound_started: Box::new(move || {
            let _ = outbound_tx.send(LoopEvent::OutboundStarted);
        }),
        on_subscription_data: Box::new(move |d| {
            let _ = data_tx.send(LoopEvent::SubscriptionData(d));
        }),
        on_subscription_error: Box::new(move |id, e| {
            let _ = error_tx.send(LoopEvent::SubscriptionError(id, e));
        }),
    }
}

fn spawn_connectivity_forwarder(
    notifier: &Notifier,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
) -> JoinHandle<()> {
    let mut rx = notifier.subscribe_to_connectivity();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(state) => {
                    if events_tx.send(LoopEvent::Connectivity(state)).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_potential_forwarder(
    notifier: &Notifier,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
) -> JoinHandle<()> {
    let mut rx = notifier.subscribe_to_potential_changes();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(()) => {
                    if events_tx.send(LoopEvent::PotentialChange).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_auth_forwarder(
    notifier: &Notifier,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
) -> JoinHandle<()> {
    let mut rx = notifier.subscribe_to_auth_changes();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    if events_tx
                        .send(LoopEvent::AuthChanged(change.token))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_poller(
    interval: std::time::Duration,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the poll cadence
        // starts one interval after boot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if events_tx.send(LoopEvent::PotentialChange).is_err() {
                return;
            }
        }
    })
}

// =============================================================================
// The Loop
// =============================================================================

struct SatelliteLoop {
    adapter: Adapter,
    client: Arc<dyn ReplicationClient>,
    notifier: Notifier,
    names: TableNames,
    auth_token: String,
    client_id: String,
    /// Relation cache keyed by table name, patched by inbound relation
    /// messages and DDL.
    relations: HashMap<String, Relation>,
    lsn: Option<Lsn>,
    last_ackd: RowId,
    last_sent: RowId,
    max_sql_parameters: usize,
    subscriptions: SubscriptionManager,
    throttle: Throttle,
    /// Re-entrancy tripwire; the loop alone makes overlap impossible.
    snapshot_in_progress: bool,
    /// Whether the server has opened the outbound direction.
    replicating: bool,
    clear_on_behind_window: bool,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    background: Vec<JoinHandle<()>>,
}

impl SatelliteLoop {
    async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = events_rx.recv().await {
            if self.handle(event).await {
                break;
            }
        }
        for task in &self.background {
            task.abort();
        }
        let _ = self.client.close().await;
        debug!("satellite loop stopped");
    }

    /// Returns `true` when the loop should stop.
    async fn handle(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Connect(reply) => {
                let outcome = self.connect_with_policy().await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            LoopEvent::Connectivity(state) => self.connectivity_state_changed(state).await,
            LoopEvent::AuthChanged(token) => {
                self.auth_token = token;
            }
            LoopEvent::PotentialChange => self.throttled_snapshot().await,
            LoopEvent::SnapshotDue => {
                if let Err(e) = self.snapshot_cycle().await {
                    warn!(error = %e, "trailing snapshot failed");
                }
            }
            LoopEvent::OutboundStarted => {
                self.replicating = true;
                if let Err(e) = self.snapshot_cycle().await {
                    warn!(error = %e, "backlog flush failed");
                }
            }
            LoopEvent::Relation(relation) => {
                self.relations.insert(relation.table.clone(), relation);
            }
            LoopEvent::Ack(lsn, kind) => {
                if let Err(e) = self.handle_ack(lsn, kind).await {
                    error!(error = %e, "acknowledgement handling failed");
                }
            }
            LoopEvent::Transaction(transaction) => {
                if let Err(e) = self.apply_transaction(transaction).await {
                    error!(error = %e, "inbound transaction apply failed");
                }
            }
            LoopEvent::SubscriptionData(data) => {
                if let Err(e) = self.handle_subscription_data(data).await {
                    error!(error = %e, "subscription data apply failed");
                }
            }
            LoopEvent::SubscriptionError(id, err) => {
                self.handle_subscription_error(id, err).await;
            }
            LoopEvent::Command(Command::Subscribe { shapes, reply }) => {
                let outcome = self.do_subscribe(shapes).await;
                let _ = reply.send(outcome);
            }
            LoopEvent::Command(Command::Snapshot { reply }) => {
                let _ = reply.send(self.snapshot_cycle().await);
            }
            LoopEvent::Command(Command::Stop { reply }) => {
                // Close before replying so a caller observing `stop()`'s
                // completion sees the client closed.
                if let Err(e) = self.client.close().await {
                    warn!(error = %e, "client close failed during stop");
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // -------------------------------------------------------------------------
    // Connectivity
    // -------------------------------------------------------------------------

    async fn connectivity_state_changed(&mut self, state: ConnectivityState) {
        debug!(?state, "connectivity transition");
        match state {
            ConnectivityState::Available => {
                let _ = self.events_tx.send(LoopEvent::Connect(None));
            }
            ConnectivityState::Disconnected | ConnectivityState::Error => {
                self.replicating = false;
                if let Err(e) = self.client.close().await {
                    warn!(error = %e, "client close failed");
                }
            }
            ConnectivityState::Connected => {}
        }
    }

    /// The start-replication error policy: fatal codes propagate, behind-
    /// window recovers when configured, everything else is logged and left
    /// for the next connectivity transition.
    async fn connect_with_policy(&mut self) -> Result<()> {
        match self.connect_and_start_replication().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal_for_start() => Err(e),
            Err(e) => {
                warn!(error = %e, "replication start failed; awaiting next connectivity change");
                Ok(())
            }
        }
    }

    async fn connect_and_start_replication(&mut self) -> Result<()> {
        // Shapes to re-subscribe after a behind-window reset.
        let mut resubscribe: Vec<ShapeDefinition> = Vec::new();

        loop {
            self.client.connect().await?;
            let auth = AuthState {
                client_id: self.client_id.clone(),
                token: self.auth_token.clone(),
            };
            self.client.authenticate(&auth).await?;

            let schema_version = {
                let names = self.names.clone();
                self.adapter
                    .call(move |conn| migrations::latest_version(conn, &names))
                    .await?
            };

            let result = self
                .client
                .start_replication(
                    self.lsn.clone(),
                    schema_version,
                    self.subscriptions.fulfilled_ids(),
                )
                .await;

            match result {
                Ok(()) => {
                    if !resubscribe.is_empty() {
                        info!(
                            shapes = resubscribe.len(),
                            "re-subscribing shapes after window reset"
                        );
                        // Fire-and-forget: failures surface on the shape's
                        // own future, which nobody holds here.
                        let _ = self.do_subscribe(resubscribe).await;
                    }
                    return Ok(());
                }
                Err(Error::BehindWindow) if self.clear_on_behind_window => {
                    warn!("behind the server's window; clearing client state");
                    resubscribe = self.subscriptions.fulfilled_shapes();
                    self.reset_client_state("behind replication window").await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Clears the resume position and every subscription, in memory and in
    /// meta, so the next start-replication begins fresh.
    async fn reset_client_state(&mut self, reason: &str) -> Result<()> {
        self.lsn = None;
        self.subscriptions.reset(reason);
        let names = self.names.clone();
        self.adapter
            .call(move |conn| {
                schema::set_meta_lsn(conn, &names, None)?;
                schema::set_meta(conn, &names, "subscriptions", "")
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    async fn throttled_snapshot(&mut self) {
        match self.throttle.request(Instant::now()) {
            ThrottleDecision::RunNow => {
                if let Err(e) = self.snapshot_cycle().await {
                    warn!(error = %e, "snapshot failed");
                }
            }
            ThrottleDecision::Schedule(delay) => {
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events_tx.send(LoopEvent::SnapshotDue);
                });
            }
            ThrottleDecision::Coalesced => {}
        }
    }

    /// Snapshot plus follow-through: change notifications and, when the
    /// outbound direction is open, shipping the promoted tail.
    async fn snapshot_cycle(&mut self) -> Result<()> {
        self.throttle.mark_ran(Instant::now());
        let outcome = self.mutex_snapshot().await?;
        if !outcome.entries.is_empty() {
            let mut tables: Vec<QualifiedTablename> = outcome
                .entries
                .iter()
                .map(|e| e.qualified_tablename())
                .collect();
            tables.sort();
            tables.dedup();
            self.notifier.actually_changed(tables);
        }
        if self.replicating {
            self.send_pending().await?;
        }
        Ok(())
    }

    async fn mutex_snapshot(&mut self) -> Result<SnapshotOutcome> {
        if self.snapshot_in_progress {
            return Err(Error::Internal(
                "snapshot re-entered while one is in flight".to_string(),
            ));
        }
        self.snapshot_in_progress = true;
        let result = snapshot::perform_snapshot(
            &self.adapter,
            self.names.clone(),
            self.client_id.clone(),
            self.last_ackd,
        )
        .await;
        self.snapshot_in_progress = false;
        result
    }

    /// Ships every promoted oplog row above `lastSentRowId`, in commit
    /// order, one transaction per commit instant.
    async fn send_pending(&mut self) -> Result<()> {
        let names = self.names.clone();
        let since = self.last_sent;
        let entries = self
            .adapter
            .call(move |conn| oplog::get_sendable_entries_since(conn, &names, since))
            .await?;
        if entries.is_empty() {
            return Ok(());
        }

        let relations = self.relations.clone();
        let transactions = oplog::entries_to_transactions(&entries, &self.client_id, |table| {
            relations.get(table).cloned()
        })?;
        for transaction in transactions {
            self.client.enqueue_transaction(transaction).await?;
        }

        let max_rowid = entries.last().expect("non-empty").rowid;
        self.set_last_sent(max_rowid).await
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    async fn handle_ack(&mut self, lsn: Lsn, kind: AckType) -> Result<()> {
        let row_id = lsn.to_row_id()?;
        match kind {
            AckType::LocalSend => {
                if row_id > self.last_sent {
                    self.set_last_sent(row_id).await?;
                }
            }
            AckType::RemoteCommit => {
                if row_id < self.last_ackd {
                    return Err(Error::Internal(format!(
                        "ack position {row_id} regressed below {}",
                        self.last_ackd
                    )));
                }
                if row_id > self.last_sent {
                    return Err(Error::Internal(format!(
                        "ack position {row_id} ahead of last sent {}",
                        self.last_sent
                    )));
                }
                self.set_last_ackd(row_id).await?;
            }
        }
        Ok(())
    }

    async fn set_last_sent(&mut self, row_id: RowId) -> Result<()> {
        self.last_sent = row_id;
        let names = self.names.clone();
        self.adapter
            .call(move |conn| schema::set_meta_row_id(conn, &names, "lastSentRowId", row_id))
            .await
    }

    async fn set_last_ackd(&mut self, row_id: RowId) -> Result<()> {
        self.last_ackd = row_id;
        let names = self.names.clone();
        self.adapter
            .call(move |conn| schema::set_meta_row_id(conn, &names, "lastAckdRowId", row_id))
            .await
    }

    // -------------------------------------------------------------------------
    // Inbound Transactions
    // -------------------------------------------------------------------------

    async fn apply_transaction(&mut self, transaction: Transaction) -> Result<()> {
        let commit_dt = transaction.commit_datetime()?;
        let lsn = transaction.lsn.clone();

        // A locally-originated transaction coming back is the round-trip
        // acknowledgement of writes already present in the user tables:
        // advance the position and drop the acknowledged oplog rows.
        if transaction.origin.as_deref() == Some(self.client_id.as_str()) {
            let names = self.names.clone();
            let gc_lsn = lsn.clone();
            let removed = self
                .adapter
                .transaction(move |tx| {
                    let removed = oplog::garbage_collect(tx, &names, commit_dt)?;
                    schema::set_meta_lsn(tx, &names, Some(&gc_lsn))?;
                    Ok(removed)
                })
                .await?;
            self.lsn = Some(lsn);
            debug!(removed, "round-trip acknowledgement applied");
            return Ok(());
        }

        // Remote transaction: make conflict resolution well-defined by
        // fully timestamping pending local writes first.
        let has_dml = transaction
            .changes
            .iter()
            .any(|c| matches!(c, Change::Data(_)));
        if has_dml {
            self.mutex_snapshot().await?;
        }

        let names = self.names.clone();
        let since = self.last_ackd;
        let pending = self
            .adapter
            .call(move |conn| oplog::get_entries_since(conn, &names, since))
            .await?;

        // Chunk changes by kind, preserving stream order.
        let chunks = chunk_changes(&transaction.changes);
        let origin = transaction.origin.clone().unwrap_or_default();
        let mut plan: Vec<PlannedOp> = Vec::new();
        let mut touched: Vec<QualifiedTablename> = Vec::new();

        for chunk in chunks {
            match chunk {
                ChangeChunk::Data(changes) => {
                    let merged = merge::merge_entries(
                        &self.client_id,
                        &pending,
                        &origin,
                        &changes,
                        transaction.commit_timestamp,
                    )?;
                    let (statements, tables) =
                        build_dml_statements(&merged, &self.relations, &self.names)?;
                    touched.extend(tables);
                    plan.push(PlannedOp::Dml(statements));
                }
                ChangeChunk::Schema(changes) => {
                    for change in changes {
                        touched
                            .push(QualifiedTablename::new(self.names.namespace.clone(), change.table.clone()));
                        plan.push(PlannedOp::Ddl(change));
                    }
                }
            }
        }
        touched.sort();
        touched.dedup();

        // One ACID transaction: trigger gating, DML, DDL (through the
        // migrator when versioned), LSN meta.
        let names = self.names.clone();
        let exec_touched = touched.clone();
        let exec_lsn = lsn.clone();
        let new_relation_base = self.relations.values().map(|r| r.id).max().unwrap_or(0);
        self.adapter
            .transaction(move |tx| {
                tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;
                for table in &exec_touched {
                    triggers::set_triggers_enabled(tx, &names, &table.key(), false)?;
                }

                let mut next_relation_id = new_relation_base;
                for op in plan {
                    match op {
                        PlannedOp::Dml(statements) => {
                            for statement in statements {
                                tx.execute(
                                    &statement.sql,
                                    rusqlite::params_from_iter(statement.params),
                                )?;
                            }
                        }
                        PlannedOp::Ddl(change) => {
                            match &change.version {
                                Some(version) => {
                                    migrations::apply_if_not_already(
                                        tx,
                                        &names,
                                        version,
                                        &[change.sql.clone()],
                                    )?;
                                }
                                None => tx.execute_batch(&change.sql)?,
                            }
                            // New or altered table: regenerate its capture
                            // triggers from the fresh schema and keep them
                            // gated for the rest of this transaction.
                            next_relation_id += 1;
                            let relation = relation_from_table_info(
                                tx,
                                &names,
                                &change.table,
                                next_relation_id,
                            )?;
                            triggers::install_for_relation(tx, &names, &relation)?;
                            triggers::install_compensation_triggers(tx, &names, &relation)?;
                            triggers::set_triggers_enabled(
                                tx,
                                &names,
                                &relation.qualified_tablename().key(),
                                false,
                            )?;
                        }
                    }
                }

                for table in &exec_touched {
                    triggers::set_triggers_enabled(tx, &names, &table.key(), true)?;
                }
                schema::set_meta_lsn(tx, &names, Some(&exec_lsn))?;
                Ok(())
            })
            .await?;
        self.lsn = Some(lsn);

        // Refresh cached relations for DDL-touched tables.
        let ddl_tables: Vec<String> = transaction
            .changes
            .iter()
            .filter_map(|c| match c {
                Change::Schema(s) => Some(s.table.clone()),
                Change::Data(_) => None,
            })
            .collect();
        for table in ddl_tables {
            self.refresh_relation(&table).await?;
        }

        self.notifier.actually_changed(touched);
        Ok(())
    }

    async fn refresh_relation(&mut self, table: &str) -> Result<()> {
        let names = self.names.clone();
        let id = self
            .relations
            .get(table)
            .map(|r| r.id)
            .unwrap_or_else(|| self.relations.values().map(|r| r.id).max().unwrap_or(0) + 1);
        let table_owned = table.to_string();
        let relation = self
            .adapter
            .call(move |conn| relation_from_table_info(conn, &names, &table_owned, id))
            .await?;
        self.relations.insert(table.to_string(), relation);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    async fn do_subscribe(&mut self, shapes: Vec<ShapeDefinition>) -> Result<SyncedFuture> {
        // Whole-table shapes must name known tables.
        for shape in &shapes {
            if !self.relations.contains_key(&shape.tablename) {
                return Err(Error::Subscription {
                    subscription_id: None,
                    message: format!("unknown table '{}'", shape.tablename),
                });
            }
        }

        match self.subscriptions.subscribe(&shapes) {
            SubscribeOutcome::AlreadyFulfilled(synced)
            | SubscribeOutcome::SharedInFlight(synced) => Ok(synced),
            SubscribeOutcome::Request {
                subscription_id,
                requests,
                synced,
            } => {
                if let Err(e) = self
                    .client
                    .subscribe(subscription_id.clone(), requests)
                    .await
                {
                    // The error belongs to this subscription's future.
                    self.subscriptions.fail(&subscription_id, &e.to_string());
                }
                Ok(synced)
            }
        }
    }

    async fn handle_subscription_data(&mut self, data: SubscriptionData) -> Result<()> {
        let id = data.subscription_id.clone();
        if !self.subscriptions.contains(&id) {
            warn!(subscription = %id, "data for an unknown subscription; dropping");
            return Ok(());
        }

        // Promote before applying so the persisted state includes this
        // subscription, atomically with its rows and LSN.
        self.subscriptions.promote(&id);
        let serialized = self.subscriptions.serialize();
        let lsn = data.lsn.clone();

        let result = subscriptions::apply_subscription_data(
            &self.adapter,
            self.names.clone(),
            self.max_sql_parameters,
            data,
            serialized,
        )
        .await;

        match result {
            Ok(affected) => {
                self.lsn = Some(lsn);
                self.subscriptions.complete(&id);
                self.notifier.actually_changed(affected);
                Ok(())
            }
            Err(e) => {
                self.subscriptions.fail(&id, &e.to_string());
                self.reset_client_state("subscription apply failed").await?;
                Err(e)
            }
        }
    }

    async fn handle_subscription_error(&mut self, id: Option<SubscriptionId>, error: Error) {
        warn!(error = %error, "subscription failed; resetting client state");
        if let Some(id) = &id {
            self.subscriptions.fail(id, &error.to_string());
        }
        if let Err(e) = self.reset_client_state(&error.to_string()).await {
            error!(error = %e, "client state reset failed");
        }
    }
}

// =============================================================================
// Apply Planning
// =============================================================================

enum ChangeChunk {
    Data(Vec<DataChange>),
    Schema(Vec<SchemaChange>),
}

enum PlannedOp {
    Dml(Vec<Statement>),
    Ddl(SchemaChange),
}

struct Statement {
    sql: String,
    params: Vec<rusqlite::types::Value>,
}

/// Splits a transaction's changes into contiguous same-kind chunks,
/// preserving order.
fn chunk_changes(changes: &[Change]) -> Vec<ChangeChunk> {
    let mut chunks: Vec<ChangeChunk> = Vec::new();
    for change in changes {
        match (change, chunks.last_mut()) {
            (Change::Data(d), Some(ChangeChunk::Data(chunk))) => chunk.push(d.clone()),
            (Change::Data(d), _) => chunks.push(ChangeChunk::Data(vec![d.clone()])),
            (Change::Schema(s), Some(ChangeChunk::Schema(chunk))) => chunk.push(s.clone()),
            (Change::Schema(s), _) => chunks.push(ChangeChunk::Schema(vec![s.clone()])),
        }
    }
    chunks
}

/// Lowers merged row outcomes to SQL: DELETE by key or upsert of all
/// columns, plus the matching shadow write.
fn build_dml_statements(
    merged: &merge::TableChanges<merge::ShadowEntryChanges>,
    relations: &HashMap<String, Relation>,
    names: &TableNames,
) -> Result<(Vec<Statement>, Vec<QualifiedTablename>)> {
    let mut statements = Vec::new();
    let mut tables = Vec::new();

    for (table, rows) in merged {
        let relation = relations.get(&table.tablename).ok_or_else(|| {
            Error::Internal(format!("no relation cached for table '{}'", table.tablename))
        })?;
        tables.push(table.clone());

        let pk_cols = relation.primary_key_columns();
        let all_cols: Vec<&str> = relation.columns.iter().map(|c| c.name.as_str()).collect();

        for (pk_json, outcome) in rows {
            match outcome.optype {
                ChangeOp::Delete => {
                    let where_clause = pk_cols
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!("\"{c}\" = ?{}", i + 1))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    let mut params = Vec::with_capacity(pk_cols.len());
                    for &col in &pk_cols {
                        let value = outcome.primary_key.get(col).ok_or_else(|| {
                            Error::Internal(format!("merged key lacks column '{col}'"))
                        })?;
                        params.push(crate::types::json_to_sql_value(value)?);
                    }
                    statements.push(Statement {
                        sql: format!("DELETE FROM {table} WHERE {where_clause}"),
                        params,
                    });
                    statements.push(Statement {
                        sql: format!(
                            "DELETE FROM {} \
                             WHERE namespace = ?1 AND tablename = ?2 AND \"primaryKey\" = ?3",
                            names.shadow_qualified()
                        ),
                        params: vec![
                            rusqlite::types::Value::Text(table.namespace.clone()),
                            rusqlite::types::Value::Text(table.tablename.clone()),
                            rusqlite::types::Value::Text(pk_json.clone()),
                        ],
                    });
                }
                ChangeOp::Upsert => {
                    // A merged row may be partial (a compensation carries
                    // only key columns); write exactly what it holds.
                    let present: Vec<&str> = all_cols
                        .iter()
                        .copied()
                        .filter(|c| {
                            outcome.changes.contains_key(*c)
                                || outcome.primary_key.contains_key(*c)
                        })
                        .collect();
                    let row = outcome.build_row(&present)?;
                    let quoted: Vec<String> =
                        present.iter().map(|c| format!("\"{c}\"")).collect();
                    let placeholders: Vec<String> =
                        (1..=present.len()).map(|i| format!("?{i}")).collect();
                    let conflict_target = pk_cols
                        .iter()
                        .map(|c| format!("\"{c}\""))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let updates: Vec<String> = present
                        .iter()
                        .filter(|c| !pk_cols.contains(c))
                        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
                        .collect();
                    let sql = if updates.is_empty() {
                        format!(
                            "INSERT INTO {table} ({}) VALUES ({}) \
                             ON CONFLICT ({conflict_target}) DO NOTHING",
                            quoted.join(", "),
                            placeholders.join(", "),
                        )
                    } else {
                        format!(
                            "INSERT INTO {table} ({}) VALUES ({}) \
                             ON CONFLICT ({conflict_target}) DO UPDATE SET {}",
                            quoted.join(", "),
                            placeholders.join(", "),
                            updates.join(", "),
                        )
                    };
                    let mut params = Vec::with_capacity(present.len());
                    for &col in &present {
                        let value = row.get(col).expect("build_row covers requested columns");
                        params.push(crate::types::json_to_sql_value(value)?);
                    }
                    statements.push(Statement { sql, params });
                    statements.push(Statement {
                        sql: format!(
                            "INSERT OR REPLACE INTO {} \
                             (namespace, tablename, \"primaryKey\", tags) VALUES (?1, ?2, ?3, ?4)",
                            names.shadow_qualified()
                        ),
                        params: vec![
                            rusqlite::types::Value::Text(table.namespace.clone()),
                            rusqlite::types::Value::Text(table.tablename.clone()),
                            rusqlite::types::Value::Text(pk_json.clone()),
                            rusqlite::types::Value::Text(outcome.tags.encode()),
                        ],
                    });
                }
            }
        }
    }

    Ok((statements, tables))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{ColumnChange, ShadowEntryChanges};
    use crate::tags::{Tag, TagSet};
    use crate::types::{RecordType, Row};
    use chrono::TimeZone;

    fn relation() -> Relation {
        Relation {
            id: 1,
            schema: "main".to_string(),
            table: "parent".to_string(),
            table_type: TableType::Table,
            columns: vec![
                RelationColumn {
                    name: "id".to_string(),
                    sqlite_type: "INTEGER".to_string(),
                    is_nullable: false,
                    primary_key: Some(1),
                },
                RelationColumn {
                    name: "value".to_string(),
                    sqlite_type: "TEXT".to_string(),
                    is_nullable: true,
                    primary_key: None,
                },
            ],
        }
    }

    #[test]
    fn test_chunking_preserves_order_and_contiguity() {
        let data = Change::Data(DataChange {
            relation: relation(),
            record_type: RecordType::Insert,
            new_record: Some(Row::new()),
            old_record: None,
            tags: vec![],
        });
        let ddl = Change::Schema(SchemaChange {
            sql: "CREATE TABLE x (id INTEGER PRIMARY KEY)".to_string(),
            table: "x".to_string(),
            migration_type: crate::types::MigrationType::CreateTable,
            version: None,
        });

        let chunks = chunk_changes(&[
            data.clone(),
            data.clone(),
            ddl.clone(),
            data.clone(),
        ]);
        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], ChangeChunk::Data(c) if c.len() == 2));
        assert!(matches!(&chunks[1], ChangeChunk::Schema(c) if c.len() == 1));
        assert!(matches!(&chunks[2], ChangeChunk::Data(c) if c.len() == 1));
    }

    #[test]
    fn test_dml_lowering_upsert_and_delete() {
        let mut relations = HashMap::new();
        relations.insert("parent".to_string(), relation());
        let names = TableNames::default();
        let table = QualifiedTablename::new("main", "parent");
        let tag = Tag::generate("c", chrono::Utc.timestamp_millis_opt(1_000).unwrap());

        let mut upsert_changes = HashMap::new();
        upsert_changes.insert(
            "value".to_string(),
            ColumnChange {
                value: serde_json::json!("x"),
                timestamp_ms: 1_000,
            },
        );
        let mut pk = Row::new();
        pk.insert("id".to_string(), serde_json::json!(1));

        let mut rows = HashMap::new();
        rows.insert(
            "{\"id\":1}".to_string(),
            ShadowEntryChanges {
                optype: ChangeOp::Upsert,
                changes: upsert_changes,
                primary_key: pk.clone(),
                tags: TagSet::singleton(tag),
            },
        );
        rows.insert(
            "{\"id\":2}".to_string(),
            ShadowEntryChanges {
                optype: ChangeOp::Delete,
                changes: HashMap::new(),
                primary_key: {
                    let mut pk = Row::new();
                    pk.insert("id".to_string(), serde_json::json!(2));
                    pk
                },
                tags: TagSet::new(),
            },
        );
        let mut merged = HashMap::new();
        merged.insert(table.clone(), rows);

        let (statements, tables) = build_dml_statements(&merged, &relations, &names).unwrap();
        assert_eq!(tables, vec![table]);
        // Two rows, each with a user-table and a shadow statement.
        assert_eq!(statements.len(), 4);
        assert!(statements
            .iter()
            .any(|s| s.sql.contains("ON CONFLICT (\"id\") DO UPDATE SET")));
        assert!(statements
            .iter()
            .any(|s| s.sql.starts_with("DELETE FROM \"main\".\"parent\"")));
    }

    #[test]
    fn test_dml_lowering_requires_cached_relation() {
        let relations = HashMap::new();
        let names = TableNames::default();
        let mut merged: merge::TableChanges<ShadowEntryChanges> = HashMap::new();
        merged.insert(QualifiedTablename::new("main", "ghost"), HashMap::new());
        // An untouched (empty) table map still needs its relation.
        assert!(build_dml_statements(&merged, &relations, &names).is_err());
    }

    #[tokio::test]
    async fn test_probe_max_parameters_is_modern_for_bundled() {
        let mut conn = crate::schema::Database::open_in_memory()
            .unwrap()
            .into_connection();
        // The bundled SQLite is well past 3.32.
        assert_eq!(probe_max_parameters(&mut conn).unwrap(), MAX_PARAMETERS_MODERN);
    }

    #[tokio::test]
    async fn test_resolve_client_id_is_stable() {
        let conn = crate::schema::Database::open_in_memory()
            .unwrap()
            .into_connection();
        let mut conn = conn;
        let names = TableNames::default();
        migrations::up(&mut conn, &names).unwrap();

        let first = resolve_client_id(&conn, &names, None).unwrap();
        assert!(!first.is_empty());
        let second = resolve_client_id(&conn, &names, None).unwrap();
        assert_eq!(first, second, "generated id persists");

        let forced = resolve_client_id(&conn, &names, Some("fixed".to_string())).unwrap();
        assert_eq!(forced, "fixed");
        assert_eq!(
            schema::get_meta(&conn, &names, "clientId").unwrap().as_deref(),
            Some("fixed")
        );
    }

    #[tokio::test]
    async fn test_build_relations_skips_internal_tables() {
        let mut conn = crate::schema::Database::open_in_memory()
            .unwrap()
            .into_connection();
        let names = TableNames::default();
        migrations::up(&mut conn, &names).unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY, value TEXT);\
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER);",
        )
        .unwrap();

        let relations = build_relations(&conn, &names).unwrap();
        let mut tables: Vec<&String> = relations.keys().collect();
        tables.sort();
        assert_eq!(tables, vec!["child", "parent"]);
        assert_eq!(relations["parent"].primary_key_columns(), vec!["id"]);
    }
}
