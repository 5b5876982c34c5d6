//! # satlite — Local-First SQLite Replication Core
//!
//! satlite keeps an embedded SQLite database synchronized with an upstream
//! replication service. Applications write to their tables normally; capture
//! triggers append every write to an oplog, a snapshotter promotes the oplog
//! into shippable transactions, and inbound remote transactions merge
//! against pending local writes with an add-wins / observed-delete tag CRDT.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application                              │
//! │                   (ordinary SQL writes)                         │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ capture triggers
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SQLite: user tables + oplog / shadow / meta bookkeeping        │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ dedicated adapter thread
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Satellite event loop                         │
//! │   snapshotter · merger/applier · subscriptions · lifecycle      │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ length-prefixed protobuf frames
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Replication service                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. A shadow row exists exactly for live user rows, and its tag set is
//!    never empty.
//! 2. Oplog rows with no timestamp sit above `lastAckdRowId`;
//!    `lastAckdRowId ≤ lastSentRowId ≤ max(rowid)`.
//! 3. The persisted LSN is the position of the most recently fully-applied
//!    inbound transaction, and it advances monotonically.
//! 4. The client identity is stable for the lifetime of the database file.
//!
//! ## Module Organization
//!
//! - [`error`]: the single error enum and result alias
//! - [`types`]: domain types (oplog rows, transactions, relations, LSNs)
//! - [`tags`]: the tag algebra behind conflict resolution
//! - [`schema`] / [`migrations`] / [`triggers`]: on-disk bookkeeping
//! - [`adapter`]: dedicated-thread SQLite access
//! - [`oplog`] / [`snapshot`] / [`merge`]: the replication pipeline
//! - [`subscriptions`]: whole-table shape subscriptions
//! - [`protocol`] / [`client`]: the wire protocol and its client
//! - [`notifier`]: typed pub/sub with the embedder
//! - [`satellite`]: the process itself
//! - [`testing`]: in-memory service stand-ins for tests

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod merge;
pub mod migrations;
pub mod notifier;
pub mod oplog;
pub mod protocol;
pub mod satellite;
pub mod schema;
pub mod snapshot;
pub mod subscriptions;
pub mod tags;
pub mod testing;
pub mod triggers;
pub mod types;

pub use adapter::Adapter;
pub use client::{
    ClientHandlers, Connect, OutboundPositions, ReplicationClient, TcpConnect, WireClient,
};
pub use config::{AuthConfig, AuthState, SatelliteConfig, TableNames};
pub use error::{Error, Result};
pub use notifier::{ConnectivityState, Notifier};
pub use satellite::Satellite;
pub use schema::Database;
pub use subscriptions::{ShapeDefinition, SubscriptionId, SyncedFuture};
pub use tags::{Tag, TagSet};
pub use types::{Lsn, OplogEntry, OpType, QualifiedTablename, Relation, RowId, Transaction};
