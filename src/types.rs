//! # Domain Types
//!
//! Core types for the replication domain: oplog rows, replicated
//! transactions, relations, and the newtypes that keep positions from being
//! mixed up.
//!
//! ## Newtypes
//!
//! - [`RowId`]: monotonic oplog insertion-order key. Also the unit of the
//!   outbound log position counters (`lastAckdRowId`, `lastSentRowId`).
//! - [`Lsn`]: opaque ordered byte-string naming a position in the upstream
//!   replication log. Persisted base64-encoded; outbound acknowledgements
//!   encode a [`RowId`] in the same field.
//!
//! ## Row Snapshots
//!
//! Row values travel as JSON column maps ([`Row`]): the oplog triggers
//! capture rows with `json_object(...)`, and the applier writes them back
//! column by column. Column order in the map follows the declared column
//! order of the table, which keeps the canonical primary-key encoding stable
//! between trigger-generated and code-generated JSON.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::tags::Tag;

/// A JSON column map: column name → value.
///
/// `serde_json`'s preserve-order map keeps insertion order, so maps built in
/// declared column order serialize in declared column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Positions
// =============================================================================

/// An oplog row identifier.
///
/// # Invariants
///
/// - Strictly increases with each captured operation (AUTOINCREMENT).
/// - `lastAckdRowId ≤ lastSentRowId ≤ max(rowid)` at every suspension point.
/// - Rows with a `NULL` timestamp always sit above `lastAckdRowId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RowId(i64);

impl RowId {
    /// The position before any oplog row exists (0).
    pub const ZERO: RowId = RowId(0);

    /// Creates a RowId from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for database storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque, ordered position in the upstream replication log.
///
/// The server hands these out; the client never interprets inbound LSN bytes,
/// only stores and echoes them. Outbound acknowledgements reuse the field to
/// carry a [`RowId`] as eight big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Lsn(Vec<u8>);

impl Lsn {
    /// Wraps raw LSN bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encodes a [`RowId`] as an LSN for outbound position bookkeeping.
    pub fn from_row_id(row_id: RowId) -> Self {
        Self(row_id.as_raw().to_be_bytes().to_vec())
    }

    /// Recovers the [`RowId`] from an outbound-position LSN.
    ///
    /// # Errors
    ///
    /// `Error::Internal` if the LSN is not exactly eight bytes — inbound
    /// server LSNs must never be fed through this.
    pub fn to_row_id(&self) -> Result<RowId> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().map_err(|_| {
            Error::Internal(format!("lsn of {} bytes is not a row id", self.0.len()))
        })?;
        Ok(RowId::from_raw(i64::from_be_bytes(bytes)))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the empty (never-synced) position.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 form used in the `_electric_meta` table.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Parses the base64 meta form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Internal(format!("malformed lsn in meta: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

// =============================================================================
// Table Identity
// =============================================================================

/// A namespace-qualified table name. The namespace is always `main` for the
/// embedded store; statements quote both parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTablename {
    pub namespace: String,
    pub tablename: String,
}

impl QualifiedTablename {
    pub fn new(namespace: impl Into<String>, tablename: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tablename: tablename.into(),
        }
    }

    /// The unquoted `namespace.tablename` form used as a key in the trigger
    /// settings table.
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.tablename)
    }
}

impl fmt::Display for QualifiedTablename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.namespace, self.tablename)
    }
}

// =============================================================================
// Oplog
// =============================================================================

/// The kind of operation an oplog row captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Insert,
    Update,
    Delete,
    /// A synthetic upsert recorded to keep a referenced parent row alive
    /// across the merge. Never wins a column.
    Compensation,
}

impl OpType {
    /// The storage form used in the `optype` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
            OpType::Compensation => "COMPENSATION",
        }
    }

    /// Parses the storage form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(OpType::Insert),
            "UPDATE" => Ok(OpType::Update),
            "DELETE" => Ok(OpType::Delete),
            "COMPENSATION" => Ok(OpType::Compensation),
            other => Err(Error::Internal(format!("unknown optype '{other}' in oplog"))),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured local operation.
///
/// The trigger writes the row with `timestamp = NULL` and
/// `clearTags = '[]'`; a snapshot fills both in when it promotes the row.
#[derive(Debug, Clone)]
pub struct OplogEntry {
    pub rowid: RowId,
    pub namespace: String,
    pub tablename: String,
    pub optype: OpType,
    /// Canonical JSON encoding of the primary-key columns in declared order.
    pub primary_key: String,
    /// JSON snapshot of the row after the operation (INSERT/UPDATE).
    pub new_row: Option<String>,
    /// JSON snapshot of the row before the operation (UPDATE/DELETE).
    pub old_row: Option<String>,
    /// Commit instant assigned by the snapshot; `None` while pending.
    pub timestamp: Option<DateTime<Utc>>,
    /// JSON-encoded tag set this operation observed being cleared.
    pub clear_tags: String,
}

impl OplogEntry {
    /// The qualified table this entry belongs to.
    pub fn qualified_tablename(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.namespace.clone(), self.tablename.clone())
    }

    /// Parses the `newRow` snapshot.
    pub fn new_row_map(&self) -> Result<Option<Row>> {
        parse_row(self.new_row.as_deref())
    }

    /// Parses the `oldRow` snapshot.
    pub fn old_row_map(&self) -> Result<Option<Row>> {
        parse_row(self.old_row.as_deref())
    }

    /// Parses the primary-key column map.
    pub fn primary_key_map(&self) -> Result<Row> {
        Ok(serde_json::from_str(&self.primary_key)?)
    }
}

fn parse_row(json: Option<&str>) -> Result<Option<Row>> {
    match json {
        Some(json) => Ok(Some(serde_json::from_str(json)?)),
        None => Ok(None),
    }
}

// =============================================================================
// Relations
// =============================================================================

/// One column of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub name: String,
    /// Declared SQLite type, uppercased (`INTEGER`, `TEXT`, ...).
    pub sqlite_type: String,
    pub is_nullable: bool,
    /// 1-based position within the primary key, `None` for non-key columns.
    pub primary_key: Option<u32>,
}

/// The shape of a replicated table: identity plus ordered columns.
///
/// The cache is rebuilt from `pragma_table_info` on startup and patched by
/// inbound relation messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub table_type: TableType,
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    /// Primary-key column names in declared key order.
    pub fn primary_key_columns(&self) -> Vec<&str> {
        let mut keyed: Vec<&RelationColumn> = self
            .columns
            .iter()
            .filter(|c| c.primary_key.is_some())
            .collect();
        keyed.sort_by_key(|c| c.primary_key.unwrap_or(0));
        keyed.iter().map(|c| c.name.as_str()).collect()
    }

    /// Non-key column names in declared order.
    pub fn non_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key.is_none())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// The qualified table name.
    pub fn qualified_tablename(&self) -> QualifiedTablename {
        QualifiedTablename::new(self.schema.clone(), self.table.clone())
    }
}

/// Whether a relation is a plain table or something the applier must not
/// write through (views are rejected at subscription time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Table,
    View,
}

// =============================================================================
// Replicated Transactions
// =============================================================================

/// A transaction on the replication stream, inbound or outbound.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Client id of the node that committed this transaction. `None` when
    /// the server did not attribute an origin (server-side migrations).
    pub origin: Option<String>,
    /// Commit instant in Unix milliseconds.
    pub commit_timestamp: i64,
    /// Position of this transaction in the upstream log.
    pub lsn: Lsn,
    pub changes: Vec<Change>,
}

impl Transaction {
    /// The commit instant as a UTC datetime (millisecond precision).
    pub fn commit_datetime(&self) -> Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.commit_timestamp).ok_or_else(|| {
            Error::Internal(format!(
                "commit timestamp {} out of range",
                self.commit_timestamp
            ))
        })
    }

    /// True when every change is DML.
    pub fn is_data_only(&self) -> bool {
        self.changes.iter().all(|c| matches!(c, Change::Data(_)))
    }
}

/// One change within a replicated transaction.
#[derive(Debug, Clone)]
pub enum Change {
    Data(DataChange),
    Schema(SchemaChange),
}

/// The DML record kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Insert,
    Update,
    Delete,
}

/// A row-level change.
#[derive(Debug, Clone)]
pub struct DataChange {
    pub relation: Relation,
    pub record_type: RecordType,
    /// Row values after the change (INSERT/UPDATE).
    pub new_record: Option<Row>,
    /// Row values before the change (UPDATE/DELETE).
    pub old_record: Option<Row>,
    /// The tag set this change observed on its origin. For an upsert this is
    /// the write's own tag; for a delete it is the set of tags the delete saw
    /// and cleared.
    pub tags: Vec<Tag>,
}

impl DataChange {
    /// The record used to locate the row: new for upserts, old for deletes.
    pub fn locator_record(&self) -> Option<&Row> {
        match self.record_type {
            RecordType::Delete => self.old_record.as_ref().or(self.new_record.as_ref()),
            _ => self.new_record.as_ref(),
        }
    }
}

/// Kinds of schema migrations carried on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationType {
    CreateTable,
    AlterAdd,
}

/// A DDL statement carried on the stream.
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub sql: String,
    pub table: String,
    pub migration_type: MigrationType,
    /// Migration version; routed through the migrator so re-delivery is a
    /// no-op.
    pub version: Option<String>,
}

/// What an acknowledgement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// The transaction left this client (updates `lastSentRowId`).
    LocalSend,
    /// The upstream service durably committed it (updates `lastAckdRowId`).
    RemoteCommit,
}

// =============================================================================
// JSON ↔ SQL value bridging
// =============================================================================

/// Converts a JSON column value into a SQLite parameter value.
///
/// Booleans become integers; the embedded store has no boolean affinity.
pub fn json_to_sql_value(value: &serde_json::Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Ok(Sql::Null),
        serde_json::Value::Bool(b) => Ok(Sql::Integer(i64::from(*b))),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Sql::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Sql::Real(f))
            } else {
                Err(Error::Internal(format!("unrepresentable number {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(Sql::Text(s.clone())),
        other => Err(Error::Internal(format!(
            "row value {other} is not a scalar"
        ))),
    }
}

/// Converts a SQLite column value into its JSON row form.
pub fn sql_value_to_json(value: rusqlite::types::ValueRef<'_>) -> Result<serde_json::Value> {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Ok(serde_json::Value::Null),
        ValueRef::Integer(i) => Ok(serde_json::Value::from(i)),
        ValueRef::Real(f) => Ok(serde_json::Value::from(f)),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t)
                .map_err(|e| Error::Internal(format!("non-utf8 text column: {e}")))?;
            Ok(serde_json::Value::from(s))
        }
        ValueRef::Blob(_) => Err(Error::Internal(
            "blob columns are not replicated".to_string(),
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================
