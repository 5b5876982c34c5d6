//! # Oplog Access
//!
//! Row mapping and queries over the trigger-populated oplog: reading the
//! pending tail for merges, converting promoted rows into outbound
//! transactions, and garbage-collecting rows once their round-trip
//! acknowledgement arrives.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::tags::TagSet;
use crate::types::{
    Change, DataChange, Lsn, OplogEntry, OpType, RecordType, Relation, RowId, Transaction,
};

// =============================================================================
// Row Mapping
// =============================================================================

/// Storage form of an oplog timestamp (same shape as a tag timestamp).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses the storage form back.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::Internal(format!("malformed oplog timestamp '{raw}': {e}")))?
        .with_timezone(&Utc))
}

type RawEntry = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn convert_entry(raw: RawEntry) -> Result<OplogEntry> {
    let (rowid, namespace, tablename, optype, primary_key, new_row, old_row, timestamp, clear_tags) =
        raw;
    Ok(OplogEntry {
        rowid: RowId::from_raw(rowid),
        namespace,
        tablename,
        optype: OpType::parse(&optype)?,
        primary_key,
        new_row,
        old_row,
        timestamp: timestamp.as_deref().map(parse_timestamp).transpose()?,
        clear_tags,
    })
}

const ENTRY_COLUMNS: &str =
    "rowid, namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp, \"clearTags\"";

fn read_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<OplogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let raw: Vec<RawEntry> = stmt
        .query_map(params, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;
    raw.into_iter().map(convert_entry).collect()
}

// =============================================================================
// Queries
// =============================================================================

/// All oplog rows above `since`, in rowid (commit) order. This is the
/// pending local tail the merge runs against.
pub fn get_entries_since(
    conn: &Connection,
    names: &TableNames,
    since: RowId,
) -> Result<Vec<OplogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM {} WHERE rowid > ?1 ORDER BY rowid ASC",
        names.oplog_qualified()
    );
    read_entries(conn, &sql, params![since.as_raw()])
}

/// Promoted rows above `since` that are ready to ship (timestamp assigned).
pub fn get_sendable_entries_since(
    conn: &Connection,
    names: &TableNames,
    since: RowId,
) -> Result<Vec<OplogEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM {} \
         WHERE rowid > ?1 AND timestamp IS NOT NULL ORDER BY rowid ASC",
        names.oplog_qualified()
    );
    read_entries(conn, &sql, params![since.as_raw()])
}

/// Deletes every oplog row promoted at `timestamp` — the round-trip
/// acknowledgement of one locally-committed transaction.
pub fn garbage_collect(
    conn: &Connection,
    names: &TableNames,
    timestamp: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!(
        "DELETE FROM {} WHERE timestamp = ?1",
        names.oplog_qualified()
    );
    Ok(conn.execute(&sql, params![format_timestamp(timestamp)])?)
}

// =============================================================================
// Outbound Conversion
// =============================================================================

/// Converts one promoted oplog row into its wire change.
///
/// The change's `tags` carry the row's `clearTags` — the set this operation
/// observed — which is what concurrent mergers on other nodes resolve
/// against.
pub fn entry_to_change(entry: &OplogEntry, relation: &Relation) -> Result<DataChange> {
    let record_type = match entry.optype {
        OpType::Insert => RecordType::Insert,
        OpType::Update | OpType::Compensation => RecordType::Update,
        OpType::Delete => RecordType::Delete,
    };
    let tags = TagSet::decode(&entry.clear_tags)?;
    Ok(DataChange {
        relation: relation.clone(),
        record_type,
        new_record: entry.new_row_map()?,
        old_record: entry.old_row_map()?,
        tags: tags.iter().cloned().collect(),
    })
}

/// Groups promoted oplog rows into outbound transactions, one per distinct
/// commit timestamp, in rowid order. Each transaction's LSN encodes the
/// last rowid it covers, which is what send/ack position bookkeeping uses.
pub fn entries_to_transactions(
    entries: &[OplogEntry],
    origin: &str,
    lookup_relation: impl Fn(&str) -> Option<Relation>,
) -> Result<Vec<Transaction>> {
    let mut transactions: Vec<Transaction> = Vec::new();
    let mut current_ts: Option<DateTime<Utc>> = None;

    for entry in entries {
        let ts = entry.timestamp.ok_or_else(|| {
            Error::Internal(format!(
                "oplog row {} has no timestamp; snapshot must run first",
                entry.rowid
            ))
        })?;
        let relation = lookup_relation(&entry.tablename).ok_or_else(|| {
            Error::Internal(format!("no relation cached for table '{}'", entry.tablename))
        })?;
        let change = Change::Data(entry_to_change(entry, &relation)?);

        if current_ts != Some(ts) {
            transactions.push(Transaction {
                origin: Some(origin.to_string()),
                commit_timestamp: ts.timestamp_millis(),
                lsn: Lsn::from_row_id(entry.rowid),
                changes: vec![change],
            });
            current_ts = Some(ts);
        } else {
            let tx = transactions.last_mut().expect("group started above");
            tx.lsn = Lsn::from_row_id(entry.rowid);
            tx.changes.push(change);
        }
    }

    Ok(transactions)
}

// =============================================================================
// Tests
// =============================================================================
