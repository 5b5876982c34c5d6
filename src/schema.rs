//! # On-Disk Schema
//!
//! The replication core keeps five bookkeeping tables next to the user's
//! tables:
//!
//! ```text
//! _electric_meta        key/value: clientId, lsn, lastAckdRowId,
//!                       lastSentRowId, subscriptions, lastMigration
//! _electric_oplog       append-only capture of local writes (triggers)
//! _electric_shadow      per-row surviving tag set
//! _electric_migrations  applied schema migration versions
//! _electric_triggers    per-table flag gating the capture triggers
//! ```
//!
//! DDL lives here as constants; the migrator installs it as the baseline
//! migration. The [`Database`] wrapper owns the connection and applies the
//! pragmas every connection needs before any other statement runs.

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::types::{Lsn, RowId};

// =============================================================================
// DDL Statements
// =============================================================================

/// Key/value store for replication positions and identity.
///
/// Values are TEXT: `lsn` is base64, the row-id counters are decimal
/// strings, `subscriptions` is the serialized manager state.
pub(crate) fn create_meta_sql(names: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20   key   TEXT PRIMARY KEY,\n\
         \x20   value TEXT\n\
         )",
        names.meta_qualified()
    )
}

/// Append-only log of local writes.
///
/// `rowid` is the monotonic insertion-order key and the unit of the
/// outbound position counters. `timestamp` stays NULL and `clearTags`
/// stays `'[]'` until a snapshot promotes the row.
pub(crate) fn create_oplog_sql(names: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20   rowid        INTEGER PRIMARY KEY AUTOINCREMENT,\n\
         \x20   namespace    TEXT NOT NULL,\n\
         \x20   tablename    TEXT NOT NULL,\n\
         \x20   optype       TEXT NOT NULL,\n\
         \x20   \"primaryKey\" TEXT NOT NULL,\n\
         \x20   \"newRow\"     TEXT,\n\
         \x20   \"oldRow\"     TEXT,\n\
         \x20   timestamp    TEXT,\n\
         \x20   \"clearTags\"  TEXT NOT NULL DEFAULT '[]'\n\
         )",
        names.oplog_qualified()
    )
}

/// Per-row surviving tag set. A row is present here iff the user row is
/// live; `tags` is never the empty set.
pub(crate) fn create_shadow_sql(names: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20   namespace    TEXT NOT NULL,\n\
         \x20   tablename    TEXT NOT NULL,\n\
         \x20   \"primaryKey\" TEXT NOT NULL,\n\
         \x20   tags         TEXT NOT NULL,\n\
         \x20   PRIMARY KEY (namespace, tablename, \"primaryKey\")\n\
         )",
        names.shadow_qualified()
    )
}

/// Applied migration versions, so re-delivered migrations are no-ops.
pub(crate) fn create_migrations_sql(names: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20   version    TEXT PRIMARY KEY,\n\
         \x20   applied_at TEXT NOT NULL\n\
         )",
        names.migrations_qualified()
    )
}

/// Per-table trigger gate. `flag = 0` silences the capture triggers while
/// the applier writes remote changes.
pub(crate) fn create_triggers_sql(names: &TableNames) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20   tablename TEXT PRIMARY KEY,\n\
         \x20   flag      INTEGER NOT NULL DEFAULT 1\n\
         )",
        names.triggers_qualified()
    )
}

/// All baseline DDL in creation order.
pub(crate) fn baseline_ddl(names: &TableNames) -> Vec<String> {
    vec![
        create_meta_sql(names),
        create_oplog_sql(names),
        create_shadow_sql(names),
        create_migrations_sql(names),
        create_triggers_sql(names),
    ]
}

/// Meta rows seeded on first start. `compensations` globally gates the
/// foreign-key compensation triggers.
pub(crate) const META_SEED_KEYS: &[(&str, &str)] = &[
    ("clientId", ""),
    ("lsn", ""),
    ("lastAckdRowId", "0"),
    ("lastSentRowId", "0"),
    ("subscriptions", ""),
    ("compensations", "1"),
];

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the pragmas the replication core requires.
///
/// The wrapper does not create the bookkeeping tables; that is the
/// migrator's job, so that table creation is recorded like any other
/// migration.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating it if necessary.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.apply_pragmas(true)?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.apply_pragmas(false)?;
        Ok(db)
    }

    fn apply_pragmas(&self, file_backed: bool) -> Result<()> {
        // WAL only applies to file-backed databases; in-memory connections
        // reject the journal-mode change.
        if file_backed {
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
            self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        }
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(())
    }

    /// Releases the underlying connection to the adapter actor.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// Fails fast if the bookkeeping tables are missing — the migrator did not
/// run, or ran against a different prefix.
pub fn verify_satellite_tables(conn: &Connection, names: &TableNames) -> Result<()> {
    for table in [&names.meta, &names.oplog, &names.shadow] {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(Error::Internal(format!(
                "satellite table '{table}' is missing; migrations did not run"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Meta Accessors
// =============================================================================

/// Reads a raw meta value.
pub fn get_meta(conn: &Connection, names: &TableNames, key: &str) -> Result<Option<String>> {
    let sql = format!(
        "SELECT value FROM {} WHERE key = ?1",
        names.meta_qualified()
    );
    Ok(conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?)
}

/// Writes a raw meta value (upsert).
pub fn set_meta(conn: &Connection, names: &TableNames, key: &str, value: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (key, value) VALUES (?1, ?2)\n\
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        names.meta_qualified()
    );
    conn.execute(&sql, params![key, value])?;
    Ok(())
}

/// Reads a row-id counter (`lastAckdRowId` / `lastSentRowId`).
pub fn get_meta_row_id(conn: &Connection, names: &TableNames, key: &str) -> Result<RowId> {
    let raw = get_meta(conn, names, key)?.unwrap_or_default();
    if raw.is_empty() {
        return Ok(RowId::ZERO);
    }
    let value: i64 = raw
        .parse()
        .map_err(|_| Error::Internal(format!("meta '{key}' holds non-numeric '{raw}'")))?;
    Ok(RowId::from_raw(value))
}

/// Writes a row-id counter as a decimal string.
pub fn set_meta_row_id(
    conn: &Connection,
    names: &TableNames,
    key: &str,
    value: RowId,
) -> Result<()> {
    set_meta(conn, names, key, &value.as_raw().to_string())
}

/// Reads the persisted LSN; `None` when the client has never synced.
pub fn get_meta_lsn(conn: &Connection, names: &TableNames) -> Result<Option<Lsn>> {
    match get_meta(conn, names, "lsn")? {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => Ok(Some(Lsn::from_base64(&raw)?)),
    }
}

/// Persists the LSN in base64, or clears it.
pub fn set_meta_lsn(conn: &Connection, names: &TableNames, lsn: Option<&Lsn>) -> Result<()> {
    let encoded = lsn.map(Lsn::to_base64).unwrap_or_default();
    set_meta(conn, names, "lsn", &encoded)
}

// =============================================================================
// Tests
// =============================================================================
