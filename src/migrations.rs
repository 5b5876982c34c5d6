//! # Schema Migrations
//!
//! Every schema change — the baseline bookkeeping tables and the DDL that
//! arrives on the replication stream — is recorded by version in
//! `_electric_migrations`, so re-running `up()` and re-delivered stream
//! migrations are no-ops.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::TableNames;
use crate::error::Result;
use crate::schema;

/// Version of the built-in baseline migration.
pub const BASELINE_VERSION: &str = "0";

/// Brings a fresh or existing database up to the baseline schema and seeds
/// the meta rows. Idempotent.
pub fn up(conn: &mut Connection, names: &TableNames) -> Result<()> {
    let tx = conn.transaction()?;

    // The migrations table must exist before any version can be recorded.
    tx.execute_batch(&schema::create_migrations_sql(names))?;

    if !is_applied(&tx, names, BASELINE_VERSION)? {
        for ddl in schema::baseline_ddl(names) {
            tx.execute_batch(&ddl)?;
        }
        for (key, value) in schema::META_SEED_KEYS {
            let sql = format!(
                "INSERT OR IGNORE INTO {} (key, value) VALUES (?1, ?2)",
                names.meta_qualified()
            );
            tx.execute(&sql, params![key, value])?;
        }
        record(&tx, names, BASELINE_VERSION)?;
    }

    tx.commit()?;
    Ok(())
}

/// Runs `statements` under `version` unless that version was already
/// applied. Returns whether the statements ran.
///
/// Used by the applier to route stream-delivered DDL: a transaction that is
/// re-delivered after a crash finds its version recorded and skips the DDL.
pub fn apply_if_not_already(
    conn: &Connection,
    names: &TableNames,
    version: &str,
    statements: &[String],
) -> Result<bool> {
    if is_applied(conn, names, version)? {
        return Ok(false);
    }
    for sql in statements {
        conn.execute_batch(sql)?;
    }
    record(conn, names, version)?;
    Ok(true)
}

/// Whether `version` has been applied.
pub fn is_applied(conn: &Connection, names: &TableNames, version: &str) -> Result<bool> {
    let sql = format!(
        "SELECT version FROM {} WHERE version = ?1",
        names.migrations_qualified()
    );
    let found: Option<String> = conn
        .query_row(&sql, params![version], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// The most recently applied version, used as the schema version offered to
/// the replication service.
pub fn latest_version(conn: &Connection, names: &TableNames) -> Result<Option<String>> {
    let sql = format!(
        "SELECT version FROM {} ORDER BY applied_at DESC, version DESC LIMIT 1",
        names.migrations_qualified()
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0)).optional()?)
}

fn record(conn: &Connection, names: &TableNames, version: &str) -> Result<()> {
    let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let sql = format!(
        "INSERT OR IGNORE INTO {} (version, applied_at) VALUES (?1, ?2)",
        names.migrations_qualified()
    );
    conn.execute(&sql, params![version, applied_at])?;
    schema::set_meta(conn, names, "lastMigration", version)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn conn() -> Connection {
        Database::open_in_memory().unwrap().into_connection()
    }

    #[test]
    fn test_up_is_idempotent() {
        let mut conn = conn();
        let names = TableNames::default();
        up(&mut conn, &names).unwrap();
        up(&mut conn, &names).unwrap();
        assert!(is_applied(&conn, &names, BASELINE_VERSION).unwrap());
    }

    #[test]
    fn test_apply_if_not_already_runs_once() {
        let mut conn = conn();
        let names = TableNames::default();
        up(&mut conn, &names).unwrap();

        let stmts = vec!["CREATE TABLE items (id INTEGER PRIMARY KEY)".to_string()];
        assert!(apply_if_not_already(&conn, &names, "20240102", &stmts).unwrap());
        // Re-delivery: the CREATE would fail, but the version gate skips it.
        assert!(!apply_if_not_already(&conn, &names, "20240102", &stmts).unwrap());
    }

    #[test]
    fn test_latest_version_tracks_applies() {
        let mut conn = conn();
        let names = TableNames::default();
        up(&mut conn, &names).unwrap();
        assert_eq!(
            latest_version(&conn, &names).unwrap().as_deref(),
            Some(BASELINE_VERSION)
        );

        apply_if_not_already(
            &conn,
            &names,
            "20240102",
            &["CREATE TABLE items (id INTEGER PRIMARY KEY)".to_string()],
        )
        .unwrap();
        assert_eq!(
            latest_version(&conn, &names).unwrap().as_deref(),
            Some("20240102")
        );
        assert_eq!(
            schema::get_meta(&conn, &names, "lastMigration")
                .unwrap()
                .as_deref(),
            Some("20240102")
        );
    }
}
