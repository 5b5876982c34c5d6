#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use satlite::adapter::Adapter;
use satlite::config::{AuthConfig, SatelliteConfig};
use satlite::satellite::Satellite;
use satlite::schema::Database;
use satlite::tags::TagSet;
use satlite::testing::MockClient;
use satlite::types::{Relation, RelationColumn, Row, TableType};
use satlite::Notifier;

/// The fixed local client id used across the scenario tests.
pub const LOCAL_CLIENT: &str = "client-local";

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A running satellite wired to a scripted client over an in-memory
/// database with a `parent(id, value, other)` table.
pub struct Harness {
    pub adapter: Adapter,
    pub client: MockClient,
    pub notifier: Notifier,
    pub satellite: Satellite,
}

pub async fn start_satellite() -> Harness {
    start_satellite_with_config(SatelliteConfig {
        // Keep the background poller out of the way; tests drive snapshots.
        polling_interval: Duration::from_secs(3600),
        min_snapshot_window: Duration::from_millis(1),
        ..SatelliteConfig::default()
    })
    .await
}

pub async fn start_satellite_with_config(config: SatelliteConfig) -> Harness {
    init_tracing();
    let conn = Database::open_in_memory()
        .expect("open in-memory database")
        .into_connection();
    conn.execute_batch(
        "CREATE TABLE parent (id INTEGER PRIMARY KEY, value TEXT, other INTEGER)",
    )
    .expect("create parent table");
    let adapter = Adapter::new(conn);

    let client = MockClient::new();
    let notifier = Notifier::new();
    let mut satellite = Satellite::start(
        adapter.clone(),
        Arc::new(client.clone()),
        notifier.clone(),
        AuthConfig::new("test-jwt").with_client_id(LOCAL_CLIENT),
        config,
    )
    .await
    .expect("start satellite");
    satellite
        .wait_connected()
        .await
        .expect("initial connection attempt");

    Harness {
        adapter,
        client,
        notifier,
        satellite,
    }
}

/// Opens a satellite over an existing database file (restart scenarios).
pub async fn start_satellite_on_file(path: &Path) -> Harness {
    init_tracing();
    let conn = Database::open(path)
        .expect("open database file")
        .into_connection();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS parent (id INTEGER PRIMARY KEY, value TEXT, other INTEGER)",
    )
    .expect("create parent table");
    let adapter = Adapter::new(conn);

    let client = MockClient::new();
    let notifier = Notifier::new();
    let mut satellite = Satellite::start(
        adapter.clone(),
        Arc::new(client.clone()),
        notifier.clone(),
        AuthConfig::new("test-jwt"),
        SatelliteConfig {
            polling_interval: Duration::from_secs(3600),
            min_snapshot_window: Duration::from_millis(1),
            ..SatelliteConfig::default()
        },
    )
    .await
    .expect("start satellite");
    satellite
        .wait_connected()
        .await
        .expect("initial connection attempt");

    Harness {
        adapter,
        client,
        notifier,
        satellite,
    }
}

/// The relation for the test `parent` table, as a server would announce it.
pub fn parent_relation() -> Relation {
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
            RelationColumn {
                name: "other".to_string(),
                sqlite_type: "INTEGER".to_string(),
                is_nullable: true,
                primary_key: None,
            },
        ],
    }
}

/// Builds a `parent` row map in declared column order.
pub fn parent_row(id: i64, value: Option<&str>, other: Option<i64>) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), serde_json::json!(id));
    row.insert(
        "value".to_string(),
        value.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
    );
    row.insert(
        "other".to_string(),
        other.map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
    );
    row
}

// =============================================================================
// Database Inspection
// =============================================================================

/// All `parent` rows as `(id, value, other)`, ordered by id.
pub async fn parent_rows(adapter: &Adapter) -> Vec<(i64, Option<String>, Option<i64>)> {
    adapter
        .call(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, value, other FROM parent ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
        .expect("read parent rows")
}

/// Oplog rows as `(rowid, optype, primaryKey, timestamp, clearTags)`.
pub async fn oplog_rows(
    adapter: &Adapter,
) -> Vec<(i64, String, String, Option<String>, String)> {
    adapter
        .call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rowid, optype, \"primaryKey\", timestamp, \"clearTags\" \
                 FROM _electric_oplog ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
        .expect("read oplog rows")
}

/// The shadow tag set for a `parent` primary key, if any.
pub async fn shadow_tags(adapter: &Adapter, primary_key: &str) -> Option<TagSet> {
    let primary_key = primary_key.to_string();
    adapter
        .call(move |conn| {
            use rusqlite::OptionalExtension;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT tags FROM _electric_shadow \
                     WHERE tablename = 'parent' AND \"primaryKey\" = ?1",
                    rusqlite::params![primary_key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw.map(|r| TagSet::decode(&r)).transpose()?)
        })
        .await
        .expect("read shadow tags")
}

pub async fn shadow_count(adapter: &Adapter) -> i64 {
    adapter
        .call(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM _electric_shadow", [], |r| r.get(0))?)
        })
        .await
        .expect("count shadow rows")
}

pub async fn meta_value(adapter: &Adapter, key: &str) -> Option<String> {
    let key = key.to_string();
    adapter
        .call(move |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    "SELECT value FROM _electric_meta WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
        .expect("read meta")
}

// =============================================================================
// Polling
// =============================================================================

/// Polls `f` until it yields a value or `timeout` elapses.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Async-predicate variant of [`eventually`].
pub async fn eventually_async<F, Fut, T>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(interval).await;
    }
}
