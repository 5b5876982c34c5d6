//! # Shape Subscriptions
//!
//! A *shape* is a whole-table subscription: the server delivers an initial
//! bulk of rows, then folds further changes for that table into the normal
//! replication stream.
//!
//! The manager tracks subscription lifecycle (`requested` → `delivered`),
//! deduplicates identical shape sets, and hands callers a `synced` future
//! that resolves when the initial data has been applied. Initial data lands
//! in one database transaction, batched to honor the SQL host's positional
//! parameter limit, with capture triggers disabled so the bulk insert does
//! not echo into the oplog.

use std::collections::HashMap;
use std::fmt;

use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::tags::{Tag, TagSet};
use crate::triggers;
use crate::types::{json_to_sql_value, Lsn, QualifiedTablename, Relation, Row};
use crate::schema;

// =============================================================================
// Identifiers and Definitions
// =============================================================================

/// Server-visible subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Allocates a fresh identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for SubscriptionId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A whole-table shape definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeDefinition {
    pub tablename: String,
}

impl ShapeDefinition {
    pub fn new(tablename: impl Into<String>) -> Self {
        Self {
            tablename: tablename.into(),
        }
    }
}

/// One shape inside a subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub request_id: String,
    pub definition: ShapeDefinition,
}

/// The initial bulk data for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionData {
    pub subscription_id: SubscriptionId,
    /// Stream position the data is consistent with; persisted atomically
    /// with the rows.
    pub lsn: Lsn,
    pub data: Vec<InitialDataChange>,
}

/// One delivered row.
#[derive(Debug, Clone)]
pub struct InitialDataChange {
    pub relation: Relation,
    pub record: Row,
    pub tags: Vec<Tag>,
}

// =============================================================================
// Manager
// =============================================================================

/// Resolves when the server has delivered (and the core has applied) the
/// subscription's initial data.
#[derive(Debug)]
pub struct SyncedFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl SyncedFuture {
    /// Waits for the initial data.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| Error::Stopped)?
    }

    fn resolved(result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

/// In-memory subscription state. Lives on the satellite loop; the fulfilled
/// map is what gets persisted into meta.
#[derive(Default)]
pub struct SubscriptionManager {
    /// Requested but not yet delivered, by id.
    in_flight: HashMap<SubscriptionId, Vec<ShapeDefinition>>,
    /// Delivered, by id.
    fulfilled: HashMap<SubscriptionId, Vec<ShapeDefinition>>,
    /// `synced` waiters per in-flight subscription.
    waiters: HashMap<SubscriptionId, Vec<oneshot::Sender<Result<()>>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical key for a shape set: identical sets deduplicate regardless
    /// of request order.
    fn dedup_key(shapes: &[ShapeDefinition]) -> String {
        let mut sorted = shapes.to_vec();
        sorted.sort();
        sorted.dedup();
        serde_json::to_string(&sorted).expect("shape definitions always serialize")
    }

    /// Routes a subscribe call: an identical fulfilled set resolves
    /// immediately, an identical in-flight set shares its future, and a new
    /// set allocates ids for a client request.
    pub fn subscribe(&mut self, shapes: &[ShapeDefinition]) -> SubscribeOutcome {
        let key = Self::dedup_key(shapes);
        for existing in self.fulfilled.values() {
            if Self::dedup_key(existing) == key {
                return SubscribeOutcome::AlreadyFulfilled(SyncedFuture::resolved(Ok(())));
            }
        }
        for (id, existing) in &self.in_flight {
            if Self::dedup_key(existing) == key {
                return SubscribeOutcome::SharedInFlight(self.add_waiter(id.clone()));
            }
        }

        let id = SubscriptionId::random();
        let requests: Vec<ShapeRequest> = shapes
            .iter()
            .map(|definition| ShapeRequest {
                request_id: Uuid::new_v4().to_string(),
                definition: definition.clone(),
            })
            .collect();
        self.in_flight.insert(id.clone(), shapes.to_vec());
        let synced = self.add_waiter(id.clone());
        SubscribeOutcome::Request {
            subscription_id: id,
            requests,
            synced,
        }
    }

    fn add_waiter(&mut self, id: SubscriptionId) -> SyncedFuture {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id).or_default().push(tx);
        SyncedFuture { rx }
    }

    /// Moves a subscription to the delivered state without resolving its
    /// waiters, so the serialized form can be persisted atomically with the
    /// delivered rows before anyone observes `synced`.
    pub fn promote(&mut self, id: &SubscriptionId) {
        if let Some(shapes) = self.in_flight.remove(id) {
            self.fulfilled.insert(id.clone(), shapes);
        }
    }

    /// Resolves a delivered subscription's waiters.
    pub fn complete(&mut self, id: &SubscriptionId) {
        for waiter in self.waiters.remove(id).unwrap_or_default() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Marks a subscription delivered and resolves its waiters.
    pub fn mark_fulfilled(&mut self, id: &SubscriptionId) {
        self.promote(id);
        self.complete(id);
    }

    /// Fails a subscription, delivering the error to its waiters only.
    pub fn fail(&mut self, id: &SubscriptionId, message: &str) {
        self.in_flight.remove(id);
        self.fulfilled.remove(id);
        for waiter in self.waiters.remove(id).unwrap_or_default() {
            let _ = waiter.send(Err(Error::Subscription {
                subscription_id: Some(id.clone()),
                message: message.to_string(),
            }));
        }
    }

    /// Drops every subscription. Outstanding waiters fail with `message`.
    pub fn reset(&mut self, message: &str) {
        let ids: Vec<SubscriptionId> = self.waiters.keys().cloned().collect();
        for id in ids {
            self.fail(&id, message);
        }
        self.in_flight.clear();
        self.fulfilled.clear();
    }

    /// Ids of delivered subscriptions, offered when resuming replication.
    pub fn fulfilled_ids(&self) -> Vec<SubscriptionId> {
        self.fulfilled.keys().cloned().collect()
    }

    /// Distinct shape definitions across delivered subscriptions — what a
    /// behind-window recovery re-subscribes.
    pub fn fulfilled_shapes(&self) -> Vec<ShapeDefinition> {
        let mut shapes: Vec<ShapeDefinition> =
            self.fulfilled.values().flatten().cloned().collect();
        shapes.sort();
        shapes.dedup();
        shapes
    }

    /// Whether an id is known (either state).
    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.in_flight.contains_key(id) || self.fulfilled.contains_key(id)
    }

    /// Serialized form persisted in the meta table (delivered subscriptions
    /// only; in-flight futures cannot outlive the process).
    pub fn serialize(&self) -> String {
        serde_json::to_string(&self.fulfilled).expect("subscription state always serializes")
    }

    /// Restores the persisted form. The empty string is the fresh state.
    pub fn restore(&mut self, raw: &str) -> Result<()> {
        self.in_flight.clear();
        self.waiters.clear();
        self.fulfilled = if raw.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(raw)?
        };
        Ok(())
    }

    /// Unsubscription has no defined upstream semantics.
    pub fn unsubscribe(&mut self, _id: &SubscriptionId) -> Result<()> {
        Err(Error::Internal("unsubscribe is not supported".to_string()))
    }
}

/// What a `subscribe` call should do next.
pub enum SubscribeOutcome {
    /// Identical shape set already delivered: resolved future, no request.
    AlreadyFulfilled(SyncedFuture),
    /// Identical shape set in flight: share its future, no request.
    SharedInFlight(SyncedFuture),
    /// New shape set: send this request to the client.
    Request {
        subscription_id: SubscriptionId,
        requests: Vec<ShapeRequest>,
        synced: SyncedFuture,
    },
}

// =============================================================================
// Initial Data Apply
// =============================================================================

/// Applies a subscription's initial data in one database transaction:
/// user rows and shadow rows batched under the parameter limit, capture
/// triggers disabled around the writes, subscription state and LSN meta
/// updated atomically with the rows. Returns the affected tables.
pub async fn apply_subscription_data(
    adapter: &Adapter,
    names: TableNames,
    max_sql_parameters: usize,
    data: SubscriptionData,
    serialized_subscriptions: String,
) -> Result<Vec<QualifiedTablename>> {
    adapter
        .transaction(move |tx| {
            // Group rows per relation, preserving delivery order.
            let mut grouped: Vec<(Relation, Vec<InitialDataChange>)> = Vec::new();
            for change in data.data {
                match grouped.iter_mut().find(|(r, _)| r.id == change.relation.id) {
                    Some((_, rows)) => rows.push(change),
                    None => grouped.push((change.relation.clone(), vec![change])),
                }
            }

            let mut affected = Vec::new();
            for (relation, rows) in &grouped {
                let table = relation.qualified_tablename();
                triggers::set_triggers_enabled(tx, &names, &table.key(), false)?;
                insert_initial_rows(tx, &names, relation, rows, max_sql_parameters)?;
                triggers::set_triggers_enabled(tx, &names, &table.key(), true)?;
                affected.push(table);
            }

            schema::set_meta(tx, &names, "subscriptions", &serialized_subscriptions)?;
            schema::set_meta_lsn(tx, &names, Some(&data.lsn))?;
            Ok(affected)
        })
        .await
}

fn insert_initial_rows(
    tx: &rusqlite::Transaction<'_>,
    names: &TableNames,
    relation: &Relation,
    rows: &[InitialDataChange],
    max_sql_parameters: usize,
) -> Result<()> {
    let columns: Vec<&str> = relation.columns.iter().map(|c| c.name.as_str()).collect();
    let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
    let table = relation.qualified_tablename();

    // Rows per statement, bounded by the host's positional parameter limit.
    let rows_per_batch = (max_sql_parameters / columns.len()).max(1);

    for batch in rows.chunks(rows_per_batch) {
        let placeholder_row = format!(
            "({})",
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );
        let sql = format!(
            "INSERT OR REPLACE INTO {table} ({}) VALUES {}",
            quoted.join(", "),
            vec![placeholder_row.as_str(); batch.len()].join(", ")
        );
        let mut params: Vec<rusqlite::types::Value> =
            Vec::with_capacity(batch.len() * columns.len());
        for change in batch {
            for &col in &columns {
                let value = change.record.get(col).unwrap_or(&serde_json::Value::Null);
                params.push(json_to_sql_value(value)?);
            }
        }
        tx.execute(&sql, params_from_iter(params))?;
    }

    // Shadow rows: four parameters each, batched the same way.
    let shadow_rows_per_batch = (max_sql_parameters / 4).max(1);
    for batch in rows.chunks(shadow_rows_per_batch) {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (namespace, tablename, \"primaryKey\", tags) VALUES {}",
            names.shadow_qualified(),
            vec!["(?, ?, ?, ?)"; batch.len()].join(", ")
        );
        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(batch.len() * 4);
        for change in batch {
            let mut pk = Row::new();
            for col in relation.primary_key_columns() {
                let value = change.record.get(col).ok_or_else(|| {
                    Error::Internal(format!(
                        "initial row for '{}' lacks key column '{col}'",
                        relation.table
                    ))
                })?;
                pk.insert(col.to_string(), value.clone());
            }
            let tags: TagSet = change.tags.iter().cloned().collect();
            params.push(rusqlite::types::Value::Text(relation.schema.clone()));
            params.push(rusqlite::types::Value::Text(relation.table.clone()));
            params.push(rusqlite::types::Value::Text(serde_json::to_string(&pk)?));
            params.push(rusqlite::types::Value::Text(tags.encode()));
        }
        tx.execute(&sql, params_from_iter(params))?;
    }

    Ok(())
}

/// Garbage-collects a shape's rows: `DELETE FROM <table>` with capture
/// triggers disabled. Shadow rows are deliberately left behind; a future
/// re-subscribe reconciles against them.
pub async fn garbage_collect_shape(
    adapter: &Adapter,
    names: TableNames,
    table: QualifiedTablename,
) -> Result<()> {
    adapter
        .transaction(move |tx| {
            triggers::set_triggers_enabled(tx, &names, &table.key(), false)?;
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            triggers::set_triggers_enabled(tx, &names, &table.key(), true)?;
            Ok(())
        })
        .await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use crate::schema::Database;
    use crate::types::{RelationColumn, TableType};
    use chrono::TimeZone;

    fn shapes(names: &[&str]) -> Vec<ShapeDefinition> {
        names.iter().map(|n| ShapeDefinition::new(*n)).collect()
    }

    #[test]
    fn test_new_shape_set_becomes_request() {
        let mut mgr = SubscriptionManager::new();
        match mgr.subscribe(&shapes(&["parent"])) {
            SubscribeOutcome::Request {
                subscription_id,
                requests,
                ..
            } => {
                assert!(mgr.contains(&subscription_id));
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].definition.tablename, "parent");
            }
            _ => panic!("expected a fresh request"),
        }
    }

    #[tokio::test]
    async fn test_identical_in_flight_set_shares_future() {
        let mut mgr = SubscriptionManager::new();
        let first = mgr.subscribe(&shapes(&["a", "b"]));
        let id = match first {
            SubscribeOutcome::Request {
                subscription_id, ..
            } => subscription_id,
            _ => panic!("expected request"),
        };

        // Same set, different order: no second request.
        let second = mgr.subscribe(&shapes(&["b", "a"]));
        let shared = match second {
            SubscribeOutcome::SharedInFlight(f) => f,
            _ => panic!("expected shared future"),
        };

        mgr.mark_fulfilled(&id);
        shared.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_fulfilled_set_resolves_immediately() {
        let mut mgr = SubscriptionManager::new();
        let id = match mgr.subscribe(&shapes(&["parent"])) {
            SubscribeOutcome::Request {
                subscription_id,
                synced,
                ..
            } => {
                // Complete the first subscription.
                let id = subscription_id;
                mgr.mark_fulfilled(&id);
                synced.wait().await.unwrap();
                id
            }
            _ => panic!("expected request"),
        };
        assert_eq!(mgr.fulfilled_ids(), vec![id]);

        match mgr.subscribe(&shapes(&["parent"])) {
            SubscribeOutcome::AlreadyFulfilled(f) => f.wait().await.unwrap(),
            _ => panic!("expected immediate resolution"),
        }
    }

    #[tokio::test]
    async fn test_failure_reaches_only_that_subscription() {
        let mut mgr = SubscriptionManager::new();
        let (id_a, synced_a) = match mgr.subscribe(&shapes(&["a"])) {
            SubscribeOutcome::Request {
                subscription_id,
                synced,
                ..
            } => (subscription_id, synced),
            _ => panic!(),
        };
        let (id_b, synced_b) = match mgr.subscribe(&shapes(&["b"])) {
            SubscribeOutcome::Request {
                subscription_id,
                synced,
                ..
            } => (subscription_id, synced),
            _ => panic!(),
        };

        mgr.fail(&id_a, "shape rejected");
        mgr.mark_fulfilled(&id_b);

        let err = synced_a.wait().await.unwrap_err();
        assert!(matches!(err, Error::Subscription { .. }));
        synced_b.wait().await.unwrap();
        assert!(!mgr.contains(&id_a));
        assert!(mgr.contains(&id_b));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let mut mgr = SubscriptionManager::new();
        let synced = match mgr.subscribe(&shapes(&["a"])) {
            SubscribeOutcome::Request { synced, .. } => synced,
            _ => panic!(),
        };
        mgr.reset("client state reset");
        assert!(synced.wait().await.is_err());
        assert!(mgr.fulfilled_ids().is_empty());
        assert!(mgr.fulfilled_shapes().is_empty());
    }

    #[test]
    fn test_serialize_restore_roundtrip() {
        let mut mgr = SubscriptionManager::new();
        let id = match mgr.subscribe(&shapes(&["a", "b"])) {
            SubscribeOutcome::Request {
                subscription_id, ..
            } => subscription_id,
            _ => panic!(),
        };
        mgr.mark_fulfilled(&id);

        let raw = mgr.serialize();
        let mut restored = SubscriptionManager::new();
        restored.restore(&raw).unwrap();
        assert_eq!(restored.fulfilled_ids(), vec![id]);
        assert_eq!(restored.fulfilled_shapes(), shapes(&["a", "b"]));

        let mut fresh = SubscriptionManager::new();
        fresh.restore("").unwrap();
        assert!(fresh.fulfilled_ids().is_empty());
    }

    #[test]
    fn test_unsubscribe_is_unsupported() {
        let mut mgr = SubscriptionManager::new();
        let err = mgr.unsubscribe(&SubscriptionId::from("x")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    // -------------------------------------------------------------------------
    // Initial data apply
    // -------------------------------------------------------------------------

    fn items_relation() -> Relation {
        Relation {
            id: 7,
            schema: "main".to_string(),
            table: "items".to_string(),
            table_type: TableType::Table,
            columns: vec![
                RelationColumn {
                    name: "id".to_string(),
                    sqlite_type: "INTEGER".to_string(),
                    is_nullable: false,
                    primary_key: Some(1),
                },
                RelationColumn {
                    name: "label".to_string(),
                    sqlite_type: "TEXT".to_string(),
                    is_nullable: true,
                    primary_key: None,
                },
            ],
        }
    }

    async fn setup_adapter() -> Adapter {
        let mut conn = Database::open_in_memory().unwrap().into_connection();
        let names = TableNames::default();
        migrations::up(&mut conn, &names).unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")
            .unwrap();
        crate::triggers::install_for_relation(&conn, &names, &items_relation()).unwrap();
        Adapter::new(conn)
    }

    #[tokio::test]
    async fn test_apply_batches_under_parameter_limit() {
        let adapter = setup_adapter().await;
        let relation = items_relation();
        let tag = Tag::generate("srv", chrono::Utc.timestamp_millis_opt(1_000).unwrap());

        // 25 rows × 2 columns with a limit of 10 parameters forces batching.
        let rows: Vec<InitialDataChange> = (0..25)
            .map(|i| {
                let mut record = Row::new();
                record.insert("id".to_string(), serde_json::json!(i));
                record.insert("label".to_string(), serde_json::json!(format!("row-{i}")));
                InitialDataChange {
                    relation: relation.clone(),
                    record,
                    tags: vec![tag.clone()],
                }
            })
            .collect();

        let data = SubscriptionData {
            subscription_id: SubscriptionId::from("sub-1"),
            lsn: Lsn::from_bytes(vec![1, 2]),
            data: rows,
        };

        let affected = apply_subscription_data(
            &adapter,
            TableNames::default(),
            10,
            data,
            "{}".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(affected, vec![QualifiedTablename::new("main", "items")]);

        let (user_rows, shadow_rows, oplog_rows): (i64, i64, i64) = adapter
            .call(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM _electric_shadow", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM _electric_oplog", [], |r| r.get(0))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(user_rows, 25, "every delivered row lands");
        assert_eq!(shadow_rows, 25, "one shadow row per user row");
        assert_eq!(oplog_rows, 0, "capture triggers must not fire");

        // LSN and subscription state were persisted with the rows.
        let (lsn, subs) = adapter
            .call(|conn| {
                let names = TableNames::default();
                Ok((
                    schema::get_meta_lsn(conn, &names)?,
                    schema::get_meta(conn, &names, "subscriptions")?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(lsn, Some(Lsn::from_bytes(vec![1, 2])));
        assert_eq!(subs.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_shape_gc_leaves_shadow_rows() {
        let adapter = setup_adapter().await;
        let relation = items_relation();
        let tag = Tag::generate("srv", chrono::Utc.timestamp_millis_opt(1_000).unwrap());

        let mut record = Row::new();
        record.insert("id".to_string(), serde_json::json!(1));
        record.insert("label".to_string(), serde_json::json!("x"));
        let data = SubscriptionData {
            subscription_id: SubscriptionId::from("sub-1"),
            lsn: Lsn::from_bytes(vec![1]),
            data: vec![InitialDataChange {
                relation: relation.clone(),
                record,
                tags: vec![tag],
            }],
        };
        apply_subscription_data(&adapter, TableNames::default(), 100, data, String::new())
            .await
            .unwrap();

        garbage_collect_shape(
            &adapter,
            TableNames::default(),
            relation.qualified_tablename(),
        )
        .await
        .unwrap();

        let (user_rows, shadow_rows, oplog_rows): (i64, i64, i64) = adapter
            .call(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM _electric_shadow", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM _electric_oplog", [], |r| r.get(0))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!(user_rows, 0);
        assert_eq!(shadow_rows, 1, "shadow rows are retained for re-subscribe");
        assert_eq!(oplog_rows, 0, "gc must not echo into the oplog");
    }
}
