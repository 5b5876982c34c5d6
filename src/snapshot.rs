//! # Snapshotting
//!
//! A snapshot promotes the pending oplog tail into a committed local write
//! batch: every row captured since the last snapshot gets this snapshot's
//! timestamp, the tag bookkeeping is reconciled, and the rows become
//! eligible for outbound shipping.
//!
//! The four steps run in one database transaction:
//!
//! 1. assign `timestamp = T` to every row with `timestamp IS NULL` above
//!    `lastAckdRowId`, returning the promoted rows;
//! 2. for every `(namespace, table, pk)` touched, set the promoted rows'
//!    `clearTags` to the key's pre-snapshot shadow tags plus this
//!    snapshot's own tag — the set these operations observed;
//! 3. upsert the shadow row to exactly `[newTag]` for keys whose last
//!    promoted op is not a DELETE;
//! 4. drop the shadow row for keys whose last promoted op is a DELETE.
//!
//! Snapshots never overlap: the satellite loop runs them one at a time and
//! coalesces bursts of requests through [`Throttle`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::adapter::Adapter;
use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::oplog::{self, format_timestamp};
use crate::tags::{Tag, TagSet};
use crate::types::{OplogEntry, OpType, RowId};

// =============================================================================
// Snapshot
// =============================================================================

/// What a snapshot promoted.
#[derive(Debug)]
pub struct SnapshotOutcome {
    /// The commit instant assigned to every promoted row.
    pub timestamp: DateTime<Utc>,
    /// Promoted rows in rowid order, with their final `clearTags`.
    pub entries: Vec<OplogEntry>,
}

/// Runs the four snapshot steps as one database transaction and returns the
/// promoted rows.
pub async fn perform_snapshot(
    adapter: &Adapter,
    names: TableNames,
    client_id: String,
    last_ackd: RowId,
) -> Result<SnapshotOutcome> {
    let (timestamp, entries) = adapter
        .transaction(move |tx| {
            // Millisecond precision (the timestamp round-trips through the
            // tag string form), strictly after every already-promoted row:
            // a commit instant names exactly one snapshot.
            let now_ms = Utc::now().timestamp_millis();
            let floor_ms = max_promoted_millis(tx, &names)?.map(|m| m + 1).unwrap_or(0);
            let timestamp = DateTime::<Utc>::from_timestamp_millis(now_ms.max(floor_ms))
                .ok_or_else(|| Error::Internal("snapshot instant out of range".to_string()))?;

            let new_tag = Tag::generate(&client_id, timestamp);
            let ts_text = format_timestamp(timestamp);

            // Step 1: promote the pending tail, returning the rows.
            let promote_sql = format!(
                "UPDATE {} SET timestamp = ?1 \
                 WHERE timestamp IS NULL AND rowid > ?2 \
                 RETURNING rowid",
                names.oplog_qualified()
            );
            let promoted_ids: Vec<i64> = {
                let mut stmt = tx.prepare(&promote_sql)?;
                let rows = stmt.query_map(params![ts_text, last_ackd.as_raw()], |row| {
                    row.get::<_, i64>(0)
                })?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            if promoted_ids.is_empty() {
                return Ok((timestamp, Vec::new()));
            }

            let mut entries = read_promoted(tx, &names, &ts_text)?;

            // Group the promoted rows per key, keeping rowid order.
            let mut groups: BTreeMap<(String, String, String), Vec<usize>> = BTreeMap::new();
            for (idx, entry) in entries.iter().enumerate() {
                groups
                    .entry((
                        entry.namespace.clone(),
                        entry.tablename.clone(),
                        entry.primary_key.clone(),
                    ))
                    .or_default()
                    .push(idx);
            }

            for ((namespace, tablename, primary_key), indexes) in &groups {
                // Step 2: observed set = pre-snapshot shadow tags + own tag.
                let prior = read_shadow_tags(tx, &names, namespace, tablename, primary_key)?;
                let mut observed = prior;
                observed.insert(new_tag.clone());
                let encoded = observed.encode();

                let rowids: Vec<String> = indexes
                    .iter()
                    .map(|&i| entries[i].rowid.as_raw().to_string())
                    .collect();
                let clear_sql = format!(
                    "UPDATE {} SET \"clearTags\" = ?1 WHERE rowid IN ({})",
                    names.oplog_qualified(),
                    rowids.join(", ")
                );
                tx.execute(&clear_sql, params![encoded])?;
                for &i in indexes {
                    entries[i].clear_tags = encoded.clone();
                }

                // Steps 3 and 4: reconcile the shadow row by the last op.
                let last = &entries[*indexes.last().expect("non-empty group")];
                if last.optype == OpType::Delete {
                    let delete_sql = format!(
                        "DELETE FROM {} \
                         WHERE namespace = ?1 AND tablename = ?2 AND \"primaryKey\" = ?3",
                        names.shadow_qualified()
                    );
                    tx.execute(&delete_sql, params![namespace, tablename, primary_key])?;
                } else {
                    let upsert_sql = format!(
                        "INSERT OR REPLACE INTO {} (namespace, tablename, \"primaryKey\", tags) \
                         VALUES (?1, ?2, ?3, ?4)",
                        names.shadow_qualified()
                    );
                    tx.execute(
                        &upsert_sql,
                        params![
                            namespace,
                            tablename,
                            primary_key,
                            TagSet::singleton(new_tag.clone()).encode()
                        ],
                    )?;
                }
            }

            Ok((timestamp, entries))
        })
        .await?;

    Ok(SnapshotOutcome { timestamp, entries })
}

/// The latest commit instant already present in the oplog, if any. ISO
/// strings compare lexicographically in chronological order.
fn max_promoted_millis(
    tx: &rusqlite::Transaction<'_>,
    names: &TableNames,
) -> Result<Option<i64>> {
    use rusqlite::OptionalExtension;
    let sql = format!(
        "SELECT MAX(timestamp) FROM {} WHERE timestamp IS NOT NULL",
        names.oplog_qualified()
    );
    let raw: Option<Option<String>> = tx.query_row(&sql, [], |row| row.get(0)).optional()?;
    match raw.flatten() {
        Some(text) => Ok(Some(oplog::parse_timestamp(&text)?.timestamp_millis())),
        None => Ok(None),
    }
}

fn read_promoted(
    tx: &rusqlite::Transaction<'_>,
    names: &TableNames,
    ts_text: &str,
) -> Result<Vec<OplogEntry>> {
    let sql = format!(
        "SELECT rowid, namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", \
         timestamp, \"clearTags\" \
         FROM {} WHERE timestamp = ?1 ORDER BY rowid ASC",
        names.oplog_qualified()
    );
    let mut stmt = tx.prepare(&sql)?;
    let raw: Vec<(i64, String, String, String, String, Option<String>, Option<String>, String, String)> =
        stmt.query_map(params![ts_text], |row| {
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

    raw.into_iter()
        .map(|(rowid, namespace, tablename, optype, primary_key, new_row, old_row, ts, clear_tags)| {
            Ok(OplogEntry {
                rowid: RowId::from_raw(rowid),
                namespace,
                tablename,
                optype: OpType::parse(&optype)?,
                primary_key,
                new_row,
                old_row,
                timestamp: Some(oplog::parse_timestamp(&ts)?),
                clear_tags,
            })
        })
        .collect()
}

fn read_shadow_tags(
    tx: &rusqlite::Transaction<'_>,
    names: &TableNames,
    namespace: &str,
    tablename: &str,
    primary_key: &str,
) -> Result<TagSet> {
    use rusqlite::OptionalExtension;
    let sql = format!(
        "SELECT tags FROM {} \
         WHERE namespace = ?1 AND tablename = ?2 AND \"primaryKey\" = ?3",
        names.shadow_qualified()
    );
    let raw: Option<String> = tx
        .query_row(&sql, params![namespace, tablename, primary_key], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        Some(encoded) => TagSet::decode(&encoded),
        None => Ok(TagSet::new()),
    }
}

// =============================================================================
// Throttle
// =============================================================================

/// What a snapshot request should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Run immediately; the window has elapsed (or never started).
    RunNow,
    /// Too soon: run again after this delay. The caller schedules exactly
    /// one trailing run.
    Schedule(Duration),
    /// A trailing run is already scheduled; this request coalesces into it.
    Coalesced,
}

/// Leading-edge throttle with a single trailing slot.
///
/// The first request in a quiet period runs immediately; requests inside
/// the window coalesce into one trailing run when the window elapses.
#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    last_run: Option<Instant>,
    trailing_scheduled: bool,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_run: None,
            trailing_scheduled: false,
        }
    }

    /// Registers a request at `now`.
    pub fn request(&mut self, now: Instant) -> ThrottleDecision {
        if self.trailing_scheduled {
            return ThrottleDecision::Coalesced;
        }
        match self.last_run {
            Some(last) if now.duration_since(last) < self.window => {
                self.trailing_scheduled = true;
                ThrottleDecision::Schedule(self.window - now.duration_since(last))
            }
            _ => ThrottleDecision::RunNow,
        }
    }

    /// Records that a run happened at `now` (leading or trailing).
    pub fn mark_ran(&mut self, now: Instant) {
        self.last_run = Some(now);
        self.trailing_scheduled = false;
    }
}

// =============================================================================
// Tests
// =============================================================================
