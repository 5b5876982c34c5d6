//! # Conflict Resolution
//!
//! Resolves a batch of incoming remote changes against the pending local
//! oplog tail. Both sides are folded per `(namespace, table, primary key)`
//! into a single summary, then the two summaries resolve into one outcome
//! per row.
//!
//! ## Presence: tag algebra
//!
//! The surviving tag set for a row is
//!
//! ```text
//! localTag ∪ (incomingTags \ localClearTags)
//! ```
//!
//! - `localTag` is the tag of the last pending local write (absent when the
//!   local tail ends in a delete);
//! - `incomingTags` is the tag set the last remote op carried on the wire —
//!   its own tag for an upsert, the set it observed for a delete;
//! - `localClearTags` is everything the local tail observed being cleared.
//!
//! Empty result ⇒ the row is deleted everywhere it was observed ⇒ DELETE.
//! Non-empty ⇒ UPSERT. A remote write whose tag the local delete never
//! observed therefore survives the delete: add-wins.
//!
//! ## Values: column-wise last-writer-wins
//!
//! Each folded side stamps every column it wrote with the writing op's
//! timestamp. Resolution picks, per column, the side with the greater
//! timestamp; ties break toward the lexicographically greater client id.
//! Ties are only possible across sides — within a side the fold already
//! kept the latest write.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::tags::{Tag, TagSet};
use crate::types::{DataChange, OplogEntry, OpType, QualifiedTablename, RecordType, Row};

// =============================================================================
// Folded Changes
// =============================================================================

/// One column's latest value on one side, stamped with the write instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnChange {
    pub value: serde_json::Value,
    pub timestamp_ms: i64,
}

/// Resolved outcome kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Upsert,
    Delete,
}

/// The fold of one side's operations on one row, and the shape of the final
/// resolved outcome the applier writes back.
#[derive(Debug, Clone)]
pub struct ShadowEntryChanges {
    pub optype: ChangeOp,
    /// Latest value per column written on this side. Deletes contribute no
    /// columns; a delete that loses the presence battle must not resurrect
    /// its pre-image over the surviving write's values.
    pub changes: HashMap<String, ColumnChange>,
    /// Canonical primary-key column map.
    pub primary_key: Row,
    /// Remote fold: wire tags of the last op. Resolved outcome: the
    /// surviving tag set to write to the shadow table.
    pub tags: TagSet,
}

impl ShadowEntryChanges {
    /// Assembles the full row in `columns` order (the relation's declared
    /// order), falling back to the primary-key map for key columns.
    pub fn build_row(&self, columns: &[&str]) -> Result<Row> {
        let mut row = Row::new();
        for &col in columns {
            let value = if let Some(change) = self.changes.get(col) {
                change.value.clone()
            } else if let Some(pk_value) = self.primary_key.get(col) {
                pk_value.clone()
            } else {
                return Err(Error::Internal(format!(
                    "merged row is missing a value for column '{col}'"
                )));
            };
            row.insert(col.to_string(), value);
        }
        Ok(row)
    }
}

/// The fold of the pending local tail on one row.
#[derive(Debug, Clone)]
pub struct LocalChanges {
    pub optype: ChangeOp,
    pub changes: HashMap<String, ColumnChange>,
    pub primary_key: Row,
    /// Tag of the last pending local write; `None` when the tail ends in a
    /// delete.
    pub tag: Option<Tag>,
    /// Union of everything the local tail observed being cleared.
    pub clear_tags: TagSet,
}

/// Folded changes per table, per canonical primary key.
pub type TableChanges<T> = HashMap<QualifiedTablename, HashMap<String, T>>;

// =============================================================================
// Folding
// =============================================================================

/// Folds pending local oplog entries, left-to-right in rowid order.
///
/// Every entry must already be promoted (timestamped) — the applier takes a
/// snapshot before merging precisely so this holds.
pub fn local_operations_to_table_changes(
    entries: &[OplogEntry],
    local_origin: &str,
) -> Result<TableChanges<LocalChanges>> {
    let mut tables: TableChanges<LocalChanges> = HashMap::new();

    for entry in entries {
        let timestamp = entry.timestamp.ok_or_else(|| {
            Error::Internal(format!(
                "oplog row {} is not promoted; snapshot must precede merge",
                entry.rowid
            ))
        })?;
        let timestamp_ms = timestamp.timestamp_millis();
        let clear_tags = TagSet::decode(&entry.clear_tags)?;
        let key = entry.primary_key.clone();
        let table = entry.qualified_tablename();

        let fold = tables
            .entry(table)
            .or_default()
            .entry(key)
            .or_insert_with(|| LocalChanges {
                optype: ChangeOp::Upsert,
                changes: HashMap::new(),
                primary_key: Row::new(),
                tag: None,
                clear_tags: TagSet::new(),
            });

        fold.primary_key = entry.primary_key_map()?;
        fold.clear_tags = fold.clear_tags.merge(&clear_tags);

        match entry.optype {
            OpType::Delete => {
                fold.optype = ChangeOp::Delete;
                fold.tag = None;
            }
            OpType::Compensation => {
                // Keeps the row alive but never wins a column.
                fold.optype = ChangeOp::Upsert;
                fold.tag = Some(Tag::generate(local_origin, timestamp));
            }
            OpType::Insert | OpType::Update => {
                fold.optype = ChangeOp::Upsert;
                fold.tag = Some(Tag::generate(local_origin, timestamp));
                if let Some(row) = entry.new_row_map()? {
                    for (col, value) in row {
                        fold.changes
                            .insert(col, ColumnChange { value, timestamp_ms });
                    }
                }
            }
        }
    }

    Ok(tables)
}

/// Folds the incoming changes of one remote transaction. All ops share the
/// transaction's commit instant.
pub fn remote_operations_to_table_changes(
    changes: &[DataChange],
    commit_timestamp_ms: i64,
) -> Result<TableChanges<ShadowEntryChanges>> {
    let mut tables: TableChanges<ShadowEntryChanges> = HashMap::new();

    for change in changes {
        let table = change.relation.qualified_tablename();
        let locator = change.locator_record().ok_or_else(|| {
            Error::Internal("incoming change carries no row record".to_string())
        })?;
        let primary_key = primary_key_of(&change.relation, locator)?;
        let key = serde_json::to_string(&primary_key)?;

        let fold = tables
            .entry(table)
            .or_default()
            .entry(key)
            .or_insert_with(|| ShadowEntryChanges {
                optype: ChangeOp::Upsert,
                changes: HashMap::new(),
                primary_key: primary_key.clone(),
                tags: TagSet::new(),
            });

        fold.primary_key = primary_key;
        fold.tags = change.tags.iter().cloned().collect();

        match change.record_type {
            RecordType::Delete => {
                fold.optype = ChangeOp::Delete;
            }
            RecordType::Insert | RecordType::Update => {
                fold.optype = ChangeOp::Upsert;
                if let Some(row) = &change.new_record {
                    for (col, value) in row {
                        fold.changes.insert(
                            col.clone(),
                            ColumnChange {
                                value: value.clone(),
                                timestamp_ms: commit_timestamp_ms,
                            },
                        );
                    }
                }
            }
        }
    }

    Ok(tables)
}

fn primary_key_of(relation: &crate::types::Relation, record: &Row) -> Result<Row> {
    let mut pk = Row::new();
    for col in relation.primary_key_columns() {
        let value = record.get(col).ok_or_else(|| {
            Error::Internal(format!(
                "incoming record for '{}' lacks key column '{col}'",
                relation.table
            ))
        })?;
        pk.insert(col.to_string(), value.clone());
    }
    Ok(pk)
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolves everything an incoming transaction touches against the pending
/// local tail. Keys only the local side touched are not in the result —
/// they are pending outbound writes, not something to apply.
pub fn merge_entries(
    local_origin: &str,
    local: &[OplogEntry],
    incoming_origin: &str,
    incoming: &[DataChange],
    incoming_commit_ms: i64,
) -> Result<TableChanges<ShadowEntryChanges>> {
    let local_tables = local_operations_to_table_changes(local, local_origin)?;
    let incoming_tables = remote_operations_to_table_changes(incoming, incoming_commit_ms)?;

    let mut merged: TableChanges<ShadowEntryChanges> = HashMap::new();
    for (table, incoming_rows) in incoming_tables {
        let local_rows = local_tables.get(&table);
        let out = merged.entry(table).or_default();
        for (key, incoming_fold) in incoming_rows {
            let resolved = match local_rows.and_then(|rows| rows.get(&key)) {
                Some(local_fold) => {
                    merge_changes(local_origin, local_fold, incoming_origin, &incoming_fold)
                }
                // Nothing pending locally: the incoming fold applies as-is.
                None => incoming_fold,
            };
            out.insert(key, resolved);
        }
    }
    Ok(merged)
}

/// Resolves one row: presence by tag algebra, values column-wise.
fn merge_changes(
    local_origin: &str,
    local: &LocalChanges,
    incoming_origin: &str,
    incoming: &ShadowEntryChanges,
) -> ShadowEntryChanges {
    // Values: start from the local side, let incoming columns win when they
    // are newer (or tie with the greater origin).
    let mut changes = local.changes.clone();
    for (col, incoming_change) in &incoming.changes {
        let incoming_wins = match changes.get(col) {
            None => true,
            Some(local_change) => {
                incoming_change.timestamp_ms > local_change.timestamp_ms
                    || (incoming_change.timestamp_ms == local_change.timestamp_ms
                        && incoming_origin > local_origin)
            }
        };
        if incoming_wins {
            changes.insert(col.clone(), incoming_change.clone());
        }
    }

    // Presence: survivors of the incoming tags after local observation,
    // plus the local write's own tag.
    let surviving = incoming.tags.difference(&local.clear_tags);
    let tags = match &local.tag {
        Some(tag) => surviving.merge(&TagSet::singleton(tag.clone())),
        None => surviving,
    };

    let optype = if tags.is_empty() {
        ChangeOp::Delete
    } else {
        ChangeOp::Upsert
    };

    ShadowEntryChanges {
        optype,
        changes,
        primary_key: local.primary_key.clone(),
        tags,
    }
}

// =============================================================================
// Tests
// =============================================================================
