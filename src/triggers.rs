//! # Oplog Capture Triggers
//!
//! Three `AFTER` triggers per user table append an oplog row for every
//! INSERT, UPDATE and DELETE, snapshotting the row as `json_object(...)`
//! column maps. A `WHEN` clause on each trigger consults the per-table flag
//! row in the trigger-settings table, so the applier can silence capture
//! while it writes remote changes.
//!
//! Trigger bodies must use unqualified table names (SQLite resolves them in
//! the trigger's own database), so only the trigger name itself carries the
//! namespace.

use rusqlite::{params, Connection};

use crate::config::TableNames;
use crate::error::{Error, Result};
use crate::types::Relation;

// =============================================================================
// SQL Generation
// =============================================================================

/// `json_object('a', src."a", 'b', src."b", ...)` over the given columns.
fn json_object_expr(src: &str, columns: &[&str]) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {src}.\"{c}\""))
        .collect();
    format!("json_object({})", parts.join(", "))
}

fn trigger_name(op: &str, relation: &Relation) -> String {
    format!("{}_{}_{}_into_oplog", op, relation.schema, relation.table)
}

/// The DROP + CREATE statements for one table's three capture triggers.
///
/// Statements are returned individually; the caller runs them inside
/// whatever transaction is already open.
pub fn generate_triggers(names: &TableNames, relation: &Relation) -> Vec<String> {
    let ns = &relation.schema;
    let table = &relation.table;
    let key = format!("{ns}.{table}");
    let pk_cols = relation.primary_key_columns();
    let all_cols: Vec<&str> = relation.columns.iter().map(|c| c.name.as_str()).collect();

    let gate = format!(
        "WHEN 1 = (SELECT flag FROM \"{}\" WHERE tablename = '{key}')",
        names.triggers
    );
    let oplog = &names.oplog;

    let mut statements = drop_triggers(relation);

    // INSERT: key and row from `new`, no old row.
    statements.push(format!(
        "CREATE TRIGGER \"{ns}\".\"{name}\"\n\
         AFTER INSERT ON \"{table}\"\n\
         {gate}\n\
         BEGIN\n\
         \x20 INSERT INTO \"{oplog}\" (namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp)\n\
         \x20 VALUES ('{ns}', '{table}', 'INSERT', {pk}, {row}, NULL, NULL);\n\
         END",
        name = trigger_name("insert", relation),
        pk = json_object_expr("new", &pk_cols),
        row = json_object_expr("new", &all_cols),
    ));

    // UPDATE: both row images. The key comes from `new`; replicated tables
    // never update primary-key columns.
    statements.push(format!(
        "CREATE TRIGGER \"{ns}\".\"{name}\"\n\
         AFTER UPDATE ON \"{table}\"\n\
         {gate}\n\
         BEGIN\n\
         \x20 INSERT INTO \"{oplog}\" (namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp)\n\
         \x20 VALUES ('{ns}', '{table}', 'UPDATE', {pk}, {new_row}, {old_row}, NULL);\n\
         END",
        name = trigger_name("update", relation),
        pk = json_object_expr("new", &pk_cols),
        new_row = json_object_expr("new", &all_cols),
        old_row = json_object_expr("old", &all_cols),
    ));

    // DELETE: key and old row from `old`, no new row.
    statements.push(format!(
        "CREATE TRIGGER \"{ns}\".\"{name}\"\n\
         AFTER DELETE ON \"{table}\"\n\
         {gate}\n\
         BEGIN\n\
         \x20 INSERT INTO \"{oplog}\" (namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp)\n\
         \x20 VALUES ('{ns}', '{table}', 'DELETE', {pk}, NULL, {old_row}, NULL);\n\
         END",
        name = trigger_name("delete", relation),
        pk = json_object_expr("old", &pk_cols),
        old_row = json_object_expr("old", &all_cols),
    ));

    statements
}

/// DROP statements for one table's triggers, used alone when a table goes
/// away and as the first half of regeneration.
pub fn drop_triggers(relation: &Relation) -> Vec<String> {
    ["insert", "update", "delete"]
        .iter()
        .map(|op| {
            format!(
                "DROP TRIGGER IF EXISTS \"{}\".\"{}\"",
                relation.schema,
                trigger_name(op, relation)
            )
        })
        .collect()
}

// =============================================================================
// Installation and Gating
// =============================================================================

/// Installs (or regenerates) the capture triggers for `relation` and seeds
/// its gate row enabled.
pub fn install_for_relation(
    conn: &Connection,
    names: &TableNames,
    relation: &Relation,
) -> Result<()> {
    for sql in generate_triggers(names, relation) {
        conn.execute_batch(&sql)?;
    }
    let sql = format!(
        "INSERT OR IGNORE INTO {} (tablename, flag) VALUES (?1, 1)",
        names.triggers_qualified()
    );
    conn.execute(&sql, params![relation.qualified_tablename().key()])?;
    Ok(())
}

// =============================================================================
// Compensations
// =============================================================================

/// A single-column foreign key, as read from `pragma_foreign_key_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    /// Referencing column on the child table.
    pub column: String,
    pub parent_table: String,
    /// Referenced parent column (the parent's primary key when the FK
    /// declaration names no column).
    pub parent_key: String,
}

/// Reads the table's foreign keys. Compound keys are a hard error: there
/// are no defined compensation semantics for them.
pub fn table_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKeyRef>> {
    use std::collections::BTreeMap;

    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows: Vec<(i64, String, String, Option<String>)> = stmt
        .query_map(params![table], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut grouped: BTreeMap<i64, Vec<(String, String, Option<String>)>> = BTreeMap::new();
    for (id, parent, from, to) in rows {
        grouped.entry(id).or_default().push((parent, from, to));
    }

    let mut keys = Vec::new();
    for (_, columns) in grouped {
        if columns.len() > 1 {
            return Err(Error::Internal(format!(
                "table '{table}' has a compound foreign key; compensations are unsupported"
            )));
        }
        let (parent_table, column, to) = columns.into_iter().next().expect("non-empty group");
        let parent_key = match to {
            Some(key) => key,
            // Unnamed reference: the parent's (single-column) primary key.
            None => single_primary_key(conn, &parent_table)?,
        };
        keys.push(ForeignKeyRef {
            column,
            parent_table,
            parent_key,
        });
    }
    Ok(keys)
}

fn single_primary_key(conn: &Connection, table: &str) -> Result<String> {
    let mut stmt =
        conn.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
    let keys: Vec<String> = stmt
        .query_map(params![table], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    match keys.as_slice() {
        [key] => Ok(key.clone()),
        _ => Err(Error::Internal(format!(
            "table '{table}' needs a single-column primary key for compensations"
        ))),
    }
}

/// The DROP + CREATE statements for one foreign key's compensation
/// triggers: a child INSERT or UPDATE records a COMPENSATION touch of the
/// referenced parent row, so a concurrent remote delete of the parent is
/// observed losing to the reference.
pub fn generate_compensation_triggers(
    names: &TableNames,
    relation: &Relation,
    fk: &ForeignKeyRef,
) -> Vec<String> {
    let ns = &relation.schema;
    let child = &relation.table;
    let parent = &fk.parent_table;
    let parent_key = &fk.parent_key;
    let fk_col = &fk.column;
    let oplog = &names.oplog;

    // Gated on the PARENT's capture flag plus the global compensations
    // switch in meta. The meta value column is TEXT; compare as text.
    let gate = format!(
        "WHEN 1 = (SELECT flag FROM \"{}\" WHERE tablename = '{ns}.{parent}')\n\
         \x20AND '1' = (SELECT value FROM \"{}\" WHERE key = 'compensations')",
        names.triggers, names.meta
    );

    let mut statements = Vec::new();
    for op in ["insert", "update"] {
        let name =
            format!("compensation_{op}_{ns}_{child}_{fk_col}_into_oplog");
        statements.push(format!(
            "DROP TRIGGER IF EXISTS \"{ns}\".\"{name}\""
        ));
        statements.push(format!(
            "CREATE TRIGGER \"{ns}\".\"{name}\"\n\
             AFTER {op_upper} ON \"{child}\"\n\
             {gate}\n\
             BEGIN\n\
             \x20 INSERT INTO \"{oplog}\" (namespace, tablename, optype, \"primaryKey\", \"newRow\", \"oldRow\", timestamp)\n\
             \x20 SELECT '{ns}', '{parent}', 'COMPENSATION', json_object('{parent_key}', \"{parent_key}\"), json_object('{parent_key}', \"{parent_key}\"), NULL, NULL\n\
             \x20 FROM \"{parent}\" WHERE \"{parent_key}\" = new.\"{fk_col}\";\n\
             END",
            op_upper = op.to_uppercase(),
        ));
    }
    statements
}

/// Installs compensation triggers for every foreign key of `relation`.
/// A compound foreign key fails the installation.
pub fn install_compensation_triggers(
    conn: &Connection,
    names: &TableNames,
    relation: &Relation,
) -> Result<()> {
    for fk in table_foreign_keys(conn, &relation.table)? {
        for sql in generate_compensation_triggers(names, relation, &fk) {
            conn.execute_batch(&sql)?;
        }
    }
    Ok(())
}

/// Flips the gate flag for one table. `false` silences capture.
pub fn set_triggers_enabled(
    conn: &Connection,
    names: &TableNames,
    table_key: &str,
    enabled: bool,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (tablename, flag) VALUES (?1, ?2)\n\
         ON CONFLICT (tablename) DO UPDATE SET flag = excluded.flag",
        names.triggers_qualified()
    );
    conn.execute(&sql, params![table_key, i64::from(enabled)])?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
