// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The metadata tables that persist schema definitions, and helpers for
//! reading them back.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::error::Error;
use crate::mutation::{new_timestamp, Cell, Mutation};
use crate::objects::TableId;
use crate::rows::{ResultSet, SchemaResult, Value};
use crate::storage::SchemaStorage;

pub mod ddl;

/// The keyspace holding every metadata table.
pub const SCHEMA_KEYSPACE: &str = "system_schema";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchemaTable {
    Keyspaces,
    KeyspaceAttributes,
    Tables,
    Views,
    Columns,
    TableAttributes,
    Types,
    Functions,
    Aggregates,
    AggregateAttributes,
}

impl SchemaTable {
    pub const ALL: [SchemaTable; 10] = [
        SchemaTable::Keyspaces,
        SchemaTable::KeyspaceAttributes,
        SchemaTable::Tables,
        SchemaTable::Views,
        SchemaTable::Columns,
        SchemaTable::TableAttributes,
        SchemaTable::Types,
        SchemaTable::Functions,
        SchemaTable::Aggregates,
        SchemaTable::AggregateAttributes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SchemaTable::Keyspaces => "keyspaces",
            SchemaTable::KeyspaceAttributes => "keyspace_attributes",
            SchemaTable::Tables => "tables",
            SchemaTable::Views => "views",
            SchemaTable::Columns => "columns",
            SchemaTable::TableAttributes => "table_attributes",
            SchemaTable::Types => "types",
            SchemaTable::Functions => "functions",
            SchemaTable::Aggregates => "aggregates",
            SchemaTable::AggregateAttributes => "aggregate_attributes",
        }
    }

    /// The partition key column, shared by every metadata table.
    pub fn partition_key_column(&self) -> &'static str {
        "keyspace_name"
    }

    pub fn clustering_key_columns(&self) -> &'static [&'static str] {
        match self {
            SchemaTable::Keyspaces | SchemaTable::KeyspaceAttributes => &[],
            SchemaTable::Tables | SchemaTable::TableAttributes => &["table_name"],
            SchemaTable::Views => &["view_name"],
            SchemaTable::Columns => &["table_name", "column_name"],
            SchemaTable::Types => &["type_name"],
            SchemaTable::Functions => &["function_name", "argument_types"],
            SchemaTable::Aggregates | SchemaTable::AggregateAttributes => {
                &["aggregate_name", "argument_types"]
            }
        }
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.partition_key_column())
            .chain(self.clustering_key_columns().iter().copied())
    }

    /// Whether this table holds the definition of individual tables or views,
    /// in which case the first clustering column is the table name.
    pub fn holds_schema_mutations(&self) -> bool {
        matches!(
            self,
            SchemaTable::Tables
                | SchemaTable::Views
                | SchemaTable::Columns
                | SchemaTable::TableAttributes
        )
    }

    /// The stable identifier of this metadata table.
    pub fn id(&self) -> TableId {
        TableId::for_name(SCHEMA_KEYSPACE, self.name())
    }
}

impl fmt::Display for SchemaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEMA_KEYSPACE}.{}", self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    pub const ALL: [TableKind; 2] = [TableKind::Table, TableKind::View];

    /// The metadata table holding one row per table of this kind.
    pub fn holder(&self) -> SchemaTable {
        match self {
            TableKind::Table => SchemaTable::Tables,
            TableKind::View => SchemaTable::Views,
        }
    }

    /// The clustering column of [`Self::holder`] holding the name.
    pub fn name_column(&self) -> &'static str {
        self.holder().clustering_key_columns()[0]
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Table => f.write_str("table"),
            TableKind::View => f.write_str("view"),
        }
    }
}

/// The tables and views of one keyspace affected by a mutation batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSelector {
    /// If true, selects all existing tables in the keyspace in addition to
    /// those in `tables`.
    pub all_in_keyspace: bool,
    pub tables: BTreeMap<TableKind, BTreeSet<String>>,
}

impl TableSelector {
    pub fn add(&mut self, kind: TableKind, name: impl Into<String>) {
        self.tables.entry(kind).or_default().insert(name.into());
    }

    /// Adds `name` as both a table and a view: mutations of shared metadata
    /// tables (like `columns`) don't say which one they are for.
    pub fn add_any(&mut self, name: &str) {
        for kind in TableKind::ALL {
            self.add(kind, name);
        }
    }

    pub fn names(&self, kind: TableKind) -> impl Iterator<Item = &String> {
        self.tables.get(&kind).into_iter().flatten()
    }
}

impl AddAssign for TableSelector {
    fn add_assign(&mut self, other: TableSelector) {
        self.all_in_keyspace |= other.all_in_keyspace;
        for (kind, names) in other.tables {
            self.tables.entry(kind).or_default().extend(names);
        }
    }
}

/// Everything persisted about one table or view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SchemaMutations {
    #[serde(skip_serializing)]
    pub kind: TableKind,
    pub keyspace: String,
    pub name: String,
    pub columnfamilies: ResultSet,
    pub columns: ResultSet,
    pub attributes: ResultSet,
}

impl SchemaMutations {
    /// Returns the stable id of the table, or `None` if it has no live
    /// definition row.
    pub fn table_id(&self) -> Result<Option<TableId>, Error> {
        match self.columnfamilies.first() {
            None => Ok(None),
            Some(row) => Ok(Some(TableId(row.get_nonnull::<Uuid>("id")?))),
        }
    }
}

/// Extracts the names of tables affected by a mutation of a metadata table
/// holding schema mutations.
pub fn get_affected_tables(keyspace: &str, m: &Mutation) -> TableSelector {
    let table_name = |clustering: &[Value]| match clustering.first() {
        Some(Value::Text(name)) => Some(name.clone()),
        _ => None,
    };
    let mut result = TableSelector::default();
    if m.partition_tombstone.is_some() {
        trace!(
            "mutation of {} for keyspace {keyspace} contains a partition tombstone",
            m.table
        );
        result.all_in_keyspace = true;
    }
    for rt in &m.range_tombstones {
        match (table_name(&rt.start), table_name(&rt.end)) {
            (Some(start), Some(end)) if start == end => result.add_any(&start),
            _ => {
                trace!(
                    "mutation of {} for keyspace {keyspace} contains a multi-table range tombstone",
                    m.table
                );
                result.all_in_keyspace = true;
                break;
            }
        }
    }
    for row in &m.rows {
        if let Some(name) = table_name(&row.clustering) {
            result.add_any(&name);
        }
    }
    trace!(
        "mutation of {} for keyspace {keyspace} affects tables: {:?}, all_in_keyspace: {}",
        m.table,
        result.tables,
        result.all_in_keyspace
    );
    result
}

/// Deletes the `version` cell of `table_attributes` rows that were not
/// committed through the replicated log, forcing their version to be
/// recomputed from content after the merge.
pub fn maybe_delete_schema_version(m: &mut Mutation) {
    if m.table != SchemaTable::TableAttributes {
        return;
    }
    for row in &mut m.rows {
        let committed_by_log = matches!(
            row.cells.get("committed_by_log"),
            Some(Cell {
                value: Some(Value::Bool(true)),
                ..
            })
        );
        if committed_by_log {
            continue;
        }
        let mut timestamp = new_timestamp();
        if let Some(cell) = row.cells.get("version") {
            timestamp = std::cmp::max(timestamp, cell.timestamp);
        }
        row.cells.insert("version".into(), Cell::dead(timestamp));
    }
}

/// Reads `table` for every keyspace in `keyspaces`, omitting empty partitions.
pub async fn read_schema_for_keyspaces(
    storage: &dyn SchemaStorage,
    table: SchemaTable,
    keyspaces: &BTreeSet<String>,
) -> Result<SchemaResult, Error> {
    let mut result = SchemaResult::new();
    for keyspace in keyspaces {
        let rows = storage.read_schema_partition(table, keyspace).await?;
        if !rows.is_empty() {
            result.insert(keyspace.clone(), rows);
        }
    }
    Ok(result)
}

/// Returns the names of the live definitions of `kind` in `keyspace`.
pub async fn read_table_names_of_keyspace(
    storage: &dyn SchemaStorage,
    keyspace: &str,
    kind: TableKind,
) -> Result<Vec<String>, Error> {
    let rows = storage.read_schema_partition(kind.holder(), keyspace).await?;
    rows.rows()
        .iter()
        .map(|row| row.get_nonnull::<String>(kind.name_column()))
        .collect()
}

pub async fn read_table_mutations(
    storage: &dyn SchemaStorage,
    keyspace: &str,
    name: &str,
    kind: TableKind,
) -> Result<SchemaMutations, Error> {
    let holder = storage.read_schema_partition(kind.holder(), keyspace).await?;
    let columns = storage
        .read_schema_partition(SchemaTable::Columns, keyspace)
        .await?;
    let attributes = storage
        .read_schema_partition(SchemaTable::TableAttributes, keyspace)
        .await?;
    Ok(SchemaMutations {
        kind,
        keyspace: keyspace.into(),
        name: name.into(),
        columnfamilies: holder.filter(kind.name_column(), name),
        columns: columns.filter("table_name", name),
        attributes: attributes.filter("table_name", name),
    })
}

/// Reads the definitions of every selected table of `kind`, keyed by stable id.
pub async fn read_tables_for_keyspaces(
    storage: &dyn SchemaStorage,
    affected: &BTreeMap<String, TableSelector>,
    kind: TableKind,
) -> Result<Arc<BTreeMap<TableId, SchemaMutations>>, Error> {
    let mut result = BTreeMap::new();
    for (keyspace, selector) in affected {
        for name in selector.names(kind) {
            let mutations = read_table_mutations(storage, keyspace, name, kind).await?;
            if let Some(id) = mutations.table_id()? {
                result.insert(id, mutations);
            }
        }
    }
    Ok(Arc::new(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affected_tables_from_rows_and_tombstones() {
        let mut m = Mutation::new(SchemaTable::Columns, "ks");
        m.set_row(
            vec![Value::text("t1"), Value::text("c")],
            [("type", Some(Value::text("int")))],
            1,
        );
        m.delete_range(vec![Value::text("t2")], vec![Value::text("t2")], 1);
        let sel = get_affected_tables("ks", &m);
        assert!(!sel.all_in_keyspace);
        let tables: Vec<_> = sel.names(TableKind::Table).cloned().collect();
        assert_eq!(tables, vec!["t1".to_string(), "t2".to_string()]);
        let views: Vec<_> = sel.names(TableKind::View).cloned().collect();
        assert_eq!(views, tables);

        let mut multi = Mutation::new(SchemaTable::Columns, "ks");
        multi.delete_range(vec![Value::text("a")], vec![Value::text("b")], 1);
        assert!(get_affected_tables("ks", &multi).all_in_keyspace);

        let mut unbounded = Mutation::new(SchemaTable::Tables, "ks");
        unbounded.delete_range(vec![], vec![Value::text("b")], 1);
        assert!(get_affected_tables("ks", &unbounded).all_in_keyspace);

        let mut dropped = Mutation::new(SchemaTable::Tables, "ks");
        dropped.delete_partition(1);
        assert!(get_affected_tables("ks", &dropped).all_in_keyspace);
    }

    #[test]
    fn selectors_merge() {
        let mut a = TableSelector::default();
        a.add(TableKind::Table, "t");
        let mut b = TableSelector::default();
        b.all_in_keyspace = true;
        b.add(TableKind::View, "v");
        a += b;
        assert!(a.all_in_keyspace);
        assert_eq!(a.names(TableKind::View).count(), 1);
        assert_eq!(a.names(TableKind::Table).count(), 1);
    }

    #[test]
    fn version_deleted_unless_committed_by_log() {
        let mut m = Mutation::new(SchemaTable::TableAttributes, "ks");
        let v = Value::Uuid(Uuid::new_v4());
        m.set_row(
            vec![Value::text("local")],
            [("version", Some(v.clone()))],
            1,
        );
        m.set_row(
            vec![Value::text("replicated")],
            [
                ("version", Some(v.clone())),
                ("committed_by_log", Some(Value::Bool(true))),
            ],
            1,
        );
        maybe_delete_schema_version(&mut m);
        assert!(!m.rows[0].cells["version"].is_live());
        assert!(m.rows[0].cells["version"].timestamp > 1);
        assert_eq!(m.rows[1].cells["version"].value, Some(v));

        let mut other = Mutation::new(SchemaTable::Tables, "ks");
        other.set_row(vec![Value::text("t")], [("version", Some(Value::Int(1)))], 1);
        let before = other.clone();
        maybe_delete_schema_version(&mut other);
        assert_eq!(other, before);
    }
}
