// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Builders for the metadata mutations that create, alter and drop schema
//! objects.
//!
//! Every builder returns the mutations to announce; none of them touch
//! storage. Altering an object is expressed by creating it again with a
//! later timestamp, plus whatever deletions the new definition implies.

use crate::functions::{Aggregate, FunctionName, UserFunction};
use crate::mutation::{Mutation, Timestamp};
use crate::objects::{KeyspaceAttributes, KeyspaceMetadata, TableSchema};
use crate::rows::Value;
use crate::schema_tables::SchemaTable;
use crate::types::{ColumnType, UserType};

fn argument_types_key(arg_types: &[ColumnType]) -> Value {
    Value::text_list(arg_types.iter().map(|t| t.to_string()))
}

/// Creates `keyspace`, or replaces its definition if it already exists.
pub fn make_create_keyspace_mutations(
    keyspace: &KeyspaceMetadata,
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let mut definition = Mutation::new(SchemaTable::Keyspaces, &keyspace.name);
    definition.set_row(
        vec![],
        [
            ("durable_writes", Some(Value::Bool(keyspace.durable_writes))),
            (
                "replication",
                Some(Value::Map(keyspace.replication_options.clone())),
            ),
        ],
        timestamp,
    );

    let mut attributes = Mutation::new(SchemaTable::KeyspaceAttributes, &keyspace.name);
    if keyspace.attributes == KeyspaceAttributes::default() {
        attributes.delete_row(vec![], timestamp);
    } else {
        attributes.set_row(
            vec![],
            [
                (
                    "storage_type",
                    keyspace.attributes.storage_type.clone().map(Value::Text),
                ),
                (
                    "initial_tablets",
                    keyspace.attributes.initial_tablets.map(Value::Int),
                ),
            ],
            timestamp,
        );
    }
    vec![definition, attributes]
}

/// Drops `keyspace` together with everything defined in it.
pub fn make_drop_keyspace_mutations(keyspace: &str, timestamp: Timestamp) -> Vec<Mutation> {
    SchemaTable::ALL
        .into_iter()
        .map(|table| {
            let mut m = Mutation::new(table, keyspace);
            m.delete_partition(timestamp);
            m
        })
        .collect()
}

fn add_columns(columns: &mut Mutation, table: &TableSchema, timestamp: Timestamp) {
    for column in &table.columns {
        columns.set_row(
            vec![Value::text(&table.name), Value::text(&column.name)],
            [
                ("kind", Some(Value::text(column.kind.as_str()))),
                ("position", Some(Value::Int(column.position))),
                ("type", Some(Value::Text(column.ty.to_string()))),
            ],
            timestamp,
        );
    }
}

/// Creates the table or view `table`. The stored version is kept only if
/// the mutations are committed through the replicated log.
pub fn make_create_table_mutations(table: &TableSchema, timestamp: Timestamp) -> Vec<Mutation> {
    let key = vec![Value::text(&table.name)];
    let definition = match &table.view {
        None => {
            let mut m = Mutation::new(SchemaTable::Tables, &table.keyspace);
            m.set_row(
                key.clone(),
                [
                    ("id", Some(Value::Uuid(table.id.0))),
                    ("comment", table.comment.clone().map(Value::Text)),
                ],
                timestamp,
            );
            m
        }
        Some(view) => {
            let mut m = Mutation::new(SchemaTable::Views, &table.keyspace);
            m.set_row(
                key.clone(),
                [
                    ("id", Some(Value::Uuid(table.id.0))),
                    ("base_table_id", Some(Value::Uuid(view.base_id.0))),
                    ("base_table_name", Some(Value::text(&view.base_name))),
                    (
                        "include_all_columns",
                        Some(Value::Bool(view.include_all_columns)),
                    ),
                    ("where_clause", Some(Value::text(&view.where_clause))),
                ],
                timestamp,
            );
            m
        }
    };

    let mut columns = Mutation::new(SchemaTable::Columns, &table.keyspace);
    add_columns(&mut columns, table, timestamp);

    let mut attributes = Mutation::new(SchemaTable::TableAttributes, &table.keyspace);
    attributes.set_row(
        key,
        [("version", Some(Value::Uuid(table.version.0)))],
        timestamp,
    );
    vec![definition, columns, attributes]
}

/// Replaces the definition of `old` with `new`, removing the columns `new`
/// no longer has.
pub fn make_update_table_mutations(
    old: &TableSchema,
    new: &TableSchema,
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let mut mutations = make_create_table_mutations(new, timestamp);
    let removed = old
        .columns
        .iter()
        .filter(|c| new.column(&c.name).is_none())
        .map(|c| vec![Value::text(&old.name), Value::text(&c.name)])
        .collect::<Vec<_>>();
    if !removed.is_empty() {
        let mut columns = Mutation::new(SchemaTable::Columns, &old.keyspace);
        for key in removed {
            columns.delete_row(key, timestamp);
        }
        mutations.push(columns);
    }
    mutations
}

fn drop_definition(
    holder: SchemaTable,
    keyspace: &str,
    name: &str,
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let key = vec![Value::text(name)];
    let mut definition = Mutation::new(holder, keyspace);
    definition.delete_row(key.clone(), timestamp);
    let mut columns = Mutation::new(SchemaTable::Columns, keyspace);
    columns.delete_range(key.clone(), key.clone(), timestamp);
    let mut attributes = Mutation::new(SchemaTable::TableAttributes, keyspace);
    attributes.delete_row(key, timestamp);
    vec![definition, columns, attributes]
}

pub fn make_drop_table_mutations(
    keyspace: &str,
    name: &str,
    timestamp: Timestamp,
) -> Vec<Mutation> {
    drop_definition(SchemaTable::Tables, keyspace, name, timestamp)
}

pub fn make_drop_view_mutations(keyspace: &str, name: &str, timestamp: Timestamp) -> Vec<Mutation> {
    drop_definition(SchemaTable::Views, keyspace, name, timestamp)
}

pub fn make_create_type_mutations(ty: &UserType, timestamp: Timestamp) -> Vec<Mutation> {
    let mut m = Mutation::new(SchemaTable::Types, &ty.keyspace);
    m.set_row(
        vec![Value::text(&ty.name)],
        [
            ("field_names", Some(Value::text_list(ty.field_names.iter().cloned()))),
            (
                "field_types",
                Some(Value::text_list(ty.field_types.iter().map(|t| t.to_string()))),
            ),
        ],
        timestamp,
    );
    vec![m]
}

pub fn make_drop_type_mutations(keyspace: &str, name: &str, timestamp: Timestamp) -> Vec<Mutation> {
    let mut m = Mutation::new(SchemaTable::Types, keyspace);
    m.delete_row(vec![Value::text(name)], timestamp);
    vec![m]
}

pub fn make_create_function_mutations(f: &UserFunction, timestamp: Timestamp) -> Vec<Mutation> {
    let mut m = Mutation::new(SchemaTable::Functions, &f.name.keyspace);
    m.set_row(
        vec![Value::text(&f.name.name), argument_types_key(&f.arg_types)],
        [
            ("argument_names", Some(Value::text_list(f.arg_names.iter().cloned()))),
            ("return_type", Some(Value::Text(f.return_type.to_string()))),
            ("language", Some(Value::text(&f.language))),
            ("body", Some(Value::text(&f.body))),
            (
                "called_on_null_input",
                Some(Value::Bool(f.called_on_null_input)),
            ),
        ],
        timestamp,
    );
    vec![m]
}

pub fn make_drop_function_mutations(
    name: &FunctionName,
    arg_types: &[ColumnType],
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let mut m = Mutation::new(SchemaTable::Functions, &name.keyspace);
    m.delete_row(
        vec![Value::text(&name.name), argument_types_key(arg_types)],
        timestamp,
    );
    vec![m]
}

/// Creates `aggregate`. Aggregates with a reduce function also get a row in
/// `aggregate_attributes`.
pub fn make_create_aggregate_mutations(
    aggregate: &Aggregate,
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let key = vec![
        Value::text(&aggregate.name.name),
        argument_types_key(&aggregate.arg_types),
    ];
    let mut definition = Mutation::new(SchemaTable::Aggregates, &aggregate.name.keyspace);
    definition.set_row(
        key.clone(),
        [
            ("state_type", Some(Value::Text(aggregate.state_type.to_string()))),
            (
                "state_func",
                Some(Value::text(&aggregate.state_func.name.name)),
            ),
            (
                "final_func",
                aggregate
                    .final_func
                    .as_ref()
                    .map(|f| Value::text(&f.name.name)),
            ),
            ("initcond", aggregate.initcond.clone().map(Value::Text)),
        ],
        timestamp,
    );
    let mut mutations = vec![definition];
    if let Some(reduce) = &aggregate.reduce_func {
        let mut attributes =
            Mutation::new(SchemaTable::AggregateAttributes, &aggregate.name.keyspace);
        attributes.set_row(
            key,
            [("reduce_func", Some(Value::text(&reduce.name.name)))],
            timestamp,
        );
        mutations.push(attributes);
    }
    mutations
}

pub fn make_drop_aggregate_mutations(
    name: &FunctionName,
    arg_types: &[ColumnType],
    timestamp: Timestamp,
) -> Vec<Mutation> {
    let key = vec![Value::text(&name.name), argument_types_key(arg_types)];
    [SchemaTable::Aggregates, SchemaTable::AggregateAttributes]
        .into_iter()
        .map(|table| {
            let mut m = Mutation::new(table, &name.keyspace);
            m.delete_row(key.clone(), timestamp);
            m
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::objects::ReplicationStrategy;
    use crate::schema_tables::{get_affected_tables, TableKind};

    #[test]
    fn default_keyspace_attributes_are_deleted() {
        let mut ks = KeyspaceMetadata {
            name: "ks".into(),
            durable_writes: true,
            replication: ReplicationStrategy::Everywhere,
            replication_options: BTreeMap::new(),
            attributes: KeyspaceAttributes::default(),
        };
        let ms = make_create_keyspace_mutations(&ks, 10);
        assert_eq!(ms[1].rows[0].tombstone, Some(10));

        ks.attributes.storage_type = Some("s3".into());
        let ms = make_create_keyspace_mutations(&ks, 11);
        assert_eq!(ms[1].rows[0].tombstone, None);
        assert_eq!(
            ms[1].rows[0].cells["storage_type"].value,
            Some(Value::text("s3"))
        );
        assert!(!ms[1].rows[0].cells["initial_tablets"].is_live());
    }

    #[test]
    fn dropped_definitions_are_visible_as_affected_tables() {
        for m in make_drop_view_mutations("ks", "v", 1) {
            let selector = get_affected_tables("ks", &m);
            assert!(!selector.all_in_keyspace);
            assert_eq!(selector.names(TableKind::View).collect::<Vec<_>>(), ["v"]);
        }
        for m in make_drop_keyspace_mutations("ks", 1) {
            assert!(get_affected_tables("ks", &m).all_in_keyspace);
        }
    }
}
