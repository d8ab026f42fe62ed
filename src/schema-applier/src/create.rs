// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Construction of runtime objects from metadata rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use itertools::Itertools;
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::functions::{Aggregate, ChangeBatch, FunctionName, UserFunction};
use crate::objects::{
    BaseDependentViewInfo, ColumnDefinition, ColumnKind, KeyspaceAttributes, KeyspaceMetadata,
    ReplicationStrategy, SchemaVersion, TableId, TableSchema, ViewInfo,
};
use crate::rows::{ResultSet, Row};
use crate::schema_tables::SchemaMutations;
use crate::types::{ColumnType, UserType, UserTypeLookup};

/// Namespace of content-derived table versions.
const TABLE_VERSION_NAMESPACE: Uuid = Uuid::from_u128(0x8a5e_1f0c_61d2_4c8e_9a3b_27d4_e1f6_0b59);

pub fn create_keyspace_metadata(
    name: &str,
    keyspace: &ResultSet,
    attributes: Option<&ResultSet>,
) -> Result<KeyspaceMetadata, Error> {
    let row = keyspace
        .first()
        .ok_or_else(|| Error::new(ErrorKind::NoSuchKeyspace(name.into())))?;
    let replication_options = row.get_nonnull::<BTreeMap<String, String>>("replication")?;
    let replication = ReplicationStrategy::from_options(name, &replication_options)?;
    let attributes = match attributes.and_then(|rs| rs.first()) {
        Some(row) => KeyspaceAttributes {
            storage_type: row.get("storage_type")?,
            initial_tablets: row.get("initial_tablets")?,
        },
        None => KeyspaceAttributes::default(),
    };
    Ok(KeyspaceMetadata {
        name: name.into(),
        durable_writes: row.get("durable_writes")?.unwrap_or(true),
        replication,
        replication_options,
        attributes,
    })
}

struct PendingType<'a> {
    index: usize,
    keyspace: String,
    name: String,
    row: &'a Row,
}

/// Builds the user types described by `rows`.
///
/// A type may refer to other types of the same batch, in any order; those
/// shadow the types known to `lookup`. Returns the types in row order.
pub fn create_types(
    rows: &[Row],
    lookup: &dyn UserTypeLookup,
) -> Result<Vec<Arc<UserType>>, Error> {
    let mut pending = rows
        .iter()
        .enumerate()
        .map(|(index, row)| -> Result<PendingType<'_>, Error> {
            Ok(PendingType {
                index,
                keyspace: row.get_nonnull("keyspace_name")?,
                name: row.get_nonnull("type_name")?,
                row,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut built: BTreeMap<(String, String), Arc<UserType>> = BTreeMap::new();
    let mut result = vec![None; rows.len()];

    while !pending.is_empty() {
        let attempted = pending.len();
        let mut unresolved = Vec::new();
        let mut last_error = None;
        for p in pending {
            let resolve = |name: &str| {
                built
                    .get(&(p.keyspace.clone(), name.to_string()))
                    .cloned()
                    .or_else(|| lookup.user_types(&p.keyspace).get(name).cloned())
            };
            let field_types = p
                .row
                .get_nonnull::<Vec<String>>("field_types")?
                .iter()
                .map(|text| ColumnType::parse(text, &resolve))
                .collect::<Result<Vec<_>, _>>();
            match field_types {
                Ok(field_types) => {
                    let ty = Arc::new(UserType {
                        keyspace: p.keyspace.clone(),
                        name: p.name.clone(),
                        field_names: p.row.get_nonnull("field_names")?,
                        field_types,
                    });
                    trace!("created user type {ty}");
                    built.insert((p.keyspace, p.name), Arc::clone(&ty));
                    result[p.index] = Some(ty);
                }
                // May refer to a type later in the batch.
                Err(e) if matches!(e.kind(), ErrorKind::UnknownType(_)) => {
                    last_error = Some(e);
                    unresolved.push(p);
                }
                Err(e) => return Err(e),
            }
        }
        if unresolved.len() == attempted {
            return Err(last_error.unwrap_or_else(|| Error::internal("unresolved user types")));
        }
        pending = unresolved;
    }
    Ok(result.into_iter().flatten().collect())
}

fn read_columns(
    sm: &SchemaMutations,
    lookup: &dyn UserTypeLookup,
) -> Result<Vec<ColumnDefinition>, Error> {
    let columns = sm
        .columns
        .rows()
        .iter()
        .map(|row| -> Result<ColumnDefinition, Error> {
            Ok(ColumnDefinition {
                name: row.get_nonnull("column_name")?,
                kind: row.get_nonnull::<String>("kind")?.parse()?,
                position: row.get("position")?.unwrap_or(-1),
                ty: ColumnType::parse_in(
                    &row.get_nonnull::<String>("type")?,
                    &sm.keyspace,
                    lookup,
                )?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns
        .into_iter()
        .sorted_by(|a, b| (a.kind, a.position, &a.name).cmp(&(b.kind, b.position, &b.name)))
        .collect())
}

/// Returns the version stored with the table, or a digest of its definition.
fn table_version(sm: &SchemaMutations) -> Result<SchemaVersion, Error> {
    let stored = match sm.attributes.first() {
        Some(row) => row.get::<Uuid>("version")?,
        None => None,
    };
    if let Some(version) = stored {
        return Ok(SchemaVersion(version));
    }
    Ok(SchemaVersion::digest(
        &TABLE_VERSION_NAMESPACE,
        &serde_json::to_vec(sm)?,
    ))
}

fn definition_row<'a>(sm: &'a SchemaMutations) -> Result<&'a Row, Error> {
    sm.columnfamilies.first().ok_or_else(|| {
        Error::new(ErrorKind::NoSuchTable {
            keyspace: sm.keyspace.clone(),
            name: sm.name.clone(),
        })
    })
}

pub fn create_table_from_mutations(
    sm: &SchemaMutations,
    lookup: &dyn UserTypeLookup,
) -> Result<TableSchema, Error> {
    let row = definition_row(sm)?;
    Ok(TableSchema {
        id: TableId(row.get_nonnull("id")?),
        keyspace: sm.keyspace.clone(),
        name: sm.name.clone(),
        version: table_version(sm)?,
        columns: read_columns(sm, lookup)?,
        comment: row.get("comment")?,
        view: None,
    })
}

/// Builds a view without its base-dependent parts, which are filled in once
/// the base table is resolved.
pub fn create_view_from_mutations(
    sm: &SchemaMutations,
    lookup: &dyn UserTypeLookup,
) -> Result<TableSchema, Error> {
    let row = definition_row(sm)?;
    Ok(TableSchema {
        id: TableId(row.get_nonnull("id")?),
        keyspace: sm.keyspace.clone(),
        name: sm.name.clone(),
        version: table_version(sm)?,
        columns: read_columns(sm, lookup)?,
        comment: None,
        view: Some(ViewInfo {
            base_id: TableId(row.get_nonnull("base_table_id")?),
            base_name: row.get_nonnull("base_table_name")?,
            include_all_columns: row.get("include_all_columns")?.unwrap_or(false),
            where_clause: row.get("where_clause")?.unwrap_or_default(),
            base_info: None,
        }),
    })
}

/// Verifies that `view` can be served from `base`, rejecting views left
/// behind by an incompatible earlier definition of the base.
pub fn check_view_compatible(view: &TableSchema, base: &TableSchema) -> Result<(), Error> {
    let incompatible = |detail: String| {
        Error::new(ErrorKind::IncompatibleView {
            keyspace: view.keyspace.clone(),
            view: view.name.clone(),
            base: base.name.clone(),
            detail,
        })
    };
    let Some(info) = &view.view else {
        return Err(incompatible("not a view".into()));
    };
    if base.is_view() {
        return Err(incompatible("base is itself a view".into()));
    }
    if info.base_id != base.id {
        return Err(incompatible(format!(
            "view was defined on base id {} but the base has id {}",
            info.base_id, base.id
        )));
    }
    for column in &view.columns {
        match base.column(&column.name) {
            None => {
                return Err(incompatible(format!(
                    "column '{}' does not exist in the base",
                    column.name
                )))
            }
            Some(base_column) if base_column.ty != column.ty => {
                return Err(incompatible(format!(
                    "column '{}' has type {} but {} in the base",
                    column.name, column.ty, base_column.ty
                )))
            }
            Some(_) => {}
        }
    }
    for base_column in base.primary_key_columns() {
        let in_view_pk = view
            .column(&base_column.name)
            .is_some_and(|c| c.kind.is_primary_key());
        if !in_view_pk {
            return Err(incompatible(format!(
                "base primary key column '{}' is missing from the view's primary key",
                base_column.name
            )));
        }
    }
    Ok(())
}

pub fn make_base_dependent_view_info(
    view: &TableSchema,
    base: &TableSchema,
) -> BaseDependentViewInfo {
    BaseDependentViewInfo {
        base_version: base.version,
        base_regular_columns_in_view_pk: view
            .primary_key_columns()
            .filter(|c| {
                base.column(&c.name)
                    .is_some_and(|b| b.kind == ColumnKind::Regular)
            })
            .map(|c| c.name.clone())
            .collect(),
    }
}

/// Reads the argument types of a function or aggregate row.
pub fn read_arg_types(
    row: &Row,
    keyspace: &str,
    lookup: &dyn UserTypeLookup,
) -> Result<Vec<ColumnType>, Error> {
    row.get_nonnull::<Vec<String>>("argument_types")?
        .iter()
        .map(|text| ColumnType::parse_in(text, keyspace, lookup))
        .collect()
}

pub fn function_name(row: &Row, name_column: &str) -> Result<FunctionName, Error> {
    Ok(FunctionName::new(
        row.get_nonnull::<String>("keyspace_name")?,
        row.get_nonnull::<String>(name_column)?,
    ))
}

pub fn create_func(row: &Row, lookup: &dyn UserTypeLookup) -> Result<UserFunction, Error> {
    let name = function_name(row, "function_name")?;
    let arg_types = read_arg_types(row, &name.keyspace, lookup)?;
    Ok(UserFunction {
        return_type: ColumnType::parse_in(
            &row.get_nonnull::<String>("return_type")?,
            &name.keyspace,
            lookup,
        )?,
        arg_names: row.get_nonnull("argument_names")?,
        language: row.get_nonnull("language")?,
        body: row.get_nonnull("body")?,
        called_on_null_input: row.get("called_on_null_input")?.unwrap_or(false),
        arg_types,
        name,
    })
}

/// Builds an aggregate from its definition row and optional attribute row,
/// resolving its functions among those staged in `batch`.
pub fn create_aggregate(
    row: &Row,
    attributes: Option<&Row>,
    batch: &ChangeBatch,
    lookup: &dyn UserTypeLookup,
) -> Result<Aggregate, Error> {
    let name = function_name(row, "aggregate_name")?;
    let arg_types = read_arg_types(row, &name.keyspace, lookup)?;
    let state_type = ColumnType::parse_in(
        &row.get_nonnull::<String>("state_type")?,
        &name.keyspace,
        lookup,
    )?;
    let find = |func: String, args: Vec<ColumnType>| {
        let func = FunctionName::new(name.keyspace.clone(), func);
        batch.find_scalar(&func, &args).ok_or_else(|| {
            Error::new(ErrorKind::NoSuchFunction(format!(
                "{func}({})",
                args.iter().join(", ")
            )))
        })
    };

    let state_args = std::iter::once(state_type.clone())
        .chain(arg_types.iter().cloned())
        .collect();
    let state_func = find(row.get_nonnull("state_func")?, state_args)?;
    let final_func = row
        .get::<String>("final_func")?
        .map(|f| find(f, vec![state_type.clone()]))
        .transpose()?;
    let reduce_func = attributes
        .map(|attrs| attrs.get::<String>("reduce_func"))
        .transpose()?
        .flatten()
        .map(|f| find(f, vec![state_type.clone(), state_type.clone()]))
        .transpose()?;
    let return_type = match &final_func {
        Some(f) => f.return_type.clone(),
        None => state_type.clone(),
    };
    Ok(Aggregate {
        initcond: row.get("initcond")?,
        arg_types,
        state_type,
        return_type,
        state_func,
        final_func,
        reduce_func,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{FunctionObject, FunctionRegistry};
    use crate::rows::Value;
    use crate::types::{NativeType, UserTypes, EMPTY_USER_TYPES};

    #[derive(Default)]
    struct Types(BTreeMap<String, UserTypes>);

    impl UserTypeLookup for Types {
        fn user_types(&self, keyspace: &str) -> &UserTypes {
            self.0.get(keyspace).unwrap_or(&EMPTY_USER_TYPES)
        }
    }

    fn row(cells: Vec<(&str, Value)>) -> Row {
        Row::new(cells.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    fn type_row(name: &str, fields: &[(&str, &str)]) -> Row {
        row(vec![
            ("keyspace_name", Value::text("ks")),
            ("type_name", Value::text(name)),
            ("field_names", Value::text_list(fields.iter().map(|f| f.0))),
            ("field_types", Value::text_list(fields.iter().map(|f| f.1))),
        ])
    }

    fn int() -> ColumnType {
        ColumnType::Native(NativeType::Int)
    }

    #[test]
    fn types_may_reference_later_types_of_the_batch() {
        let rows = vec![
            type_row("person", &[("home", "frozen<address>")]),
            type_row("address", &[("street", "text")]),
        ];
        let types = create_types(&rows, &Types::default()).unwrap();
        assert_eq!(types[0].name, "person");
        assert_eq!(types[1].name, "address");
        assert_eq!(
            types[0].field_types[0],
            ColumnType::Frozen(Box::new(ColumnType::User(Arc::clone(&types[1]))))
        );

        let err =
            create_types(&[type_row("t", &[("f", "missing")])], &Types::default()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownType(name) if name == "missing"));
    }

    #[test]
    fn batch_types_shadow_known_ones() {
        let mut known = UserTypes::new();
        known.add(Arc::new(UserType {
            keyspace: "ks".into(),
            name: "address".into(),
            field_names: vec!["street".into()],
            field_types: vec![int()],
        }));
        let lookup = Types([("ks".to_string(), known)].into());
        let rows = vec![
            type_row("person", &[("home", "frozen<address>")]),
            type_row("address", &[("street", "text"), ("zip", "int")]),
        ];
        let types = create_types(&rows, &lookup).unwrap();
        let ColumnType::Frozen(inner) = &types[0].field_types[0] else {
            panic!("unexpected type {}", types[0].field_types[0]);
        };
        assert_eq!(**inner, ColumnType::User(Arc::clone(&types[1])));
    }

    fn column(name: &str, kind: ColumnKind, ty: ColumnType) -> ColumnDefinition {
        ColumnDefinition {
            name: name.into(),
            kind,
            position: 0,
            ty,
        }
    }

    fn table(id: TableId, columns: Vec<ColumnDefinition>, view: Option<ViewInfo>) -> TableSchema {
        TableSchema {
            id,
            keyspace: "ks".into(),
            name: if view.is_some() { "v" } else { "t" }.into(),
            version: SchemaVersion(Uuid::new_v4()),
            columns,
            comment: None,
            view,
        }
    }

    #[test]
    fn view_compatibility() {
        let base_id = TableId::random();
        let base = table(
            base_id,
            vec![
                column("pk", ColumnKind::PartitionKey, int()),
                column("v", ColumnKind::Regular, int()),
            ],
            None,
        );
        let info = ViewInfo {
            base_id,
            base_name: "t".into(),
            include_all_columns: false,
            where_clause: "v IS NOT NULL".into(),
            base_info: None,
        };
        let view = table(
            TableId::random(),
            vec![
                column("v", ColumnKind::PartitionKey, int()),
                column("pk", ColumnKind::Clustering, int()),
            ],
            Some(info.clone()),
        );
        check_view_compatible(&view, &base).unwrap();
        assert_eq!(
            make_base_dependent_view_info(&view, &base).base_regular_columns_in_view_pk,
            vec!["v".to_string()]
        );

        let stale = table(
            TableId::random(),
            view.columns.clone(),
            Some(ViewInfo {
                base_id: TableId::random(),
                ..info.clone()
            }),
        );
        let missing_pk = table(
            TableId::random(),
            vec![column("v", ColumnKind::PartitionKey, int())],
            Some(info),
        );
        for bad in [stale, missing_pk] {
            assert!(matches!(
                check_view_compatible(&bad, &base).unwrap_err().kind(),
                ErrorKind::IncompatibleView { .. }
            ));
        }
    }

    fn function_row(name: &str, args: &[&str], return_type: &str) -> Row {
        row(vec![
            ("keyspace_name", Value::text("ks")),
            ("function_name", Value::text(name)),
            ("argument_types", Value::text_list(args.iter().copied())),
            ("argument_names", Value::text_list((0..args.len()).map(|i| format!("a{i}")))),
            ("body", Value::text("return a0;")),
            ("language", Value::text("lua")),
            ("return_type", Value::text(return_type)),
        ])
    }

    #[test]
    fn aggregates_with_and_without_attributes() {
        let lookup = Types::default();
        let mut batch = ChangeBatch::new(&FunctionRegistry::default());
        for (name, args) in [("acc", &["int", "int"][..]), ("fin", &["int"][..])] {
            let f = create_func(&function_row(name, args, "int"), &lookup).unwrap();
            batch.add_function(FunctionObject::Scalar(Arc::new(f)));
        }
        let aggregate = row(vec![
            ("keyspace_name", Value::text("ks")),
            ("aggregate_name", Value::text("total")),
            ("argument_types", Value::text_list(["int"])),
            ("state_type", Value::text("int")),
            ("state_func", Value::text("acc")),
            ("final_func", Value::text("fin")),
            ("initcond", Value::text("0")),
        ]);

        let plain = create_aggregate(&aggregate, None, &batch, &lookup).unwrap();
        assert_eq!(plain.state_func.name.name, "acc");
        assert_eq!(plain.final_func.as_ref().map(|f| f.name.name.as_str()), Some("fin"));
        assert!(plain.reduce_func.is_none());
        assert_eq!(plain.initcond.as_deref(), Some("0"));

        let attributes = row(vec![("reduce_func", Value::text("acc"))]);
        let reducible = create_aggregate(&aggregate, Some(&attributes), &batch, &lookup).unwrap();
        assert_eq!(reducible.reduce_func.map(|f| f.name.name.clone()), Some("acc".into()));

        let unknown = row(vec![("reduce_func", Value::text("nope"))]);
        assert!(matches!(
            create_aggregate(&aggregate, Some(&unknown), &batch, &lookup).unwrap_err().kind(),
            ErrorKind::NoSuchFunction(_)
        ));
    }
}
