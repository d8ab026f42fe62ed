// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Entity mergers.
//!
//! Each merger compares the before and after snapshots of its metadata tables
//! and builds the runtime objects the commit will publish. Mergers never
//! modify a catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::applier::in_progress_types::{InProgressTypes, TypeOverlay};
use crate::catalog::Catalog;
use crate::create::{
    check_view_compatible, create_aggregate, create_func, create_keyspace_metadata,
    create_table_from_mutations, create_types, create_view_from_mutations, function_name,
    make_base_dependent_view_info, read_arg_types,
};
use crate::diff::{difference, diff_rows, indirect_equal, RowDiff};
use crate::error::{Error, ErrorKind};
use crate::functions::{ChangeBatch, FunctionObject, FunctionSignature};
use crate::objects::{KeyspaceMetadata, TableId, TableSchema};
use crate::rows::{Row, SchemaResult, Value};
use crate::schema_tables::{
    read_schema_for_keyspaces, read_tables_for_keyspaces, SchemaMutations, SchemaTable,
    TableKind, TableSelector,
};
use crate::shard::Shard;
use crate::storage::SchemaStorage;
use crate::types::{UserType, UserTypeLookup};

/// The metadata rows of the keyspaces and tables a merge touches.
#[derive(Debug, Default)]
pub struct SchemaPersistedState {
    pub keyspaces: SchemaResult,
    pub keyspace_attributes: SchemaResult,
    pub types: SchemaResult,
    pub tables: Arc<BTreeMap<TableId, SchemaMutations>>,
    pub views: Arc<BTreeMap<TableId, SchemaMutations>>,
    pub functions: SchemaResult,
    pub aggregates: SchemaResult,
    pub aggregate_attributes: SchemaResult,
}

pub async fn read_schema_state(
    storage: &dyn SchemaStorage,
    keyspaces: &BTreeSet<String>,
    tables: &BTreeMap<String, TableSelector>,
) -> Result<SchemaPersistedState, Error> {
    Ok(SchemaPersistedState {
        keyspaces: read_schema_for_keyspaces(storage, SchemaTable::Keyspaces, keyspaces).await?,
        keyspace_attributes: read_schema_for_keyspaces(
            storage,
            SchemaTable::KeyspaceAttributes,
            keyspaces,
        )
        .await?,
        types: read_schema_for_keyspaces(storage, SchemaTable::Types, keyspaces).await?,
        tables: read_tables_for_keyspaces(storage, tables, TableKind::Table).await?,
        views: read_tables_for_keyspaces(storage, tables, TableKind::View).await?,
        functions: read_schema_for_keyspaces(storage, SchemaTable::Functions, keyspaces).await?,
        aggregates: read_schema_for_keyspaces(storage, SchemaTable::Aggregates, keyspaces).await?,
        aggregate_attributes: read_schema_for_keyspaces(
            storage,
            SchemaTable::AggregateAttributes,
            keyspaces,
        )
        .await?,
    })
}

#[derive(Clone, Debug, Default)]
pub struct AffectedKeyspaces {
    pub created: Vec<Arc<KeyspaceMetadata>>,
    pub altered: Vec<Arc<KeyspaceMetadata>>,
    pub dropped: BTreeSet<String>,
}

impl AffectedKeyspaces {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }

    pub fn created_names(&self) -> BTreeSet<String> {
        self.created.iter().map(|ks| ks.name.clone()).collect()
    }
}

/// Diffs keyspaces by their definition row and their attribute row. A change
/// of attributes alone surfaces as an alter.
pub fn merge_keyspaces(
    before: &SchemaPersistedState,
    after: &SchemaPersistedState,
) -> Result<AffectedKeyspaces, Error> {
    let definitions = difference(&before.keyspaces, &after.keyspaces, indirect_equal);
    let attributes = difference(
        &before.keyspace_attributes,
        &after.keyspace_attributes,
        indirect_equal,
    );

    let metadata = |name: &String| -> Result<Arc<KeyspaceMetadata>, Error> {
        let keyspace = after
            .keyspaces
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchKeyspace(name.clone())))?;
        Ok(Arc::new(create_keyspace_metadata(
            name,
            keyspace,
            after.keyspace_attributes.get(name).map(|rs| &**rs),
        )?))
    };

    let mut result = AffectedKeyspaces::default();
    for name in &definitions.entries_only_on_right {
        info!("creating keyspace {name}");
        result.created.push(metadata(name)?);
    }
    let altered: BTreeSet<&String> = definitions
        .entries_differing
        .iter()
        .chain(&attributes.entries_only_on_left)
        .chain(&attributes.entries_only_on_right)
        .chain(&attributes.entries_differing)
        .filter(|name| {
            !definitions.entries_only_on_right.contains(*name)
                && !definitions.entries_only_on_left.contains(*name)
                && after.keyspaces.contains_key(*name)
        })
        .collect();
    for name in altered {
        info!("altering keyspace {name}");
        result.altered.push(metadata(name)?);
    }
    for name in &definitions.entries_only_on_left {
        info!("dropping keyspace {name}");
        result.dropped.insert(name.clone());
    }
    Ok(result)
}

#[derive(Clone, Debug, Default)]
pub struct AffectedUserTypes {
    pub created: Vec<Arc<UserType>>,
    pub altered: Vec<Arc<UserType>>,
    pub dropped: Vec<Arc<UserType>>,
}

impl AffectedUserTypes {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

/// Builds the user type changes of `diff` against one shard's catalog.
pub fn merge_types(catalog: &Catalog, diff: &RowDiff) -> Result<AffectedUserTypes, Error> {
    let rows = diff
        .created
        .iter()
        .chain(&diff.altered)
        .cloned()
        .collect::<Vec<_>>();
    let mut created = create_types(&rows, catalog)?;
    let altered = created.split_off(diff.created.len());

    let mut dropped = Vec::new();
    for row in &diff.dropped {
        let keyspace = row.get_nonnull::<String>("keyspace_name")?;
        let name = row.get_nonnull::<String>("type_name")?;
        match catalog.user_types(&keyspace).get(&name) {
            Some(ty) => dropped.push(Arc::clone(ty)),
            None => warn!("dropped user type {keyspace}.{name} is not in the catalog"),
        }
    }
    Ok(AffectedUserTypes {
        created,
        altered,
        dropped,
    })
}

/// Merges user types on one shard and stages them for the table and view
/// mergers.
pub fn merge_types_on_shard(
    shard: &Shard,
    diff: &RowDiff,
    created_keyspaces: &BTreeSet<String>,
    dropped_keyspaces: &BTreeSet<String>,
) -> Result<Arc<AffectedUserTypes>, Error> {
    let (types, staged) = {
        let catalog = shard.catalog();
        let types = merge_types(&catalog, diff)?;
        let staged = InProgressTypes::new(&catalog, created_keyspaces, dropped_keyspaces, &types);
        (types, staged)
    };
    shard.set_in_progress_types(Some(staged));
    Ok(Arc::new(types))
}

#[derive(Clone, Debug)]
pub struct AlteredSchema {
    pub old: Arc<TableSchema>,
    pub new: Arc<TableSchema>,
    pub columns_changed: bool,
}

impl AlteredSchema {
    fn new(old: Arc<TableSchema>, new: Arc<TableSchema>) -> AlteredSchema {
        let columns_changed = old.columns != new.columns;
        AlteredSchema {
            old,
            new,
            columns_changed,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaDiff {
    pub created: Vec<Arc<TableSchema>>,
    pub altered: Vec<AlteredSchema>,
    pub dropped: Vec<Arc<TableSchema>>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct AffectedTablesAndViews {
    pub tables: SchemaDiff,
    pub views: SchemaDiff,
}

impl AffectedTablesAndViews {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.views.is_empty()
    }
}

/// Which version of an altered table a view must be built against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Old,
    New,
}

/// Yields to the shard's scheduler every `interval` calls to [`Self::tick`].
struct Yielder {
    interval: usize,
    count: usize,
}

impl Yielder {
    fn new(interval: usize) -> Yielder {
        Yielder {
            interval: interval.max(1),
            count: 0,
        }
    }

    async fn tick(&mut self) {
        self.count += 1;
        if self.count % self.interval == 0 {
            tokio::task::yield_now().await;
        }
    }
}

/// Builds a table or view from its metadata rows, resolving user types
/// through `lookup`.
fn build(
    kind: TableKind,
    sm: &SchemaMutations,
    lookup: &dyn UserTypeLookup,
) -> Result<TableSchema, Error> {
    match kind {
        TableKind::Table => create_table_from_mutations(sm, lookup),
        TableKind::View => create_view_from_mutations(sm, lookup),
    }
}

/// Builds one version of a table or view. Old versions only ever refer to
/// committed user types; new versions see the staged ones.
fn build_on(
    shard: &Shard,
    kind: TableKind,
    sm: &SchemaMutations,
    side: Side,
) -> Result<TableSchema, Error> {
    let catalog = shard.catalog();
    let staged = shard.in_progress_types();
    let overlay = TypeOverlay {
        staged: match side {
            Side::Old => None,
            Side::New => staged.as_ref(),
        },
        catalog: &catalog,
    };
    build(kind, sm, &overlay)
}

/// Finds the base table of `view`: among the altered tables of this batch
/// (picking the version matching `side`), then among the created ones, and
/// finally in the committed catalog.
fn resolve_base(
    view: &TableSchema,
    side: Side,
    tables: &SchemaDiff,
    catalog: &Catalog,
) -> Result<Arc<TableSchema>, Error> {
    let Some(info) = &view.view else {
        return Err(Error::internal(format!("{view} is not a view")));
    };
    let matches = |t: &Arc<TableSchema>| t.keyspace == view.keyspace && t.name == info.base_name;
    if let Some(altered) = tables.altered.iter().find(|a| matches(&a.new)) {
        return Ok(match side {
            Side::Old => Arc::clone(&altered.old),
            Side::New => Arc::clone(&altered.new),
        });
    }
    if let Some(created) = tables.created.iter().find(|t| matches(*t)) {
        return Ok(Arc::clone(created));
    }
    if let Ok(base) = catalog.find_schema(&view.keyspace, &info.base_name) {
        return Ok(Arc::clone(base));
    }
    error!(
        "base table {}.{} of view {} not found",
        view.keyspace, info.base_name, view.name
    );
    Err(Error::new(ErrorKind::MissingBaseTable {
        keyspace: view.keyspace.clone(),
        view: view.name.clone(),
        base: info.base_name.clone(),
    }))
}

fn build_view_on(
    shard: &Shard,
    sm: &SchemaMutations,
    side: Side,
    tables: &SchemaDiff,
) -> Result<Arc<TableSchema>, Error> {
    let mut view = build_on(shard, TableKind::View, sm, side)?;
    let base = resolve_base(&view, side, tables, &shard.catalog())?;
    check_view_compatible(&view, &base)?;
    let base_info = make_base_dependent_view_info(&view, &base);
    if let Some(info) = view.view.as_mut() {
        info.base_info = Some(base_info);
    }
    Ok(Arc::new(view))
}

/// Returns the committed version of a dropped table or view, or rebuilds it
/// from its last rows if this shard never saw it.
fn dropped_on(
    shard: &Shard,
    kind: TableKind,
    id: TableId,
    sm: &SchemaMutations,
) -> Result<Arc<TableSchema>, Error> {
    if let Ok(existing) = shard.catalog().find_schema_by_id(id) {
        return Ok(Arc::clone(existing));
    }
    Ok(Arc::new(build_on(shard, kind, sm, Side::Old)?))
}

/// Diffs tables and views by stable id and builds their new versions on
/// `shard`. Tables are built first so that views created or altered along
/// with their base see the right version of it.
pub async fn merge_tables_and_views(
    shard: &Shard,
    before: &SchemaPersistedState,
    after: &SchemaPersistedState,
    created_keyspaces: &BTreeSet<String>,
    reload: bool,
    yield_interval: usize,
) -> Result<AffectedTablesAndViews, Error> {
    let mut yielder = Yielder::new(yield_interval);
    let mut result = AffectedTablesAndViews::default();

    let tables = difference(&before.tables, &after.tables, |a, b| a == b);
    for id in &tables.entries_only_on_right {
        let sm = &after.tables[id];
        if !created_keyspaces.contains(&sm.keyspace) && !shard.catalog().has_keyspace(&sm.keyspace)
        {
            error!(
                "keyspace {} of new table {} does not exist",
                sm.keyspace, sm.name
            );
            return Err(Error::new(ErrorKind::NoSuchKeyspace(sm.keyspace.clone())));
        }
        let table = Arc::new(build_on(shard, TableKind::Table, sm, Side::New)?);
        info!("creating table {table}");
        result.tables.created.push(table);
        yielder.tick().await;
    }
    for id in &tables.entries_differing {
        let old = Arc::new(build_on(shard, TableKind::Table, &before.tables[id], Side::Old)?);
        let new = Arc::new(build_on(shard, TableKind::Table, &after.tables[id], Side::New)?);
        info!("altering table {new}");
        result.tables.altered.push(AlteredSchema::new(old, new));
        yielder.tick().await;
    }
    if reload {
        for id in &tables.entries_in_common {
            let table = Arc::new(build_on(shard, TableKind::Table, &after.tables[id], Side::New)?);
            debug!("reloading table {table}");
            result
                .tables
                .altered
                .push(AlteredSchema::new(Arc::clone(&table), table));
            yielder.tick().await;
        }
    }
    for id in &tables.entries_only_on_left {
        let table = dropped_on(shard, TableKind::Table, *id, &before.tables[id])?;
        info!("dropping table {table}");
        result.tables.dropped.push(table);
        yielder.tick().await;
    }

    let views = difference(&before.views, &after.views, |a, b| a == b);
    for id in &views.entries_only_on_right {
        let view = build_view_on(shard, &after.views[id], Side::New, &result.tables)?;
        info!("creating view {view}");
        result.views.created.push(view);
        yielder.tick().await;
    }
    for id in &views.entries_differing {
        let old = build_view_on(shard, &before.views[id], Side::Old, &result.tables)?;
        let new = build_view_on(shard, &after.views[id], Side::New, &result.tables)?;
        info!("altering view {new}");
        result.views.altered.push(AlteredSchema::new(old, new));
        yielder.tick().await;
    }
    if reload {
        for id in &views.entries_in_common {
            let view = build_view_on(shard, &after.views[id], Side::New, &result.tables)?;
            debug!("reloading view {view}");
            result
                .views
                .altered
                .push(AlteredSchema::new(Arc::clone(&view), view));
            yielder.tick().await;
        }
    }
    for id in &views.entries_only_on_left {
        let view = dropped_on(shard, TableKind::View, *id, &before.views[id])?;
        info!("dropping view {view}");
        result.views.dropped.push(view);
        yielder.tick().await;
    }
    Ok(result)
}

/// Records the column mapping history of changed tables: created tables get
/// a permanent entry, altered tables a permanent entry for the new version
/// and an expiring one for the old, and dropped tables lose all entries.
pub async fn store_column_mappings(
    storage: &dyn SchemaStorage,
    tables: &SchemaDiff,
    ttl: Duration,
    max_concurrent: usize,
) -> Result<(), Error> {
    let limit = max_concurrent.max(1);
    stream::iter(tables.created.iter().map(Ok::<_, Error>))
        .try_for_each_concurrent(limit, |table| storage.store_column_mapping(table, None))
        .await?;
    stream::iter(tables.altered.iter().map(Ok::<_, Error>))
        .try_for_each_concurrent(limit, |altered| async move {
            storage
                .store_column_mapping(&altered.old, Some(ttl))
                .await?;
            storage.store_column_mapping(&altered.new, None).await
        })
        .await?;
    stream::iter(tables.dropped.iter().map(Ok::<_, Error>))
        .try_for_each_concurrent(limit, |table| storage.drop_column_mapping(table.id))
        .await
}

/// An aggregate's definition row joined with its optional attribute row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateRows {
    pub definition: Row,
    pub attributes: Option<Row>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateDiff {
    pub created: Vec<AggregateRows>,
    pub altered: Vec<AggregateRows>,
    pub dropped: Vec<AggregateRows>,
}

impl AggregateDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

fn keyed_rows(result: &SchemaResult) -> Result<BTreeMap<Vec<Value>, Row>, Error> {
    let mut rows = BTreeMap::new();
    for rs in result.values() {
        for (key, row) in rs.row_map()? {
            rows.insert(key, row.clone());
        }
    }
    Ok(rows)
}

/// Diffs aggregates by their definition rows, joining in the attribute row
/// with the same primary key. An aggregate whose attribute row alone changed
/// is altered.
pub fn diff_aggregates_rows(
    definitions_before: &SchemaResult,
    definitions_after: &SchemaResult,
    attributes_before: &SchemaResult,
    attributes_after: &SchemaResult,
) -> Result<AggregateDiff, Error> {
    let definitions_before = keyed_rows(definitions_before)?;
    let definitions_after = keyed_rows(definitions_after)?;
    let attributes_before = keyed_rows(attributes_before)?;
    let attributes_after = keyed_rows(attributes_after)?;
    let definitions = difference(&definitions_before, &definitions_after, |a, b| a == b);
    let attributes = difference(&attributes_before, &attributes_after, |a, b| a == b);

    let joined = |definitions: &BTreeMap<Vec<Value>, Row>,
                  attributes: &BTreeMap<Vec<Value>, Row>,
                  key: &Vec<Value>| AggregateRows {
        definition: definitions[key].clone(),
        attributes: attributes.get(key).cloned(),
    };
    let attributes_changed = |key: &Vec<Value>| {
        attributes.entries_only_on_left.contains(key)
            || attributes.entries_only_on_right.contains(key)
            || attributes.entries_differing.contains(key)
    };

    Ok(AggregateDiff {
        created: definitions
            .entries_only_on_right
            .iter()
            .map(|key| joined(&definitions_after, &attributes_after, key))
            .collect(),
        altered: definitions
            .entries_differing
            .iter()
            .chain(
                definitions
                    .entries_in_common
                    .iter()
                    .filter(|key| attributes_changed(*key)),
            )
            .map(|key| joined(&definitions_after, &attributes_after, key))
            .collect(),
        dropped: definitions
            .entries_only_on_left
            .iter()
            .map(|key| joined(&definitions_before, &attributes_before, key))
            .collect(),
    })
}

/// Stages the function and aggregate changes of a merge on one shard.
///
/// Compiled forms of altered and dropped functions are scheduled for
/// eviction in the returned batch, so they disappear together with the
/// registry switch at commit.
pub fn merge_functions_on_shard(
    shard: &Shard,
    functions: &RowDiff,
    aggregates: &AggregateDiff,
) -> Result<ChangeBatch, Error> {
    let catalog = shard.catalog();
    let staged = shard.in_progress_types();
    let overlay = TypeOverlay {
        staged: staged.as_ref(),
        catalog: &catalog,
    };
    let committed: &Catalog = &catalog;
    let mut batch = ChangeBatch::new(catalog.functions());

    for row in &functions.created {
        let function = create_func(row, &overlay)?;
        batch.add_function(FunctionObject::Scalar(Arc::new(function)));
    }
    for row in &functions.altered {
        let function = create_func(row, &overlay)?;
        batch.evict_compiled(function.signature());
        batch.replace_function(FunctionObject::Scalar(Arc::new(function)));
    }
    for row in &functions.dropped {
        let name = function_name(row, "function_name")?;
        // Dropped functions may use types dropped by this merge.
        let arg_types = read_arg_types(row, &name.keyspace, committed)?;
        let signature = FunctionSignature::new(name.clone(), &arg_types);
        if let Some(FunctionObject::Scalar(f)) = committed.functions().get(&signature) {
            if f.is_compiled() {
                batch.evict_compiled(signature);
            }
        }
        batch.remove_function(name, arg_types);
    }

    for rows in &aggregates.created {
        let aggregate =
            create_aggregate(&rows.definition, rows.attributes.as_ref(), &batch, &overlay)?;
        batch.add_function(FunctionObject::Aggregate(Arc::new(aggregate)));
    }
    for rows in &aggregates.altered {
        let aggregate =
            create_aggregate(&rows.definition, rows.attributes.as_ref(), &batch, &overlay)?;
        batch.replace_function(FunctionObject::Aggregate(Arc::new(aggregate)));
    }
    for rows in &aggregates.dropped {
        let name = function_name(&rows.definition, "aggregate_name")?;
        let arg_types = read_arg_types(&rows.definition, &name.keyspace, committed)?;
        batch.remove_aggregate(name, arg_types);
    }
    Ok(batch)
}

/// Diffs the function rows of two snapshots.
pub fn diff_functions(
    before: &SchemaPersistedState,
    after: &SchemaPersistedState,
) -> Result<RowDiff, Error> {
    diff_rows(&before.functions, &after.functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::ResultSet;

    fn aggregate_row(name: &str, state_func: &str) -> Row {
        Row::new(
            [
                ("keyspace_name".to_string(), Value::text("ks")),
                ("aggregate_name".to_string(), Value::text(name)),
                ("argument_types".to_string(), Value::text_list(["int"])),
                ("state_func".to_string(), Value::text(state_func)),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn attribute_row(name: &str, reduce_func: &str) -> Row {
        Row::new(
            [
                ("keyspace_name".to_string(), Value::text("ks")),
                ("aggregate_name".to_string(), Value::text(name)),
                ("argument_types".to_string(), Value::text_list(["int"])),
                ("reduce_func".to_string(), Value::text(reduce_func)),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn snapshot(table: SchemaTable, rows: Vec<Row>) -> SchemaResult {
        if rows.is_empty() {
            return SchemaResult::new();
        }
        [("ks".to_string(), Arc::new(ResultSet::new(table, rows)))].into()
    }

    #[test]
    fn aggregates_are_joined_with_their_attributes() {
        let before = snapshot(
            SchemaTable::Aggregates,
            vec![aggregate_row("kept", "f"), aggregate_row("gone", "f")],
        );
        let after = snapshot(
            SchemaTable::Aggregates,
            vec![aggregate_row("kept", "f"), aggregate_row("new", "f")],
        );
        let attrs_after = snapshot(
            SchemaTable::AggregateAttributes,
            vec![attribute_row("kept", "r"), attribute_row("new", "r")],
        );
        let diff =
            diff_aggregates_rows(&before, &after, &SchemaResult::new(), &attrs_after).unwrap();

        assert_eq!(diff.created.len(), 1);
        assert_eq!(diff.created[0].definition, aggregate_row("new", "f"));
        assert_eq!(diff.created[0].attributes, Some(attribute_row("new", "r")));
        // Gaining an attribute row is an alteration.
        assert_eq!(diff.altered.len(), 1);
        assert_eq!(diff.altered[0].attributes, Some(attribute_row("kept", "r")));
        assert_eq!(diff.dropped.len(), 1);
        assert_eq!(diff.dropped[0].definition, aggregate_row("gone", "f"));
        assert_eq!(diff.dropped[0].attributes, None);

        assert!(diff_aggregates_rows(&after, &after, &attrs_after, &attrs_after)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn attribute_only_keyspace_change_is_an_alter() {
        let keyspace = |durable: bool| {
            Row::new(
                [
                    ("keyspace_name".to_string(), Value::text("ks")),
                    ("durable_writes".to_string(), Value::Bool(durable)),
                    (
                        "replication".to_string(),
                        Value::Map(
                            [("class".to_string(), "LocalStrategy".to_string())].into(),
                        ),
                    ),
                ]
                .into_iter()
                .collect(),
            )
        };
        let attributes = Row::new(
            [
                ("keyspace_name".to_string(), Value::text("ks")),
                ("storage_type".to_string(), Value::text("s3")),
            ]
            .into_iter()
            .collect(),
        );
        let before = SchemaPersistedState {
            keyspaces: snapshot(SchemaTable::Keyspaces, vec![keyspace(true)]),
            ..Default::default()
        };
        let after = SchemaPersistedState {
            keyspaces: snapshot(SchemaTable::Keyspaces, vec![keyspace(true)]),
            keyspace_attributes: snapshot(SchemaTable::KeyspaceAttributes, vec![attributes]),
            ..Default::default()
        };
        let affected = merge_keyspaces(&before, &after).unwrap();
        assert!(affected.created.is_empty());
        assert!(affected.dropped.is_empty());
        assert_eq!(affected.altered.len(), 1);
        assert_eq!(
            affected.altered[0].attributes.storage_type.as_deref(),
            Some("s3")
        );

        let gone = merge_keyspaces(&after, &SchemaPersistedState::default()).unwrap();
        assert_eq!(gone.dropped, ["ks".to_string()].into());
        assert!(gone.altered.is_empty());
    }
}
