// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Application of a batch of schema mutations to every shard.
//!
//! A merge runs the phases of a [`SchemaApplier`] in order, each exactly
//! once:
//!
//! 1. [`SchemaApplier::prepare`] finds the keyspaces and tables the batch
//!    touches and snapshots their metadata rows.
//! 2. The caller applies the raw mutations to storage.
//! 3. [`SchemaApplier::update`] snapshots the rows again and builds the new
//!    runtime objects, staging new user types on every shard.
//! 4. [`SchemaApplier::commit`] publishes the objects, on shard 0 first.
//! 5. [`SchemaApplier::notify`] informs the listeners of every shard.
//! 6. [`SchemaApplier::destroy`] drops the staged user types.
//!
//! Nothing becomes visible to readers of a catalog before `commit`; a
//! failure in `prepare` or `update` leaves every catalog untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, instrument};

use crate::catalog::Catalog;
use crate::config::{Config, ConfigSet};
use crate::diff::diff_rows;
use crate::error::{Error, ErrorKind};
use crate::functions::{ChangeBatch, RemovedFunction};
use crate::mutation::{Cell, Mutation};
use crate::notifier::{MigrationNotifier, SchemaChange};
use crate::objects::TableId;
use crate::rows::Value;
use crate::schema_tables::{
    get_affected_tables, maybe_delete_schema_version, read_table_names_of_keyspace, SchemaTable,
    TableKind, TableSelector,
};
use crate::shard::{Shard, ShardId, Sharded};
use crate::storage::SchemaStorage;

use self::merge::{
    diff_aggregates_rows, diff_functions, merge_functions_on_shard, merge_keyspaces,
    merge_tables_and_views, merge_types_on_shard, read_schema_state, store_column_mappings,
    AffectedKeyspaces, AffectedTablesAndViews, AffectedUserTypes, SchemaPersistedState,
};

pub mod in_progress_types;
pub mod merge;

pub const SCHEMA_MERGE_MAX_CONCURRENT: Config<usize> = Config::new(
    "schema_merge_max_concurrent",
    8,
    "Maximum number of per-object operations, like column mapping writes and \
     listener notifications, a schema merge runs concurrently.",
);

pub const SCHEMA_MERGE_YIELD_INTERVAL: Config<usize> = Config::new(
    "schema_merge_yield_interval",
    64,
    "Number of objects a schema merge builds between yields to the shard's scheduler.",
);

pub const SCHEMA_COLUMN_MAPPING_TTL: Config<Duration> = Config::new(
    "schema_column_mapping_ttl",
    Duration::from_secs(10 * 24 * 60 * 60),
    "How long the column mapping of a superseded table version is kept.",
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    New,
    Prepared,
    Updated,
    Committed,
    Notified,
    Destroyed,
}

/// The changes computed by [`SchemaApplier::update`] that are identical on
/// every shard.
#[derive(Clone, Debug, Default)]
pub struct AffectedSchema {
    pub keyspaces: AffectedKeyspaces,
    pub tables_and_views: AffectedTablesAndViews,
}

/// Drives one merge of schema mutations through its phases.
#[derive(Debug)]
pub struct SchemaApplier {
    sharded: Sharded,
    storage: Arc<dyn SchemaStorage>,
    configs: ConfigSet,
    reload: bool,
    phase: Phase,

    keyspaces: BTreeSet<String>,
    affected_tables: BTreeMap<String, TableSelector>,
    before: Arc<SchemaPersistedState>,
    after: Arc<SchemaPersistedState>,

    affected: Arc<AffectedSchema>,
    /// Per shard, in shard order.
    user_types: Vec<Arc<AffectedUserTypes>>,
    function_batches: Vec<ChangeBatch>,
    removed_functions: Vec<Arc<Vec<RemovedFunction>>>,
}

impl SchemaApplier {
    /// Creates an applier for one merge. With `reload`, every table and view
    /// of every non-system keyspace is rebuilt and reported as altered.
    pub fn new(
        sharded: Sharded,
        storage: Arc<dyn SchemaStorage>,
        configs: ConfigSet,
        reload: bool,
    ) -> SchemaApplier {
        SchemaApplier {
            sharded,
            storage,
            configs,
            reload,
            phase: Phase::New,
            keyspaces: BTreeSet::new(),
            affected_tables: BTreeMap::new(),
            before: Arc::default(),
            after: Arc::default(),
            affected: Arc::default(),
            user_types: Vec::new(),
            function_batches: Vec::new(),
            removed_functions: Vec::new(),
        }
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), Error> {
        if self.phase != expected {
            return Err(Error::internal(format!(
                "schema applier is {:?}, expected {:?}",
                self.phase, expected
            )));
        }
        Ok(())
    }

    /// The keyspaces touched by the batch.
    pub fn keyspaces(&self) -> &BTreeSet<String> {
        &self.keyspaces
    }

    pub fn affected(&self) -> &AffectedSchema {
        &self.affected
    }

    /// The user type changes computed on each shard.
    pub fn user_types(&self) -> &[Arc<AffectedUserTypes>] {
        &self.user_types
    }

    /// Reports whether `update` found nothing to change.
    pub fn is_empty(&self) -> bool {
        self.affected.keyspaces.is_empty()
            && self.affected.tables_and_views.is_empty()
            && self.user_types.iter().all(|types| types.is_empty())
            && self.removed_functions.iter().all(|removed| removed.is_empty())
            && self.after.functions == self.before.functions
            && self.after.aggregates == self.before.aggregates
            && self.after.aggregate_attributes == self.before.aggregate_attributes
    }

    /// Computes the scope of `mutations` and snapshots it. Strips the table
    /// version from mutations not committed through the replicated log so
    /// that it gets recomputed from the new content.
    #[instrument(
        level = "debug",
        skip_all,
        fields(mutations = mutations.len(), reload = self.reload)
    )]
    pub async fn prepare(&mut self, mutations: &mut [Mutation]) -> Result<(), Error> {
        self.expect_phase(Phase::New)?;
        for m in mutations.iter() {
            self.keyspaces.insert(m.keyspace.clone());
            if m.table.holds_schema_mutations() {
                *self.affected_tables.entry(m.keyspace.clone()).or_default() +=
                    get_affected_tables(&m.keyspace, m);
            }
        }
        if self.reload {
            let keyspaces = self
                .sharded
                .invoke_on(0, |shard| {
                    let names = shard
                        .catalog()
                        .non_system_keyspaces()
                        .map(String::from)
                        .collect::<Vec<_>>();
                    future::ready(names)
                })
                .await?;
            for keyspace in keyspaces {
                self.keyspaces.insert(keyspace.clone());
                self.affected_tables
                    .entry(keyspace)
                    .or_default()
                    .all_in_keyspace = true;
            }
        }
        for (keyspace, selector) in &mut self.affected_tables {
            if !selector.all_in_keyspace {
                continue;
            }
            for kind in TableKind::ALL {
                let names = read_table_names_of_keyspace(&*self.storage, keyspace, kind).await?;
                debug!("{kind}s of keyspace {keyspace} affected by the batch: {names:?}");
                for name in names {
                    selector.add(kind, name);
                }
            }
        }

        self.validate_table_ids(mutations).await?;
        self.before = Arc::new(
            read_schema_state(&*self.storage, &self.keyspaces, &self.affected_tables).await?,
        );
        for m in mutations.iter_mut() {
            maybe_delete_schema_version(m);
        }
        self.phase = Phase::Prepared;
        Ok(())
    }

    /// Rejects table and view definitions that reuse the name of a live
    /// object with a different id, unless the batch also drops that object.
    /// Runs before the mutations reach storage.
    async fn validate_table_ids(&self, mutations: &[Mutation]) -> Result<(), Error> {
        let mut definitions = Vec::new();
        for m in mutations
            .iter()
            .filter(|m| matches!(m.table, SchemaTable::Tables | SchemaTable::Views))
        {
            for row in &m.rows {
                if let (
                    Some(Value::Text(name)),
                    Some(Cell {
                        value: Some(Value::Uuid(id)),
                        ..
                    }),
                ) = (row.clustering.first(), row.cells.get("id"))
                {
                    definitions.push((m.keyspace.clone(), name.clone(), TableId(*id)));
                }
            }
        }
        if definitions.is_empty() {
            return Ok(());
        }
        let conflicts = self
            .sharded
            .invoke_on(0, move |shard| {
                let conflicts = find_id_conflicts(&shard.catalog(), definitions);
                future::ready(conflicts)
            })
            .await?;
        for conflict in conflicts {
            let holder = conflict.existing_kind.holder();
            if drops_definition(mutations, holder, &conflict.keyspace, &conflict.name) {
                debug!(
                    "{}.{} is dropped and recreated with id {}",
                    conflict.keyspace, conflict.name, conflict.id
                );
                continue;
            }
            error!(
                "{}.{} is defined with id {} but exists with id {}",
                conflict.keyspace, conflict.name, conflict.id, conflict.existing_id
            );
            return Err(Error::new(ErrorKind::TableAlreadyExists {
                keyspace: conflict.keyspace,
                name: conflict.name,
            }));
        }
        Ok(())
    }

    /// Snapshots the applied rows and builds the changes every shard will
    /// commit.
    #[instrument(level = "debug", skip_all)]
    pub async fn update(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Prepared)?;
        let after = Arc::new(
            read_schema_state(&*self.storage, &self.keyspaces, &self.affected_tables).await?,
        );

        let keyspaces = merge_keyspaces(&self.before, &after)?;
        let created_keyspaces = keyspaces.created_names();

        let types = Arc::new(diff_rows(&self.before.types, &after.types)?);
        let created = Arc::new(created_keyspaces.clone());
        let dropped = Arc::new(keyspaces.dropped.clone());
        let user_types = self
            .sharded
            .invoke_on_all(move |shard| {
                let result = merge_types_on_shard(&shard, &types, &created, &dropped);
                future::ready(result)
            })
            .await?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        // Tables and views are built once, on shard 0, and shared.
        let before = Arc::clone(&self.before);
        let after_on_shard = Arc::clone(&after);
        let reload = self.reload;
        let yield_interval = SCHEMA_MERGE_YIELD_INTERVAL.get(&self.configs);
        let tables_and_views = self
            .sharded
            .invoke_on(0, move |shard| async move {
                merge_tables_and_views(
                    &shard,
                    &before,
                    &after_on_shard,
                    &created_keyspaces,
                    reload,
                    yield_interval,
                )
                .await
            })
            .await??;

        store_column_mappings(
            &*self.storage,
            &tables_and_views.tables,
            SCHEMA_COLUMN_MAPPING_TTL.get(&self.configs),
            SCHEMA_MERGE_MAX_CONCURRENT.get(&self.configs),
        )
        .await?;

        let functions = Arc::new(diff_functions(&self.before, &after)?);
        let aggregates = Arc::new(diff_aggregates_rows(
            &self.before.aggregates,
            &after.aggregates,
            &self.before.aggregate_attributes,
            &after.aggregate_attributes,
        )?);
        let function_batches = self
            .sharded
            .invoke_on_all(move |shard| {
                let result = merge_functions_on_shard(&shard, &functions, &aggregates);
                future::ready(result)
            })
            .await?
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        self.removed_functions = function_batches
            .iter()
            .map(|batch| Arc::new(batch.removed_functions().to_vec()))
            .collect();
        self.function_batches = function_batches;
        self.user_types = user_types;
        self.affected = Arc::new(AffectedSchema {
            keyspaces,
            tables_and_views,
        });
        self.after = after;
        self.phase = Phase::Updated;
        Ok(())
    }

    /// Publishes the changes. Shard 0 commits first and alone: it seeds the
    /// effective replication maps the other shards adopt.
    #[instrument(level = "debug", skip_all)]
    pub async fn commit(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Updated)?;
        let mut per_shard = std::mem::take(&mut self.function_batches)
            .into_iter()
            .zip(self.user_types.iter().cloned())
            .enumerate();
        let commit = |id: ShardId, functions: ChangeBatch, types: Arc<AffectedUserTypes>| {
            let affected = Arc::clone(&self.affected);
            self.sharded.invoke_on(id, move |shard| {
                let result = commit_on_shard(&shard, &affected, &types, functions);
                future::ready(result)
            })
        };

        if let Some((id, (functions, types))) = per_shard.next() {
            commit(id, functions, types).await??;
        }
        try_join_all(per_shard.map(|(id, (functions, types))| commit(id, functions, types)))
            .await?
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;
        self.phase = Phase::Committed;
        Ok(())
    }

    /// Informs the listeners of every shard of the committed changes.
    #[instrument(level = "debug", skip_all)]
    pub async fn notify(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::Committed)?;
        let affected = Arc::clone(&self.affected);
        let max_concurrent = SCHEMA_MERGE_MAX_CONCURRENT.get(&self.configs).max(1);
        let inputs = self
            .user_types
            .iter()
            .cloned()
            .zip(self.removed_functions.iter().cloned())
            .collect::<Vec<_>>();
        self.sharded
            .invoke_on_each(inputs, move |shard, (types, removed)| {
                let affected = Arc::clone(&affected);
                let notifier = shard.notifier();
                async move {
                    notify_shard(&notifier, &affected, &types, &removed, max_concurrent).await
                }
            })
            .await?;
        self.phase = Phase::Notified;
        Ok(())
    }

    /// Drops the user types staged on every shard. Safe to call in any
    /// phase, and the only phase allowed after a failure.
    #[instrument(level = "debug", skip_all)]
    pub async fn destroy(&mut self) -> Result<(), Error> {
        self.sharded
            .invoke_on_all(|shard| {
                shard.set_in_progress_types(None);
                future::ready(())
            })
            .await?;
        self.phase = Phase::Destroyed;
        Ok(())
    }
}

/// A definition whose name is taken by a live object with another id.
#[derive(Debug)]
struct IdConflict {
    keyspace: String,
    name: String,
    id: TableId,
    existing_id: TableId,
    existing_kind: TableKind,
}

fn find_id_conflicts(
    catalog: &Catalog,
    definitions: Vec<(String, String, TableId)>,
) -> Vec<IdConflict> {
    definitions
        .into_iter()
        .filter_map(|(keyspace, name, id)| {
            let existing = catalog.find_schema(&keyspace, &name).ok()?;
            if existing.id == id {
                return None;
            }
            let existing_kind = match existing.view {
                Some(_) => TableKind::View,
                None => TableKind::Table,
            };
            Some(IdConflict {
                existing_id: existing.id,
                existing_kind,
                keyspace,
                name,
                id,
            })
        })
        .collect()
}

/// Reports whether `mutations` carry a tombstone covering the row of `name`
/// in `holder`.
fn drops_definition(
    mutations: &[Mutation],
    holder: SchemaTable,
    keyspace: &str,
    name: &str,
) -> bool {
    let key = [Value::text(name)];
    mutations
        .iter()
        .filter(|m| m.table == holder && m.keyspace == keyspace)
        .any(|m| {
            m.partition_tombstone.is_some()
                || m.range_tombstones.iter().any(|rt| rt.covers(&key))
                || m
                    .rows
                    .iter()
                    .any(|row| row.tombstone.is_some() && row.clustering[..] == key[..])
        })
}

/// Moves the changes into the catalog of `shard`. Never suspends.
fn commit_on_shard(
    shard: &Shard,
    affected: &AffectedSchema,
    types: &AffectedUserTypes,
    functions: ChangeBatch,
) -> Result<(), Error> {
    let mut catalog = shard.catalog_mut();
    let keyspaces = &affected.keyspaces;
    let tables = &affected.tables_and_views.tables;
    let views = &affected.tables_and_views.views;

    for metadata in &keyspaces.created {
        catalog.insert_keyspace(Arc::clone(metadata))?;
    }
    for metadata in &keyspaces.altered {
        catalog.update_keyspace(Arc::clone(metadata))?;
    }
    for ty in types.created.iter().chain(&types.altered) {
        catalog.add_user_type(Arc::clone(ty))?;
    }
    // Views go before their base tables.
    for view in &views.dropped {
        catalog.drop_table(&view.keyspace, &view.name)?;
    }
    for table in &tables.dropped {
        catalog.drop_table(&table.keyspace, &table.name)?;
    }
    for table in tables.created.iter().chain(&views.created) {
        catalog.add_table(Arc::clone(table))?;
    }
    for altered in tables.altered.iter().chain(&views.altered) {
        catalog.update_table(Arc::clone(&altered.new))?;
    }
    catalog.commit_functions(functions);
    for ty in &types.dropped {
        catalog.remove_user_type(ty)?;
    }
    for keyspace in &keyspaces.dropped {
        catalog.drop_keyspace(keyspace)?;
    }
    debug!("committed schema changes on shard {}", shard.id());
    Ok(())
}

async fn notify_all<'a>(
    notifier: &MigrationNotifier,
    max_concurrent: usize,
    changes: impl Iterator<Item = SchemaChange<'a>>,
) {
    stream::iter(changes)
        .for_each_concurrent(max_concurrent, |change| notifier.notify(change))
        .await
}

/// Notifies in an order that never lets a listener see a dangling
/// reference: views are dropped before their tables and created after them.
async fn notify_shard(
    notifier: &MigrationNotifier,
    affected: &AffectedSchema,
    types: &AffectedUserTypes,
    removed_functions: &[RemovedFunction],
    max_concurrent: usize,
) {
    if notifier.is_empty() {
        return;
    }
    let keyspaces = &affected.keyspaces;
    let tables = &affected.tables_and_views.tables;
    let views = &affected.tables_and_views.views;
    let n = max_concurrent;

    notify_all(
        notifier,
        n,
        keyspaces
            .created
            .iter()
            .map(|ks| SchemaChange::CreateKeyspace(ks.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        keyspaces
            .altered
            .iter()
            .map(|ks| SchemaChange::UpdateKeyspace(ks.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        views.dropped.iter().map(|v| SchemaChange::DropView(v.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        tables.dropped.iter().map(|t| SchemaChange::DropTable(t.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        tables.created.iter().map(|t| SchemaChange::CreateTable(t.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        views.created.iter().map(|v| SchemaChange::CreateView(v.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        tables
            .altered
            .iter()
            .map(|a| SchemaChange::UpdateTable(a.new.as_ref(), a.columns_changed)),
    )
    .await;
    notify_all(
        notifier,
        n,
        views
            .altered
            .iter()
            .map(|a| SchemaChange::UpdateView(a.new.as_ref(), a.columns_changed)),
    )
    .await;
    notify_all(
        notifier,
        n,
        types
            .created
            .iter()
            .map(|ty| SchemaChange::CreateUserType(ty.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        types
            .altered
            .iter()
            .map(|ty| SchemaChange::UpdateUserType(ty.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        types
            .dropped
            .iter()
            .map(|ty| SchemaChange::DropUserType(ty.as_ref())),
    )
    .await;
    notify_all(
        notifier,
        n,
        removed_functions.iter().map(SchemaChange::DropFunction),
    )
    .await;
    notify_all(
        notifier,
        n,
        keyspaces
            .dropped
            .iter()
            .map(|ks| SchemaChange::DropKeyspace(ks.as_str())),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::all_dyncfgs;
    use crate::storage::MemSchemaStorage;

    fn applier(sharded: &Sharded, storage: &MemSchemaStorage) -> SchemaApplier {
        SchemaApplier::new(
            sharded.clone(),
            Arc::new(storage.clone()),
            all_dyncfgs(ConfigSet::default()),
            false,
        )
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let sharded = Sharded::new(2).unwrap();
        let storage = MemSchemaStorage::new();
        let mut applier = applier(&sharded, &storage);
        assert!(applier.update().await.is_err());
        assert!(applier.commit().await.is_err());

        applier.prepare(&mut []).await.unwrap();
        assert!(applier.prepare(&mut []).await.is_err());
        assert!(applier.notify().await.is_err());
        applier.update().await.unwrap();
        assert!(applier.is_empty());
        assert_eq!(applier.user_types().len(), 2);
        applier.commit().await.unwrap();
        applier.notify().await.unwrap();
        applier.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_clears_staged_types() {
        let sharded = Sharded::new(2).unwrap();
        let storage = MemSchemaStorage::new();
        let mut applier = applier(&sharded, &storage);
        applier.prepare(&mut []).await.unwrap();
        applier.update().await.unwrap();
        let staged = sharded
            .invoke_on_all(|shard| {
                let staged = shard.in_progress_types().is_some();
                future::ready(staged)
            })
            .await
            .unwrap();
        assert_eq!(staged, vec![true, true]);

        applier.destroy().await.unwrap();
        let staged = sharded
            .invoke_on_all(|shard| {
                let staged = shard.in_progress_types().is_some();
                future::ready(staged)
            })
            .await
            .unwrap();
        assert_eq!(staged, vec![false, false]);
    }

    #[test]
    fn drops_are_recognized_by_every_tombstone_kind() {
        let mut row = Mutation::new(SchemaTable::Tables, "ks");
        row.delete_row(vec![Value::text("t")], 1);
        let mut range = Mutation::new(SchemaTable::Tables, "ks");
        range.delete_range(vec![Value::text("s")], vec![Value::text("u")], 1);
        let mut partition = Mutation::new(SchemaTable::Tables, "ks");
        partition.delete_partition(1);
        for m in [row, range, partition] {
            let batch = [m];
            assert!(drops_definition(&batch, SchemaTable::Tables, "ks", "t"));
            assert!(!drops_definition(&batch, SchemaTable::Views, "ks", "t"));
            assert!(!drops_definition(&batch, SchemaTable::Tables, "other", "t"));
        }

        let mut unrelated = Mutation::new(SchemaTable::Tables, "ks");
        unrelated.delete_row(vec![Value::text("u")], 1);
        unrelated.set_row(vec![Value::text("t")], [("id", Some(Value::text("x")))], 2);
        assert!(!drops_definition(&[unrelated], SchemaTable::Tables, "ks", "t"));
    }
}
