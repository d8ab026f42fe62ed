// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The shard-local catalog of live schema objects.
//!
//! Every shard owns an independent [`Catalog`]. Shards are kept in sync by
//! replaying the same changes on each of them; the only state they share is
//! the [`ReplicationMapRegistry`], which shard 0 seeds for the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::{Error, ErrorKind};
use crate::functions::{
    ChangeBatch, CompiledFunction, CompiledFunctionCache, FunctionObject, FunctionRegistry,
    FunctionSignature,
};
use crate::objects::{KeyspaceMetadata, ReplicationStrategy, SchemaVersion, TableId, TableSchema};
use crate::schema_tables::SCHEMA_KEYSPACE;
use crate::shard::ShardId;
use crate::types::{UserType, UserTypeLookup, UserTypes, EMPTY_USER_TYPES};

/// The replica placement derived from a keyspace's replication strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveReplicationMap {
    pub keyspace: String,
    pub strategy: ReplicationStrategy,
    /// Bumped every time the map is rebuilt.
    pub generation: u64,
}

/// Effective replication maps published by shard 0 for the other shards.
#[derive(Debug, Default)]
pub struct ReplicationMapRegistry {
    maps: Mutex<BTreeMap<String, Arc<EffectiveReplicationMap>>>,
}

impl ReplicationMapRegistry {
    /// Builds the map of `metadata` and publishes it.
    fn seed(&self, metadata: &KeyspaceMetadata) -> Result<Arc<EffectiveReplicationMap>, Error> {
        let mut maps = self
            .maps
            .lock()
            .map_err(|_| Error::internal("replication map registry lock poisoned"))?;
        let generation = maps
            .get(&metadata.name)
            .map_or(0, |erm| erm.generation + 1);
        let erm = Arc::new(EffectiveReplicationMap {
            keyspace: metadata.name.clone(),
            strategy: metadata.replication.clone(),
            generation,
        });
        debug!(keyspace = %metadata.name, generation, "seeded effective replication map");
        maps.insert(metadata.name.clone(), Arc::clone(&erm));
        Ok(erm)
    }

    /// Returns the map shard 0 published for `keyspace`.
    fn adopt(&self, keyspace: &str) -> Result<Arc<EffectiveReplicationMap>, Error> {
        let maps = self
            .maps
            .lock()
            .map_err(|_| Error::internal("replication map registry lock poisoned"))?;
        maps.get(keyspace)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::ReplicationMapNotSeeded(keyspace.into())))
    }

    fn remove(&self, keyspace: &str) -> Result<(), Error> {
        self.maps
            .lock()
            .map_err(|_| Error::internal("replication map registry lock poisoned"))?
            .remove(keyspace);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Keyspace {
    pub metadata: Arc<KeyspaceMetadata>,
    pub user_types: UserTypes,
    pub column_families: BTreeSet<TableId>,
    pub replication_map: Arc<EffectiveReplicationMap>,
}

/// The live schema objects of one shard.
#[derive(Debug)]
pub struct Catalog {
    shard: ShardId,
    registry: Arc<ReplicationMapRegistry>,
    keyspaces: BTreeMap<String, Keyspace>,
    tables: BTreeMap<TableId, Arc<TableSchema>>,
    tables_by_name: BTreeMap<(String, String), TableId>,
    functions: FunctionRegistry,
    compiled_functions: CompiledFunctionCache,
    schema_version: Option<SchemaVersion>,
}

impl Catalog {
    pub fn new(shard: ShardId, registry: Arc<ReplicationMapRegistry>) -> Catalog {
        Catalog {
            shard,
            registry,
            keyspaces: BTreeMap::new(),
            tables: BTreeMap::new(),
            tables_by_name: BTreeMap::new(),
            functions: FunctionRegistry::default(),
            compiled_functions: CompiledFunctionCache::default(),
            schema_version: None,
        }
    }

    fn replication_map(
        &self,
        metadata: &KeyspaceMetadata,
    ) -> Result<Arc<EffectiveReplicationMap>, Error> {
        if self.shard == 0 {
            self.registry.seed(metadata)
        } else {
            self.registry.adopt(&metadata.name)
        }
    }

    pub fn insert_keyspace(&mut self, metadata: Arc<KeyspaceMetadata>) -> Result<(), Error> {
        if self.keyspaces.contains_key(&metadata.name) {
            return Err(Error::new(ErrorKind::KeyspaceAlreadyExists(
                metadata.name.clone(),
            )));
        }
        let replication_map = self.replication_map(&metadata)?;
        self.keyspaces.insert(
            metadata.name.clone(),
            Keyspace {
                metadata,
                user_types: UserTypes::new(),
                column_families: BTreeSet::new(),
                replication_map,
            },
        );
        Ok(())
    }

    pub fn update_keyspace(&mut self, metadata: Arc<KeyspaceMetadata>) -> Result<(), Error> {
        let replication_map = self.replication_map(&metadata)?;
        let keyspace = self.keyspace_mut(&metadata.name)?;
        keyspace.metadata = metadata;
        keyspace.replication_map = replication_map;
        Ok(())
    }

    /// Drops `name`, which must no longer hold any table or view.
    pub fn drop_keyspace(&mut self, name: &str) -> Result<(), Error> {
        let keyspace = self.keyspace(name)?;
        if !keyspace.column_families.is_empty() {
            return Err(Error::new(ErrorKind::KeyspaceNotEmpty(name.into())));
        }
        self.keyspaces.remove(name);
        if self.shard == 0 {
            self.registry.remove(name)?;
        }
        Ok(())
    }

    pub fn keyspace(&self, name: &str) -> Result<&Keyspace, Error> {
        self.keyspaces
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchKeyspace(name.into())))
    }

    fn keyspace_mut(&mut self, name: &str) -> Result<&mut Keyspace, Error> {
        self.keyspaces
            .get_mut(name)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchKeyspace(name.into())))
    }

    pub fn has_keyspace(&self, name: &str) -> bool {
        self.keyspaces.contains_key(name)
    }

    pub fn keyspaces(&self) -> impl Iterator<Item = &Keyspace> {
        self.keyspaces.values()
    }

    pub fn non_system_keyspaces(&self) -> impl Iterator<Item = &str> {
        self.keyspaces
            .keys()
            .map(String::as_str)
            .filter(|name| *name != SCHEMA_KEYSPACE)
    }

    pub fn add_user_type(&mut self, ty: Arc<UserType>) -> Result<(), Error> {
        self.keyspace_mut(&ty.keyspace)?.user_types.add(ty);
        Ok(())
    }

    pub fn remove_user_type(&mut self, ty: &UserType) -> Result<(), Error> {
        self.keyspace_mut(&ty.keyspace)?
            .user_types
            .remove(&ty.name)
            .map(|_| ())
            .ok_or_else(|| {
                Error::new(ErrorKind::NoSuchUserType {
                    keyspace: ty.keyspace.clone(),
                    name: ty.name.clone(),
                })
            })
    }

    pub fn add_table(&mut self, table: Arc<TableSchema>) -> Result<(), Error> {
        let key = (table.keyspace.clone(), table.name.clone());
        if self.tables_by_name.contains_key(&key) {
            return Err(Error::new(ErrorKind::TableAlreadyExists {
                keyspace: key.0,
                name: key.1,
            }));
        }
        self.keyspace_mut(&table.keyspace)?
            .column_families
            .insert(table.id);
        self.tables_by_name.insert(key, table.id);
        self.tables.insert(table.id, table);
        Ok(())
    }

    /// Replaces the schema of an existing table or view.
    pub fn update_table(&mut self, table: Arc<TableSchema>) -> Result<(), Error> {
        let Some(old) = self.tables.get(&table.id) else {
            return Err(Error::new(ErrorKind::NoSuchTableId(table.id)));
        };
        if old.name != table.name || old.keyspace != table.keyspace {
            self.tables_by_name
                .remove(&(old.keyspace.clone(), old.name.clone()));
            self.tables_by_name
                .insert((table.keyspace.clone(), table.name.clone()), table.id);
        }
        self.tables.insert(table.id, table);
        Ok(())
    }

    /// Drops a table or view. A table can only be dropped once every view
    /// of it is gone.
    pub fn drop_table(&mut self, keyspace: &str, name: &str) -> Result<Arc<TableSchema>, Error> {
        let id = self.find_schema(keyspace, name)?.id;
        if let Some(view) = self.views_of(id).next() {
            return Err(Error::new(ErrorKind::TableHasViews {
                keyspace: keyspace.into(),
                name: name.into(),
                view: view.name.clone(),
            }));
        }
        self.tables_by_name
            .remove(&(keyspace.to_string(), name.to_string()));
        self.keyspace_mut(keyspace)?.column_families.remove(&id);
        self.tables
            .remove(&id)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchTableId(id)))
    }

    pub fn find_schema(&self, keyspace: &str, name: &str) -> Result<&Arc<TableSchema>, Error> {
        self.tables_by_name
            .get(&(keyspace.to_string(), name.to_string()))
            .and_then(|id| self.tables.get(id))
            .ok_or_else(|| {
                Error::new(ErrorKind::NoSuchTable {
                    keyspace: keyspace.into(),
                    name: name.into(),
                })
            })
    }

    pub fn find_schema_by_id(&self, id: TableId) -> Result<&Arc<TableSchema>, Error> {
        self.tables
            .get(&id)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchTableId(id)))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    /// Returns the views whose base is `base`.
    pub fn views_of(&self, base: TableId) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables
            .values()
            .filter(move |t| t.view.as_ref().is_some_and(|v| v.base_id == base))
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Publishes a function change batch together with its compiled
    /// function evictions.
    pub fn commit_functions(&mut self, batch: ChangeBatch) {
        batch.commit(&mut self.functions, &mut self.compiled_functions);
    }

    /// Returns the compiled form of a registered function, compiling it on
    /// first use.
    pub fn compiled_function(
        &mut self,
        signature: &FunctionSignature,
    ) -> Result<Arc<CompiledFunction>, Error> {
        match self.functions.get(signature) {
            Some(FunctionObject::Scalar(f)) if f.is_compiled() => {
                Ok(self.compiled_functions.get_or_compile(f))
            }
            _ => Err(Error::new(ErrorKind::NoSuchFunction(signature.to_string()))),
        }
    }

    pub fn is_function_compiled(&self, signature: &FunctionSignature) -> bool {
        self.compiled_functions.contains(signature)
    }

    pub fn schema_version(&self) -> Option<SchemaVersion> {
        self.schema_version
    }

    pub fn set_schema_version(&mut self, version: SchemaVersion) {
        if self.schema_version != Some(version) && self.shard == 0 {
            info!("schema version changed to {version}");
        }
        self.schema_version = Some(version);
    }
}

impl UserTypeLookup for Catalog {
    fn user_types(&self, keyspace: &str) -> &UserTypes {
        self.keyspaces
            .get(keyspace)
            .map_or(&EMPTY_USER_TYPES, |ks| &ks.user_types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{KeyspaceAttributes, ViewInfo};

    fn metadata(name: &str) -> Arc<KeyspaceMetadata> {
        Arc::new(KeyspaceMetadata {
            name: name.into(),
            durable_writes: true,
            replication: ReplicationStrategy::Simple {
                replication_factor: 1,
            },
            replication_options: BTreeMap::new(),
            attributes: KeyspaceAttributes::default(),
        })
    }

    fn table(name: &str, view_of: Option<TableId>) -> Arc<TableSchema> {
        Arc::new(TableSchema {
            id: TableId::random(),
            keyspace: "ks".into(),
            name: name.into(),
            version: SchemaVersion(uuid::Uuid::new_v4()),
            columns: Vec::new(),
            comment: None,
            view: view_of.map(|base_id| ViewInfo {
                base_id,
                base_name: "t".into(),
                include_all_columns: true,
                where_clause: String::new(),
                base_info: None,
            }),
        })
    }

    #[test]
    fn replication_maps_are_seeded_by_shard_zero() {
        let registry = Arc::new(ReplicationMapRegistry::default());
        let mut shard0 = Catalog::new(0, Arc::clone(&registry));
        let mut shard1 = Catalog::new(1, Arc::clone(&registry));
        assert!(matches!(
            shard1.insert_keyspace(metadata("ks")).unwrap_err().kind(),
            ErrorKind::ReplicationMapNotSeeded(_)
        ));
        shard0.insert_keyspace(metadata("ks")).unwrap();
        shard1.insert_keyspace(metadata("ks")).unwrap();
        assert!(Arc::ptr_eq(
            &shard0.keyspace("ks").unwrap().replication_map,
            &shard1.keyspace("ks").unwrap().replication_map
        ));

        shard0.update_keyspace(metadata("ks")).unwrap();
        shard1.update_keyspace(metadata("ks")).unwrap();
        assert_eq!(shard1.keyspace("ks").unwrap().replication_map.generation, 1);
    }

    #[test]
    fn tables_are_dropped_after_their_views() {
        let registry = Arc::new(ReplicationMapRegistry::default());
        let mut catalog = Catalog::new(0, registry);
        catalog.insert_keyspace(metadata("ks")).unwrap();
        let t = table("t", None);
        let v = table("v", Some(t.id));
        catalog.add_table(Arc::clone(&t)).unwrap();
        catalog.add_table(Arc::clone(&v)).unwrap();
        assert!(catalog.add_table(table("t", None)).unwrap_err().is_table_already_exists());

        assert!(matches!(
            catalog.drop_table("ks", "t").unwrap_err().kind(),
            ErrorKind::TableHasViews { view, .. } if view == "v"
        ));
        assert!(matches!(
            catalog.drop_keyspace("ks").unwrap_err().kind(),
            ErrorKind::KeyspaceNotEmpty(_)
        ));
        catalog.drop_table("ks", "v").unwrap();
        catalog.drop_table("ks", "t").unwrap();
        catalog.drop_keyspace("ks").unwrap();
        assert!(!catalog.has_keyspace("ks"));
    }
}
