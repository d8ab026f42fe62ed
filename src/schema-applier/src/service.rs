// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The entry points for applying schema changes on a node.

use std::fmt::Debug;
use std::future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::applier::SchemaApplier;
use crate::config::{all_dyncfgs, ConfigSet};
use crate::error::Error;
use crate::mutation::{freeze, new_timestamp, unfreeze, Mutation};
use crate::notifier::MigrationListener;
use crate::objects::{SchemaVersion, TableSchema};
use crate::schema_tables::ddl::make_create_table_mutations;
use crate::schema_tables::{SchemaTable, SCHEMA_KEYSPACE};
use crate::shard::{this_shard_id, Sharded};
use crate::storage::SchemaStorage;

/// Namespace of the schema digest.
const SCHEMA_DIGEST_NAMESPACE: Uuid = Uuid::from_u128(0x5c1f_2e0a_93d4_4b7e_a1c6_0f8e_27d3_b945);

/// Cluster capabilities that change how the schema version is computed.
/// Every node of a cluster must digest the same metadata tables, or their
/// versions never agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaFeatures {
    /// Keyspace attributes (storage options) are part of the digest.
    pub keyspace_attributes: bool,
    /// Aggregate attributes (reduce functions) are part of the digest.
    pub aggregate_attributes: bool,
}

impl Default for SchemaFeatures {
    fn default() -> SchemaFeatures {
        SchemaFeatures {
            keyspace_attributes: true,
            aggregate_attributes: true,
        }
    }
}

impl SchemaFeatures {
    fn digests(&self, table: SchemaTable) -> bool {
        match table {
            SchemaTable::KeyspaceAttributes => self.keyspace_attributes,
            SchemaTable::AggregateAttributes => self.aggregate_attributes,
            _ => true,
        }
    }
}

/// Reports the features enabled across the cluster.
pub trait FeatureService: Debug + Send + Sync {
    fn schema_features(&self) -> SchemaFeatures;
}

/// A [`FeatureService`] with a fixed feature set.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticFeatures(pub SchemaFeatures);

impl FeatureService for StaticFeatures {
    fn schema_features(&self) -> SchemaFeatures {
        self.0
    }
}

/// Digests the metadata of every non-system keyspace.
pub async fn calculate_schema_digest(
    storage: &dyn SchemaStorage,
    features: SchemaFeatures,
) -> Result<SchemaVersion, Error> {
    let mut bytes = Vec::new();
    for table in SchemaTable::ALL {
        if !features.digests(table) {
            continue;
        }
        for (keyspace, rows) in storage.read_schema_table(table).await? {
            if keyspace == SCHEMA_KEYSPACE {
                continue;
            }
            serde_json::to_writer(&mut bytes, &(table, &keyspace, &*rows))?;
        }
    }
    Ok(SchemaVersion::digest(&SCHEMA_DIGEST_NAMESPACE, &bytes))
}

#[derive(Debug)]
struct Inner {
    sharded: Sharded,
    storage: Arc<dyn SchemaStorage>,
    features: Arc<dyn FeatureService>,
    configs: ConfigSet,
    merge_lock: Arc<Mutex<()>>,
}

/// Applies schema changes to the shards of a node, one merge at a time.
#[derive(Clone, Debug)]
pub struct SchemaService {
    inner: Arc<Inner>,
}

impl SchemaService {
    /// Registers the configs of this crate in `configs` if the caller has
    /// not done so already.
    pub fn new(
        sharded: Sharded,
        storage: Arc<dyn SchemaStorage>,
        features: Arc<dyn FeatureService>,
        configs: ConfigSet,
    ) -> SchemaService {
        SchemaService {
            inner: Arc::new(Inner {
                sharded,
                storage,
                features,
                configs: all_dyncfgs(configs),
                merge_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    pub fn sharded(&self) -> &Sharded {
        &self.inner.sharded
    }

    pub fn storage(&self) -> &Arc<dyn SchemaStorage> {
        &self.inner.storage
    }

    pub fn configs(&self) -> &ConfigSet {
        &self.inner.configs
    }

    /// Acquires the lock that serializes merges. Must be called on shard 0.
    pub async fn hold_merge_lock(&self) -> Result<OwnedMutexGuard<()>, Error> {
        if this_shard_id() != Some(0) {
            return Err(Error::internal(format!(
                "merge lock requested outside of shard 0 (on {:?})",
                this_shard_id()
            )));
        }
        Ok(Arc::clone(&self.inner.merge_lock).lock_owned().await)
    }

    /// Applies `mutations` to storage and to the catalog of every shard,
    /// then publishes the new schema version. Callers outside of shard 0 are
    /// forwarded there.
    ///
    /// With `reload`, every table and view of every non-system keyspace is
    /// rebuilt from storage.
    pub async fn merge_schema(&self, mutations: Vec<Mutation>, reload: bool) -> Result<(), Error> {
        if this_shard_id() == Some(0) {
            return self.merge_schema_on_primary(mutations, reload).await;
        }
        debug!("forwarding {} schema mutations to shard 0", mutations.len());
        let frozen = freeze(&mutations)?;
        let service = self.clone();
        self.inner
            .sharded
            .invoke_on(0, move |_| async move {
                let mutations = unfreeze(&frozen)?;
                service.merge_schema_on_primary(mutations, reload).await
            })
            .await?
    }

    #[instrument(level = "debug", skip_all, fields(mutations = mutations.len(), reload = reload))]
    async fn merge_schema_on_primary(
        &self,
        mut mutations: Vec<Mutation>,
        reload: bool,
    ) -> Result<(), Error> {
        let _lock = self.hold_merge_lock().await?;
        self.do_merge_schema(&mut mutations, reload).await?;
        self.update_schema_version_and_announce().await?;
        Ok(())
    }

    async fn do_merge_schema(&self, mutations: &mut [Mutation], reload: bool) -> Result<(), Error> {
        let storage = Arc::clone(&self.inner.storage);
        let mut applier = SchemaApplier::new(
            self.inner.sharded.clone(),
            Arc::clone(&storage),
            self.inner.configs.clone(),
            reload,
        );
        let result = async {
            applier.prepare(mutations).await?;
            storage.apply(mutations).await?;
            applier.update().await?;
            applier.commit().await?;
            applier.notify().await
        }
        .await;
        match result {
            Ok(()) => applier.destroy().await,
            Err(e) => {
                if let Err(destroy) = applier.destroy().await {
                    warn!("failed to clean up after a failed schema merge: {destroy}");
                }
                Err(e)
            }
        }
    }

    /// Recomputes the schema version and publishes it to every shard.
    pub async fn recalculate_schema_version(&self) -> Result<SchemaVersion, Error> {
        if this_shard_id() == Some(0) {
            let _lock = self.hold_merge_lock().await?;
            return self.update_schema_version_and_announce().await;
        }
        let service = self.clone();
        self.inner
            .sharded
            .invoke_on(0, move |_| async move {
                let _lock = service.hold_merge_lock().await?;
                service.update_schema_version_and_announce().await
            })
            .await?
    }

    /// Adopts the version committed through the replicated log, if any,
    /// and otherwise digests the stored metadata.
    async fn update_schema_version_and_announce(&self) -> Result<SchemaVersion, Error> {
        let storage = &*self.inner.storage;
        let version = match storage.group0_schema_version().await? {
            Some(version) => {
                debug!("using schema version {version} committed by the replicated log");
                version
            }
            None => {
                calculate_schema_digest(storage, self.inner.features.schema_features()).await?
            }
        };
        self.inner
            .sharded
            .invoke_on_all(move |shard| {
                shard.catalog_mut().set_schema_version(version);
                future::ready(())
            })
            .await?;
        info!("schema version {version} published to every shard");
        Ok(version)
    }

    /// The schema version last published to shard 0.
    pub async fn schema_version(&self) -> Result<Option<SchemaVersion>, Error> {
        self.inner
            .sharded
            .invoke_on(0, |shard| {
                let version = shard.catalog().schema_version();
                future::ready(version)
            })
            .await
    }

    /// Creates `table` unless a table of the same name exists. Losing a race
    /// against a concurrent creator is not an error.
    pub async fn create_table_if_missing(&self, table: &TableSchema) -> Result<(), Error> {
        let keyspace = table.keyspace.clone();
        let name = table.name.clone();
        let exists = self
            .inner
            .sharded
            .invoke_on(0, move |shard| {
                let exists = shard.catalog().find_schema(&keyspace, &name).is_ok();
                future::ready(exists)
            })
            .await?;
        if exists {
            return Ok(());
        }
        let mutations = make_create_table_mutations(table, new_timestamp());
        match self.merge_schema(mutations, false).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_table_already_exists() => {
                debug!("{table} was created concurrently: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Registers `listener` on every shard.
    pub async fn register_listener(
        &self,
        listener: Arc<dyn MigrationListener>,
    ) -> Result<(), Error> {
        self.inner
            .sharded
            .invoke_on_all(move |shard| {
                shard.notifier_mut().register(Arc::clone(&listener));
                future::ready(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use crate::rows::Value;
    use crate::storage::MemSchemaStorage;

    fn aggregate_attributes(keyspace: &str) -> Mutation {
        let mut m = Mutation::new(SchemaTable::AggregateAttributes, keyspace);
        m.set_row(
            vec![Value::text("agg"), Value::text_list(["int"])],
            [("reduce_func", Some(Value::text("combine")))],
            new_timestamp(),
        );
        m
    }

    #[tokio::test]
    async fn digest_follows_schema_features() {
        let storage = MemSchemaStorage::new();
        let all = SchemaFeatures::default();
        let legacy = SchemaFeatures {
            keyspace_attributes: true,
            aggregate_attributes: false,
        };
        let empty = calculate_schema_digest(&storage, all).await.unwrap();
        assert_eq!(empty, calculate_schema_digest(&storage, legacy).await.unwrap());

        storage.apply(&[aggregate_attributes("ks")]).await.unwrap();
        assert_ne!(empty, calculate_schema_digest(&storage, all).await.unwrap());
        assert_eq!(empty, calculate_schema_digest(&storage, legacy).await.unwrap());

        storage
            .apply(&[aggregate_attributes(SCHEMA_KEYSPACE)])
            .await
            .unwrap();
        assert_eq!(empty, calculate_schema_digest(&storage, legacy).await.unwrap());
    }

    #[tokio::test]
    async fn merge_lock_is_only_available_on_shard_zero() {
        let sharded = Sharded::new(2).unwrap();
        let service = SchemaService::new(
            sharded.clone(),
            Arc::new(MemSchemaStorage::new()),
            Arc::new(StaticFeatures::default()),
            crate::config::all_dyncfgs(ConfigSet::default()),
        );
        assert!(service.hold_merge_lock().await.is_err());

        let on_one = service.clone();
        let held = sharded
            .invoke_on(1, move |_| async move { on_one.hold_merge_lock().await.is_ok() })
            .await
            .unwrap();
        assert!(!held);

        let on_zero = service.clone();
        let held = sharded
            .invoke_on(0, move |_| async move { on_zero.hold_merge_lock().await.is_ok() })
            .await
            .unwrap();
        assert!(held);
    }
}
