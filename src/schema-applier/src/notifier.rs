// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Notification of schema changes to dependent subsystems.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::functions::RemovedFunction;
use crate::objects::{KeyspaceMetadata, TableSchema};
use crate::types::UserType;

/// A subsystem interested in schema changes.
///
/// Callbacks run on the shard whose catalog changed, after the change became
/// visible there. They must not merge schema changes themselves.
#[allow(unused_variables)]
#[async_trait(?Send)]
pub trait MigrationListener: fmt::Debug + Send + Sync {
    async fn on_create_keyspace(&self, keyspace: &KeyspaceMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update_keyspace(&self, keyspace: &KeyspaceMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_keyspace(&self, keyspace: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_create_column_family(&self, table: &TableSchema) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update_column_family(
        &self,
        table: &TableSchema,
        columns_changed: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_column_family(&self, table: &TableSchema) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_create_view(&self, view: &TableSchema) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update_view(
        &self,
        view: &TableSchema,
        columns_changed: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_view(&self, view: &TableSchema) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_create_user_type(&self, ty: &UserType) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_update_user_type(&self, ty: &UserType) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_user_type(&self, ty: &UserType) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_function(&self, function: &RemovedFunction) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_drop_aggregate(&self, aggregate: &RemovedFunction) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The event a [`MigrationNotifier`] is asked to deliver.
#[derive(Clone, Copy, Debug)]
pub enum SchemaChange<'a> {
    CreateKeyspace(&'a KeyspaceMetadata),
    UpdateKeyspace(&'a KeyspaceMetadata),
    DropKeyspace(&'a str),
    CreateTable(&'a TableSchema),
    UpdateTable(&'a TableSchema, bool),
    DropTable(&'a TableSchema),
    CreateView(&'a TableSchema),
    UpdateView(&'a TableSchema, bool),
    DropView(&'a TableSchema),
    CreateUserType(&'a UserType),
    UpdateUserType(&'a UserType),
    DropUserType(&'a UserType),
    DropFunction(&'a RemovedFunction),
}

impl fmt::Display for SchemaChange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::CreateKeyspace(ks) => write!(f, "create keyspace {}", ks.name),
            SchemaChange::UpdateKeyspace(ks) => write!(f, "update keyspace {}", ks.name),
            SchemaChange::DropKeyspace(ks) => write!(f, "drop keyspace {ks}"),
            SchemaChange::CreateTable(t) => write!(f, "create table {t}"),
            SchemaChange::UpdateTable(t, _) => write!(f, "update table {t}"),
            SchemaChange::DropTable(t) => write!(f, "drop table {t}"),
            SchemaChange::CreateView(v) => write!(f, "create view {v}"),
            SchemaChange::UpdateView(v, _) => write!(f, "update view {v}"),
            SchemaChange::DropView(v) => write!(f, "drop view {v}"),
            SchemaChange::CreateUserType(ty) => {
                write!(f, "create type {}.{}", ty.keyspace, ty.name)
            }
            SchemaChange::UpdateUserType(ty) => {
                write!(f, "update type {}.{}", ty.keyspace, ty.name)
            }
            SchemaChange::DropUserType(ty) => write!(f, "drop type {}.{}", ty.keyspace, ty.name),
            SchemaChange::DropFunction(func) if func.aggregate => {
                write!(f, "drop aggregate {}", func.name)
            }
            SchemaChange::DropFunction(func) => write!(f, "drop function {}", func.name),
        }
    }
}

/// The listeners registered on one shard.
#[derive(Clone, Debug, Default)]
pub struct MigrationNotifier {
    listeners: Vec<Arc<dyn MigrationListener>>,
}

impl MigrationNotifier {
    pub fn register(&mut self, listener: Arc<dyn MigrationListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Delivers `change` to every listener in registration order. A failing
    /// listener does not prevent delivery to the others.
    pub async fn notify(&self, change: SchemaChange<'_>) {
        for listener in &self.listeners {
            let result = match change {
                SchemaChange::CreateKeyspace(ks) => listener.on_create_keyspace(ks).await,
                SchemaChange::UpdateKeyspace(ks) => listener.on_update_keyspace(ks).await,
                SchemaChange::DropKeyspace(ks) => listener.on_drop_keyspace(ks).await,
                SchemaChange::CreateTable(t) => listener.on_create_column_family(t).await,
                SchemaChange::UpdateTable(t, columns_changed) => {
                    listener.on_update_column_family(t, columns_changed).await
                }
                SchemaChange::DropTable(t) => listener.on_drop_column_family(t).await,
                SchemaChange::CreateView(v) => listener.on_create_view(v).await,
                SchemaChange::UpdateView(v, columns_changed) => {
                    listener.on_update_view(v, columns_changed).await
                }
                SchemaChange::DropView(v) => listener.on_drop_view(v).await,
                SchemaChange::CreateUserType(ty) => listener.on_create_user_type(ty).await,
                SchemaChange::UpdateUserType(ty) => listener.on_update_user_type(ty).await,
                SchemaChange::DropUserType(ty) => listener.on_drop_user_type(ty).await,
                SchemaChange::DropFunction(func) if func.aggregate => {
                    listener.on_drop_aggregate(func).await
                }
                SchemaChange::DropFunction(func) => listener.on_drop_function(func).await,
            };
            if let Err(e) = result {
                warn!("failed to notify {change}: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::functions::FunctionName;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait(?Send)]
    impl MigrationListener for Recorder {
        async fn on_drop_keyspace(&self, keyspace: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("drop {keyspace}"));
            anyhow::bail!("listener failure")
        }

        async fn on_drop_aggregate(&self, aggregate: &RemovedFunction) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("drop aggregate {}", aggregate.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_fan_out() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let mut notifier = MigrationNotifier::default();
        notifier.register(Arc::clone(&first) as Arc<dyn MigrationListener>);
        notifier.register(Arc::clone(&second) as Arc<dyn MigrationListener>);

        notifier.notify(SchemaChange::DropKeyspace("ks")).await;
        let aggregate = RemovedFunction {
            name: FunctionName::new("ks", "agg"),
            arg_types: vec![],
            aggregate: true,
        };
        notifier.notify(SchemaChange::DropFunction(&aggregate)).await;

        for recorder in [first, second] {
            assert_eq!(
                *recorder.0.lock().unwrap(),
                vec!["drop ks".to_string(), "drop aggregate ks.agg".to_string()]
            );
        }
    }
}
