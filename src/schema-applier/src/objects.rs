// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runtime schema objects built from metadata rows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::types::ColumnType;

/// The stable identifier of a table or view. Survives alterations and
/// changes only when the table is dropped and created again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(pub Uuid);

impl TableId {
    /// Returns a random id, as assigned by a user-issued create statement.
    pub fn random() -> TableId {
        TableId(Uuid::new_v4())
    }

    /// Returns the deterministic id of `keyspace.name`, used for tables that
    /// several nodes may create concurrently.
    pub fn for_name(keyspace: &str, name: &str) -> TableId {
        TableId(Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{keyspace}.{name}").as_bytes(),
        ))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A content digest of a schema, either of one table or of the whole node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub Uuid);

impl SchemaVersion {
    /// Digests `bytes` within `namespace`.
    pub fn digest(namespace: &Uuid, bytes: &[u8]) -> SchemaVersion {
        SchemaVersion(Uuid::new_v5(namespace, bytes))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Static,
    Regular,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::PartitionKey => "partition_key",
            ColumnKind::Clustering => "clustering",
            ColumnKind::Static => "static",
            ColumnKind::Regular => "regular",
        }
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self, ColumnKind::PartitionKey | ColumnKind::Clustering)
    }
}

impl FromStr for ColumnKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partition_key" => Ok(ColumnKind::PartitionKey),
            "clustering" => Ok(ColumnKind::Clustering),
            "static" => Ok(ColumnKind::Static),
            "regular" => Ok(ColumnKind::Regular),
            other => Err(Error::new(ErrorKind::MalformedRow {
                column: "kind".into(),
                detail: format!("holds unknown column kind '{other}'"),
            })),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub kind: ColumnKind,
    /// Position within the partition or clustering key; `-1` for other columns.
    pub position: i64,
    pub ty: ColumnType,
}

/// The runtime schema of a table or view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    pub keyspace: String,
    pub name: String,
    pub version: SchemaVersion,
    /// Ordered by kind, then by position, then by name.
    pub columns: Vec<ColumnDefinition>,
    pub comment: Option<String>,
    /// Present iff this schema describes a view.
    pub view: Option<ViewInfo>,
}

impl TableSchema {
    pub fn is_view(&self) -> bool {
        self.view.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| c.kind.is_primary_key())
    }

    pub fn column_mapping(&self) -> ColumnMapping {
        ColumnMapping {
            table: self.id,
            version: self.version,
            columns: self
                .columns
                .iter()
                .map(|c| ColumnMappingEntry {
                    name: c.name.clone(),
                    ty: c.ty.to_string(),
                    kind: c.kind,
                })
                .collect(),
        }
    }

    /// Reports whether any column references the user type `keyspace.name`.
    pub fn references_user_type(&self, keyspace: &str, name: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.ty.references_user_type(keyspace, name))
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} id={} version={}",
            self.keyspace, self.name, self.id, self.version
        )
    }
}

/// View-specific parts of a [`TableSchema`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewInfo {
    pub base_id: TableId,
    pub base_name: String,
    pub include_all_columns: bool,
    pub where_clause: String,
    /// Derived from the base table's schema once the base has been resolved.
    pub base_info: Option<BaseDependentViewInfo>,
}

/// The parts of a view definition that depend on one version of its base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseDependentViewInfo {
    pub base_version: SchemaVersion,
    /// Regular base columns that are part of the view's primary key.
    pub base_regular_columns_in_view_pk: Vec<String>,
}

/// The layout of one version of a table, kept in history so data written
/// under an older version can still be interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub table: TableId,
    pub version: SchemaVersion,
    pub columns: Vec<ColumnMappingEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMappingEntry {
    pub name: String,
    pub ty: String,
    pub kind: ColumnKind,
}

/// How the data of a keyspace is replicated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Local,
    Everywhere,
    Simple { replication_factor: usize },
    NetworkTopology { datacenters: BTreeMap<String, usize> },
}

impl ReplicationStrategy {
    /// Parses the `replication` map of a keyspace, which holds the strategy
    /// under `class` and its options under the remaining keys.
    pub fn from_options(
        keyspace: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<ReplicationStrategy, Error> {
        let invalid = |detail: String| {
            Error::new(ErrorKind::InvalidReplication {
                keyspace: keyspace.into(),
                detail,
            })
        };
        let factor = |key: &str, value: &str| {
            value
                .parse::<usize>()
                .map_err(|_| {
                    invalid(format!(
                        "'{key}' must be a non-negative integer, got '{value}'"
                    ))
                })
        };
        let class = options
            .get("class")
            .ok_or_else(|| invalid("missing 'class'".into()))?;
        let class = class.rsplit('.').next().unwrap_or(class);
        let other_options = || options.iter().filter(|(k, _)| k.as_str() != "class");
        match class {
            "LocalStrategy" => Ok(ReplicationStrategy::Local),
            "EverywhereStrategy" => Ok(ReplicationStrategy::Everywhere),
            "SimpleStrategy" => {
                let rf = options
                    .get("replication_factor")
                    .ok_or_else(|| invalid("missing 'replication_factor'".into()))?;
                if let Some((key, _)) = other_options().find(|(k, _)| *k != "replication_factor") {
                    return Err(invalid(format!("unexpected option '{key}'")));
                }
                Ok(ReplicationStrategy::Simple {
                    replication_factor: factor("replication_factor", rf.as_str())?,
                })
            }
            "NetworkTopologyStrategy" => {
                let datacenters = other_options()
                    .map(|(dc, rf)| -> Result<(String, usize), Error> {
                        Ok((dc.clone(), factor(dc.as_str(), rf.as_str())?))
                    })
                    .collect::<Result<_, _>>()?;
                Ok(ReplicationStrategy::NetworkTopology { datacenters })
            }
            other => Err(invalid(format!("unknown replication strategy '{other}'"))),
        }
    }

    /// The total number of replicas; `None` when every node holds a replica.
    pub fn replication_factor(&self) -> Option<usize> {
        match self {
            ReplicationStrategy::Local => Some(1),
            ReplicationStrategy::Everywhere => None,
            ReplicationStrategy::Simple { replication_factor } => Some(*replication_factor),
            ReplicationStrategy::NetworkTopology { datacenters } => {
                Some(datacenters.values().sum())
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyspaceAttributes {
    pub storage_type: Option<String>,
    pub initial_tablets: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyspaceMetadata {
    pub name: String,
    pub durable_writes: bool,
    pub replication: ReplicationStrategy,
    pub replication_options: BTreeMap<String, String>,
    pub attributes: KeyspaceAttributes,
}

impl fmt::Display for KeyspaceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} durable_writes={} replication={:?}",
            self.name, self.durable_writes, self.replication_options
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replication_strategies() {
        let simple = ReplicationStrategy::from_options(
            "ks",
            &options(&[
                ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                ("replication_factor", "3"),
            ]),
        )
        .unwrap();
        assert_eq!(simple.replication_factor(), Some(3));

        let nts = ReplicationStrategy::from_options(
            "ks",
            &options(&[("class", "NetworkTopologyStrategy"), ("dc1", "3"), ("dc2", "2")]),
        )
        .unwrap();
        assert_eq!(nts.replication_factor(), Some(5));

        for bad in [
            options(&[("replication_factor", "3")]),
            options(&[("class", "SimpleStrategy")]),
            options(&[("class", "SimpleStrategy"), ("replication_factor", "x")]),
            options(&[("class", "SimpleStrategy"), ("replication_factor", "1"), ("dc1", "1")]),
            options(&[("class", "NoSuchStrategy")]),
        ] {
            assert!(matches!(
                ReplicationStrategy::from_options("ks", &bad).unwrap_err().kind(),
                ErrorKind::InvalidReplication { keyspace, .. } if keyspace == "ks"
            ));
        }
    }

    #[test]
    fn deterministic_table_ids() {
        assert_eq!(TableId::for_name("ks", "t"), TableId::for_name("ks", "t"));
        assert_ne!(TableId::for_name("ks", "t"), TableId::for_name("ks", "u"));
        assert_ne!(TableId::random(), TableId::random());
    }

    #[test]
    fn column_kinds() {
        for kind in [
            ColumnKind::PartitionKey,
            ColumnKind::Clustering,
            ColumnKind::Static,
            ColumnKind::Regular,
        ] {
            assert_eq!(kind.as_str().parse::<ColumnKind>().unwrap(), kind);
        }
        assert!("primary".parse::<ColumnKind>().is_err());
    }
}
