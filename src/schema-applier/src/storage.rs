// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Access to the persisted metadata tables.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::Error;
use crate::mutation::{Cell, Mutation, RangeTombstone, Timestamp};
use crate::objects::{ColumnMapping, SchemaVersion, TableId, TableSchema};
use crate::rows::{ResultSet, Row, SchemaResult, Value};
use crate::schema_tables::SchemaTable;

/// The storage layer holding the metadata tables and the column mapping
/// history.
#[async_trait]
pub trait SchemaStorage: Debug + Send + Sync {
    /// Reads the live rows of `table` stored for `keyspace`.
    async fn read_schema_partition(
        &self,
        table: SchemaTable,
        keyspace: &str,
    ) -> Result<Arc<ResultSet>, Error>;

    /// Reads every non-empty partition of `table`.
    async fn read_schema_table(&self, table: SchemaTable) -> Result<SchemaResult, Error>;

    /// Applies `mutations` without any durability barrier beyond the
    /// storage default.
    async fn apply(&self, mutations: &[Mutation]) -> Result<(), Error>;

    /// Records the column mapping of `table`'s current version. Entries
    /// stored with a `ttl` expire once it elapses.
    async fn store_column_mapping(
        &self,
        table: &TableSchema,
        ttl: Option<Duration>,
    ) -> Result<(), Error>;

    /// Deletes every recorded column mapping of `table`.
    async fn drop_column_mapping(&self, table: TableId) -> Result<(), Error>;

    async fn read_column_mapping(
        &self,
        table: TableId,
        version: SchemaVersion,
    ) -> Result<Option<ColumnMapping>, Error>;

    /// The schema version committed through the replicated log, if the log
    /// manages the schema.
    async fn group0_schema_version(&self) -> Result<Option<SchemaVersion>, Error> {
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct StoredRow {
    marker: Option<Timestamp>,
    tombstone: Option<Timestamp>,
    cells: BTreeMap<String, Cell>,
}

#[derive(Debug, Default)]
struct Partition {
    tombstone: Option<Timestamp>,
    range_tombstones: Vec<RangeTombstone>,
    rows: BTreeMap<Vec<Value>, StoredRow>,
}

impl Partition {
    fn apply(&mut self, m: &Mutation) {
        if let Some(ts) = m.partition_tombstone {
            self.tombstone = std::cmp::max(self.tombstone, Some(ts));
            self.range_tombstones.retain(|rt| rt.timestamp > ts);
        }
        for rt in &m.range_tombstones {
            self.add_range_tombstone(rt);
        }
        for update in &m.rows {
            let row = self.rows.entry(update.clustering.clone()).or_default();
            if let Some(ts) = update.marker {
                row.marker = std::cmp::max(row.marker, Some(ts));
            }
            if let Some(ts) = update.tombstone {
                row.tombstone = std::cmp::max(row.tombstone, Some(ts));
            }
            for (column, cell) in &update.cells {
                let wins = match row.cells.get(column) {
                    None => true,
                    // Deletions win timestamp ties.
                    Some(existing) => {
                        cell.timestamp > existing.timestamp
                            || (cell.timestamp == existing.timestamp
                                && (existing.is_live() || !cell.is_live()))
                    }
                };
                if wins {
                    row.cells.insert(column.clone(), cell.clone());
                }
            }
        }
    }

    /// Keeps at most one tombstone per range. Tombstones no newer than the
    /// partition tombstone are dropped.
    fn add_range_tombstone(&mut self, rt: &RangeTombstone) {
        if self.tombstone.is_some_and(|ts| rt.timestamp <= ts) {
            return;
        }
        let same_range = self
            .range_tombstones
            .iter_mut()
            .find(|existing| existing.start == rt.start && existing.end == rt.end);
        match same_range {
            Some(existing) => existing.timestamp = existing.timestamp.max(rt.timestamp),
            None => self.range_tombstones.push(rt.clone()),
        }
    }

    /// Returns the live rows, each holding the partition key, the clustering
    /// columns and every live regular cell.
    fn live_rows(&self, table: SchemaTable, keyspace: &str) -> Vec<Row> {
        let clustering_columns = table.clustering_key_columns();
        let mut rows = Vec::new();
        for (clustering, stored) in &self.rows {
            let deleted_at = self
                .range_tombstones
                .iter()
                .filter(|rt| rt.covers(clustering))
                .map(|rt| rt.timestamp)
                .chain(self.tombstone)
                .chain(stored.tombstone)
                .max();
            let alive = |ts: Timestamp| deleted_at.map_or(true, |d| ts > d);
            let mut cells: BTreeMap<String, Value> = stored
                .cells
                .iter()
                .filter(|(_, cell)| alive(cell.timestamp))
                .filter_map(|(column, cell)| Some((column.clone(), cell.value.clone()?)))
                .collect();
            let has_marker = stored.marker.is_some_and(alive);
            if cells.is_empty() && !has_marker {
                continue;
            }
            cells.insert(
                table.partition_key_column().into(),
                Value::text(keyspace),
            );
            for (column, value) in clustering_columns.iter().zip(clustering) {
                cells.insert((*column).into(), value.clone());
            }
            rows.push(Row::new(cells));
        }
        rows
    }
}

#[derive(Debug)]
struct StoredMapping {
    mapping: ColumnMapping,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemState {
    partitions: BTreeMap<(SchemaTable, String), Partition>,
    column_mappings: BTreeMap<(TableId, SchemaVersion), StoredMapping>,
    group0_schema_version: Option<SchemaVersion>,
}

/// An in-memory [`SchemaStorage`] with last-write-wins cells.
#[derive(Debug, Default, Clone)]
pub struct MemSchemaStorage {
    state: Arc<Mutex<MemState>>,
}

impl MemSchemaStorage {
    pub fn new() -> MemSchemaStorage {
        MemSchemaStorage::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemState>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::internal("schema storage lock poisoned"))
    }

    /// Makes the replicated log report `version` as the committed schema
    /// version.
    pub fn set_group0_schema_version(&self, version: Option<SchemaVersion>) -> Result<(), Error> {
        self.state()?.group0_schema_version = version;
        Ok(())
    }

    /// Returns the unexpired column mappings of `table` with their remaining
    /// time to live.
    pub fn column_mappings(
        &self,
        table: TableId,
    ) -> Result<Vec<(ColumnMapping, Option<Duration>)>, Error> {
        let now = Instant::now();
        let state = self.state()?;
        let mappings = state
            .column_mappings
            .range((table, SchemaVersion(uuid::Uuid::nil()))..)
            .take_while(|((id, _), _)| *id == table)
            .filter(|(_, stored)| stored.expires_at.map_or(true, |at| at > now))
            .map(|(_, stored)| {
                (
                    stored.mapping.clone(),
                    stored.expires_at.map(|at| at.saturating_duration_since(now)),
                )
            })
            .collect();
        Ok(mappings)
    }
}

#[async_trait]
impl SchemaStorage for MemSchemaStorage {
    async fn read_schema_partition(
        &self,
        table: SchemaTable,
        keyspace: &str,
    ) -> Result<Arc<ResultSet>, Error> {
        let state = self.state()?;
        let rows = state
            .partitions
            .get(&(table, keyspace.to_string()))
            .map(|p| p.live_rows(table, keyspace))
            .unwrap_or_default();
        trace!("read {} rows of {table} for keyspace {keyspace}", rows.len());
        Ok(Arc::new(ResultSet::new(table, rows)))
    }

    async fn read_schema_table(&self, table: SchemaTable) -> Result<SchemaResult, Error> {
        let state = self.state()?;
        let mut result = SchemaResult::new();
        for ((t, keyspace), partition) in &state.partitions {
            if *t != table {
                continue;
            }
            let rows = partition.live_rows(table, keyspace);
            if !rows.is_empty() {
                result.insert(keyspace.clone(), Arc::new(ResultSet::new(table, rows)));
            }
        }
        Ok(result)
    }

    async fn apply(&self, mutations: &[Mutation]) -> Result<(), Error> {
        let mut state = self.state()?;
        for m in mutations {
            trace!("applying {m}");
            state
                .partitions
                .entry((m.table, m.keyspace.clone()))
                .or_default()
                .apply(m);
        }
        debug!("applied {} schema mutations", mutations.len());
        Ok(())
    }

    async fn store_column_mapping(
        &self,
        table: &TableSchema,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let mapping = table.column_mapping();
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state()?
            .column_mappings
            .insert((table.id, table.version), StoredMapping { mapping, expires_at });
        Ok(())
    }

    async fn drop_column_mapping(&self, table: TableId) -> Result<(), Error> {
        self.state()?
            .column_mappings
            .retain(|(id, _), _| *id != table);
        Ok(())
    }

    async fn read_column_mapping(
        &self,
        table: TableId,
        version: SchemaVersion,
    ) -> Result<Option<ColumnMapping>, Error> {
        let now = Instant::now();
        let state = self.state()?;
        Ok(state
            .column_mappings
            .get(&(table, version))
            .filter(|stored| stored.expires_at.map_or(true, |at| at > now))
            .map(|stored| stored.mapping.clone()))
    }

    async fn group0_schema_version(&self) -> Result<Option<SchemaVersion>, Error> {
        Ok(self.state()?.group0_schema_version)
    }
}
