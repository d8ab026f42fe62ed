// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Raw write-sets addressed to metadata tables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rows::Value;
use crate::schema_tables::SchemaTable;

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Returns a timestamp that is strictly greater than every timestamp
/// previously returned in this process.
pub fn new_timestamp() -> Timestamp {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    let mut prev = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = std::cmp::max(now, prev + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// A timestamped cell write. A `None` value deletes the cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: Option<Value>,
    pub timestamp: Timestamp,
}

impl Cell {
    pub fn live(value: Value, timestamp: Timestamp) -> Cell {
        Cell {
            value: Some(value),
            timestamp,
        }
    }

    pub fn dead(timestamp: Timestamp) -> Cell {
        Cell {
            value: None,
            timestamp,
        }
    }

    pub fn is_live(&self) -> bool {
        self.value.is_some()
    }
}

/// Writes to a single clustering row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub clustering: Vec<Value>,
    /// Keeps the row alive even when it has no live cells.
    pub marker: Option<Timestamp>,
    pub tombstone: Option<Timestamp>,
    pub cells: BTreeMap<String, Cell>,
}

/// Deletes every row whose clustering key falls within `[start, end]`,
/// comparing by prefix. An empty bound is unbounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: Vec<Value>,
    pub end: Vec<Value>,
    pub timestamp: Timestamp,
}

impl RangeTombstone {
    pub fn covers(&self, clustering: &[Value]) -> bool {
        let prefix = |len: usize| &clustering[..std::cmp::min(len, clustering.len())];
        prefix(self.start.len()) >= self.start.as_slice()
            && (self.end.is_empty() || prefix(self.end.len()) <= self.end.as_slice())
    }
}

/// A write-set for one partition (keyspace) of one metadata table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub table: SchemaTable,
    pub keyspace: String,
    pub partition_tombstone: Option<Timestamp>,
    pub range_tombstones: Vec<RangeTombstone>,
    pub rows: Vec<RowUpdate>,
}

impl Mutation {
    pub fn new(table: SchemaTable, keyspace: impl Into<String>) -> Mutation {
        Mutation {
            table,
            keyspace: keyspace.into(),
            partition_tombstone: None,
            range_tombstones: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Returns the update for the row at `clustering`, creating it if needed.
    pub fn row_mut(&mut self, clustering: Vec<Value>) -> &mut RowUpdate {
        let pos = match self.rows.iter().position(|r| r.clustering == clustering) {
            Some(pos) => pos,
            None => {
                self.rows.push(RowUpdate {
                    clustering,
                    marker: None,
                    tombstone: None,
                    cells: BTreeMap::new(),
                });
                self.rows.len() - 1
            }
        };
        &mut self.rows[pos]
    }

    /// Writes a live row with the given cells.
    pub fn set_row<I>(&mut self, clustering: Vec<Value>, cells: I, timestamp: Timestamp)
    where
        I: IntoIterator<Item = (&'static str, Option<Value>)>,
    {
        let row = self.row_mut(clustering);
        row.marker = Some(timestamp);
        for (column, value) in cells {
            let cell = match value {
                Some(value) => Cell::live(value, timestamp),
                None => Cell::dead(timestamp),
            };
            row.cells.insert(column.into(), cell);
        }
    }

    pub fn delete_row(&mut self, clustering: Vec<Value>, timestamp: Timestamp) {
        self.row_mut(clustering).tombstone = Some(timestamp);
    }

    pub fn delete_range(&mut self, start: Vec<Value>, end: Vec<Value>, timestamp: Timestamp) {
        self.range_tombstones.push(RangeTombstone {
            start,
            end,
            timestamp,
        });
    }

    pub fn delete_partition(&mut self, timestamp: Timestamp) {
        self.partition_tombstone = Some(timestamp);
    }

    pub fn freeze(&self) -> Result<FrozenMutation, Error> {
        Ok(FrozenMutation(Bytes::from(serde_json::to_vec(self)?)))
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}.{} rows={} range_tombstones={} partition_tombstone={:?}}}",
            self.table,
            self.keyspace,
            self.rows.len(),
            self.range_tombstones.len(),
            self.partition_tombstone
        )
    }
}

/// The serialized form of a [`Mutation`], suitable for crossing shard
/// boundaries and for measuring command sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrozenMutation(Bytes);

impl FrozenMutation {
    pub fn unfreeze(&self) -> Result<Mutation, Error> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn representation(&self) -> &Bytes {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn freeze(mutations: &[Mutation]) -> Result<Vec<FrozenMutation>, Error> {
    mutations.iter().map(Mutation::freeze).collect()
}

pub fn unfreeze(frozen: &[FrozenMutation]) -> Result<Vec<Mutation>, Error> {
    frozen.iter().map(FrozenMutation::unfreeze).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let a = new_timestamp();
        let b = new_timestamp();
        assert!(b > a);
    }

    #[test]
    fn range_tombstone_prefix_bounds() {
        let rt = RangeTombstone {
            start: vec![Value::text("t")],
            end: vec![Value::text("t")],
            timestamp: 1,
        };
        assert!(rt.covers(&[Value::text("t"), Value::text("c1")]));
        assert!(!rt.covers(&[Value::text("u"), Value::text("c1")]));
        assert!(!rt.covers(&[Value::text("s"), Value::text("zz")]));

        let everything = RangeTombstone {
            start: vec![],
            end: vec![],
            timestamp: 1,
        };
        assert!(everything.covers(&[Value::text("anything")]));
    }

    #[test]
    fn frozen_mutation_survives_unfreeze() {
        let mut m = Mutation::new(SchemaTable::Types, "ks");
        m.set_row(
            vec![Value::text("address")],
            [("field_names", Some(Value::text_list(["street"])))],
            7,
        );
        let frozen = m.freeze().unwrap();
        assert!(!frozen.is_empty());
        assert_eq!(frozen.unfreeze().unwrap(), m);
    }
}
