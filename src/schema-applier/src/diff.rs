// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Comparison of keyed snapshots.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Error;
use crate::rows::{Row, SchemaResult};

/// The partition of the keys of two maps by where, and how, they appear.
///
/// Every key of either map lands in exactly one of the four sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapDifference<K> {
    pub entries_only_on_left: BTreeSet<K>,
    pub entries_only_on_right: BTreeSet<K>,
    pub entries_differing: BTreeSet<K>,
    pub entries_in_common: BTreeSet<K>,
}

impl<K> Default for MapDifference<K> {
    fn default() -> Self {
        MapDifference {
            entries_only_on_left: BTreeSet::new(),
            entries_only_on_right: BTreeSet::new(),
            entries_differing: BTreeSet::new(),
            entries_in_common: BTreeSet::new(),
        }
    }
}

/// Compares `left` and `right`, deciding whether values of a shared key
/// differ with `eq`.
pub fn difference<K, V, F>(
    left: &BTreeMap<K, V>,
    right: &BTreeMap<K, V>,
    eq: F,
) -> MapDifference<K>
where
    K: Ord + Clone,
    F: Fn(&V, &V) -> bool,
{
    let mut diff = MapDifference::default();
    for (key, left_value) in left {
        match right.get(key) {
            None => {
                diff.entries_only_on_left.insert(key.clone());
            }
            Some(right_value) if eq(left_value, right_value) => {
                diff.entries_in_common.insert(key.clone());
            }
            Some(_) => {
                diff.entries_differing.insert(key.clone());
            }
        }
    }
    for key in right.keys() {
        if !left.contains_key(key) {
            diff.entries_only_on_right.insert(key.clone());
        }
    }
    diff
}

/// Value equality through a smart pointer: compares the pointees, never the
/// pointers.
pub fn indirect_equal<P, T>(a: &P, b: &P) -> bool
where
    P: std::ops::Deref<Target = T>,
    T: PartialEq + ?Sized,
{
    **a == **b
}

/// Rows created, altered or dropped between two snapshots of a metadata
/// table, identified by primary key. Rows of one keyspace are adjacent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowDiff {
    pub created: Vec<Row>,
    /// The new version of each altered row.
    pub altered: Vec<Row>,
    pub dropped: Vec<Row>,
}

impl RowDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

fn collect_rows(keys: &BTreeSet<String>, result: &SchemaResult) -> Vec<Row> {
    keys.iter()
        .filter_map(|key| result.get(key))
        .flat_map(|rs| rs.rows().iter().cloned())
        .collect()
}

/// Diffs two snapshots, first by keyspace and then, within keyspaces whose
/// rows changed, by primary key.
pub fn diff_rows(before: &SchemaResult, after: &SchemaResult) -> Result<RowDiff, Error> {
    let diff = difference(before, after, indirect_equal);

    let mut result = RowDiff {
        // Keyspaces now without rows.
        dropped: collect_rows(&diff.entries_only_on_left, before),
        // New keyspaces with rows.
        created: collect_rows(&diff.entries_only_on_right, after),
        altered: Vec::new(),
    };
    for key in &diff.entries_differing {
        let before_rows = before[key].row_map()?;
        let after_rows = after[key].row_map()?;
        let row_diff = difference(&before_rows, &after_rows, |a, b| a == b);
        for pk in &row_diff.entries_only_on_left {
            result.dropped.push(before_rows[pk].clone());
        }
        for pk in &row_diff.entries_only_on_right {
            result.created.push(after_rows[pk].clone());
        }
        for pk in &row_diff.entries_differing {
            result.altered.push(after_rows[pk].clone());
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::rows::{ResultSet, Value};
    use crate::schema_tables::SchemaTable;

    fn type_row(ks: &str, name: &str, field: &str) -> Row {
        Row::new(
            [
                ("keyspace_name".to_string(), Value::text(ks)),
                ("type_name".to_string(), Value::text(name)),
                ("field_names".to_string(), Value::text_list([field])),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn snapshot(rows: &[(&str, &str, &str)]) -> SchemaResult {
        let mut by_keyspace = BTreeMap::<&str, Vec<Row>>::new();
        for &(ks, name, field) in rows {
            by_keyspace
                .entry(ks)
                .or_default()
                .push(type_row(ks, name, field));
        }
        by_keyspace
            .into_iter()
            .map(|(ks, rows)| {
                (
                    ks.to_string(),
                    Arc::new(ResultSet::new(SchemaTable::Types, rows)),
                )
            })
            .collect()
    }

    #[test]
    fn shared_values_compare_by_content() {
        let left: BTreeMap<_, _> = [("a", Arc::new(1)), ("b", Arc::new(2))].into();
        let right: BTreeMap<_, _> =
            [("a", Arc::new(1)), ("b", Arc::new(3)), ("c", Arc::new(4))].into();
        let diff = difference(&left, &right, indirect_equal);
        assert_eq!(diff.entries_in_common, ["a"].into());
        assert_eq!(diff.entries_differing, ["b"].into());
        assert_eq!(diff.entries_only_on_right, ["c"].into());
        assert!(diff.entries_only_on_left.is_empty());
    }

    #[test]
    fn two_level_row_diff() {
        let before = snapshot(&[("ks1", "a", "x"), ("ks1", "b", "x"), ("ks2", "c", "x")]);
        let after = snapshot(&[("ks1", "a", "y"), ("ks1", "d", "x"), ("ks3", "e", "x")]);
        let diff = diff_rows(&before, &after).unwrap();
        let names = |rows: &[Row]| -> Vec<String> {
            rows.iter()
                .map(|r| r.get_nonnull::<String>("type_name").unwrap())
                .collect()
        };
        assert_eq!(names(&diff.altered), vec!["a"]);
        assert_eq!(names(&diff.created), vec!["e", "d"]);
        assert_eq!(names(&diff.dropped), vec!["c", "b"]);

        assert!(diff_rows(&after, &after).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn difference_covers_every_key(
            left in proptest::collection::btree_map(0u8..32, 0u8..4, 0..24),
            right in proptest::collection::btree_map(0u8..32, 0u8..4, 0..24),
        ) {
            let diff = difference(&left, &right, |a, b| a == b);
            let all: BTreeSet<_> = left.keys().chain(right.keys()).copied().collect();
            for key in all {
                let hits = [
                    diff.entries_only_on_left.contains(&key),
                    diff.entries_only_on_right.contains(&key),
                    diff.entries_differing.contains(&key),
                    diff.entries_in_common.contains(&key),
                ]
                .into_iter()
                .filter(|hit| *hit)
                .count();
                prop_assert_eq!(hits, 1);
            }
            let total = diff.entries_only_on_left.len()
                + diff.entries_only_on_right.len()
                + diff.entries_differing.len()
                + diff.entries_in_common.len();
            prop_assert_eq!(total, left.keys().chain(right.keys()).collect::<BTreeSet<_>>().len());
        }
    }
}
