// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Point-in-time views of the rows stored in metadata tables.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::schema_tables::SchemaTable;

/// A single cell value of a metadata row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
    List(Vec<Value>),
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    pub fn text_list<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::Text(s.into())).collect())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Int(_) => "bigint",
            Value::Text(_) => "text",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(x) => write!(f, "{x}"),
            Value::Int(x) => write!(f, "{x}"),
            Value::Text(x) => write!(f, "'{x}'"),
            Value::Uuid(x) => write!(f, "{x}"),
            Value::List(xs) => write!(f, "[{}]", xs.iter().join(", ")),
            Value::Map(m) => write!(
                f,
                "{{{}}}",
                m.iter().map(|(k, v)| format!("'{k}': '{v}'")).join(", ")
            ),
        }
    }
}

/// Conversion from a cell [`Value`] into a typed Rust value.
pub trait FromValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(x) => Some(*x),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const TYPE_NAME: &'static str = "bigint";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }
}

impl FromValue for String {
    const TYPE_NAME: &'static str = "text";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(x) => Some(x.clone()),
            _ => None,
        }
    }
}

impl FromValue for Uuid {
    const TYPE_NAME: &'static str = "uuid";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Uuid(x) => Some(*x),
            _ => None,
        }
    }
}

impl FromValue for Vec<String> {
    const TYPE_NAME: &'static str = "list<text>";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(xs) => xs.iter().map(String::from_value).collect(),
            _ => None,
        }
    }
}

impl FromValue for BTreeMap<String, String> {
    const TYPE_NAME: &'static str = "map<text, text>";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Map(m) => Some(m.clone()),
            _ => None,
        }
    }
}

/// A live row of a metadata table. Columns without a live cell are absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    cells: BTreeMap<String, Value>,
}

impl Row {
    pub fn new(cells: BTreeMap<String, Value>) -> Row {
        Row { cells }
    }

    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.cells.get(column)
    }

    /// Returns the typed value of `column`, or `None` if the cell is null.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<Option<T>, Error> {
        match self.cells.get(column) {
            None => Ok(None),
            Some(value) => T::from_value(value).map(Some).ok_or_else(|| {
                Error::new(ErrorKind::MalformedRow {
                    column: column.into(),
                    detail: format!(
                        "holds {} but {} was expected",
                        value.type_name(),
                        T::TYPE_NAME
                    ),
                })
            }),
        }
    }

    /// Returns the typed value of `column`, which must not be null.
    pub fn get_nonnull<T: FromValue>(&self, column: &str) -> Result<T, Error> {
        self.get(column)?
            .ok_or_else(|| Error::new(ErrorKind::MissingColumn(column.into())))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The rows of one partition of a metadata table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    table: SchemaTable,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(table: SchemaTable, rows: Vec<Row>) -> ResultSet {
        ResultSet { table, rows }
    }

    pub fn empty(table: SchemaTable) -> ResultSet {
        ResultSet::new(table, Vec::new())
    }

    pub fn table(&self) -> SchemaTable {
        self.table
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Returns the primary key of `row`: the partition key followed by every
    /// clustering column.
    pub fn primary_key(&self, row: &Row) -> Result<Vec<Value>, Error> {
        self.table
            .primary_key_columns()
            .map(|column| {
                row.get_value(column)
                    .cloned()
                    .ok_or_else(|| Error::new(ErrorKind::MissingColumn(column.into())))
            })
            .collect()
    }

    /// Indexes the rows by primary key.
    pub fn row_map(&self) -> Result<BTreeMap<Vec<Value>, &Row>, Error> {
        self.rows
            .iter()
            .map(|row| -> Result<_, Error> { Ok((self.primary_key(row)?, row)) })
            .collect()
    }

    /// Returns the rows whose text `column` equals `value`.
    pub fn filter(&self, column: &str, value: &str) -> ResultSet {
        let rows = self
            .rows
            .iter()
            .filter(|row| matches!(row.get_value(column), Some(Value::Text(v)) if v == value))
            .cloned()
            .collect();
        ResultSet::new(self.table, rows)
    }
}

/// A snapshot of one metadata table: keyspace name to the non-empty set of
/// rows stored for that keyspace.
pub type SchemaResult = BTreeMap<String, Arc<ResultSet>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(&str, Value)]) -> Row {
        Row::new(
            cells
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn typed_getters() {
        let r = row(&[
            ("keyspace_name", Value::text("ks")),
            ("durable_writes", Value::Bool(true)),
            ("names", Value::text_list(["a", "b"])),
        ]);
        assert_eq!(r.get_nonnull::<String>("keyspace_name").unwrap(), "ks");
        assert_eq!(r.get::<bool>("durable_writes").unwrap(), Some(true));
        assert_eq!(r.get::<i64>("missing").unwrap(), None);
        assert_eq!(
            r.get_nonnull::<Vec<String>>("names").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(matches!(
            r.get_nonnull::<i64>("missing").unwrap_err().kind(),
            ErrorKind::MissingColumn(_)
        ));
        assert!(matches!(
            r.get::<i64>("durable_writes").unwrap_err().kind(),
            ErrorKind::MalformedRow { .. }
        ));
    }

    #[test]
    fn row_map_uses_primary_key() {
        let rs = ResultSet::new(
            SchemaTable::Types,
            vec![
                row(&[
                    ("keyspace_name", Value::text("ks")),
                    ("type_name", Value::text("b")),
                ]),
                row(&[
                    ("keyspace_name", Value::text("ks")),
                    ("type_name", Value::text("a")),
                ]),
            ],
        );
        let keys: Vec<_> = rs.row_map().unwrap().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                vec![Value::text("ks"), Value::text("a")],
                vec![Value::text("ks"), Value::text("b")],
            ]
        );
        assert_eq!(rs.filter("type_name", "a").rows().len(), 1);
    }
}
