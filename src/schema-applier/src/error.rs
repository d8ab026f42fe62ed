// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use crate::objects::TableId;
use crate::shard::ShardId;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error {
    #[from]
    pub(crate) kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("malformed row: column '{column}' {detail}")]
    MalformedRow { column: String, detail: String },
    #[error("missing non-null column '{0}'")]
    MissingColumn(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("invalid type '{text}': {detail}")]
    InvalidType { text: String, detail: String },
    #[error("invalid replication for keyspace '{keyspace}': {detail}")]
    InvalidReplication { keyspace: String, detail: String },
    #[error("keyspace '{0}' does not exist")]
    NoSuchKeyspace(String),
    #[error("keyspace '{0}' already exists")]
    KeyspaceAlreadyExists(String),
    #[error("cannot drop non-empty keyspace '{0}'")]
    KeyspaceNotEmpty(String),
    #[error("table {keyspace}.{name} does not exist")]
    NoSuchTable { keyspace: String, name: String },
    #[error("table with id {0} does not exist")]
    NoSuchTableId(TableId),
    #[error("table {keyspace}.{name} already exists")]
    TableAlreadyExists { keyspace: String, name: String },
    #[error("cannot drop table {keyspace}.{name} while view {view} still depends on it")]
    TableHasViews {
        keyspace: String,
        name: String,
        view: String,
    },
    #[error("base table {keyspace}.{base} of view {view} not found")]
    MissingBaseTable {
        keyspace: String,
        view: String,
        base: String,
    },
    #[error("view {keyspace}.{view} is incompatible with base table {base}: {detail}")]
    IncompatibleView {
        keyspace: String,
        view: String,
        base: String,
        detail: String,
    },
    #[error("user type {keyspace}.{name} does not exist")]
    NoSuchUserType { keyspace: String, name: String },
    #[error("function {0} does not exist")]
    NoSuchFunction(String),
    #[error("replication map of keyspace '{0}' was not seeded by shard 0")]
    ReplicationMapNotSeeded(String),
    #[error("shard {0} is unavailable")]
    ShardUnavailable(ShardId),
    #[error("command of {size} bytes exceeds the maximum command size of {max} bytes")]
    CommandTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    pub(crate) fn internal(detail: impl Into<String>) -> Error {
        Error::new(ErrorKind::Internal(detail.into()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Reports whether this error is a concurrent creation of a table that
    /// already exists, which idempotent creators are allowed to ignore.
    pub fn is_table_already_exists(&self) -> bool {
        matches!(self.kind, ErrorKind::TableAlreadyExists { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::new(ErrorKind::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_convert_into_errors() {
        let e: Error = ErrorKind::NoSuchFunction("ks.f".into()).into();
        assert!(matches!(e.kind(), ErrorKind::NoSuchFunction(_)));
        assert!(!e.is_table_already_exists());
        assert_eq!(e.to_string(), "function ks.f does not exist");
    }
}
