// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Schema change application for a sharded database node.
//!
//! Schema changes arrive as batches of [`Mutation`]s to the metadata tables
//! of the [`schema_tables`] module. [`SchemaService::merge_schema`] applies a
//! batch to [`storage`](storage::SchemaStorage), diffs the metadata it
//! touched before and after, and publishes the resulting keyspaces, user
//! types, tables, views, functions, and aggregates to the [`Catalog`] of
//! every [shard](shard::Sharded), notifying registered
//! [`MigrationListener`]s once the changes are visible.
//!
//! The heavy lifting happens in [`SchemaApplier`], whose phases are
//! documented in the [`applier`] module.

pub mod announce;
pub mod applier;
pub mod catalog;
pub mod config;
pub mod create;
pub mod diff;
pub mod error;
pub mod functions;
pub mod mutation;
pub mod notifier;
pub mod objects;
pub mod rows;
pub mod schema_tables;
pub mod service;
pub mod shard;
pub mod storage;
pub mod types;

pub use crate::applier::{AffectedSchema, SchemaApplier};
pub use crate::catalog::Catalog;
pub use crate::config::{all_dyncfgs, Config, ConfigSet};
pub use crate::error::{Error, ErrorKind};
pub use crate::mutation::{FrozenMutation, Mutation};
pub use crate::notifier::{MigrationListener, MigrationNotifier};
pub use crate::service::{FeatureService, SchemaFeatures, SchemaService, StaticFeatures};
pub use crate::shard::Sharded;
pub use crate::storage::{MemSchemaStorage, SchemaStorage};
