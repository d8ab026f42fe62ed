// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The user types a merge is about to commit, layered over the committed
//! catalog.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use crate::applier::merge::AffectedUserTypes;
use crate::catalog::Catalog;
use crate::types::{UserTypeLookup, UserTypes};

/// Staged user types of the keyspaces touched by a merge.
///
/// Keyspaces without staged changes are absent; lookups for them fall
/// through to the committed catalog via [`TypeOverlay`].
#[derive(Clone, Debug, Default)]
pub struct InProgressTypes {
    staged: BTreeMap<String, UserTypes>,
}

impl InProgressTypes {
    /// Stages the user types of every keyspace that is created, dropped, or
    /// has type changes in this merge. Dropped keyspaces stage an empty set:
    /// nothing may refer to a type of a dying keyspace.
    pub fn new(
        catalog: &Catalog,
        created_keyspaces: &BTreeSet<String>,
        dropped_keyspaces: &BTreeSet<String>,
        types: &AffectedUserTypes,
    ) -> InProgressTypes {
        let mut staged = BTreeMap::new();
        for keyspace in created_keyspaces {
            staged.insert(keyspace.clone(), UserTypes::new());
        }
        let changed = types
            .created
            .iter()
            .chain(&types.altered)
            .chain(&types.dropped)
            .map(|ty| ty.keyspace.clone());
        for keyspace in changed {
            staged
                .entry(keyspace)
                .or_insert_with_key(|ks| catalog.user_types(ks).clone());
        }
        for ty in types.created.iter().chain(&types.altered) {
            if let Some(set) = staged.get_mut(&ty.keyspace) {
                set.add(Arc::clone(ty));
            }
        }
        for ty in &types.dropped {
            if let Some(set) = staged.get_mut(&ty.keyspace) {
                set.remove(&ty.name);
            }
        }
        for keyspace in dropped_keyspaces {
            staged.insert(keyspace.clone(), UserTypes::new());
        }
        trace!(
            "staged user types of keyspaces {:?}",
            staged.keys().collect::<Vec<_>>()
        );
        InProgressTypes { staged }
    }

    pub fn get(&self, keyspace: &str) -> Option<&UserTypes> {
        self.staged.get(keyspace)
    }
}

/// Resolves user types through the staged types of a merge, if any, and
/// otherwise through the committed catalog.
pub struct TypeOverlay<'a> {
    pub staged: Option<&'a InProgressTypes>,
    pub catalog: &'a Catalog,
}

impl UserTypeLookup for TypeOverlay<'_> {
    fn user_types(&self, keyspace: &str) -> &UserTypes {
        match self.staged.and_then(|staged| staged.get(keyspace)) {
            Some(types) => types,
            None => self.catalog.user_types(keyspace),
        }
    }
}
