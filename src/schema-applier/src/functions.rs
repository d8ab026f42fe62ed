// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! User-defined functions and aggregates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use tracing::{debug, warn};

use crate::types::ColumnType;

/// The language whose functions are compiled before they can run.
pub const COMPILED_LANGUAGE: &str = "wasm";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionName {
    pub keyspace: String,
    pub name: String,
}

impl FunctionName {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> FunctionName {
        FunctionName {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

/// Identifies one overload of a function.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionSignature {
    pub name: FunctionName,
    /// The textual form of each argument type.
    pub arg_types: Vec<String>,
}

impl FunctionSignature {
    pub fn new(name: FunctionName, arg_types: &[ColumnType]) -> FunctionSignature {
        FunctionSignature {
            name,
            arg_types: arg_types.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.arg_types.iter().join(", "))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserFunction {
    pub name: FunctionName,
    pub arg_names: Vec<String>,
    pub arg_types: Vec<ColumnType>,
    pub return_type: ColumnType,
    pub language: String,
    pub body: String,
    pub called_on_null_input: bool,
}

impl UserFunction {
    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature::new(self.name.clone(), &self.arg_types)
    }

    pub fn is_compiled(&self) -> bool {
        self.language == COMPILED_LANGUAGE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    pub name: FunctionName,
    pub arg_types: Vec<ColumnType>,
    pub state_type: ColumnType,
    pub return_type: ColumnType,
    pub state_func: Arc<UserFunction>,
    pub final_func: Option<Arc<UserFunction>>,
    /// Combines partial states; only known when the aggregate has an
    /// attribute row.
    pub reduce_func: Option<Arc<UserFunction>>,
    pub initcond: Option<String>,
}

impl Aggregate {
    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature::new(self.name.clone(), &self.arg_types)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FunctionObject {
    Scalar(Arc<UserFunction>),
    Aggregate(Arc<Aggregate>),
}

impl FunctionObject {
    pub fn signature(&self) -> FunctionSignature {
        match self {
            FunctionObject::Scalar(f) => f.signature(),
            FunctionObject::Aggregate(a) => a.signature(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, FunctionObject::Aggregate(_))
    }
}

/// The functions and aggregates known to one shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionRegistry {
    functions: BTreeMap<FunctionSignature, FunctionObject>,
}

impl FunctionRegistry {
    pub fn get(&self, signature: &FunctionSignature) -> Option<&FunctionObject> {
        self.functions.get(signature)
    }

    /// Finds the scalar function `name` taking exactly `arg_types`.
    pub fn find_scalar(
        &self,
        name: &FunctionName,
        arg_types: &[ColumnType],
    ) -> Option<Arc<UserFunction>> {
        match self.get(&FunctionSignature::new(name.clone(), arg_types)) {
            Some(FunctionObject::Scalar(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionObject> {
        self.functions.values()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn insert(&mut self, function: FunctionObject) -> Option<FunctionObject> {
        self.functions.insert(function.signature(), function)
    }

    fn remove(&mut self, signature: &FunctionSignature) -> Option<FunctionObject> {
        self.functions.remove(signature)
    }
}

/// A function or aggregate removed by a [`ChangeBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovedFunction {
    pub name: FunctionName,
    pub arg_types: Vec<ColumnType>,
    pub aggregate: bool,
}

/// Staged changes to one shard's [`FunctionRegistry`].
///
/// The batch works on a private copy of the registry, so functions added to
/// it are visible to later additions (aggregates find their state functions
/// there) while the live registry is untouched. [`ChangeBatch::commit`]
/// swaps the copy in and evicts the stale compiled functions in one step.
#[derive(Clone, Debug)]
pub struct ChangeBatch {
    functions: FunctionRegistry,
    removed_functions: Vec<RemovedFunction>,
    evictions: Vec<FunctionSignature>,
}

impl ChangeBatch {
    pub fn new(current: &FunctionRegistry) -> ChangeBatch {
        ChangeBatch {
            functions: current.clone(),
            removed_functions: Vec::new(),
            evictions: Vec::new(),
        }
    }

    pub fn add_function(&mut self, function: FunctionObject) {
        debug!("adding function {}", function.signature());
        self.functions.insert(function);
    }

    pub fn replace_function(&mut self, function: FunctionObject) {
        debug!("replacing function {}", function.signature());
        self.functions.insert(function);
    }

    pub fn remove_function(&mut self, name: FunctionName, arg_types: Vec<ColumnType>) {
        self.remove(name, arg_types, false)
    }

    pub fn remove_aggregate(&mut self, name: FunctionName, arg_types: Vec<ColumnType>) {
        self.remove(name, arg_types, true)
    }

    fn remove(&mut self, name: FunctionName, arg_types: Vec<ColumnType>, aggregate: bool) {
        let signature = FunctionSignature::new(name.clone(), &arg_types);
        match self.functions.remove(&signature) {
            Some(_) => {
                debug!("removing function {signature}");
                self.removed_functions.push(RemovedFunction {
                    name,
                    arg_types,
                    aggregate,
                });
            }
            None => warn!("function {signature} to remove is not registered"),
        }
    }

    /// Schedules the compiled form of `signature` for eviction at commit.
    pub fn evict_compiled(&mut self, signature: FunctionSignature) {
        self.evictions.push(signature);
    }

    pub fn find_scalar(
        &self,
        name: &FunctionName,
        arg_types: &[ColumnType],
    ) -> Option<Arc<UserFunction>> {
        self.functions.find_scalar(name, arg_types)
    }

    pub fn removed_functions(&self) -> &[RemovedFunction] {
        &self.removed_functions
    }

    /// Publishes the batch. Never suspends.
    pub fn commit(self, registry: &mut FunctionRegistry, cache: &mut CompiledFunctionCache) {
        for signature in &self.evictions {
            if cache.remove(signature) {
                debug!("evicted compiled function {signature}");
            }
        }
        *registry = self.functions;
    }
}

/// A function compiled for the embedded runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledFunction {
    pub signature: FunctionSignature,
    pub module: Bytes,
}

/// Compiled functions of one shard, populated on first invocation.
#[derive(Debug, Default)]
pub struct CompiledFunctionCache {
    entries: BTreeMap<FunctionSignature, Arc<CompiledFunction>>,
}

impl CompiledFunctionCache {
    pub fn get_or_compile(&mut self, function: &UserFunction) -> Arc<CompiledFunction> {
        let signature = function.signature();
        let entry = self.entries.entry(signature.clone()).or_insert_with(|| {
            debug!("compiling function {signature}");
            Arc::new(CompiledFunction {
                signature,
                module: Bytes::from(function.body.clone().into_bytes()),
            })
        });
        Arc::clone(entry)
    }

    pub fn contains(&self, signature: &FunctionSignature) -> bool {
        self.entries.contains_key(signature)
    }

    pub fn remove(&mut self, signature: &FunctionSignature) -> bool {
        self.entries.remove(signature).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NativeType;

    fn function(name: &str, language: &str) -> Arc<UserFunction> {
        Arc::new(UserFunction {
            name: FunctionName::new("ks", name),
            arg_names: vec!["x".into()],
            arg_types: vec![ColumnType::Native(NativeType::Int)],
            return_type: ColumnType::Native(NativeType::Int),
            language: language.into(),
            body: "(module)".into(),
            called_on_null_input: false,
        })
    }

    #[test]
    fn batch_is_invisible_until_commit() {
        let mut registry = FunctionRegistry::default();
        let mut cache = CompiledFunctionCache::default();
        let mut batch = ChangeBatch::new(&registry);
        let f = function("f", COMPILED_LANGUAGE);
        batch.add_function(FunctionObject::Scalar(Arc::clone(&f)));
        assert!(batch
            .find_scalar(&f.name, &f.arg_types)
            .is_some());
        assert!(registry.is_empty());
        batch.commit(&mut registry, &mut cache);
        assert_eq!(registry.len(), 1);

        cache.get_or_compile(&f);
        assert!(cache.contains(&f.signature()));
        let mut batch = ChangeBatch::new(&registry);
        batch.evict_compiled(f.signature());
        batch.remove_function(f.name.clone(), f.arg_types.clone());
        // The cache keeps serving the old function until the batch commits.
        assert!(cache.contains(&f.signature()));
        assert_eq!(batch.removed_functions().len(), 1);
        batch.commit(&mut registry, &mut cache);
        assert!(registry.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn removing_unknown_function_is_not_recorded() {
        let registry = FunctionRegistry::default();
        let mut batch = ChangeBatch::new(&registry);
        batch.remove_aggregate(
            FunctionName::new("ks", "missing"),
            vec![ColumnType::Native(NativeType::Int)],
        );
        assert!(batch.removed_functions().is_empty());
    }
}
