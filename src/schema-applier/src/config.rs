// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dynamically updatable configuration.
//!
//! A type-safe static [`Config`] is defined next to the code that reads it and
//! registered once into a [`ConfigSet`]. Values inside a set are shared between
//! clones of that set, so an update made through one handle is observed by
//! every component holding a clone. Independent sets (e.g. one per unit test)
//! never observe each other.
//!
//! ```
//! # use mz_schema_applier::config::{Config, ConfigSet};
//! const FOO: Config<bool> = Config::new("foo", false, "description of foo");
//! let cfg = ConfigSet::default().add(&FOO);
//! assert_eq!(FOO.get(&cfg), false);
//! cfg.set(&FOO, true);
//! assert_eq!(FOO.get(&cfg), true);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::info;

/// A handle to a dynamically updatable configuration value of type `T`.
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T,
}

impl<T: ConfigType> Config<T> {
    /// Constructs a handle for a config of type `T`.
    ///
    /// It is best practice, but not strictly required, for the name to be
    /// globally unique within a process.
    pub const fn new(name: &'static str, default: T, desc: &'static str) -> Self {
        Config {
            name,
            desc,
            default,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn desc(&self) -> &str {
        self.desc
    }

    pub fn default(&self) -> &T {
        &self.default
    }

    /// Returns the latest value of this config within the given set.
    ///
    /// Panics if this config was not previously registered to the set.
    pub fn get(&self, set: &ConfigSet) -> T {
        let entry = set
            .configs
            .get(self.name)
            .expect("config should be registered to set");
        let val = entry.val.read().expect("lock poisoned");
        T::from_val(&val).expect("config registered with a different type")
    }
}

/// A type usable as a [`Config`].
pub trait ConfigType: Clone + Sized {
    /// Converts this type to its type-erased enum equivalent.
    fn to_val(&self) -> ConfigVal;

    /// Converts back from the type-erased representation, returning `None` if
    /// the value holds a different type.
    fn from_val(val: &ConfigVal) -> Option<Self>;
}

/// A type-erased configuration value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigVal {
    Bool(bool),
    Usize(usize),
    Duration(Duration),
}

impl fmt::Display for ConfigVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigVal::Bool(x) => write!(f, "{x}"),
            ConfigVal::Usize(x) => write!(f, "{x}"),
            ConfigVal::Duration(x) => write!(f, "{x:?}"),
        }
    }
}

impl ConfigType for bool {
    fn to_val(&self) -> ConfigVal {
        ConfigVal::Bool(*self)
    }

    fn from_val(val: &ConfigVal) -> Option<Self> {
        match val {
            ConfigVal::Bool(x) => Some(*x),
            _ => None,
        }
    }
}

impl ConfigType for usize {
    fn to_val(&self) -> ConfigVal {
        ConfigVal::Usize(*self)
    }

    fn from_val(val: &ConfigVal) -> Option<Self> {
        match val {
            ConfigVal::Usize(x) => Some(*x),
            _ => None,
        }
    }
}

impl ConfigType for Duration {
    fn to_val(&self) -> ConfigVal {
        ConfigVal::Duration(*self)
    }

    fn from_val(val: &ConfigVal) -> Option<Self> {
        match val {
            ConfigVal::Duration(x) => Some(*x),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct ConfigEntry {
    desc: &'static str,
    default: ConfigVal,
    val: Arc<RwLock<ConfigVal>>,
}

/// A set of [`Config`]s with values independent of other [`ConfigSet`]s (even
/// if they contain the same configs).
#[derive(Clone, Default, Debug)]
pub struct ConfigSet {
    configs: BTreeMap<&'static str, ConfigEntry>,
}

impl ConfigSet {
    /// Adds the given config to this set.
    ///
    /// Panics if a config with the same name has been previously registered
    /// to this set.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let default = config.default.to_val();
        let entry = ConfigEntry {
            desc: config.desc,
            default: default.clone(),
            val: Arc::new(RwLock::new(default)),
        };
        let prev = self.configs.insert(config.name, entry);
        assert!(prev.is_none(), "config {} registered twice", config.name);
        self
    }

    fn add_missing<T: ConfigType>(self, config: &Config<T>) -> Self {
        if self.configs.contains_key(config.name) {
            self
        } else {
            self.add(config)
        }
    }

    /// Updates the value of `config` for every holder of this set.
    pub fn set<T: ConfigType>(&self, config: &Config<T>, value: T) {
        let entry = self
            .configs
            .get(config.name)
            .expect("config should be registered to set");
        let value = value.to_val();
        info!(name = config.name, %value, "updating config");
        *entry.val.write().expect("lock poisoned") = value;
    }

    /// Returns `(name, description, default, current)` for every registered config.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &ConfigVal, ConfigVal)> + '_ {
        self.configs.iter().map(|(name, entry)| {
            let current = entry.val.read().expect("lock poisoned").clone();
            (*name, entry.desc, &entry.default, current)
        })
    }
}

/// Adds every config used by this crate to `configs`. Configs that are
/// already registered keep their current values.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add_missing(&crate::applier::SCHEMA_MERGE_MAX_CONCURRENT)
        .add_missing(&crate::applier::SCHEMA_MERGE_YIELD_INTERVAL)
        .add_missing(&crate::applier::SCHEMA_COLUMN_MAPPING_TTL)
        .add_missing(&crate::announce::SCHEMA_ANNOUNCE_MIN_MEMORY_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAG: Config<bool> = Config::new("test_flag", true, "a flag");
    const LIMIT: Config<usize> = Config::new("test_limit", 8, "a limit");

    #[test]
    fn set_is_shared_between_clones() {
        let a = ConfigSet::default().add(&FLAG).add(&LIMIT);
        let b = a.clone();
        assert!(FLAG.get(&b));
        a.set(&FLAG, false);
        a.set(&LIMIT, 1);
        assert!(!FLAG.get(&b));
        assert_eq!(LIMIT.get(&b), 1);

        let independent = ConfigSet::default().add(&LIMIT);
        assert_eq!(LIMIT.get(&independent), 8);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let _ = ConfigSet::default().add(&FLAG).add(&FLAG);
    }

    #[test]
    fn all_dyncfgs_registers_defaults() {
        let set = all_dyncfgs(ConfigSet::default());
        assert_eq!(crate::applier::SCHEMA_MERGE_MAX_CONCURRENT.get(&set), 8);
        assert_eq!(set.entries().count(), 4);
    }

    #[test]
    fn all_dyncfgs_keeps_registered_values() {
        let set = ConfigSet::default().add(&crate::applier::SCHEMA_MERGE_MAX_CONCURRENT);
        set.set(&crate::applier::SCHEMA_MERGE_MAX_CONCURRENT, 2);
        let set = all_dyncfgs(all_dyncfgs(set));
        assert_eq!(crate::applier::SCHEMA_MERGE_MAX_CONCURRENT.get(&set), 2);
        assert_eq!(set.entries().count(), 4);
    }
}
