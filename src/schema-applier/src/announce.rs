// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Announcement of mutations through the replicated log.
//!
//! A command of the log has a size limit, so large sets of mutations are
//! produced lazily and split into several commands.

use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::{Config, ConfigSet};
use crate::error::{Error, ErrorKind};
use crate::mutation::{FrozenMutation, Mutation, Timestamp};

pub const SCHEMA_ANNOUNCE_MIN_MEMORY_THRESHOLD: Config<usize> = Config::new(
    "schema_announce_min_memory_threshold",
    1000,
    "Lower bound, in bytes, of the serialized size at which announced mutations are cut \
     into a separate command.",
);

const DESCRIPTION: &str = "modify internal data";

/// Permission to append one command to the replicated log. Operations that
/// read before they write must hold the guard across the read.
#[derive(Debug)]
pub struct WriteGuard {
    write_timestamp: Timestamp,
}

impl WriteGuard {
    pub fn new(write_timestamp: Timestamp) -> WriteGuard {
        WriteGuard { write_timestamp }
    }

    /// The timestamp mutations written under this guard must use.
    pub fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp
    }
}

/// A client of the replicated log.
#[async_trait]
pub trait Group0Client: Debug + Send + Sync {
    async fn start_operation(&self) -> Result<WriteGuard, Error>;

    /// Appends `mutations` as a single command. Fails with
    /// [`ErrorKind::CommandTooLarge`] if the command exceeds
    /// [`Group0Client::max_command_size`].
    async fn announce(
        &self,
        mutations: Vec<FrozenMutation>,
        guard: WriteGuard,
        description: &str,
    ) -> Result<(), Error>;

    fn max_command_size(&self) -> usize;
}

/// The write timestamp of the most recently acquired guard, shared with a
/// mutation generator.
#[derive(Clone, Default)]
pub struct WriteTimestamp(Arc<AtomicI64>);

impl WriteTimestamp {
    pub fn get(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, timestamp: Timestamp) {
        self.0.store(timestamp, Ordering::SeqCst)
    }
}

impl Debug for WriteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteTimestamp").field(&self.get()).finish()
    }
}

/// Announces `mutations` as one command under `guard`.
pub async fn announce_mutations_with_guard(
    client: &dyn Group0Client,
    mutations: &[Mutation],
    guard: WriteGuard,
) -> Result<(), Error> {
    let frozen = crate::mutation::freeze(mutations)?;
    client.announce(frozen, guard, DESCRIPTION).await
}

/// Announces the mutations produced by `generate`, cutting a new command
/// whenever the accumulated serialized size reaches three quarters of the
/// client's maximum command size.
///
/// A guard is acquired before `generate` runs, so reads it performs are
/// linearized with the first command. Later commands acquire fresh guards,
/// whose timestamps `generate` observes through its [`WriteTimestamp`].
pub async fn announce_mutations_with_batching<F, I>(
    client: &dyn Group0Client,
    configs: &ConfigSet,
    generate: F,
) -> Result<(), Error>
where
    F: FnOnce(WriteTimestamp) -> I,
    I: IntoIterator<Item = Result<Mutation, Error>>,
{
    let guard = client.start_operation().await?;
    announce_batched(client, configs, guard, generate).await
}

async fn announce_batched<F, I>(
    client: &dyn Group0Client,
    configs: &ConfigSet,
    guard: WriteGuard,
    generate: F,
) -> Result<(), Error>
where
    F: FnOnce(WriteTimestamp) -> I,
    I: IntoIterator<Item = Result<Mutation, Error>>,
{
    let threshold = std::cmp::max(
        client.max_command_size() / 4 * 3,
        SCHEMA_ANNOUNCE_MIN_MEMORY_THRESHOLD.get(configs),
    );
    let timestamp = WriteTimestamp::default();
    timestamp.set(guard.write_timestamp());
    let mut guard = Some(guard);

    let mut batch = Vec::new();
    let mut memory_usage = 0;
    for mutation in generate(timestamp.clone()) {
        let frozen = mutation?.freeze()?;
        memory_usage += frozen.len();
        batch.push(frozen);
        if memory_usage >= threshold {
            let full = std::mem::take(&mut batch);
            announce_splitting(client, full, &mut guard, &timestamp).await?;
            memory_usage = 0;
        }
    }
    if !batch.is_empty() {
        announce_splitting(client, batch, &mut guard, &timestamp).await?;
    }
    Ok(())
}

/// Announces `batch`, halving it for as long as the log rejects it as too
/// large. Every attempt after the first uses a fresh guard.
async fn announce_splitting(
    client: &dyn Group0Client,
    batch: Vec<FrozenMutation>,
    guard: &mut Option<WriteGuard>,
    timestamp: &WriteTimestamp,
) -> Result<(), Error> {
    let mut pending = VecDeque::from([batch]);
    while let Some(mut batch) = pending.pop_front() {
        let current = match guard.take() {
            Some(current) => current,
            None => {
                let fresh = client.start_operation().await?;
                timestamp.set(fresh.write_timestamp());
                fresh
            }
        };
        let size: usize = batch.iter().map(FrozenMutation::len).sum();
        debug!("announcing {} mutations of {size} bytes", batch.len());
        match client.announce(batch.clone(), current, DESCRIPTION).await {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::CommandTooLarge { .. }) => {
                if batch.len() <= 1 {
                    error!("cannot announce a single mutation of {size} bytes: {e}");
                    return Err(e);
                }
                let second = batch.split_off(batch.len() / 2);
                warn!(
                    "command of {size} bytes rejected, retrying as {} and {} mutations",
                    batch.len(),
                    second.len()
                );
                pending.push_front(second);
                pending.push_front(batch);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Lazily produces mutations for a [`MutationsCollector`].
pub type MutationGenerator =
    Box<dyn FnOnce(WriteTimestamp) -> Box<dyn Iterator<Item = Result<Mutation, Error>>> + Send>;

/// Gathers mutations written under a single guard and announces them
/// together.
///
/// Dropping a collector that still holds mutations loses them.
pub struct MutationsCollector {
    guard: Option<WriteGuard>,
    mutations: Vec<Mutation>,
    generators: Vec<MutationGenerator>,
}

impl Debug for MutationsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationsCollector")
            .field("guard", &self.guard)
            .field("mutations", &self.mutations.len())
            .field("generators", &self.generators.len())
            .finish()
    }
}

impl MutationsCollector {
    pub fn new(guard: WriteGuard) -> MutationsCollector {
        MutationsCollector {
            guard: Some(guard),
            mutations: Vec::new(),
            generators: Vec::new(),
        }
    }

    /// The write timestamp of the collector's guard, or `None` once the
    /// collector announced.
    pub fn write_timestamp(&self) -> Option<Timestamp> {
        self.guard.as_ref().map(WriteGuard::write_timestamp)
    }

    pub fn add_mutation(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn add_mutations(&mut self, mutations: impl IntoIterator<Item = Mutation>) {
        self.mutations.extend(mutations);
    }

    pub fn add_generator(&mut self, generator: MutationGenerator) {
        self.generators.push(generator);
    }

    /// Announces everything collected. Plain mutations alone go out as a
    /// single command; with generators the output is batched, plain
    /// mutations last.
    pub async fn announce(
        &mut self,
        client: &dyn Group0Client,
        configs: &ConfigSet,
    ) -> Result<(), Error> {
        if self.mutations.is_empty() && self.generators.is_empty() {
            return Ok(());
        }
        let guard = self
            .guard
            .take()
            .ok_or_else(|| Error::internal("mutations collector announced without a guard"))?;
        let mutations = std::mem::take(&mut self.mutations);
        if self.generators.is_empty() {
            return announce_mutations_with_guard(client, &mutations, guard).await;
        }

        let generators = std::mem::take(&mut self.generators);
        announce_batched(client, configs, guard, move |timestamp| {
            generators
                .into_iter()
                .flat_map(move |generator| generator(timestamp.clone()))
                .chain(mutations.into_iter().map(Ok))
        })
        .await
    }
}

impl Drop for MutationsCollector {
    fn drop(&mut self) {
        if !self.mutations.is_empty() || !self.generators.is_empty() {
            error!(
                "mutations collector dropped with {} mutations and {} generators, they are lost",
                self.mutations.len(),
                self.generators.len()
            );
        }
    }
}
