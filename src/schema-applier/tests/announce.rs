// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mz_schema_applier::announce::{
    announce_mutations_with_batching, Group0Client, MutationGenerator, MutationsCollector,
    WriteGuard, WriteTimestamp, SCHEMA_ANNOUNCE_MIN_MEMORY_THRESHOLD,
};
use mz_schema_applier::mutation::{unfreeze, FrozenMutation, Mutation};
use mz_schema_applier::schema_tables::SchemaTable;
use mz_schema_applier::{all_dyncfgs, ConfigSet, Error, ErrorKind};

/// A log that rejects commands of more than `max_mutations` mutations.
#[derive(Debug)]
struct MockLog {
    max_mutations: usize,
    max_command_size: usize,
    timestamps: AtomicI64,
    guards: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
}

impl MockLog {
    fn new(max_mutations: usize, max_command_size: usize) -> MockLog {
        MockLog {
            max_mutations,
            max_command_size,
            timestamps: AtomicI64::new(0),
            guards: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    fn guards(&self) -> usize {
        self.guards.load(Ordering::SeqCst)
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Group0Client for MockLog {
    async fn start_operation(&self) -> Result<WriteGuard, Error> {
        self.guards.fetch_add(1, Ordering::SeqCst);
        Ok(WriteGuard::new(self.timestamps.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn announce(
        &self,
        mutations: Vec<FrozenMutation>,
        _guard: WriteGuard,
        _description: &str,
    ) -> Result<(), Error> {
        if mutations.len() > self.max_mutations {
            return Err(ErrorKind::CommandTooLarge {
                size: mutations.iter().map(FrozenMutation::len).sum(),
                max: self.max_command_size,
            }
            .into());
        }
        let keyspaces = unfreeze(&mutations)?
            .into_iter()
            .map(|m| m.keyspace)
            .collect();
        self.commands.lock().unwrap().push(keyspaces);
        Ok(())
    }

    fn max_command_size(&self) -> usize {
        self.max_command_size
    }
}

fn configs(min_threshold: usize) -> ConfigSet {
    let configs = all_dyncfgs(ConfigSet::default());
    configs.set(&SCHEMA_ANNOUNCE_MIN_MEMORY_THRESHOLD, min_threshold);
    configs
}

fn mutations(prefix: &str, count: usize) -> Vec<Result<Mutation, Error>> {
    (0..count)
        .map(|i| Ok(Mutation::new(SchemaTable::Keyspaces, format!("{prefix}{i}"))))
        .collect()
}

fn names(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{prefix}{i}")).collect()
}

#[tokio::test]
async fn rejected_batches_are_split_in_halves() {
    let log = MockLog::new(2, 0);
    announce_mutations_with_batching(&log, &configs(usize::MAX), |_| mutations("ks", 8))
        .await
        .unwrap();
    assert_eq!(
        log.commands(),
        vec![
            names("ks", 0..2),
            names("ks", 2..4),
            names("ks", 4..6),
            names("ks", 6..8),
        ]
    );
    // One attempt with all eight, two with four, four with two.
    assert_eq!(log.guards(), 7);
}

#[tokio::test]
async fn a_single_oversized_mutation_is_fatal() {
    let log = MockLog::new(0, 0);
    let err = announce_mutations_with_batching(&log, &configs(usize::MAX), |_| mutations("ks", 3))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::CommandTooLarge { .. }), "{err}");
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn commands_are_cut_at_the_threshold() {
    let log = MockLog::new(10, 0);
    announce_mutations_with_batching(&log, &configs(0), |timestamp: WriteTimestamp| {
        // The first guard is taken before any mutation is generated.
        assert_eq!(timestamp.get(), 1);
        mutations("ks", 3)
    })
    .await
    .unwrap();
    assert_eq!(
        log.commands(),
        vec![names("ks", 0..1), names("ks", 1..2), names("ks", 2..3)]
    );
    assert_eq!(log.guards(), 3);
}

#[tokio::test]
async fn generator_errors_abort_the_announcement() {
    let log = MockLog::new(10, 0);
    let err = announce_mutations_with_batching(&log, &configs(usize::MAX), |_| {
        let mut generated = mutations("ks", 2);
        generated.push(Err(ErrorKind::Internal("generator failed".into()).into()));
        generated
    })
    .await
    .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Internal(_)), "{err}");
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn collector_announces_plain_mutations_as_one_command() {
    let log = MockLog::new(usize::MAX, 0);
    let mut collector = MutationsCollector::new(log.start_operation().await.unwrap());
    assert_eq!(collector.write_timestamp(), Some(1));
    collector.add_mutations(mutations("ks", 5).into_iter().map(Result::unwrap));
    collector.announce(&log, &configs(0)).await.unwrap();
    assert_eq!(log.commands(), vec![names("ks", 0..5)]);
    assert_eq!(log.guards(), 1);
    assert_eq!(collector.write_timestamp(), None);
}

#[tokio::test]
async fn collector_batches_generators_before_plain_mutations() {
    let log = MockLog::new(usize::MAX, 0);
    let mut collector = MutationsCollector::new(log.start_operation().await.unwrap());
    collector.add_mutation(Mutation::new(SchemaTable::Keyspaces, "plain"));
    for prefix in ["a", "b"] {
        let generator: MutationGenerator = Box::new(
            move |_: WriteTimestamp| -> Box<dyn Iterator<Item = Result<Mutation, Error>>> {
                Box::new(mutations(prefix, 2).into_iter())
            },
        );
        collector.add_generator(generator);
    }
    collector.announce(&log, &configs(usize::MAX)).await.unwrap();
    assert_eq!(log.commands(), vec![vec!["a0", "a1", "b0", "b1", "plain"]]);
    assert_eq!(log.guards(), 1);
}
