// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Execution shards.
//!
//! Each shard is a dedicated thread running a single-threaded tokio runtime.
//! Shard-local state lives in an [`Rc<Shard>`] that never leaves its thread;
//! other threads reach it only by sending closures with [`Sharded::invoke_on`]
//! and friends.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use futures::future::try_join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::applier::in_progress_types::InProgressTypes;
use crate::catalog::{Catalog, ReplicationMapRegistry};
use crate::error::{Error, ErrorKind};
use crate::notifier::MigrationNotifier;

pub type ShardId = usize;

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
}

/// Returns the shard the calling thread belongs to, if any.
pub fn this_shard_id() -> Option<ShardId> {
    CURRENT_SHARD.with(|id| id.get())
}

/// The state owned by one shard.
#[derive(Debug)]
pub struct Shard {
    id: ShardId,
    catalog: RefCell<Catalog>,
    notifier: RefCell<MigrationNotifier>,
    in_progress_types: RefCell<Option<InProgressTypes>>,
}

pub type ShardRef = Rc<Shard>;

impl Shard {
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Borrows the committed catalog. The borrow must not be held across an
    /// await point.
    pub fn catalog(&self) -> Ref<'_, Catalog> {
        self.catalog.borrow()
    }

    pub fn catalog_mut(&self) -> RefMut<'_, Catalog> {
        self.catalog.borrow_mut()
    }

    /// Returns a snapshot of the registered listeners.
    pub fn notifier(&self) -> MigrationNotifier {
        self.notifier.borrow().clone()
    }

    pub(crate) fn notifier_mut(&self) -> RefMut<'_, MigrationNotifier> {
        self.notifier.borrow_mut()
    }

    pub(crate) fn in_progress_types(&self) -> Ref<'_, Option<InProgressTypes>> {
        self.in_progress_types.borrow()
    }

    pub(crate) fn set_in_progress_types(&self, types: Option<InProgressTypes>) {
        *self.in_progress_types.borrow_mut() = types;
    }
}

type Task = Box<dyn FnOnce(ShardRef) + Send>;

struct ShardedInner {
    senders: Vec<mpsc::UnboundedSender<Task>>,
}

/// A handle to every shard of the node. Cloning the handle is cheap; the
/// shard threads exit once the last handle is dropped.
#[derive(Clone)]
pub struct Sharded {
    inner: Arc<ShardedInner>,
}

impl fmt::Debug for Sharded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sharded")
            .field("shards", &self.inner.senders.len())
            .finish()
    }
}

impl Sharded {
    /// Starts `count` shards, each with an empty catalog.
    pub fn new(count: usize) -> Result<Sharded, Error> {
        if count == 0 {
            return Err(Error::internal("at least one shard is required"));
        }
        let registry = Arc::new(ReplicationMapRegistry::default());
        let mut senders = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name(format!("shard-{id}"))
                .spawn(move || run_shard(id, registry, rx))
                .map_err(|e| Error::internal(format!("failed to start shard {id}: {e}")))?;
            senders.push(tx);
        }
        Ok(Sharded {
            inner: Arc::new(ShardedInner { senders }),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.inner.senders.len()
    }

    /// Runs `f` on shard `shard` and returns its output.
    pub async fn invoke_on<F, Fut, R>(&self, shard: ShardId, f: F) -> Result<R, Error>
    where
        F: FnOnce(ShardRef) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let sender = self
            .inner
            .senders
            .get(shard)
            .ok_or_else(|| Error::new(ErrorKind::ShardUnavailable(shard)))?;
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |state| {
            tokio::task::spawn_local(async move {
                // The caller may have gone away; nothing to report to.
                let _ = tx.send(f(state).await);
            });
        });
        sender
            .send(task)
            .map_err(|_| Error::new(ErrorKind::ShardUnavailable(shard)))?;
        rx.await
            .map_err(|_| Error::new(ErrorKind::ShardUnavailable(shard)))
    }

    /// Runs `f` on every shard concurrently. Outputs are in shard order.
    pub async fn invoke_on_all<F, Fut, R>(&self, f: F) -> Result<Vec<R>, Error>
    where
        F: Fn(ShardRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        try_join_all((0..self.shard_count()).map(|shard| {
            let f = Arc::clone(&f);
            self.invoke_on(shard, move |state| f(state))
        }))
        .await
    }

    /// Runs `f` on every shard with that shard's element of `inputs`.
    pub async fn invoke_on_each<T, F, Fut, R>(&self, inputs: Vec<T>, f: F) -> Result<Vec<R>, Error>
    where
        T: Send + 'static,
        F: Fn(ShardRef, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        if inputs.len() != self.shard_count() {
            return Err(Error::internal(format!(
                "{} inputs for {} shards",
                inputs.len(),
                self.shard_count()
            )));
        }
        let f = Arc::new(f);
        try_join_all(inputs.into_iter().enumerate().map(|(shard, input)| {
            let f = Arc::clone(&f);
            self.invoke_on(shard, move |state| f(state, input))
        }))
        .await
    }
}

fn run_shard(
    id: ShardId,
    registry: Arc<ReplicationMapRegistry>,
    mut rx: mpsc::UnboundedReceiver<Task>,
) {
    CURRENT_SHARD.with(|current| current.set(Some(id)));
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build runtime of shard {id}: {e}");
            return;
        }
    };
    let state = Rc::new(Shard {
        id,
        catalog: RefCell::new(Catalog::new(id, registry)),
        notifier: RefCell::new(MigrationNotifier::default()),
        in_progress_types: RefCell::new(None),
    });
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        while let Some(task) = rx.recv().await {
            task(Rc::clone(&state));
        }
    });
    debug!("shard {id} stopped");
}

#[cfg(test)]
mod tests {
    use std::future;

    use super::*;

    #[tokio::test]
    async fn closures_run_on_their_shard() {
        let sharded = Sharded::new(3).unwrap();
        assert_eq!(this_shard_id(), None);
        let ids = sharded
            .invoke_on_all(|shard| {
                let id = shard.id();
                future::ready((id, this_shard_id()))
            })
            .await
            .unwrap();
        assert_eq!(ids, vec![(0, Some(0)), (1, Some(1)), (2, Some(2))]);

        let echoed = sharded
            .invoke_on_each(vec!["a", "b", "c"], |shard, input| {
                future::ready(format!("{}{input}", shard.id()))
            })
            .await
            .unwrap();
        assert_eq!(echoed, vec!["0a", "1b", "2c"]);

        assert!(sharded
            .invoke_on_each(vec![1], |_, input| future::ready(input))
            .await
            .is_err());
        assert!(matches!(
            sharded
                .invoke_on(7, |_| future::ready(()))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::ShardUnavailable(7)
        ));
    }

    #[tokio::test]
    async fn shards_can_call_each_other() {
        let sharded = Sharded::new(2).unwrap();
        let inner = sharded.clone();
        let result = sharded
            .invoke_on(1, move |_| async move {
                inner
                    .invoke_on(0, |shard| future::ready(shard.id()))
                    .await
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, 0);
    }
}
