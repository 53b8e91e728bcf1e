// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pool for device handler invocations

use slog::{error, Logger};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The default number of device handlers allowed to run at the same time
pub const DEFAULT_MAX_PARALLEL_HANDLERS: usize = 16;

/// Runs device handler invocations on distinct tokio tasks, at most
/// `max_parallelism` of them at a time
///
/// Submitting never blocks: a task that exceeds the limit is spawned right
/// away but waits for a permit before it starts executing.  This lets the
/// device manager register every invocation on the current barrier phase
/// before any of them has to finish.
pub(crate) struct WorkerPool {
    log: Logger,
    semaphore: Arc<Semaphore>,
    set: JoinSet<()>,
}

impl WorkerPool {
    pub(crate) fn new(log: &Logger, max_parallelism: usize) -> WorkerPool {
        WorkerPool {
            log: log.clone(),
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            set: JoinSet::new(),
        }
    }

    pub(crate) fn submit<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.set.spawn(async move {
            // Hold onto the permit until the work finishes executing.  The
            // semaphore is never closed.
            let _permit = semaphore.acquire_owned().await;
            work.await;
        });
    }

    /// Collects every finished task, reporting ones that panicked
    ///
    /// Called once all submitted work has arrived at the barrier, so this
    /// does not wait for long.
    pub(crate) async fn reap(&mut self) {
        while let Some(result) = self.set.join_next().await {
            if let Err(err) = result {
                error!(
                    self.log,
                    "device handler task did not complete";
                    "error" => %err,
                );
            }
        }
    }

    /// Cancels every task that is still running
    pub(crate) fn abort_all(&mut self) {
        self.set.abort_all();
    }
}
