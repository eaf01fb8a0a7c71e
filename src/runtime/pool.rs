//! Fixed-size worker pool.
//!
//! Jobs are distributed round-robin over a fixed set of [`Worker`]s. The
//! process-wide pool returned by [`WorkerPool::global`] runs future
//! continuations and asynchronous HTTP calls.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam::channel;
use tracing::debug;

use crate::error::{Error, Result};

use super::worker::Worker;

// ============================================================================
// Constants
// ============================================================================

/// Pool size used when the available parallelism cannot be queried.
const FALLBACK_POOL_SIZE: usize = 4;

/// Process-wide pool, started on first use.
static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();

// ============================================================================
// WorkerPool
// ============================================================================

/// A fixed array of workers with round-robin dispatch.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawns a pool of `size` workers named `{name}-{index}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `size` is zero, or [`Error::Io`] if a
    /// thread cannot be spawned.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("worker pool size must be positive"));
        }

        let workers = (0..size)
            .map(|index| Worker::spawn(format!("{name}-{index}")))
            .collect::<Result<Vec<_>>>()?;

        debug!(name, size, "Worker pool started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Returns the process-wide pool, sized to the available parallelism.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the pool threads cannot be spawned.
    pub fn global() -> Result<&'static Self> {
        if let Some(pool) = GLOBAL.get() {
            return Ok(pool);
        }

        let size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_POOL_SIZE);
        let pool = Self::new("frankly-pool", size)?;

        // A racing initializer may win; the losing pool stops on drop.
        Ok(GLOBAL.get_or_init(|| pool))
    }

    /// Returns the number of workers.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Returns the next worker in round-robin order.
    #[must_use]
    pub fn pick(&self) -> &Worker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Schedules a closure on the next worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerStopped`] once the pool is stopped.
    #[inline]
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pick().execute(f)
    }

    /// Runs `f` over every item on the pool and collects results in input order.
    ///
    /// Blocks until every item has completed. A panicking call yields
    /// [`Error::Panicked`] for its slot. Must not be called from a pool worker.
    pub fn fan_out<I, T, R, F>(&self, items: I, f: F) -> Vec<Result<R>>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let (tx, rx) = channel::unbounded();

        let mut results: Vec<Option<Result<R>>> = Vec::new();
        let mut pending = 0usize;

        for (index, item) in items.into_iter().enumerate() {
            results.push(None);

            let f = Arc::clone(&f);
            let tx = tx.clone();
            let scheduled = self.schedule(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(item)))
                    .map_err(|payload| Error::panicked(&*payload));
                let _ = tx.send((index, result));
            });

            match scheduled {
                Ok(()) => pending += 1,
                Err(e) => results[index] = Some(Err(e)),
            }
        }
        drop(tx);

        for _ in 0..pending {
            // Every scheduled job sends exactly once; a closed channel means
            // the pool stopped underneath us.
            let Ok((index, result)) = rx.recv() else {
                break;
            };
            results[index] = Some(result);
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(Error::WorkerStopped)))
            .collect()
    }

    /// Stops every worker; queued jobs still run.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Waits for every worker thread to exit.
    pub fn join(&self) {
        for worker in &self.workers {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================
