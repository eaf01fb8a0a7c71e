//! Single-threaded job executor.
//!
//! A [`Worker`] owns one [`JobQueue`] and one named OS thread. Stopping a
//! worker enqueues the stop sentinel, so jobs scheduled before the stop still
//! run before the thread exits.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};

use super::queue::JobQueue;

// ============================================================================
// Types
// ============================================================================

/// Boxed job run by a default worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Worker
// ============================================================================

/// A job queue drained by a dedicated thread.
///
/// `J` is the job type; the default worker runs boxed closures, while
/// [`Worker::spawn_with`] lets a custom body interpret its own job type.
pub struct Worker<J = Job> {
    name: String,
    queue: Arc<JobQueue<J>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker<Job> {
    /// Spawns a worker running boxed closures in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the thread cannot be spawned.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        Self::spawn_with(name, |queue, name| run_jobs(&queue, &name))
    }

    /// Schedules a closure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerStopped`] after [`stop`](Self::stop).
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Box::new(f))
    }
}

impl<J: Send + 'static> Worker<J> {
    /// Spawns a worker whose thread runs `body` with the worker's queue.
    ///
    /// The body is expected to return once the queue yields the sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the thread cannot be spawned.
    pub fn spawn_with<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<JobQueue<J>>, String) + Send + 'static,
    {
        let name = name.into();
        let queue = Arc::new(JobQueue::new());

        let thread_queue = Arc::clone(&queue);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_queue, thread_name))?;

        debug!(worker = %name, "Worker started");

        Ok(Self {
            name,
            queue,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the worker name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the worker queue.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue<J>> {
        &self.queue
    }

    /// Enqueues a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerStopped`] after [`stop`](Self::stop).
    #[inline]
    pub fn schedule(&self, job: J) -> Result<()> {
        self.queue.push(job)
    }

    /// Enqueues the stop sentinel; pending jobs still run.
    #[inline]
    pub fn stop(&self) {
        self.queue.close();
    }

    /// Returns `true` if the worker thread has not been joined or finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for the worker thread to exit.
    ///
    /// Joining from the worker's own thread is a no-op.
    pub fn join(&self) {
        let handle = {
            let mut guard = self.handle.lock();
            match guard.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                Some(_) => guard.take(),
                None => None,
            }
        };

        if let Some(handle) = handle
            && let Err(payload) = handle.join()
        {
            error!(
                worker = %self.name,
                error = %Error::panicked(&*payload),
                "Worker thread panicked"
            );
        }
    }
}

impl<J> Drop for Worker<J> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

// ============================================================================
// Run Loop
// ============================================================================

/// Default body: runs jobs until the sentinel, surviving panics.
fn run_jobs(queue: &JobQueue<Job>, name: &str) {
    while let Some(job) = queue.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = %name,
                error = %Error::panicked(&*payload),
                "Job panicked"
            );
        }
    }
    debug!(worker = %name, "Worker stopped");
}

// ============================================================================
// Tests
// ============================================================================
