//! FIFO job queue with a stop sentinel.
//!
//! The queue is an unbounded crossbeam channel carrying either a job or the
//! stop sentinel. Closing enqueues the sentinel behind any pending jobs, so a
//! consumer drains what was scheduled before it observes the stop.

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Queue slot: a job or the stop sentinel.
enum Slot<T> {
    Job(T),
    Stop,
}

/// Outcome of a bounded wait on the queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    /// A job was dequeued.
    Job(T),
    /// The wait elapsed with the queue empty.
    Timeout,
    /// The stop sentinel was reached.
    Stopped,
}

// ============================================================================
// JobQueue
// ============================================================================

/// Multi-producer FIFO job queue with a stop sentinel.
pub struct JobQueue<T> {
    tx: Sender<Slot<T>>,
    rx: Receiver<Slot<T>>,
    /// Guards push against close so no job lands behind the sentinel.
    closed: Mutex<bool>,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    /// Creates an empty, open queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            closed: Mutex::new(false),
        }
    }

    /// Enqueues a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerStopped`] once the queue is closed.
    pub fn push(&self, job: T) -> Result<()> {
        let closed = self.closed.lock();
        if *closed {
            return Err(Error::WorkerStopped);
        }
        // The queue owns a receiver, so the channel never disconnects.
        self.tx
            .send(Slot::Job(job))
            .map_err(|_| Error::WorkerStopped)
    }

    /// Enqueues the stop sentinel. Idempotent.
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            *closed = true;
            let _ = self.tx.send(Slot::Stop);
        }
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Returns the number of queued slots, sentinel included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks for the next job; `None` once the sentinel is reached.
    pub fn recv(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(Slot::Job(job)) => Some(job),
            Ok(Slot::Stop) | Err(_) => {
                self.restore_sentinel();
                None
            }
        }
    }

    /// Waits up to `timeout` for the next job.
    pub fn recv_timeout(&self, timeout: Duration) -> Received<T> {
        self.recv_deadline(Instant::now() + timeout)
    }

    /// Waits until `deadline` for the next job.
    pub fn recv_deadline(&self, deadline: Instant) -> Received<T> {
        match self.rx.recv_deadline(deadline) {
            Ok(Slot::Job(job)) => Received::Job(job),
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Ok(Slot::Stop) | Err(RecvTimeoutError::Disconnected) => {
                self.restore_sentinel();
                Received::Stopped
            }
        }
    }

    /// Removes and returns all queued jobs in order, keeping a pending
    /// sentinel in place.
    pub fn drain(&self) -> Vec<T> {
        let mut jobs = Vec::with_capacity(self.rx.len());
        let mut stop = false;
        while let Ok(slot) = self.rx.try_recv() {
            match slot {
                Slot::Job(job) => jobs.push(job),
                Slot::Stop => stop = true,
            }
        }
        if stop {
            self.restore_sentinel();
        }
        jobs
    }

    /// Discards all queued jobs, keeping a pending sentinel in place.
    ///
    /// Returns the number of jobs discarded.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    /// Puts the consumed sentinel back so later receivers also stop.
    fn restore_sentinel(&self) {
        let _ = self.tx.send(Slot::Stop);
    }
}

// ============================================================================
// Tests
// ============================================================================
