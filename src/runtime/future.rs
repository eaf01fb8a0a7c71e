//! Single-resolution future.
//!
//! A [`Future`] is resolved or rejected exactly once. Callers either block on
//! it with [`Future::wait`] or register continuations with
//! [`Future::on_complete`]. Continuations never run on the resolving thread:
//! they are scheduled on the global [`WorkerPool`].
//!
//! # Example
//!
//! ```ignore
//! let future = Future::spawn(|| Ok(21 * 2));
//! assert_eq!(future.wait(Duration::from_secs(1))?, 42);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};

use super::pool::WorkerPool;

// ============================================================================
// Types
// ============================================================================

/// Continuation invoked with the final result.
type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

// ============================================================================
// Future
// ============================================================================

/// A value that becomes available exactly once.
///
/// Cloning yields another handle to the same future.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = matches!(*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Future").field("resolved", &resolved).finish()
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Creates a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a future already resolved with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self::completed(Ok(value))
    }

    /// Creates a future already rejected with `error`.
    #[must_use]
    pub fn rejected(error: Error) -> Self {
        Self::completed(Err(error))
    }

    fn completed(result: Result<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done(result)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Runs `f` on the global pool and resolves with its result.
    ///
    /// A panic inside `f` rejects the future with [`Error::Panicked`].
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let future = Self::new();
        let handle = future.clone();

        let scheduled = WorkerPool::global().and_then(|pool| {
            pool.schedule(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or_else(|payload| Err(Error::panicked(&*payload)));
                let _ = handle.complete(result);
            })
        });

        if let Err(e) = scheduled {
            let _ = future.reject(e);
        }
        future
    }

    /// Resolves the future with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the future was already completed;
    /// no continuation fires in that case.
    #[inline]
    pub fn resolve(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Rejects the future with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResolved`] if the future was already completed.
    #[inline]
    pub fn reject(&self, error: Error) -> Result<()> {
        self.complete(Err(error))
    }

    fn complete(&self, result: Result<T>) -> Result<()> {
        let callbacks = {
            let mut state = self.inner.state.lock();
            let callbacks = match &mut *state {
                State::Done(_) => return Err(Error::AlreadyResolved),
                State::Pending(callbacks) => mem::take(callbacks),
            };
            *state = State::Done(result.clone());
            self.inner.cond.notify_all();
            callbacks
        };

        for callback in callbacks {
            let result = result.clone();
            dispatch(move || callback(result));
        }
        Ok(())
    }

    /// Returns `true` once resolved or rejected.
    #[inline]
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Returns the result if the future is complete, without blocking.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T>> {
        match &*self.inner.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    /// Blocks until the future completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the rejection error, or [`Error::WaitTimeout`] if the future is
    /// still pending after `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => result.clone(),
                    State::Pending(_) => Err(Error::wait_timeout(
                        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    )),
                };
            }
        }
    }

    /// Registers continuations for success and failure.
    ///
    /// Exactly one of them runs, on a pool worker. If the future is already
    /// complete the matching continuation is scheduled immediately.
    pub fn on_complete<S, E>(&self, on_ok: S, on_err: E)
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        let callback: Callback<T> = Box::new(move |result| match result {
            Ok(value) => on_ok(value),
            Err(error) => on_err(error),
        });

        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(callback),
            State::Done(result) => {
                let result = result.clone();
                drop(state);
                dispatch(move || callback(result));
            }
        }
    }
}

/// Schedules a continuation on the global pool.
fn dispatch<F>(job: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = WorkerPool::global().and_then(|pool| pool.schedule(job)) {
        warn!(error = %e, "Failed to schedule continuation");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crossbeam::channel;

    #[test]
    fn test_resolve_then_wait() {
        let future = Future::new();
        future.resolve(5).expect("first resolve");
        assert!(future.is_resolved());
        assert_eq!(future.wait(Duration::from_millis(10)).expect("value"), 5);
    }

    #[test]
    fn test_single_resolution() {
        let future: Future<u32> = Future::new();
        let (tx, rx) = channel::unbounded();
        let tx_err = tx.clone();
        future.on_complete(move |v| tx.send(Ok(v)).expect("send"), move |e| {
            tx_err.send(Err(e)).expect("send");
        });

        future.resolve(1).expect("first resolve");
        assert!(matches!(future.resolve(2), Err(Error::AlreadyResolved)));
        assert!(matches!(
            future.reject(Error::ConnectionClosed),
            Err(Error::AlreadyResolved)
        ));

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_eq!(first.expect("ok"), 1);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(future.wait(Duration::ZERO).expect("value"), 1);
    }

    #[test]
    fn test_wait_timeout_distinct_from_rejection() {
        let pending: Future<u8> = Future::new();
        let err = pending.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { timeout_ms: 20 }));

        let rejected: Future<u8> = Future::rejected(Error::ConnectionClosed);
        let err = rejected.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_wait_across_threads() {
        let future: Future<String> = Future::new();
        let handle = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.resolve("done".to_string()).expect("resolve");
        });
        assert_eq!(future.wait(Duration::from_secs(5)).expect("value"), "done");
    }

    #[test]
    fn test_continuation_runs_off_resolving_thread() {
        let future: Future<()> = Future::new();
        let (tx, rx) = channel::bounded(1);
        future.on_complete(
            move |()| {
                let _ = tx.send(thread::current().id());
            },
            |_| {},
        );

        future.resolve(()).expect("resolve");
        let callback_thread = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_ne!(callback_thread, thread::current().id());
    }

    #[test]
    fn test_on_complete_after_resolution() {
        let future = Future::rejected(Error::WorkerStopped);
        let (tx, rx) = channel::bounded(1);
        future.on_complete(
            |_: u8| {},
            move |e| {
                let _ = tx.send(e);
            },
        );
        let err = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert!(matches!(err, Error::WorkerStopped));
    }

    #[test]
    fn test_spawn() {
        let future = Future::spawn(|| Ok(21 * 2));
        assert_eq!(future.wait(Duration::from_secs(5)).expect("value"), 42);

        let panicking: Future<u8> = Future::spawn(|| panic!("kaboom"));
        let err = panicking.wait(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Panicked { .. }));
    }
}
