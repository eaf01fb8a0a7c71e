//! Periodic timer thread.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};

// ============================================================================
// Timer
// ============================================================================

/// Invokes a tick on a dedicated thread at a fixed cadence until stopped.
pub struct Timer {
    name: String,
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Starts a timer calling `tick` every `interval`.
    ///
    /// The first tick fires one interval after start. A panicking tick is
    /// logged and the timer keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero interval, or [`Error::Io`] if the
    /// thread cannot be spawned.
    pub fn start<F>(name: impl Into<String>, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::config("timer interval must be positive"));
        }

        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut next = Instant::now() + interval;
            loop {
                match stop_rx.recv_deadline(next) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
                    error!(
                        timer = %thread_name,
                        error = %Error::panicked(&*payload),
                        "Timer tick panicked"
                    );
                }

                next += interval;
                let now = Instant::now();
                if next < now {
                    // Skip missed ticks instead of bursting.
                    next = now + interval;
                }
            }
            debug!(timer = %thread_name, "Timer stopped");
        })?;

        Ok(Self {
            name,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the timer name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the timer to stop. Idempotent.
    #[inline]
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Waits for the timer thread to exit.
    ///
    /// Joining from inside a tick is a no-op.
    pub fn join(&self) {
        let handle = {
            let mut guard = self.handle.lock();
            match guard.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                _ => guard.take(),
            }
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = Timer::start("test-timer", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .expect("start");

        thread::sleep(Duration::from_millis(100));
        timer.stop();
        timer.join();

        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 3, "only {ticks} ticks");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[test]
    fn test_stop_before_first_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = Timer::start("test-timer-idle", Duration::from_secs(60), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .expect("start");

        timer.stop();
        timer.join();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_survives_panicking_tick() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let timer = Timer::start("test-timer-panic", Duration::from_millis(5), move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick");
            }
        })
        .expect("start");

        thread::sleep(Duration::from_millis(60));
        timer.stop();
        timer.join();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Timer::start("test", Duration::ZERO, || {}).is_err());
    }
}
