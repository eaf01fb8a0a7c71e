//! Thread-based concurrency primitives.
//!
//! The client runs on plain OS threads: one background worker per open
//! client, one sweep timer, and a shared pool for continuations.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `future` | Single-resolution [`Future`] with continuations |
//! | `pool` | Round-robin [`WorkerPool`] |
//! | `queue` | FIFO [`JobQueue`] with a stop sentinel |
//! | `timer` | Periodic [`Timer`] thread |
//! | `worker` | Single-threaded [`Worker`] |

// ============================================================================
// Submodules
// ============================================================================

/// Single-resolution future.
pub mod future;

/// Fixed-size worker pool.
pub mod pool;

/// FIFO job queue.
pub mod queue;

/// Periodic timer.
pub mod timer;

/// Single-threaded job executor.
pub mod worker;

// ============================================================================
// Re-exports
// ============================================================================

pub use future::Future;
pub use pool::WorkerPool;
pub use queue::{JobQueue, Received};
pub use timer::Timer;
pub use worker::{Job, Worker};
