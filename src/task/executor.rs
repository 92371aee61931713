//! Task-runner abstraction consumed by the coordination layer.
//!
//! [`Execute`] is the narrow interface this crate needs from whatever
//! actually runs work: accept a zero-argument unit, run it
//! asynchronously, possibly reject it. Pool sizing, rejection policy,
//! and thread lifecycle all belong to the implementor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Error returned when an executor cannot accept a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("executor cannot accept new work")]
pub struct RejectedError;

/// Something that runs units of work asynchronously.
///
/// The only ordering guarantee is happens-before between the `execute`
/// call and the start of the work.
pub trait Execute: Send + Sync {
    /// Runs `work` asynchronously, or rejects it.
    fn execute(&self, work: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RejectedError>;
}

/// Thread-per-unit executor: every unit gets a fresh named thread.
///
/// Deliberately unpooled — it exists so the coordination layer and its
/// tests have a real runner without dragging in pool lifecycle concerns.
#[derive(Debug, Clone, Default)]
pub struct ThreadExecutor {
    next_id: Arc<AtomicU64>,
}

impl ThreadExecutor {
    /// Creates a thread-per-unit executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Execute for ThreadExecutor {
    fn execute(&self, work: Box<dyn FnOnce() + Send + 'static>) -> Result<(), RejectedError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("converge-worker-{id}"))
            .spawn(work)
            .map(drop)
            .map_err(|_| RejectedError)
    }
}
