//! Cancel context for blocking waits.
//!
//! `Cx` is the token a waiting thread presents to every blocking
//! operation in this crate. It carries a cancel flag and, while its
//! owner is suspended, the handle of the parked thread — so a canceller
//! can deliver a directed wake instead of waiting for a poll.
//!
//! # Thread Safety
//!
//! `Cx` is `Send + Sync` and cheap to clone (handles share state). The
//! semantic contract is that at most one thread waits under a given `Cx`
//! at a time; the cancelling side may be any thread.
//!
//! # Consuming a cancel
//!
//! A wait that returns an interrupted failure *consumes* the cancel flag
//! it observed ([`Cx::checkpoint`] / [`Cx::take_cancel`]), mirroring how
//! an interrupt status is cleared by the failure that reports it. Waits
//! that complete normally leave a concurrent cancel pending for the next
//! blocking call to observe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use parking_lot::Mutex;

/// Error returned when a wait is abandoned because its `Cx` was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait interrupted by cancellation")]
pub struct Interrupted;

#[derive(Debug)]
struct CxInner {
    cancel_requested: AtomicBool,
    /// Thread currently parked under this context. Published exactly once
    /// per wait, nulled immediately after the park returns.
    parked: Mutex<Option<Thread>>,
}

/// Cancellation context for a waiting thread.
#[derive(Debug, Clone)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    /// Creates a fresh, un-cancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CxInner {
                cancel_requested: AtomicBool::new(false),
                parked: Mutex::new(None),
            }),
        }
    }

    /// Creates a context for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new()
    }

    /// Requests cancellation and wakes the thread parked under this
    /// context, if any. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
        if let Some(thread) = self.inner.parked.lock().as_ref() {
            thread.unpark();
        }
    }

    /// Returns true if cancellation has been requested and not yet
    /// consumed. Does not consume the flag.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Consumes a pending cancel, returning whether one was pending.
    pub fn take_cancel(&self) -> bool {
        self.inner.cancel_requested.swap(false, Ordering::AcqRel)
    }

    /// Fails with [`Interrupted`] if cancellation is pending, consuming
    /// the flag; otherwise a no-op.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.take_cancel() {
            return Err(Interrupted);
        }
        Ok(())
    }

    /// Emits a trace event attributed to this context.
    pub fn trace(&self, message: &str) {
        tracing::trace!(target: "converge::cx", "{message}");
    }

    /// Parks the current thread until unparked or cancelled.
    ///
    /// Spurious returns are allowed; callers re-check their condition in
    /// a loop.
    pub(crate) fn park(&self) {
        self.park_inner(None);
    }

    /// Parks the current thread until unparked, cancelled, or `deadline`.
    pub(crate) fn park_deadline(&self, deadline: Instant) {
        self.park_inner(Some(deadline));
    }

    fn park_inner(&self, deadline: Option<Instant>) {
        *self.inner.parked.lock() = Some(thread::current());
        // Re-check after publishing: a cancel delivered between the
        // caller's last check and the publish must not be slept through.
        if !self.inner.cancel_requested.load(Ordering::Acquire) {
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !remaining.is_zero() {
                        thread::park_timeout(remaining);
                    }
                }
                None => thread::park(),
            }
        }
        *self.inner.parked.lock() = None;
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}
