//! Generational barrier for N-way rendezvous.
//!
//! The barrier trips when `parties` callers have arrived; the last
//! arrival (index 0) runs the optional barrier action and advances the
//! generation. Breakage is all-or-none: once any party breaks a
//! generation — by cancellation, timeout, or [`Barrier::reset`] — every
//! other waiter on that exact generation fails with
//! [`BarrierError::Broken`], never silently passes. A broken barrier
//! stays broken until `reset` starts a fresh generation.
//!
//! The barrier action runs while the internal lock is held. That is
//! deliberate: it serializes the action against concurrent `reset` and
//! `is_broken` calls, and orders it before the generation advances and
//! before any waiter is released.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cx::Cx;

/// How long a condition wait may sleep before re-checking cancellation.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Error returned when waiting at a barrier fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    /// The generation was invalidated by another party.
    #[error("barrier generation was broken by another party")]
    Broken,
    /// Cancelled while waiting; the generation is now broken.
    #[error("interrupted while waiting at the barrier")]
    Interrupted,
    /// The deadline elapsed; the generation is now broken.
    #[error("timed out waiting at the barrier")]
    Timeout,
}

/// One round of the barrier. Replaced on every trip or reset; at most
/// one generation is current at a time.
#[derive(Debug)]
struct Generation {
    /// Guarded by the barrier lock; atomic only for interior mutability
    /// behind the shared `Arc`.
    broken: AtomicBool,
}

impl Generation {
    fn new() -> Self {
        Self {
            broken: AtomicBool::new(false),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct BarrierState {
    generation: Arc<Generation>,
    /// Parties still awaited in the current generation.
    count: usize,
}

type Action = Box<dyn FnMut() + Send>;

/// Reusable N-party rendezvous with all-or-none breakage.
pub struct Barrier {
    parties: usize,
    lock: StdMutex<BarrierState>,
    cvar: Condvar,
    /// Run by the tripping thread, inside the lock, once per generation.
    action: Option<StdMutex<Action>>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("parties", &self.parties)
            .field("has_action", &self.action.is_some())
            .finish_non_exhaustive()
    }
}

impl Barrier {
    /// Creates a barrier for `parties` threads.
    ///
    /// # Panics
    /// Panics if `parties == 0`.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self::build(parties, None)
    }

    /// Creates a barrier that runs `action` once per generation, on the
    /// last-arriving thread, before any waiter is released.
    #[must_use]
    pub fn with_action(parties: usize, action: impl FnMut() + Send + 'static) -> Self {
        Self::build(parties, Some(StdMutex::new(Box::new(action) as Action)))
    }

    fn build(parties: usize, action: Option<StdMutex<Action>>) -> Self {
        assert!(parties > 0, "barrier requires at least 1 party");
        Self {
            parties,
            lock: StdMutex::new(BarrierState {
                generation: Arc::new(Generation::new()),
                count: parties,
            }),
            cvar: Condvar::new(),
            action,
        }
    }

    /// Returns the number of parties required to trip the barrier.
    #[must_use]
    pub const fn parties(&self) -> usize {
        self.parties
    }

    /// Returns the number of parties currently waiting.
    #[must_use]
    pub fn waiting(&self) -> usize {
        let state = self.state();
        self.parties - state.count
    }

    /// Returns true if the current generation is broken.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state().generation.is_broken()
    }

    /// Breaks the current generation — every waiter observes
    /// [`BarrierError::Broken`] — and starts a fresh one.
    pub fn reset(&self) {
        let mut state = self.state();
        self.break_generation(&mut state);
        self.next_generation(&mut state);
    }

    /// Waits until all parties have arrived.
    ///
    /// Returns the zero-based arrival index: `parties() - 1` for the
    /// first thread to arrive, 0 for the last (the thread that trips the
    /// barrier and runs the action).
    pub fn wait(&self, cx: &Cx) -> Result<usize, BarrierError> {
        self.do_wait(cx, None)
    }

    /// Waits until all parties have arrived or `timeout` elapses. A
    /// timeout breaks the generation for every other waiter.
    pub fn wait_timeout(&self, cx: &Cx, timeout: Duration) -> Result<usize, BarrierError> {
        self.do_wait(cx, Some(Instant::now() + timeout))
    }

    fn do_wait(&self, cx: &Cx, deadline: Option<Instant>) -> Result<usize, BarrierError> {
        cx.trace("barrier::wait starting");
        let mut state = self.state();
        let generation = Arc::clone(&state.generation);

        if generation.is_broken() {
            return Err(BarrierError::Broken);
        }
        if cx.take_cancel() {
            self.break_generation(&mut state);
            cx.trace("barrier::wait interrupted on arrival");
            return Err(BarrierError::Interrupted);
        }

        state.count -= 1;
        let index = state.count;
        if index == 0 {
            if let Some(action) = &self.action {
                let mut action = action.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (*action)())) {
                    // The action failed: every waiter breaks, the panic
                    // surfaces on the tripping thread only.
                    self.break_generation(&mut state);
                    drop(state);
                    drop(action);
                    resume_unwind(payload);
                }
            }
            self.next_generation(&mut state);
            cx.trace("barrier::wait tripped");
            return Ok(0);
        }

        loop {
            let mut slice = POLL_SLICE;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.break_generation(&mut state);
                    cx.trace("barrier::wait timed out");
                    return Err(BarrierError::Timeout);
                }
                slice = slice.min(remaining);
            }

            let (guard, _) = self
                .cvar
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;

            if generation.is_broken() {
                cx.trace("barrier::wait observed breakage");
                return Err(BarrierError::Broken);
            }
            if !Arc::ptr_eq(&state.generation, &generation) {
                // Released by a normal trip. A cancel that raced the
                // release stays pending on the Cx rather than being
                // swallowed here.
                cx.trace("barrier::wait released");
                return Ok(index);
            }
            if cx.take_cancel() {
                self.break_generation(&mut state);
                cx.trace("barrier::wait interrupted");
                return Err(BarrierError::Interrupted);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, BarrierState> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the current generation broken and wakes every waiter.
    fn break_generation(&self, state: &mut MutexGuard<'_, BarrierState>) {
        state.generation.broken.store(true, Ordering::Relaxed);
        state.count = self.parties;
        self.cvar.notify_all();
    }

    /// Installs a fresh generation and wakes the released waiters.
    fn next_generation(&self, state: &mut MutexGuard<'_, BarrierState>) {
        state.generation = Arc::new(Generation::new());
        state.count = self.parties;
        self.cvar.notify_all();
    }
}
