//! Cancelable, single-assignment result holder.
//!
//! An [`AsyncResult`] owns a unit of work and the value or failure it
//! eventually produces. Any number of handles may wait on it; exactly
//! one `run` executes the work; a cancel that wins the race prevents the
//! work from publishing anything. The outcome is written exactly once,
//! before the terminal state transition, and waiters are only drained
//! after the state is terminal — every joiner observes the same outcome.
//!
//! Waiters queue on a lock-free Treiber stack and park; completion
//! drains the stack, fires the completion hook exactly once, then drops
//! the work closure to bound memory.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SpinConfig;
use crate::cx::{Cx, Interrupted};
use crate::sync::waiters::WaiterStack;
use crate::task::state::RunState;
use crate::util::Backoff;

/// Shared failure cause stored by a failed task.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of work producing a value or a failure cause. `FnMut` so a
/// scheduling layer can re-run it through [`AsyncResult::run_and_reset`].
pub type TaskFn<T> = Box<dyn FnMut() -> Result<T, Cause> + Send + 'static>;

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Error returned when joining an [`AsyncResult`] does not yield a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JoinError {
    /// The task was cancelled before it completed.
    #[error("task was cancelled before completing")]
    Cancelled,
    /// The work returned an error or panicked.
    #[error("task execution failed")]
    Failed(#[source] Cause),
    /// The join deadline elapsed before the task settled.
    #[error("timed out waiting for the task")]
    Timeout,
    /// The joining thread's `Cx` was cancelled; the cancel is consumed.
    #[error("interrupted while waiting for the task")]
    Interrupted,
}

/// Failure cause recorded when the work panicked.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self { message }
    }

    /// The panic message, if one was recoverable.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

struct Inner<T> {
    state: AtomicU8,
    /// Claimed by the first `run`; released only by `run_and_reset`.
    claimed: AtomicBool,
    /// The running thread, published for directed interruption and
    /// nulled when the run finishes.
    runner: Mutex<Option<Thread>>,
    work: Mutex<Option<TaskFn<T>>>,
    /// Written exactly once, by the `Completing` winner, before the
    /// terminal store; read only after a terminal state is observed.
    outcome: UnsafeCell<Option<Result<T, Cause>>>,
    waiters: WaiterStack,
    hook: Mutex<Option<Hook>>,
}

// SAFETY: the outcome cell has a unique writer (the thread that won the
// Pending -> Completing transition) and is read only after the reader
// acquire-loads a terminal state published by a release store.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// Cancelable holder of a task's eventual value or failure.
pub struct AsyncResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = RunState::from_u8(self.inner.state.load(Ordering::Acquire));
        f.debug_struct("AsyncResult")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    /// Creates a pending result owning `work`.
    #[must_use]
    pub fn new(work: TaskFn<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(RunState::Pending.as_u8()),
                claimed: AtomicBool::new(false),
                runner: Mutex::new(None),
                work: Mutex::new(Some(work)),
                outcome: UnsafeCell::new(None),
                waiters: WaiterStack::new(),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Creates a pending result from an infallible closure.
    #[must_use]
    pub fn from_fn(mut f: impl FnMut() -> T + Send + 'static) -> Self {
        Self::new(Box::new(move || Ok(f())))
    }

    /// Creates a pending result from a fallible closure.
    #[must_use]
    pub fn try_from_fn<E>(mut f: impl FnMut() -> Result<T, E> + Send + 'static) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(Box::new(move || f().map_err(|e| Arc::new(e) as Cause)))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        RunState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True once the task can no longer transition to a new outcome.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != RunState::Pending.as_u8()
    }

    /// True if the task was cancelled before completing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Executes the work exactly once if still pending.
    ///
    /// Claims the runner slot with a CAS; a second `run` (or a run after
    /// a winning cancel) is a no-op. Before returning, a run that
    /// observed an in-flight interrupting cancel spins until the
    /// interrupt has been fully delivered, so the canceller's wake can
    /// never land on later, unrelated work of the executing thread.
    pub fn run(&self) {
        let inner = &*self.inner;
        if inner.state.load(Ordering::Acquire) != RunState::Pending.as_u8() {
            return;
        }
        if inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *inner.runner.lock() = Some(thread::current());
        if inner.state.load(Ordering::Acquire) == RunState::Pending.as_u8() {
            if let Some(mut work) = inner.work.lock().take() {
                let outcome = match catch_unwind(AssertUnwindSafe(|| work())) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(cause)) => Err(cause),
                    Err(payload) => Err(Arc::new(Panicked::from_payload(payload)) as Cause),
                };
                drop(work);
                self.complete(outcome);
            }
        }
        *inner.runner.lock() = None;
        if inner.state.load(Ordering::Acquire) >= RunState::Interrupting.as_u8() {
            self.await_interrupt_delivered();
        }
    }

    /// Executes the work without publishing its value, leaving the task
    /// pending for periodic re-execution.
    ///
    /// Returns true if the run succeeded and the task is ready to run
    /// again; false if the task could not run, failed, or was cancelled.
    pub fn run_and_reset(&self) -> bool {
        let inner = &*self.inner;
        if inner.state.load(Ordering::Acquire) != RunState::Pending.as_u8() {
            return false;
        }
        if inner
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *inner.runner.lock() = Some(thread::current());
        let mut ran = false;
        if inner.state.load(Ordering::Acquire) == RunState::Pending.as_u8() {
            if let Some(mut work) = inner.work.lock().take() {
                match catch_unwind(AssertUnwindSafe(|| work())) {
                    Ok(Ok(_)) => {
                        *inner.work.lock() = Some(work);
                        ran = true;
                    }
                    Ok(Err(cause)) => {
                        drop(work);
                        self.complete(Err(cause));
                    }
                    Err(payload) => {
                        drop(work);
                        self.complete(Err(Arc::new(Panicked::from_payload(payload)) as Cause));
                    }
                }
            }
        }
        *inner.runner.lock() = None;
        let state = inner.state.load(Ordering::Acquire);
        if state >= RunState::Interrupting.as_u8() {
            self.await_interrupt_delivered();
        }
        if ran && state == RunState::Pending.as_u8() {
            inner.claimed.store(false, Ordering::Release);
            return true;
        }
        false
    }

    /// Cancels the task if it has not settled.
    ///
    /// With `may_interrupt`, the running thread (if any) receives a
    /// directed wake and the state passes through `Interrupting` before
    /// settling at `Interrupted`. Returns whether this call newly
    /// cancelled the task; a cancel racing a completed, failed, or
    /// already-cancelled task returns false and never alters the stored
    /// outcome.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let inner = &*self.inner;
        let target = if may_interrupt {
            RunState::Interrupting
        } else {
            RunState::Cancelled
        };
        if inner
            .state
            .compare_exchange(
                RunState::Pending.as_u8(),
                target.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        if may_interrupt {
            if let Some(runner) = inner.runner.lock().clone() {
                runner.unpark();
            }
            // Unique value, never revisited: a plain release store
            // finishes the transient state.
            inner.state.store(RunState::Interrupted.as_u8(), Ordering::Release);
        }
        tracing::trace!(target: "converge::task", interrupt = may_interrupt, "task cancelled");
        self.finish_completion();
        true
    }

    /// Blocks until the task settles and returns its value.
    ///
    /// Every concurrent joiner observes the identical stored value
    /// (cloned out per caller) or the same typed failure.
    pub fn join(&self, cx: &Cx) -> Result<T, JoinError>
    where
        T: Clone,
    {
        match self.await_done(cx, None) {
            Ok(state) => self.report(state),
            Err(Interrupted) => Err(JoinError::Interrupted),
        }
    }

    /// Blocks until the task settles or `timeout` elapses.
    pub fn join_timeout(&self, cx: &Cx, timeout: Duration) -> Result<T, JoinError>
    where
        T: Clone,
    {
        match self.await_done(cx, Some(Instant::now() + timeout)) {
            Ok(state) => self.report(state),
            Err(Interrupted) => Err(JoinError::Interrupted),
        }
    }

    /// Blocks until the task settles, ignoring the outcome.
    pub fn wait_done(&self, cx: &Cx) -> Result<(), Interrupted> {
        self.await_done(cx, None).map(|_| ())
    }

    /// Blocks until the task settles or `deadline` passes. Returns
    /// whether the task settled.
    pub fn wait_done_deadline(&self, cx: &Cx, deadline: Instant) -> Result<bool, Interrupted> {
        let state = self.await_done(cx, Some(deadline))?;
        Ok(state > RunState::Completing.as_u8())
    }

    /// Installs the completion hook, replacing any previous one.
    ///
    /// The hook fires exactly once, on the thread that settles the task;
    /// if the task has already settled it fires here, immediately.
    pub fn set_completion_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.inner.hook.lock();
        if self.is_settled() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Waits for a settled state (anything above `Completing`).
    ///
    /// On deadline expiry the waiter record is abandoned and the final
    /// state re-read is returned, which may still be `Pending`; the
    /// caller maps that to a timeout. A cancelled `Cx` fails the wait
    /// and consumes the cancel.
    fn await_done(&self, cx: &Cx, deadline: Option<Instant>) -> Result<u8, Interrupted> {
        let inner = &*self.inner;
        let mut node = None;
        loop {
            let state = inner.state.load(Ordering::Acquire);
            if state > RunState::Completing.as_u8() {
                return Ok(state);
            }
            if state == RunState::Completing.as_u8() {
                // The outcome write is in flight and the window is
                // bounded; yield instead of parking.
                thread::yield_now();
                continue;
            }
            if cx.is_cancel_requested() {
                if let Some(node) = &node {
                    inner.waiters.abandon(node);
                }
                cx.take_cancel();
                return Err(Interrupted);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    if let Some(node) = &node {
                        inner.waiters.abandon(node);
                    }
                    return Ok(inner.state.load(Ordering::Acquire));
                }
            }
            match &node {
                None => {
                    // A refused push means the stack was drained; the
                    // next load observes the settled state.
                    node = inner.waiters.push_current();
                }
                Some(_) => match deadline {
                    Some(deadline) => cx.park_deadline(deadline),
                    None => cx.park(),
                },
            }
        }
    }

    fn report(&self, state: u8) -> Result<T, JoinError>
    where
        T: Clone,
    {
        match RunState::from_u8(state) {
            // SAFETY: a terminal Completed/Failed state was published by
            // a release store after the unique outcome write; the
            // acquire load in `await_done` makes the cell readable.
            RunState::Completed => match unsafe { &*self.inner.outcome.get() } {
                Some(Ok(value)) => Ok(value.clone()),
                _ => unreachable!("completed task without stored value"),
            },
            RunState::Failed => match unsafe { &*self.inner.outcome.get() } {
                Some(Err(cause)) => Err(JoinError::Failed(Arc::clone(cause))),
                _ => unreachable!("failed task without stored cause"),
            },
            RunState::Cancelled | RunState::Interrupting | RunState::Interrupted => {
                Err(JoinError::Cancelled)
            }
            RunState::Pending | RunState::Completing => Err(JoinError::Timeout),
        }
    }

    /// Publishes the outcome and settles the state machine. A losing
    /// race against a cancel discards the outcome.
    fn complete(&self, outcome: Result<T, Cause>) {
        let inner = &*self.inner;
        if inner
            .state
            .compare_exchange(
                RunState::Pending.as_u8(),
                RunState::Completing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let terminal = if outcome.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        // SAFETY: winning the CAS above makes this thread the unique
        // writer; no reader touches the cell before the release store.
        unsafe {
            *inner.outcome.get() = Some(outcome);
        }
        inner.state.store(terminal.as_u8(), Ordering::Release);
        tracing::trace!(target: "converge::task", state = ?terminal, "task settled");
        self.finish_completion();
    }

    /// Wakes all waiters, fires the hook, and releases the work closure.
    fn finish_completion(&self) {
        let inner = &*self.inner;
        inner.waiters.drain();
        if let Some(hook) = inner.hook.lock().take() {
            hook();
        }
        inner.work.lock().take();
    }

    /// True once the state is above `Completing` from a waiter's
    /// perspective.
    fn is_settled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) > RunState::Completing.as_u8()
    }

    /// Polls the shared state until an in-flight interrupt has fully
    /// landed. A short spin, never a blocking wait — blocking here would
    /// deadlock against the very thread delivering the signal.
    fn await_interrupt_delivered(&self) {
        let mut backoff = Backoff::new(&SpinConfig::default());
        while self.inner.state.load(Ordering::Acquire) == RunState::Interrupting.as_u8() {
            backoff.snooze();
        }
    }
}
