//! Completion coordination: waiting on many tasks collectively.
//!
//! Built entirely on [`AsyncResult`] plus the external [`Execute`]
//! abstraction:
//!
//! - [`invoke_all`] / [`invoke_all_timeout`]: run every task, wait for
//!   all of them, positionally stable results
//! - [`invoke_any`] / [`invoke_any_timeout`]: first successful value
//!   wins, submitting tasks incrementally as needed
//! - [`CompletionQueue`]: consume settled results in strict completion
//!   order (FIFO of completion times), not submission order
//!
//! Every early exit — rejection, interruption, timeout, first success —
//! best-effort cancels the stragglers with interruption requested;
//! cancellation outcome is not itself an error and is never retried.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::cx::{Cx, Interrupted};
use crate::task::async_result::{AsyncResult, Cause, JoinError, TaskFn};
use crate::task::executor::{Execute, RejectedError};

/// How long a blocked consumer sleeps before re-checking cancellation.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Error returned by the bulk invocation operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    /// No tasks were supplied.
    #[error("no tasks were supplied")]
    Empty,
    /// The executor rejected a submission.
    #[error("executor rejected a task")]
    Rejected(#[from] RejectedError),
    /// No task ever succeeded; carries the last failure seen.
    #[error("no task completed successfully")]
    Failed(#[source] Cause),
    /// The coordinating thread's `Cx` was cancelled.
    #[error("interrupted while coordinating tasks")]
    Interrupted,
    /// The deadline elapsed before any task succeeded.
    #[error("deadline elapsed before any task succeeded")]
    Timeout,
}

struct QueueShared<T> {
    ready: SegQueue<AsyncResult<T>>,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// Queue of task results in strict completion order.
///
/// Each submitted task carries a completion hook that enqueues its
/// handle the moment it settles; consumers retrieve handles in the
/// order the tasks finished.
pub struct CompletionQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> std::fmt::Debug for CompletionQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("ready", &self.shared.ready.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> CompletionQueue<T> {
    /// Creates an empty completion queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                ready: SegQueue::new(),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Submits `work` to `executor`; the returned handle is also
    /// enqueued here the moment it settles.
    pub fn submit<E>(&self, executor: &E, work: TaskFn<T>) -> Result<AsyncResult<T>, RejectedError>
    where
        E: Execute + ?Sized,
    {
        let result = AsyncResult::new(work);
        let run = result.clone();
        executor.execute(Box::new(move || run.run()))?;
        // Installed after submission on purpose: a rejected task never
        // pollutes the queue. A task that settled in between fires the
        // hook right here, exactly once.
        let shared = Arc::clone(&self.shared);
        let settled = result.clone();
        result.set_completion_hook(move || {
            shared.ready.push(settled);
            let _guard = shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
            shared.cvar.notify_all();
        });
        Ok(result)
    }

    /// Removes and returns the next settled result, if any.
    #[must_use]
    pub fn poll(&self) -> Option<AsyncResult<T>> {
        self.shared.ready.pop()
    }

    /// Blocks until a settled result is available.
    pub fn take(&self, cx: &Cx) -> Result<AsyncResult<T>, Interrupted> {
        loop {
            if let Some(result) = self.shared.ready.pop() {
                return Ok(result);
            }
            cx.checkpoint()?;
            self.sleep_slice(POLL_SLICE);
        }
    }

    /// Blocks until a settled result is available or `timeout` elapses.
    pub fn poll_timeout(
        &self,
        cx: &Cx,
        timeout: Duration,
    ) -> Result<Option<AsyncResult<T>>, Interrupted> {
        self.take_deadline(cx, Instant::now() + timeout)
    }

    pub(crate) fn take_deadline(
        &self,
        cx: &Cx,
        deadline: Instant,
    ) -> Result<Option<AsyncResult<T>>, Interrupted> {
        loop {
            if let Some(result) = self.shared.ready.pop() {
                return Ok(Some(result));
            }
            cx.checkpoint()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.sleep_slice(POLL_SLICE.min(remaining));
        }
    }

    /// Number of settled results waiting to be consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.ready.len()
    }

    /// True when no settled result is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.ready.is_empty()
    }

    fn sleep_slice(&self, slice: Duration) {
        let guard = self.shared.lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock so a push+notify between the pop and
        // this wait is not slept through.
        if self.shared.ready.is_empty() {
            let _ = self
                .shared
                .cvar
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Send + 'static> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits every task and waits for all of them in submission order.
///
/// The returned list is positionally stable with respect to `tasks`. On
/// any early exit (rejection, interruption) every not-yet-settled task
/// is cancelled with interruption requested.
pub fn invoke_all<T, E>(
    executor: &E,
    cx: &Cx,
    tasks: Vec<TaskFn<T>>,
) -> Result<Vec<AsyncResult<T>>, InvokeError>
where
    T: Send + 'static,
    E: Execute + ?Sized,
{
    let results: Vec<AsyncResult<T>> = tasks.into_iter().map(AsyncResult::new).collect();
    let mut error = None;
    for result in &results {
        let run = result.clone();
        if let Err(rejected) = executor.execute(Box::new(move || run.run())) {
            error = Some(InvokeError::Rejected(rejected));
            break;
        }
    }
    if error.is_none() {
        for result in &results {
            if result.wait_done(cx).is_err() {
                error = Some(InvokeError::Interrupted);
                break;
            }
        }
    }
    if let Some(error) = error {
        cancel_unfinished(&results);
        return Err(error);
    }
    Ok(results)
}

/// Submits every task and waits for all of them, with a deadline spread
/// across submission and waiting.
///
/// Exceeding the deadline is not an error: the unfinished tasks are
/// cancelled with interruption requested and the positionally stable
/// list is returned with whatever completed.
pub fn invoke_all_timeout<T, E>(
    executor: &E,
    cx: &Cx,
    tasks: Vec<TaskFn<T>>,
    timeout: Duration,
) -> Result<Vec<AsyncResult<T>>, InvokeError>
where
    T: Send + 'static,
    E: Execute + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let results: Vec<AsyncResult<T>> = tasks.into_iter().map(AsyncResult::new).collect();
    let mut error = None;
    let mut timed_out = false;

    for result in &results {
        if Instant::now() >= deadline {
            timed_out = true;
            break;
        }
        let run = result.clone();
        if let Err(rejected) = executor.execute(Box::new(move || run.run())) {
            error = Some(InvokeError::Rejected(rejected));
            break;
        }
    }
    if error.is_none() && !timed_out {
        for result in &results {
            match result.wait_done_deadline(cx, deadline) {
                Ok(true) => {}
                Ok(false) => {
                    timed_out = true;
                    break;
                }
                Err(Interrupted) => {
                    error = Some(InvokeError::Interrupted);
                    break;
                }
            }
        }
    }
    if let Some(error) = error {
        cancel_unfinished(&results);
        return Err(error);
    }
    if timed_out {
        tracing::debug!(
            target: "converge::completion",
            total = results.len(),
            "deadline elapsed, cancelling unfinished tasks"
        );
        cancel_unfinished(&results);
    }
    Ok(results)
}

/// Runs the tasks until one succeeds and returns its value.
///
/// Tasks are submitted incrementally, one eagerly and the rest only as
/// needed, driven by a completion-order queue. The last failure seen is
/// surfaced only if no task ever succeeds. On every exit path all
/// outstanding tasks are cancelled with interruption requested.
pub fn invoke_any<T, E>(executor: &E, cx: &Cx, tasks: Vec<TaskFn<T>>) -> Result<T, InvokeError>
where
    T: Send + Clone + 'static,
    E: Execute + ?Sized,
{
    do_invoke_any(executor, cx, tasks, None)
}

/// Like [`invoke_any`], giving up with [`InvokeError::Timeout`] when the
/// deadline elapses first.
pub fn invoke_any_timeout<T, E>(
    executor: &E,
    cx: &Cx,
    tasks: Vec<TaskFn<T>>,
    timeout: Duration,
) -> Result<T, InvokeError>
where
    T: Send + Clone + 'static,
    E: Execute + ?Sized,
{
    do_invoke_any(executor, cx, tasks, Some(Instant::now() + timeout))
}

fn do_invoke_any<T, E>(
    executor: &E,
    cx: &Cx,
    tasks: Vec<TaskFn<T>>,
    deadline: Option<Instant>,
) -> Result<T, InvokeError>
where
    T: Send + Clone + 'static,
    E: Execute + ?Sized,
{
    if tasks.is_empty() {
        return Err(InvokeError::Empty);
    }
    let queue = CompletionQueue::new();
    let mut submitted = Vec::with_capacity(tasks.len());
    let outcome = run_invoke_any(executor, cx, &queue, tasks, deadline, &mut submitted);
    for result in &submitted {
        result.cancel(true);
    }
    outcome
}

fn run_invoke_any<T, E>(
    executor: &E,
    cx: &Cx,
    queue: &CompletionQueue<T>,
    tasks: Vec<TaskFn<T>>,
    deadline: Option<Instant>,
    submitted: &mut Vec<AsyncResult<T>>,
) -> Result<T, InvokeError>
where
    T: Send + Clone + 'static,
    E: Execute + ?Sized,
{
    let mut work_iter = tasks.into_iter();
    let mut active = 0usize;
    let mut last_failure: Option<Cause> = None;

    let first = work_iter.next().expect("task set checked non-empty");
    submitted.push(queue.submit(executor, first)?);
    active += 1;

    loop {
        let settled = if let Some(result) = queue.poll() {
            result
        } else if let Some(work) = work_iter.next() {
            submitted.push(queue.submit(executor, work)?);
            active += 1;
            continue;
        } else if active == 0 {
            let cause = last_failure
                .take()
                .expect("every settled task recorded an outcome");
            return Err(InvokeError::Failed(cause));
        } else {
            match deadline {
                Some(deadline) => queue
                    .take_deadline(cx, deadline)
                    .map_err(|Interrupted| InvokeError::Interrupted)?
                    .ok_or(InvokeError::Timeout)?,
                None => queue
                    .take(cx)
                    .map_err(|Interrupted| InvokeError::Interrupted)?,
            }
        };

        active -= 1;
        match settled.join(cx) {
            Ok(value) => return Ok(value),
            Err(failure) => {
                tracing::debug!(
                    target: "converge::completion",
                    error = %failure,
                    "candidate task failed"
                );
                last_failure = Some(match failure {
                    JoinError::Failed(cause) => cause,
                    other => Arc::new(other) as Cause,
                });
            }
        }
    }
}

fn cancel_unfinished<T: Send + 'static>(results: &[AsyncResult<T>]) {
    for result in results {
        if !result.is_done() {
            result.cancel(true);
        }
    }
}
