//! One-shot countdown gate.
//!
//! A [`Latch`] starts at a fixed count and opens — once, permanently —
//! when `count_down` has been called that many times. Waiters block until
//! the zero transition; there is no reset. Callers that need repeatable
//! rounds should use [`Barrier`](crate::sync::Barrier) instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::cx::{Cx, Interrupted};
use crate::sync::waiters::WaiterStack;

/// One-shot N-to-zero countdown gate.
#[derive(Debug)]
pub struct Latch {
    count: AtomicUsize,
    waiters: WaiterStack,
}

impl Latch {
    /// Creates a latch that opens after `count` calls to [`count_down`].
    ///
    /// A zero count creates an already-open latch.
    ///
    /// [`count_down`]: Latch::count_down
    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            waiters: WaiterStack::new(),
        }
    }

    /// Returns the remaining count. Never negative; zero once open.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Decrements the count if above zero; the transition to zero wakes
    /// all waiters, exactly once. Decrementing an open latch is a no-op.
    pub fn count_down(&self) {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        tracing::trace!(target: "converge::latch", "latch opened");
                        self.waiters.drain();
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Blocks until the latch opens.
    ///
    /// Returns immediately if the count is already zero. Cancelling the
    /// `Cx` fails the wait with [`Interrupted`], consuming the cancel.
    pub fn wait(&self, cx: &Cx) -> Result<(), Interrupted> {
        self.wait_inner(cx, None).map(|_| ())
    }

    /// Blocks until the latch opens or `timeout` elapses.
    ///
    /// Returns `Ok(true)` if the latch opened, `Ok(false)` if the
    /// deadline elapsed with the gate still closed.
    pub fn wait_timeout(&self, cx: &Cx, timeout: Duration) -> Result<bool, Interrupted> {
        self.wait_inner(cx, Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, cx: &Cx, deadline: Option<Instant>) -> Result<bool, Interrupted> {
        let mut node = None;
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return Ok(true);
            }
            if cx.is_cancel_requested() {
                if let Some(node) = &node {
                    self.waiters.abandon(node);
                }
                cx.take_cancel();
                return Err(Interrupted);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    if let Some(node) = &node {
                        self.waiters.abandon(node);
                    }
                    return Ok(false);
                }
            }
            match &node {
                None => {
                    // A refused push means the gate opened concurrently;
                    // the next loop iteration observes the zero count.
                    node = self.waiters.push_current();
                }
                Some(_) => match deadline {
                    Some(deadline) => cx.park_deadline(deadline),
                    None => cx.park(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::Arc;
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn count_down_to_zero_releases_waiters() {
        init_test("count_down_to_zero_releases_waiters");
        let latch = Arc::new(Latch::new(3));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = Arc::clone(&latch);
            handles.push(thread::spawn(move || {
                let cx = Cx::for_testing();
                latch.wait(&cx).expect("wait failed");
            }));
        }

        for _ in 0..3 {
            latch.count_down();
        }
        for handle in handles {
            handle.join().expect("waiter thread panicked");
        }

        let count = latch.count();
        crate::assert_with_log!(count == 0, "count after open", 0usize, count);
        crate::test_complete!("count_down_to_zero_releases_waiters");
    }

    #[test]
    fn extra_count_down_is_noop() {
        init_test("extra_count_down_is_noop");
        let latch = Latch::new(2);
        for _ in 0..10 {
            latch.count_down();
        }
        let count = latch.count();
        crate::assert_with_log!(count == 0, "count never negative", 0usize, count);
        crate::test_complete!("extra_count_down_is_noop");
    }

    #[test]
    fn zero_count_latch_is_open() {
        init_test("zero_count_latch_is_open");
        let latch = Latch::new(0);
        let cx = Cx::for_testing();
        latch.wait(&cx).expect("open latch must not block");
        crate::test_complete!("zero_count_latch_is_open");
    }

    #[test]
    fn wait_timeout_reports_closed_gate() {
        init_test("wait_timeout_reports_closed_gate");
        let latch = Latch::new(1);
        let cx = Cx::for_testing();
        let opened = latch
            .wait_timeout(&cx, Duration::from_millis(30))
            .expect("wait failed");
        crate::assert_with_log!(!opened, "gate stayed closed", false, opened);

        latch.count_down();
        let opened = latch
            .wait_timeout(&cx, Duration::from_millis(30))
            .expect("wait failed");
        crate::assert_with_log!(opened, "gate opened", true, opened);
        crate::test_complete!("wait_timeout_reports_closed_gate");
    }

    #[test]
    fn cancelled_wait_is_interrupted_and_consumes_flag() {
        init_test("cancelled_wait_is_interrupted_and_consumes_flag");
        let latch = Latch::new(1);
        let cx = Cx::for_testing();
        cx.cancel();
        let err = latch.wait(&cx).expect_err("expected interruption");
        crate::assert_with_log!(err == Interrupted, "interrupted", Interrupted, err);
        let pending = cx.is_cancel_requested();
        crate::assert_with_log!(!pending, "cancel consumed", false, pending);
        crate::test_complete!("cancelled_wait_is_interrupted_and_consumes_flag");
    }

    #[test]
    fn open_latch_ignores_pending_cancel_on_fast_path() {
        init_test("open_latch_ignores_pending_cancel_on_fast_path");
        let latch = Latch::new(1);
        latch.count_down();
        let cx = Cx::for_testing();
        cx.cancel();
        latch.wait(&cx).expect("open latch returns before cancel check");
        let pending = cx.is_cancel_requested();
        crate::assert_with_log!(pending, "cancel left pending", true, pending);
        crate::test_complete!("open_latch_ignores_pending_cancel_on_fast_path");
    }
}
