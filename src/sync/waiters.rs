//! Lock-free stack of parked waiter records.
//!
//! A Treiber stack over an atomic head pointer, shared by the primitives
//! that signal "all waiters at once" (`AsyncResult` completion, `Latch`
//! reaching zero). Each record carries the waiting thread's handle and is
//! flagged inactive once signaled or abandoned; records are pushed with a
//! CAS and the whole stack is drained exactly once, at the signal
//! transition. After the drain the stack is closed: later pushes fail and
//! the pusher re-reads the primitive's state instead of parking.
//!
//! Abandoning a wait (timeout, cancellation) nulls the record's activity
//! flag; the record is physically unlinked only when it is still the
//! stack head (a single CAS, race-free against the drain). Interior
//! records stay linked until the drain or the stack's drop reclaims them.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use smallvec::SmallVec;

/// A single parked waiter record.
#[derive(Debug)]
pub(crate) struct Waiter {
    thread: Thread,
    /// True until the record is signaled or abandoned.
    active: AtomicBool,
    next: AtomicPtr<Waiter>,
}

impl Waiter {
    /// True once a drain has signaled this record.
    pub(crate) fn is_signaled(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }
}

/// Sentinel head value marking a drained (closed) stack. Never
/// dereferenced; no allocation can sit at the address space's top.
fn closed() -> *mut Waiter {
    usize::MAX as *mut Waiter
}

/// Treiber stack of parked waiters.
#[derive(Debug)]
pub(crate) struct WaiterStack {
    head: AtomicPtr<Waiter>,
}

impl WaiterStack {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes a record for the current thread.
    ///
    /// Returns `None` if the stack is already closed — the signal the
    /// caller was going to wait for has fired, so it must re-read state
    /// rather than park.
    pub(crate) fn push_current(&self) -> Option<Arc<Waiter>> {
        let node = Arc::new(Waiter {
            thread: thread::current(),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        });
        // The stack holds one strong reference via the raw pointer; the
        // waiting thread keeps the other, so the record outlives any
        // concurrent drain.
        let raw = Arc::into_raw(Arc::clone(&node)).cast_mut();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == closed() {
                // SAFETY: the raw pointer came from `Arc::into_raw` above
                // and was never published; reclaim the stack's reference.
                drop(unsafe { Arc::from_raw(raw) });
                return None;
            }
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Some(node),
                Err(current) => head = current,
            }
        }
    }

    /// Closes the stack and wakes every active record. Idempotent; only
    /// the first call observes the chain.
    pub(crate) fn drain(&self) {
        let mut cursor = self.head.swap(closed(), Ordering::AcqRel);
        if cursor == closed() {
            return;
        }
        let mut threads: SmallVec<[Thread; 8]> = SmallVec::new();
        while !cursor.is_null() {
            // SAFETY: every non-null, non-sentinel pointer in the chain
            // was published by `push_current` via `Arc::into_raw`; the
            // swap above transferred those references to this drain.
            let node = unsafe { Arc::from_raw(cursor) };
            cursor = node.next.load(Ordering::Acquire);
            if node.active.swap(false, Ordering::AcqRel) {
                threads.push(node.thread.clone());
            }
        }
        for thread in threads {
            thread.unpark();
        }
    }

    /// Marks a record inactive after a timeout or cancellation, and
    /// unlinks it physically when it is still the stack head.
    pub(crate) fn abandon(&self, node: &Arc<Waiter>) {
        node.active.store(false, Ordering::Release);
        let raw = Arc::as_ptr(node).cast_mut();
        let next = node.next.load(Ordering::Acquire);
        if self
            .head
            .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: the successful CAS removed the stack's pointer to
            // this record before any drain swapped the head, so the
            // stack's strong reference is ours to release.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }

    /// True once the stack has been drained.
    pub(crate) fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == closed()
    }
}

impl Drop for WaiterStack {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        if cursor == closed() {
            return;
        }
        while !cursor.is_null() {
            // SAFETY: as in `drain`; exclusive access, references are ours.
            let node = unsafe { Arc::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}
