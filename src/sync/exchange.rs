//! Pairwise rendezvous with a contention-adaptive elimination arena.
//!
//! Two threads meet at an [`Exchanger`] and swap items: the first to
//! arrive installs an offer in a slot and waits; the second claims the
//! offer with a CAS, hands its own item over as the match, and releases
//! the partner. The slot only ever transitions by CAS, so the release
//! act is unconditionally correct.
//!
//! Under contention the single slot escalates to an *elimination arena*:
//! a padded slot array allocated once at its maximum size, with a
//! versioned in-use bound that grows on collisions and shrinks on clean
//! timeouts. Each participant keeps private probing state (slot index,
//! collision count, RNG seed) that restarts whenever the bound's version
//! moves.
//!
//! # Waiting policy
//!
//! A waiting offerer spins with randomized backoff for a bounded
//! iteration count, then parks (single slot and arena slot 0) or moves
//! to a lower arena slot (other slots). A thread giving up retracts its
//! offer by CAS; once a partner has claimed the offer it can no longer
//! be retracted, and the giving-up thread still spins until the match
//! write becomes visible — no item is ever lost.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hint;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{apply_exchange_env_overrides, ConfigError, ExchangeConfig, SpinConfig};
use crate::cx::Cx;
use crate::util::{Backoff, XorShift64};

/// Error returned when an exchange fails; the offered item rides along
/// so the caller keeps ownership.
#[derive(thiserror::Error)]
pub enum ExchangeError<T> {
    /// The deadline elapsed before a partner arrived.
    #[error("exchange timed out before a partner arrived")]
    Timeout(T),
    /// The wait was cancelled before a partner arrived.
    #[error("exchange interrupted before a partner arrived")]
    Interrupted(T),
}

impl<T> ExchangeError<T> {
    /// Recovers the item that was offered.
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(item) | Self::Interrupted(item) => item,
        }
    }

    /// True for the timeout variant.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl<T> fmt::Debug for ExchangeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(_) => f.write_str("Timeout(..)"),
            Self::Interrupted(_) => f.write_str("Interrupted(..)"),
        }
    }
}

/// An in-flight offer. The slot and the offering thread each hold a
/// strong reference; the claiming partner takes over the slot's.
struct Node<T> {
    /// The offered item; taken by the claiming partner, or reclaimed by
    /// the offerer after a successful retraction.
    item: Mutex<Option<T>>,
    /// The partner's item, written by the claimant before release.
    partner: Mutex<Option<T>>,
    released: AtomicBool,
    /// Parked offerer; published once per park, nulled after use.
    waiter: Mutex<Option<Thread>>,
}

impl<T> Node<T> {
    fn new(item: T) -> Self {
        Self {
            item: Mutex::new(Some(item)),
            partner: Mutex::new(None),
            released: AtomicBool::new(false),
            waiter: Mutex::new(None),
        }
    }
}

/// Exchange slot padded out to its own cache lines.
#[repr(align(128))]
struct Slot<T> {
    node: AtomicPtr<Node<T>>,
}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            node: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        let raw = *self.node.get_mut();
        if !raw.is_null() {
            // SAFETY: the slot's strong reference is exclusively ours now.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }
}

const BOUND_MASK: u32 = 0xFFFF;
const VERSION_UNIT: u32 = 1 << 16;

/// Advances the version stamp and sets a new in-use bound.
#[allow(clippy::cast_possible_truncation)]
const fn stamp(bound_word: u32, new_max: usize) -> u32 {
    (bound_word & !BOUND_MASK).wrapping_add(VERSION_UNIT) | (new_max as u32 & BOUND_MASK)
}

/// Per-thread probing state, keyed by exchanger identity.
struct Participant {
    index: usize,
    bound_cache: u32,
    collisions: u32,
    rng: XorShift64,
}

impl Participant {
    fn new() -> Self {
        Self {
            index: 0,
            bound_cache: 0,
            collisions: 0,
            rng: XorShift64::from_entropy(),
        }
    }
}

thread_local! {
    static PARTICIPANTS: RefCell<HashMap<u64, Participant>> = RefCell::new(HashMap::new());
}

/// Outcome of waiting on an installed offer.
enum WaitOutcome {
    Released,
    Cancelled,
    Expired,
}

enum SlotOutcome<T> {
    Done(T),
    Fail(ExchangeError<T>),
    Escalate(T),
}

/// Synchronization point at which two threads swap items.
pub struct Exchanger<T> {
    slot: Slot<T>,
    arena: OnceLock<Box<[Slot<T>]>>,
    /// Versioned in-use bound: version in the high bits, max in-use
    /// arena index in the low 16.
    bound: AtomicU32,
    config: ExchangeConfig,
    id: u64,
    _marker: PhantomData<T>,
}

// SAFETY: items only ever move between threads through CAS-mediated
// ownership transfer; no `&T` is shared across threads.
unsafe impl<T: Send> Send for Exchanger<T> {}
unsafe impl<T: Send> Sync for Exchanger<T> {}

impl<T: Send> Exchanger<T> {
    /// Creates an exchanger with default tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ExchangeConfig::default())
    }

    /// Creates an exchanger with default tuning plus `CONVERGE_*`
    /// environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ExchangeConfig::default();
        apply_exchange_env_overrides(&mut config)?;
        Ok(Self::with_config(config))
    }

    /// Creates an exchanger with explicit tuning.
    #[must_use]
    pub fn with_config(mut config: ExchangeConfig) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        config.normalize();
        let cpus = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        if cpus == 1 {
            // A lone core cannot observe a partner's progress by spinning.
            config.spin_iterations = 1;
        }
        Self {
            slot: Slot::new(),
            arena: OnceLock::new(),
            bound: AtomicU32::new(0),
            config,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Exchanges `item` for the partner's item, waiting indefinitely for
    /// a partner.
    ///
    /// A cancelled `Cx` fails with [`ExchangeError::Interrupted`] and
    /// returns the item, unless a partner had already claimed the offer —
    /// a claimed offer always completes and the cancel stays pending.
    pub fn exchange(&self, cx: &Cx, item: T) -> Result<T, ExchangeError<T>> {
        self.do_exchange(cx, item, None)
    }

    /// Exchanges `item` for the partner's item, waiting at most
    /// `timeout`.
    pub fn exchange_timeout(
        &self,
        cx: &Cx,
        item: T,
        timeout: Duration,
    ) -> Result<T, ExchangeError<T>> {
        self.do_exchange(cx, item, Some(Instant::now() + timeout))
    }

    fn do_exchange(
        &self,
        cx: &Cx,
        item: T,
        deadline: Option<Instant>,
    ) -> Result<T, ExchangeError<T>> {
        if self.arena.get().is_some() {
            return self.arena_exchange(cx, item, deadline);
        }
        match self.slot_exchange(cx, item, deadline) {
            SlotOutcome::Done(got) => Ok(got),
            SlotOutcome::Fail(err) => Err(err),
            SlotOutcome::Escalate(item) => {
                tracing::debug!(
                    target: "converge::exchange",
                    slots = self.config.max_arena_slots,
                    "slot contention, enabling elimination arena"
                );
                self.arena
                    .get_or_init(|| (0..self.config.max_arena_slots).map(|_| Slot::new()).collect());
                let _ = self
                    .bound
                    .compare_exchange(0, VERSION_UNIT, Ordering::AcqRel, Ordering::Acquire);
                self.arena_exchange(cx, item, deadline)
            }
        }
    }

    /// Single-slot fast path. Returns `Escalate` after the configured
    /// number of failed release CASes.
    fn slot_exchange(
        &self,
        cx: &Cx,
        mut item: T,
        deadline: Option<Instant>,
    ) -> SlotOutcome<T> {
        let mut rng = XorShift64::from_entropy();
        let mut release_failures = 0;
        loop {
            if cx.take_cancel() {
                return SlotOutcome::Fail(ExchangeError::Interrupted(item));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return SlotOutcome::Fail(ExchangeError::Timeout(item));
                }
            }

            let resident = self.slot.node.load(Ordering::Acquire);
            if !resident.is_null() {
                match Self::claim(&self.slot, resident, item) {
                    Ok(got) => return SlotOutcome::Done(got),
                    Err(returned) => {
                        item = returned;
                        release_failures += 1;
                        if release_failures >= self.config.collision_threshold {
                            return SlotOutcome::Escalate(item);
                        }
                        continue;
                    }
                }
            }

            let node = Arc::new(Node::new(item));
            let Some(raw) = Self::install(&self.slot, &node) else {
                // Two simultaneous offers are the expected rendezvous,
                // not contention; just retry.
                item = node.item.lock().take().expect("unpublished offer kept its item");
                continue;
            };
            match self.wait_for_release(cx, &node, deadline, true, &mut rng) {
                WaitOutcome::Released => return SlotOutcome::Done(Self::take_match(&node)),
                WaitOutcome::Cancelled => {
                    if Self::retract(&self.slot, raw) {
                        cx.take_cancel();
                        let item = node.item.lock().take().expect("retracted offer kept its item");
                        return SlotOutcome::Fail(ExchangeError::Interrupted(item));
                    }
                    return SlotOutcome::Done(Self::await_forced_release(&node));
                }
                WaitOutcome::Expired => {
                    if Self::retract(&self.slot, raw) {
                        let item = node.item.lock().take().expect("retracted offer kept its item");
                        return SlotOutcome::Fail(ExchangeError::Timeout(item));
                    }
                    return SlotOutcome::Done(Self::await_forced_release(&node));
                }
            }
        }
    }

    /// Elimination-arena path: probe a private index, claim or offer,
    /// grow the bound on collisions, halve the index and shrink the
    /// bound on spin expiration.
    fn arena_exchange(
        &self,
        cx: &Cx,
        item: T,
        deadline: Option<Instant>,
    ) -> Result<T, ExchangeError<T>> {
        let mut participant = PARTICIPANTS
            .with(|map| map.borrow_mut().remove(&self.id))
            .unwrap_or_else(Participant::new);
        let result = self.arena_loop(cx, item, deadline, &mut participant);
        PARTICIPANTS.with(|map| {
            map.borrow_mut().insert(self.id, participant);
        });
        result
    }

    fn arena_loop(
        &self,
        cx: &Cx,
        mut item: T,
        deadline: Option<Instant>,
        participant: &mut Participant,
    ) -> Result<T, ExchangeError<T>> {
        let arena = self.arena.get().expect("arena installed before arena path");
        loop {
            if cx.take_cancel() {
                return Err(ExchangeError::Interrupted(item));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ExchangeError::Timeout(item));
                }
            }

            let bound_word = self.bound.load(Ordering::Acquire);
            let max_index = (bound_word & BOUND_MASK) as usize;
            if participant.bound_cache != bound_word {
                // Stale probing state: restart at the sparsest end.
                participant.bound_cache = bound_word;
                participant.collisions = 0;
                participant.index = max_index;
            }
            if participant.index > max_index {
                participant.index = max_index;
            }
            let slot = &arena[participant.index];

            let resident = slot.node.load(Ordering::Acquire);
            if !resident.is_null() {
                match Self::claim(slot, resident, item) {
                    Ok(got) => return Ok(got),
                    Err(returned) => {
                        item = returned;
                        // A failed release CAS is true contention.
                        participant.collisions += 1;
                        participant.index = if participant.index == 0 {
                            max_index
                        } else {
                            participant.index - 1
                        };
                        if participant.collisions as usize > max_index
                            && max_index + 1 < arena.len()
                            && self
                                .bound
                                .compare_exchange(
                                    bound_word,
                                    stamp(bound_word, max_index + 1),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                )
                                .is_ok()
                        {
                            tracing::debug!(
                                target: "converge::exchange",
                                bound = max_index + 1,
                                "arena bound grown"
                            );
                        }
                        continue;
                    }
                }
            }

            let node = Arc::new(Node::new(item));
            let Some(raw) = Self::install(slot, &node) else {
                item = node.item.lock().take().expect("unpublished offer kept its item");
                continue;
            };
            // Only slot 0 parks; upper slots treat spin exhaustion as
            // expiration and fall back toward the dense end.
            let can_park = participant.index == 0;
            match self.wait_for_release(cx, &node, deadline, can_park, &mut participant.rng) {
                WaitOutcome::Released => return Ok(Self::take_match(&node)),
                WaitOutcome::Cancelled => {
                    if Self::retract(slot, raw) {
                        cx.take_cancel();
                        let item = node.item.lock().take().expect("retracted offer kept its item");
                        return Err(ExchangeError::Interrupted(item));
                    }
                    return Ok(Self::await_forced_release(&node));
                }
                WaitOutcome::Expired => {
                    if Self::retract(slot, raw) {
                        item = node.item.lock().take().expect("retracted offer kept its item");
                        if can_park {
                            return Err(ExchangeError::Timeout(item));
                        }
                        if participant.index == max_index && max_index > 0 {
                            // A clean expiration at the outermost slot
                            // shrinks the in-use bound by one.
                            let _ = self.bound.compare_exchange(
                                bound_word,
                                stamp(bound_word, max_index - 1),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                        participant.index /= 2;
                        continue;
                    }
                    return Ok(Self::await_forced_release(&node));
                }
            }
        }
    }

    /// Attempts the release act: CAS the resident offer out of the slot,
    /// take its item, hand over `item` as the match, wake the offerer.
    ///
    /// Returns the caller's item on CAS failure.
    fn claim(slot: &Slot<T>, resident: *mut Node<T>, item: T) -> Result<T, T> {
        if slot
            .node
            .compare_exchange(resident, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(item);
        }
        // SAFETY: the successful CAS transferred the slot's strong
        // reference to this thread.
        let their = unsafe { Arc::from_raw(resident) };
        let got = their.item.lock().take().expect("claimed offer lost its item");
        *their.partner.lock() = Some(item);
        their.released.store(true, Ordering::Release);
        if let Some(thread) = their.waiter.lock().take() {
            thread.unpark();
        }
        Ok(got)
    }

    /// Publishes an offer into an empty slot. `None` on CAS failure.
    fn install(slot: &Slot<T>, node: &Arc<Node<T>>) -> Option<*mut Node<T>> {
        let raw = Arc::into_raw(Arc::clone(node)).cast_mut();
        if slot
            .node
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(raw)
        } else {
            // SAFETY: never published; reclaim the reference made for
            // the slot.
            drop(unsafe { Arc::from_raw(raw) });
            None
        }
    }

    /// Retracts an offer that has not been claimed. `false` means a
    /// partner already owns it and the exchange must complete.
    fn retract(slot: &Slot<T>, raw: *mut Node<T>) -> bool {
        if slot
            .node
            .compare_exchange(raw, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: the CAS removed the slot's pointer; its strong
            // reference is ours to release.
            drop(unsafe { Arc::from_raw(raw) });
            true
        } else {
            false
        }
    }

    /// Waits for the resident offer to be released by a partner.
    fn wait_for_release(
        &self,
        cx: &Cx,
        node: &Node<T>,
        deadline: Option<Instant>,
        can_park: bool,
        rng: &mut XorShift64,
    ) -> WaitOutcome {
        let mut spins = self.config.spin_iterations;
        loop {
            if node.released.load(Ordering::Acquire) {
                return WaitOutcome::Released;
            }
            if cx.is_cancel_requested() {
                return WaitOutcome::Cancelled;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return WaitOutcome::Expired;
                }
            }
            if spins > 0 {
                spins -= 1;
                // Randomized pauses keep partnered spinners out of
                // lockstep.
                if rng.next_u32() & 0x7F == 0 {
                    thread::yield_now();
                } else {
                    hint::spin_loop();
                }
            } else if can_park {
                *node.waiter.lock() = Some(thread::current());
                // Re-check after publishing: the release or a cancel may
                // have landed since the last check.
                if node.released.load(Ordering::Acquire) || cx.is_cancel_requested() {
                    *node.waiter.lock() = None;
                    continue;
                }
                match deadline {
                    Some(deadline) => cx.park_deadline(deadline),
                    None => cx.park(),
                }
                *node.waiter.lock() = None;
            } else {
                return WaitOutcome::Expired;
            }
        }
    }

    /// Spins until a claimed offer's match write becomes visible.
    fn await_forced_release(node: &Node<T>) -> T {
        let mut backoff = Backoff::new(&SpinConfig::default());
        while !node.released.load(Ordering::Acquire) {
            backoff.snooze();
        }
        Self::take_match(node)
    }

    fn take_match(node: &Node<T>) -> T {
        node.partner.lock().take().expect("released offer missing its match")
    }
}

impl<T: Send> Default for Exchanger<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Exchanger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound_word = self.bound.load(Ordering::Relaxed);
        f.debug_struct("Exchanger")
            .field("arena_enabled", &self.arena.get().is_some())
            .field("bound", &(bound_word & BOUND_MASK))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn pair_swaps_items() {
        init_test("pair_swaps_items");
        let exchanger = Arc::new(Exchanger::new());

        let other = {
            let exchanger = Arc::clone(&exchanger);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                exchanger.exchange(&cx, "right").expect("exchange failed")
            })
        };

        let cx = Cx::for_testing();
        let got = exchanger.exchange(&cx, "left").expect("exchange failed");
        let their = other.join().expect("partner panicked");

        crate::assert_with_log!(got == "right", "left received right", "right", got);
        crate::assert_with_log!(their == "left", "right received left", "left", their);
        crate::test_complete!("pair_swaps_items");
    }

    #[test]
    fn timeout_returns_item() {
        init_test("timeout_returns_item");
        let exchanger: Exchanger<u32> = Exchanger::new();
        let cx = Cx::for_testing();
        let err = exchanger
            .exchange_timeout(&cx, 17, Duration::from_millis(40))
            .expect_err("no partner, must time out");
        assert!(err.is_timeout());
        let item = err.into_inner();
        crate::assert_with_log!(item == 17, "item returned", 17u32, item);
        // The slot holds no ghost reservation: a later pair still works.
        let exchanger = Arc::new(exchanger);
        let other = {
            let exchanger = Arc::clone(&exchanger);
            thread::spawn(move || {
                let cx = Cx::for_testing();
                exchanger.exchange(&cx, 2).expect("exchange failed")
            })
        };
        let got = exchanger.exchange(&cx, 1).expect("exchange failed");
        let their = other.join().expect("partner panicked");
        crate::assert_with_log!(got == 2, "fresh pair", 2u32, got);
        crate::assert_with_log!(their == 1, "fresh pair", 1u32, their);
        crate::test_complete!("timeout_returns_item");
    }

    #[test]
    fn cancelled_wait_is_interrupted() {
        init_test("cancelled_wait_is_interrupted");
        let exchanger: Exchanger<u32> = Exchanger::new();
        let cx = Cx::for_testing();
        cx.cancel();
        let err = exchanger
            .exchange(&cx, 5)
            .expect_err("cancelled exchange must fail");
        assert!(matches!(err, ExchangeError::Interrupted(_)));
        let item = err.into_inner();
        crate::assert_with_log!(item == 5, "item returned", 5u32, item);
        let pending = cx.is_cancel_requested();
        crate::assert_with_log!(!pending, "cancel consumed", false, pending);
        crate::test_complete!("cancelled_wait_is_interrupted");
    }

    #[test]
    fn cancel_wakes_waiting_offerer() {
        init_test("cancel_wakes_waiting_offerer");
        let exchanger: Arc<Exchanger<u32>> = Arc::new(Exchanger::new());
        let cx = Cx::for_testing();

        let offerer = {
            let exchanger = Arc::clone(&exchanger);
            let cx = cx.clone();
            thread::spawn(move || exchanger.exchange(&cx, 9))
        };

        thread::sleep(Duration::from_millis(50));
        cx.cancel();
        let err = offerer
            .join()
            .expect("offerer panicked")
            .expect_err("expected interruption");
        let item = err.into_inner();
        crate::assert_with_log!(item == 9, "item returned", 9u32, item);
        crate::test_complete!("cancel_wakes_waiting_offerer");
    }

    #[test]
    fn no_item_lost_under_contention() {
        init_test("no_item_lost_under_contention");
        const WORKERS: usize = 8;
        const TARGET: usize = 200;
        let exchanger: Arc<Exchanger<usize>> = Arc::new(Exchanger::with_config(ExchangeConfig {
            spin_iterations: 64,
            collision_threshold: 1,
            max_arena_slots: 4,
        }));
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for worker in 0..WORKERS {
            let exchanger = Arc::clone(&exchanger);
            let completed = Arc::clone(&completed);
            handles.push(thread::spawn(move || {
                let cx = Cx::for_testing();
                let mut received = Vec::new();
                let mut attempt = 0usize;
                // Every worker keeps offering until the swap budget is
                // used up; a timed-out offer is retried with the same
                // item, so a straggler can never wait on an empty room.
                while completed.load(Ordering::SeqCst) < TARGET {
                    let sent = worker * 1_000_000 + attempt;
                    match exchanger.exchange_timeout(&cx, sent, Duration::from_millis(100)) {
                        Ok(got) => {
                            received.push(got);
                            completed.fetch_add(1, Ordering::SeqCst);
                            attempt += 1;
                        }
                        Err(err) => {
                            assert!(err.is_timeout(), "only timeouts expected");
                            assert_eq!(err.into_inner(), sent, "timed-out item returned");
                        }
                    }
                }
                received
            }));
        }

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("worker panicked"))
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        crate::assert_with_log!(all.len() == total, "no item delivered twice", total, all.len());
        crate::assert_with_log!(total >= TARGET, "swap budget reached", TARGET, total);
        crate::test_complete!("no_item_lost_under_contention");
    }

    #[test]
    fn sequential_rounds_reuse_the_slot() {
        init_test("sequential_rounds_reuse_the_slot");
        let exchanger: Arc<Exchanger<u32>> = Arc::new(Exchanger::new());
        for round in 0..10u32 {
            let other = {
                let exchanger = Arc::clone(&exchanger);
                thread::spawn(move || {
                    let cx = Cx::for_testing();
                    exchanger.exchange(&cx, round * 2 + 1).expect("exchange failed")
                })
            };
            let cx = Cx::for_testing();
            let got = exchanger.exchange(&cx, round * 2).expect("exchange failed");
            let their = other.join().expect("partner panicked");
            assert_eq!(got, round * 2 + 1);
            assert_eq!(their, round * 2);
        }
        crate::test_complete!("sequential_rounds_reuse_the_slot");
    }

    #[test]
    fn bound_stamp_moves_version() {
        init_test("bound_stamp_moves_version");
        let word = stamp(0, 3);
        assert_eq!(word & BOUND_MASK, 3);
        let next = stamp(word, 2);
        assert_eq!(next & BOUND_MASK, 2);
        assert_ne!(word & !BOUND_MASK, next & !BOUND_MASK);
        crate::test_complete!("bound_stamp_moves_version");
    }
}
