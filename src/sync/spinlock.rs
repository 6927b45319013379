//! Read/write spin lock with four counters packed into one 64-bit atomic.
//!
//! The entire lock state lives in a single `AtomicI64`, split LSB-first
//! into four 16-bit fields:
//!
//! ```text
//! |  V (bits 48..64)  |  C (bits 32..48)  |  W (bits 16..32)  |  R (bits 0..16)  |
//! |-------------------|-------------------|-------------------|------------------|
//! | minus the number  | 1 while a read-to | 1 while a writer  | number of active |
//! | of active-or-     | -write conversion | holds the lock    | readers          |
//! | waiting writers   | is pending        |                   |                  |
//! ```
//!
//! `V` is kept negative (or zero), so **`state < 0` means a writer is
//! active, waiting, or converting**: the one-branch test readers use on
//! the fast path. Every operation is a signed delta applied with a single
//! fetch-and-add or compare-exchange; the deltas form a closed algebra
//! whose post-states stay within the field invariants:
//!
//! - `R, W, C ≥ 0`, `V ≤ 0`,
//! - `−V ≥ W + C` (every active or converting writer is counted in `V`),
//! - `W ≤ 1`, committed `C ≤ 1`,
//! - `state == 0` iff fully unlocked with nobody waiting.
//!
//! Fast paths are a single uncontended RMW. Slow paths spin briefly on the
//! reader count and then block on one of two condition-variable pairs: a
//! *readers* side woken when the last writer leaves, and a *writers* side
//! woken when actual or converting writers leave.
//!
//! # The no-lost-wakeup rule
//!
//! Sleeping on either condvar is only correct because of one rule: **any
//! delta that can make a sleeper's predicate true is applied while holding
//! that sleeper's condvar mutex**, and is followed by a broadcast. The
//! deltas in question are exactly those that remove a writer: their
//! decoded `V` component is positive or their `C` or `W` component is
//! negative. [`removes_writer`] encodes that test, and a `const` assertion
//! block below proves it against every delta in the algebra, so a new
//! operation that forgets its notification branch fails to compile. Most
//! such deltas go through one helper that holds both condvar mutexes; the
//! conversion-commit CAS holds only the writers mutex, which suffices
//! because its `V` component is zero and the readers' predicate depends on
//! `V` alone.
//!
//! Writer-side wakeups always broadcast: both pending writers and pending
//! converters sleep on the writers condvar, and a single signal could be
//! absorbed by a thread whose predicate is still false while the (at most
//! one) converter starves.
//!
//! Pair with [`Guarded`](crate::guard::Guarded) and the
//! [`ReadWrite`](crate::guard::ReadWrite) policy for RAII tokens.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::DeadlockAvoided;
use crate::guard::RawRwLock;
use crate::tracing_compat::trace;

#[cfg(not(target_has_atomic = "64"))]
compile_error!("RwSpinLock requires lock-free 64-bit atomics on the target");

const FIELD_BITS: u32 = 16;

/// One reader.
const R_UNIT: i64 = 1;
/// The actual-writer flag.
const W_UNIT: i64 = R_UNIT << FIELD_BITS;
/// The pending-conversion flag.
const C_UNIT: i64 = W_UNIT << FIELD_BITS;
/// One active-or-waiting writer, counted negatively.
const V_UNIT: i64 = C_UNIT << FIELD_BITS;

const R_MASK: i64 = (1 << FIELD_BITS) - 1;
const W_MASK: i64 = R_MASK << FIELD_BITS;
const C_MASK: i64 = W_MASK << FIELD_BITS;
/// All fields a writer must see empty before committing.
const RWC_MASK: i64 = R_MASK | W_MASK | C_MASK;

/// Readers the 16-bit field can absorb before optimistic increments could
/// carry into `W`. Far above any realistic simultaneous reader count.
const MAX_CONCURRENT_READERS: i64 = 1 << (FIELD_BITS - 1);

// ── The delta algebra ────────────────────────────────────────────────────
//
// Each operation is one named delta. Attempt/abort pairs sum to zero, and
// acquire/release pairs sum to zero, which is what keeps the composition
// closed (property: any op sequence followed by its inverses restores the
// state word exactly).

/// Optimistic read acquire (and, negated, read release / back-out).
const RDLOCK: i64 = R_UNIT;
/// Optimistic write acquire: count in `V`, raise `W`.
const WRLOCK_ATTEMPT: i64 = W_UNIT - V_UNIT;
/// Failed write acquire: drop `W`, stay counted in `V` as a waiter.
const WRLOCK_DEMOTE: i64 = -W_UNIT;
/// Commit a waiting writer (CAS-only, from a state with `R = W = C = 0`).
const WRLOCK_COMMIT: i64 = W_UNIT;
/// Release the write lock.
const WRUNLOCK: i64 = V_UNIT - W_UNIT;
/// Atomically swap the write lock for a read lock.
const WR2RDLOCK: i64 = V_UNIT - W_UNIT + R_UNIT;
/// Announce a read-to-write conversion: count in `V`, raise `C`.
const RD2WR_ATTEMPT: i64 = C_UNIT - V_UNIT;
/// Withdraw a refused conversion.
const RD2WR_ABORT: i64 = V_UNIT - C_UNIT;
/// Commit a conversion: drop our read and the flag, raise `W`
/// (CAS-only, from a state where we are the sole reader and `W = 0`).
const RD2WR_COMMIT: i64 = W_UNIT - C_UNIT - R_UNIT;

/// Decodes a delta into its `(r, w, c, v)` field components.
///
/// Plain shifting misdecodes negative components: `-W_UNIT` as a bit
/// pattern has all-ones in the `C` and `V` positions from the borrow.
/// Working up from the least-significant field and subtracting each
/// sign-extended component before shifting undoes the borrow exactly, for
/// any delta whose true components fit in 15 bits; every delta above has
/// components in `{-1, 0, 1}`.
const fn unpack(delta: i64) -> (i64, i64, i64, i64) {
    let r = (delta << 48) >> 48;
    let rest = (delta - r) >> FIELD_BITS;
    let w = (rest << 48) >> 48;
    let rest = (rest - w) >> FIELD_BITS;
    let c = (rest << 48) >> 48;
    let v = (rest - c) >> FIELD_BITS;
    (r, w, c, v)
}

/// True iff applying `delta` can turn any of the writer-presence
/// predicates (`state < 0`, `W > 0`, `C > 0`, `W > 0 ∨ C > 0`) from true
/// to false, i.e. the delta removes a writer in some form. Such deltas
/// must run under both condvar mutexes and be followed by broadcasts.
const fn removes_writer(delta: i64) -> bool {
    let (_r, w, c, v) = unpack(delta);
    v > 0 || c < 0 || w < 0
}

// Build-time proof that every delta lands on the right side of the
// notification rule. The left column must all hold, the right column is
// the fast-path set that must stay notification-free.
const _: () = {
    assert!(removes_writer(WRLOCK_DEMOTE));
    assert!(removes_writer(WRUNLOCK));
    assert!(removes_writer(WR2RDLOCK));
    assert!(removes_writer(RD2WR_ABORT));
    assert!(removes_writer(RD2WR_COMMIT));

    assert!(!removes_writer(RDLOCK));
    assert!(!removes_writer(-RDLOCK));
    assert!(!removes_writer(WRLOCK_ATTEMPT));
    assert!(!removes_writer(WRLOCK_COMMIT));
    assert!(!removes_writer(RD2WR_ATTEMPT));
};

// Attempt/abort and acquire/release pairs cancel exactly.
const _: () = {
    assert!(WRLOCK_ATTEMPT + WRLOCK_DEMOTE + WRLOCK_COMMIT + WRUNLOCK == 0);
    assert!(RD2WR_ATTEMPT + RD2WR_ABORT == 0);
    assert!(RDLOCK + RD2WR_ATTEMPT + RD2WR_COMMIT + WRUNLOCK == 0);
    assert!(WRLOCK_ATTEMPT + WRUNLOCK == 0);
    assert!(WRLOCK_ATTEMPT + WR2RDLOCK == RDLOCK);
};

/// Read/write spin/block hybrid lock with packed state.
#[derive(Debug)]
pub struct RwSpinLock {
    state: AtomicI64,
    readers_lock: Mutex<()>,
    readers_cv: Condvar,
    writers_lock: Mutex<()>,
    writers_cv: Condvar,
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicI64::new(0),
            readers_lock: Mutex::new(()),
            readers_cv: Condvar::new(),
            writers_lock: Mutex::new(()),
            writers_cv: Condvar::new(),
        }
    }

    // ── Predicates (single masked load each) ────────────────────────────

    #[inline]
    fn writer_present(state: i64) -> bool {
        state < 0
    }

    #[inline]
    fn reader_present(state: i64) -> bool {
        state & R_MASK != 0
    }

    #[inline]
    fn other_readers_present(state: i64) -> bool {
        state & R_MASK > 1
    }

    #[inline]
    fn actual_writer_present(state: i64) -> bool {
        state & W_MASK != 0
    }

    #[inline]
    fn converting_writer_present(state: i64) -> bool {
        state & C_MASK != 0
    }

    #[inline]
    fn converting_or_actual_writer_present(state: i64) -> bool {
        state & (W_MASK | C_MASK) != 0
    }

    // ── Read lock ───────────────────────────────────────────────────────

    /// Acquires a read lock. Single RMW when no writer is around.
    pub fn rdlock(&self) {
        let prev = self.state.fetch_add(RDLOCK, Ordering::Acquire);
        debug_assert!(prev & R_MASK < MAX_CONCURRENT_READERS, "reader count overflow");
        if Self::writer_present(prev) {
            self.rdlock_blocked();
        }
    }

    /// Releases a read lock. Always a single RMW: waiting writers poll the
    /// reader count themselves, so the last reader out has nobody to wake.
    pub fn rdunlock(&self) {
        let prev = self.state.fetch_sub(RDLOCK, Ordering::Release);
        debug_assert!(Self::reader_present(prev), "rdunlock without read lock");
    }

    #[cold]
    fn rdlock_blocked(&self) {
        trace!("read lock blocked behind writer");
        loop {
            // Back out the optimistic increment, then sleep until no
            // writer is present.
            self.state.fetch_sub(RDLOCK, Ordering::Relaxed);

            let mut acquired = false;
            {
                let mut guard = self.readers_lock.lock();
                loop {
                    // Opportunistic exact grab: 0 becomes one reader.
                    // Success means we hold the lock without re-running
                    // the race below.
                    if self
                        .state
                        .compare_exchange_weak(0, RDLOCK, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        acquired = true;
                        break;
                    }
                    // Safe to keep sleeping only while a writer is
                    // present: its departure must take this mutex and
                    // broadcast (see the notification rule).
                    if !Self::writer_present(self.state.load(Ordering::Relaxed)) {
                        break;
                    }
                    self.readers_cv.wait(&mut guard);
                }
            }
            if acquired {
                return;
            }
            // No writer was present when we woke: retry the optimistic
            // increment, racing any newly arriving writers.
            if !Self::writer_present(self.state.fetch_add(RDLOCK, Ordering::Acquire)) {
                return;
            }
        }
    }

    // ── Write lock ──────────────────────────────────────────────────────

    /// Acquires the write lock. Single RMW when fully uncontended.
    pub fn wrlock(&self) {
        let prev = self.state.fetch_add(WRLOCK_ATTEMPT, Ordering::Acquire);
        if prev == 0 {
            return;
        }
        // Contended: fold the premature `W` back while keeping our `V`
        // stake, which blocks new readers from here on. The transient `W`
        // may have been observed by a converter sleeping on the writers
        // side, so this is a notifying transition.
        self.apply_notifying(WRLOCK_DEMOTE, Ordering::Relaxed);
        trace!("write lock contended, queued as waiting writer");

        loop {
            // Readers drain on their own; don't touch the condvar path
            // while they do.
            while Self::reader_present(self.state.load(Ordering::Relaxed)) {
                std::hint::spin_loop();
            }

            let mut acquired = false;
            {
                let mut guard = self.writers_lock.lock();
                loop {
                    let current = self.state.load(Ordering::Relaxed);
                    if current & RWC_MASK == 0 {
                        // Nothing but waiting writers: try to commit.
                        if self
                            .state
                            .compare_exchange_weak(
                                current,
                                current + WRLOCK_COMMIT,
                                Ordering::Acquire,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            acquired = true;
                            break;
                        }
                        continue; // state moved; re-inspect
                    }
                    // Sleep only while a committed or converting writer is
                    // in the way; mere readers are handled by the spin
                    // loop above.
                    if !Self::converting_or_actual_writer_present(current) {
                        break;
                    }
                    self.writers_cv.wait(&mut guard);
                }
            }
            if acquired {
                return;
            }
            // Readers reappeared; go back to spinning on them.
        }
    }

    /// Releases the write lock.
    pub fn wrunlock(&self) {
        debug_assert!(
            Self::actual_writer_present(self.state.load(Ordering::Relaxed)),
            "wrunlock without write lock"
        );
        self.apply_notifying(WRUNLOCK, Ordering::Release);
    }

    /// Downgrades the write lock to a read lock without a window where the
    /// lock is free.
    pub fn wr2rdlock(&self) {
        debug_assert!(
            Self::actual_writer_present(self.state.load(Ordering::Relaxed)),
            "wr2rdlock without write lock"
        );
        self.apply_notifying(WR2RDLOCK, Ordering::Release);
    }

    // ── Read-to-write conversion ────────────────────────────────────────

    /// Converts a held read lock into the write lock.
    ///
    /// Fails with [`DeadlockAvoided`] if another conversion is already
    /// pending; the caller must then release its read lock, call
    /// [`rd2wryield`](Self::rd2wryield) and retry its transaction.
    pub fn rd2wrlock(&self) -> Result<(), DeadlockAvoided> {
        let prev = self.state.fetch_add(RD2WR_ATTEMPT, Ordering::Acquire);
        debug_assert!(Self::reader_present(prev), "rd2wrlock without read lock");

        if Self::converting_writer_present(prev) {
            // Someone else is already converting; converging here from two
            // read locks would deadlock. Withdraw and report.
            self.apply_notifying(RD2WR_ABORT, Ordering::Relaxed);
            trace!("read-to-write promotion refused, another converter pending");
            return Err(DeadlockAvoided);
        }

        if prev & (R_MASK | W_MASK) == R_UNIT {
            // We were the only reader and no writer was committed: commit
            // immediately. `C` drops to zero, so this notifies.
            self.apply_notifying(RD2WR_COMMIT, Ordering::Acquire);
            return Ok(());
        }

        trace!("read-to-write conversion waiting for other readers");
        loop {
            while Self::other_readers_present(self.state.load(Ordering::Relaxed)) {
                std::hint::spin_loop();
            }

            let mut acquired = false;
            {
                let mut guard = self.writers_lock.lock();
                loop {
                    let current = self.state.load(Ordering::Relaxed);
                    if current & RWC_MASK == R_UNIT + C_UNIT {
                        // Sole reader (us), our own flag, no committed
                        // writer: commit the conversion.
                        if self
                            .state
                            .compare_exchange_weak(
                                current,
                                current + RD2WR_COMMIT,
                                Ordering::Acquire,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            acquired = true;
                            break;
                        }
                        continue;
                    }
                    if !Self::actual_writer_present(current) {
                        break;
                    }
                    self.writers_cv.wait(&mut guard);
                }
            }
            if acquired {
                // Our commit dropped `C` to zero under the writers mutex;
                // wake every rd2wryield sleeper (and any queued writer).
                self.writers_cv.notify_all();
                return Ok(());
            }
        }
    }

    /// Waits until no read-to-write conversion is pending. Call after a
    /// refused conversion, before retrying.
    pub fn rd2wryield(&self) {
        std::thread::yield_now();
        let mut guard = self.writers_lock.lock();
        while Self::converting_writer_present(self.state.load(Ordering::Relaxed)) {
            self.writers_cv.wait(&mut guard);
        }
    }

    // ── Notifying transitions ───────────────────────────────────────────

    /// Applies a writer-removing delta under both condvar mutexes and
    /// issues the broadcasts the sleepers' predicates rely on.
    ///
    /// Lock order is readers before writers, everywhere.
    fn apply_notifying(&self, delta: i64, ordering: Ordering) -> i64 {
        debug_assert!(removes_writer(delta));
        let new_state = {
            let _readers = self.readers_lock.lock();
            let _writers = self.writers_lock.lock();
            self.state.fetch_add(delta, ordering) + delta
        };
        if !Self::writer_present(new_state) {
            self.readers_cv.notify_all();
        }
        self.writers_cv.notify_all();
        new_state
    }

    /// Raw state word, for diagnostics and tests.
    #[must_use]
    pub fn raw_state(&self) -> i64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl RawRwLock for RwSpinLock {
    #[inline]
    fn rdlock(&self) {
        RwSpinLock::rdlock(self);
    }
    #[inline]
    fn rdunlock(&self) {
        RwSpinLock::rdunlock(self);
    }
    #[inline]
    fn wrlock(&self) {
        RwSpinLock::wrlock(self);
    }
    #[inline]
    fn wrunlock(&self) {
        RwSpinLock::wrunlock(self);
    }
    #[inline]
    fn rd2wrlock(&self) -> Result<(), DeadlockAvoided> {
        RwSpinLock::rd2wrlock(self)
    }
    #[inline]
    fn rd2wryield(&self) {
        RwSpinLock::rd2wryield(self);
    }
    #[inline]
    fn wr2rdlock(&self) {
        RwSpinLock::wr2rdlock(self);
    }
}
