//! Condition-variable read/write mutex with writer priority and
//! read-to-write promotion.
//!
//! This lock allows any number of readers or a single writer. When a
//! writer is waiting, new read requests block until the writer has
//! acquired and released the lock, so writers cannot starve under read
//! pressure.
//!
//! # Fairness
//!
//! | Scenario                  | Behavior                                   |
//! |---------------------------|--------------------------------------------|
//! | No writers waiting        | Readers acquire immediately                |
//! | Writer waiting            | New readers blocked until writer completes |
//! | Existing readers + writer | Writer waits for all readers to release    |
//! | Reader wants to write     | Promotion via `rd2wrlock`, may be refused  |
//!
//! # Promotion
//!
//! A reader may convert its read lock into a write lock with
//! [`rd2wrlock`](RwMutex::rd2wrlock). Only one conversion can be pending
//! at a time: the second simultaneous converter gets
//! [`DeadlockAvoided`] (both hold read locks and each would wait forever
//! for the other to drop its). The loser must release its read lock, call
//! [`rd2wryield`](RwMutex::rd2wryield), and then retry its transaction
//! from the top.
//!
//! This is a raw lock: it guards no data. Pair it with
//! [`Guarded`](crate::guard::Guarded) and the
//! [`ReadWrite`](crate::guard::ReadWrite) policy for RAII access tokens.

use parking_lot::{Condvar, Mutex};

use crate::error::DeadlockAvoided;
use crate::guard::RawRwLock;
use crate::tracing_compat::trace;

#[derive(Debug)]
struct State {
    /// Number of active readers, or −1 while write-locked.
    readers: i32,
    /// Threads waiting (or converting) toward a write lock. New readers
    /// block while this is non-zero.
    waiting_writers: u32,
    /// 1 while a read-to-write conversion is pending; never more.
    converting: u32,
}

/// Read/write mutex built on condition variables.
#[derive(Debug)]
pub struct RwMutex {
    state: Mutex<State>,
    /// Signalled when the lock becomes fully unlocked (for waiting
    /// writers).
    unlocked: Condvar,
    /// Signalled when the last writer leaves (for blocked readers).
    no_writer_left: Condvar,
    /// Signalled when exactly one reader remains (for a pending
    /// converter).
    one_reader_left: Condvar,
    /// Broadcast when the pending conversion count returns to zero.
    converted: Condvar,
}

impl Default for RwMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RwMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                readers: 0,
                waiting_writers: 0,
                converting: 0,
            }),
            unlocked: Condvar::new(),
            no_writer_left: Condvar::new(),
            one_reader_left: Condvar::new(),
            converted: Condvar::new(),
        }
    }

    /// Acquires a read lock. Blocks while a writer holds the lock or any
    /// writer is waiting for it.
    pub fn rdlock(&self) {
        let mut state = self.state.lock();
        while state.readers < 0 || state.waiting_writers > 0 {
            self.no_writer_left.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Releases a read lock. The caller must hold one.
    pub fn rdunlock(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        debug_assert!(state.readers >= 0, "rdunlock without read lock");
        if state.readers > 1 {
            return;
        }
        let one_reader_left = state.readers == 1;
        // Unlock before notifying so woken threads don't immediately bump
        // into the state mutex we still hold.
        drop(state);
        if one_reader_left {
            self.one_reader_left.notify_one();
        } else {
            self.unlocked.notify_one();
        }
    }

    /// Acquires the write lock. Blocks until all readers and any earlier
    /// writer have released.
    pub fn wrlock(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.readers != 0 {
            trace!("writer waiting for readers to drain");
            self.unlocked.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.readers = -1;
    }

    /// Releases the write lock.
    pub fn wrunlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers == -1, "wrunlock without write lock");
        state.readers = 0;
        let writer_waiting = state.waiting_writers > 0;
        drop(state);

        if writer_waiting {
            self.unlocked.notify_one();
        } else {
            self.no_writer_left.notify_all();
        }
    }

    /// Converts a held read lock into the write lock.
    ///
    /// At most one conversion can be pending. The second concurrent caller
    /// gets [`DeadlockAvoided`] and must release its read lock, call
    /// [`rd2wryield`](Self::rd2wryield), then retry from the start of its
    /// transaction.
    pub fn rd2wrlock(&self) -> Result<(), DeadlockAvoided> {
        let mut state = self.state.lock();
        debug_assert!(state.readers >= 1, "rd2wrlock without read lock");
        if state.converting > 0 {
            trace!("read-to-write promotion refused, another converter pending");
            return Err(DeadlockAvoided);
        }
        state.converting = 1;
        state.waiting_writers += 1;
        while state.readers != 1 {
            self.one_reader_left.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.readers = -1;
        state.converting = 0;
        drop(state);
        // Broadcast: a single signal could land on a thread that is not in
        // rd2wryield at all.
        self.converted.notify_all();
        Ok(())
    }

    /// Waits until no read-to-write conversion is pending. Call after a
    /// refused conversion, before retrying.
    pub fn rd2wryield(&self) {
        std::thread::yield_now();
        let mut state = self.state.lock();
        while state.converting > 0 {
            self.converted.wait(&mut state);
        }
    }

    /// Downgrades the write lock to a read lock without unlocking.
    pub fn wr2rdlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers == -1, "wr2rdlock without write lock");
        state.readers = 1;
        let writer_waiting = state.waiting_writers > 0;
        drop(state);

        // Nobody can be in the one-reader-left wait: a converter would
        // need a read lock, impossible while we held the write lock.
        if !writer_waiting {
            self.no_writer_left.notify_all();
        }
    }
}

impl RawRwLock for RwMutex {
    #[inline]
    fn rdlock(&self) {
        RwMutex::rdlock(self);
    }
    #[inline]
    fn rdunlock(&self) {
        RwMutex::rdunlock(self);
    }
    #[inline]
    fn wrlock(&self) {
        RwMutex::wrlock(self);
    }
    #[inline]
    fn wrunlock(&self) {
        RwMutex::wrunlock(self);
    }
    #[inline]
    fn rd2wrlock(&self) -> Result<(), DeadlockAvoided> {
        RwMutex::rd2wrlock(self)
    }
    #[inline]
    fn rd2wryield(&self) {
        RwMutex::rd2wryield(self);
    }
    #[inline]
    fn wr2rdlock(&self) {
        RwMutex::wr2rdlock(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn readers_share_writers_exclude() {
        init_test("readers_share_writers_exclude");
        let lock = RwMutex::new();

        lock.rdlock();
        lock.rdlock();
        lock.rdunlock();
        lock.rdunlock();

        lock.wrlock();
        lock.wrunlock();

        lock.rdlock();
        lock.rdunlock();
        crate::test_complete!("readers_share_writers_exclude");
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        init_test("waiting_writer_blocks_new_readers");
        let lock = Arc::new(RwMutex::new());
        lock.rdlock();

        let lock2 = Arc::clone(&lock);
        let writer_done = Arc::new(AtomicBool::new(false));
        let writer_done2 = Arc::clone(&writer_done);
        let writer = thread::spawn(move || {
            lock2.wrlock();
            writer_done2.store(true, Ordering::Release);
            lock2.wrunlock();
        });

        // Wait until the writer is queued.
        loop {
            let state = lock.state.lock();
            if state.waiting_writers > 0 {
                break;
            }
            drop(state);
            thread::yield_now();
        }

        // A new reader must now block until the writer is done.
        let lock3 = Arc::clone(&lock);
        let writer_done3 = Arc::clone(&writer_done);
        let late_reader = thread::spawn(move || {
            lock3.rdlock();
            let done = writer_done3.load(Ordering::Acquire);
            lock3.rdunlock();
            done
        });

        thread::yield_now();
        lock.rdunlock();
        writer.join().unwrap();
        let reader_saw_writer_done = late_reader.join().unwrap();
        crate::assert_with_log!(
            reader_saw_writer_done,
            "late reader ran after writer",
            true,
            reader_saw_writer_done
        );
        crate::test_complete!("waiting_writer_blocks_new_readers");
    }

    #[test]
    fn promotion_succeeds_for_sole_reader() {
        init_test("promotion_succeeds_for_sole_reader");
        let lock = RwMutex::new();
        lock.rdlock();
        lock.rd2wrlock().expect("sole reader promotes");
        lock.wrunlock();
        crate::test_complete!("promotion_succeeds_for_sole_reader");
    }

    #[test]
    fn second_converter_is_refused() {
        init_test("second_converter_is_refused");
        let lock = Arc::new(RwMutex::new());
        lock.rdlock();

        // Park a converter that cannot finish while we hold our read lock.
        let lock2 = Arc::clone(&lock);
        let winner = thread::spawn(move || {
            lock2.rdlock();
            lock2.rd2wrlock().expect("first converter wins");
            lock2.wrunlock();
        });

        // Wait for the winner to be converting.
        loop {
            let state = lock.state.lock();
            if state.converting > 0 {
                break;
            }
            drop(state);
            thread::yield_now();
        }

        let refused = lock.rd2wrlock();
        crate::assert_with_log!(
            refused == Err(DeadlockAvoided),
            "second converter refused",
            true,
            refused.is_err()
        );

        // Follow the documented recovery protocol.
        lock.rdunlock();
        lock.rd2wryield();
        winner.join().unwrap();

        lock.rdlock();
        lock.rd2wrlock().expect("retry succeeds after yield");
        lock.wrunlock();
        crate::test_complete!("second_converter_is_refused");
    }

    #[test]
    fn downgrade_keeps_lock_held() {
        init_test("downgrade_keeps_lock_held");
        let lock = Arc::new(RwMutex::new());
        let witnessed = Arc::new(AtomicU32::new(0));

        lock.wrlock();
        let lock2 = Arc::clone(&lock);
        let witnessed2 = Arc::clone(&witnessed);
        let writer = thread::spawn(move || {
            lock2.wrlock();
            witnessed2.store(1, Ordering::Release);
            lock2.wrunlock();
        });

        lock.wr2rdlock();
        // Still read-locked: the queued writer cannot have run.
        let seen = witnessed.load(Ordering::Acquire);
        crate::assert_with_log!(seen == 0, "writer excluded by downgrade", 0u32, seen);
        lock.rdunlock();
        writer.join().unwrap();
        let seen = witnessed.load(Ordering::Acquire);
        crate::assert_with_log!(seen == 1, "writer ran after release", 1u32, seen);
        crate::test_complete!("downgrade_keeps_lock_held");
    }
}
