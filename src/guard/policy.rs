//! Locking policies for [`Guarded`](crate::guard::Guarded).
//!
//! A policy binds guarded data to a mutex kind and, through the trait it
//! implements, to the set of access tokens that make sense for it:
//!
//! - [`ReadWrite<M>`], over any [`RawRwLock`]: concurrent readers, exclusive
//!   writers, read-to-write promotion, write-to-read carry.
//! - [`Primitive<M>`], over any [`RawLock`]: every token takes the same
//!   exclusive lock; read tokens merely restrict what the holder may do.
//! - [`OneThread`], no lock at all; enforces single-threaded use with a
//!   borrow flag (always) and a thread-identity assertion (debug).
//!
//! Policies are type parameters, never trait objects: the lock path
//! monomorphizes down to direct calls on the concrete mutex.

use std::cell::Cell;
use std::sync::atomic::AtomicU64;

use crate::error::DeadlockAvoided;
use crate::guard::{RawLock, RawRwLock};
use crate::util::is_single_threaded;

/// A locking discipline a [`Guarded`](crate::guard::Guarded) can be bound
/// to. Implementations map shared/exclusive token acquisition onto their
/// mutex.
pub trait Policy: Default {
    /// Acquires whatever lock a read token needs.
    fn lock_shared(&self);
    /// Releases the read-token lock.
    fn unlock_shared(&self);
    /// Acquires whatever lock a write token needs.
    fn lock_exclusive(&self);
    /// Releases the write-token lock.
    fn unlock_exclusive(&self);
}

/// Extension for policies whose mutex distinguishes readers from writers;
/// gates the promotion and carry APIs.
pub trait RwPolicy: Policy {
    /// Converts a held shared lock into the exclusive lock.
    fn try_promote(&self) -> Result<(), DeadlockAvoided>;
    /// Waits for a pending conversion to settle (after a refusal).
    fn promote_yield(&self);
    /// Downgrades the exclusive lock to a shared lock.
    fn demote(&self);
}

/// Read/write policy around any [`RawRwLock`].
#[derive(Debug, Default)]
pub struct ReadWrite<M: RawRwLock> {
    mutex: M,
}

impl<M: RawRwLock> ReadWrite<M> {
    /// The underlying mutex.
    #[inline]
    pub fn mutex(&self) -> &M {
        &self.mutex
    }
}

impl<M: RawRwLock + Default> Policy for ReadWrite<M> {
    #[inline]
    fn lock_shared(&self) {
        self.mutex.rdlock();
    }
    #[inline]
    fn unlock_shared(&self) {
        self.mutex.rdunlock();
    }
    #[inline]
    fn lock_exclusive(&self) {
        self.mutex.wrlock();
    }
    #[inline]
    fn unlock_exclusive(&self) {
        self.mutex.wrunlock();
    }
}

impl<M: RawRwLock + Default> RwPolicy for ReadWrite<M> {
    #[inline]
    fn try_promote(&self) -> Result<(), DeadlockAvoided> {
        self.mutex.rd2wrlock()
    }
    #[inline]
    fn promote_yield(&self) {
        self.mutex.rd2wryield();
    }
    #[inline]
    fn demote(&self) {
        self.mutex.wr2rdlock();
    }
}

/// Primitive policy around any [`RawLock`]. Shared and exclusive tokens
/// take the same lock, so readers exclude each other too; the read/write
/// distinction is purely about what the token lets you reach.
#[derive(Debug, Default)]
pub struct Primitive<M: RawLock> {
    mutex: M,
}

impl<M: RawLock> Primitive<M> {
    /// The underlying mutex.
    #[inline]
    pub fn mutex(&self) -> &M {
        &self.mutex
    }
}

impl<M: RawLock + Default> Policy for Primitive<M> {
    #[inline]
    fn lock_shared(&self) {
        self.mutex.lock();
    }
    #[inline]
    fn unlock_shared(&self) {
        self.mutex.unlock();
    }
    #[inline]
    fn lock_exclusive(&self) {
        self.mutex.lock();
    }
    #[inline]
    fn unlock_exclusive(&self) {
        self.mutex.unlock();
    }
}

/// No-lock policy for data that must only ever be touched by one thread.
///
/// The borrow flag is RefCell-style accounting: positive counts readers,
/// −1 marks a writer. It is enforced unconditionally: handing out `&mut`
/// requires uniqueness, that is a soundness matter, not a debug check.
/// The thread-identity assertion on top is debug-only, like the rest of
/// the crate's contract checks. The `Cell` makes any `Guarded` using this
/// policy `!Sync`, so misuse across threads without unsafe code is ruled
/// out at compile time as well.
#[derive(Debug, Default)]
pub struct OneThread {
    /// First thread to take a token claims this slot.
    owner: AtomicU64,
    /// RefCell-style borrow state: ≥0 readers, −1 writer.
    borrows: Cell<i32>,
}

impl OneThread {
    #[inline]
    fn assert_same_thread(&self) {
        debug_assert!(
            is_single_threaded(&self.owner),
            "single-thread guarded data touched from a second thread"
        );
    }
}

impl Policy for OneThread {
    fn lock_shared(&self) {
        self.assert_same_thread();
        let borrows = self.borrows.get();
        assert!(borrows >= 0, "read token created while a write token is live");
        self.borrows.set(borrows + 1);
    }

    fn unlock_shared(&self) {
        self.borrows.set(self.borrows.get() - 1);
    }

    fn lock_exclusive(&self) {
        self.assert_same_thread();
        assert!(
            self.borrows.get() == 0,
            "write token created while other tokens are live"
        );
        self.borrows.set(-1);
    }

    fn unlock_exclusive(&self) {
        self.borrows.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{NonRecursiveMutex, RwMutex, RwSpinLock};

    #[test]
    fn read_write_policy_delegates() {
        let policy: ReadWrite<RwMutex> = ReadWrite::default();
        policy.lock_shared();
        policy.unlock_shared();
        policy.lock_exclusive();
        policy.demote();
        policy.unlock_shared();

        let policy: ReadWrite<RwSpinLock> = ReadWrite::default();
        policy.lock_shared();
        policy.try_promote().expect("sole reader promotes");
        policy.unlock_exclusive();
    }

    #[test]
    fn primitive_policy_is_exclusive_either_way() {
        let policy: Primitive<NonRecursiveMutex> = Primitive::default();
        // A "shared" acquisition takes the one and only lock.
        policy.lock_shared();
        assert!(policy.mutex().is_self_locked());
        policy.unlock_shared();
        assert!(!policy.mutex().is_self_locked());

        policy.lock_exclusive();
        assert!(policy.mutex().is_self_locked());
        policy.unlock_exclusive();
    }

    #[test]
    fn one_thread_counts_borrows() {
        let policy = OneThread::default();
        policy.lock_shared();
        policy.lock_shared();
        policy.unlock_shared();
        policy.unlock_shared();
        policy.lock_exclusive();
        policy.unlock_exclusive();
    }

    #[test]
    #[should_panic(expected = "write token created")]
    fn one_thread_rejects_writer_over_reader() {
        let policy = OneThread::default();
        policy.lock_shared();
        policy.lock_exclusive();
    }
}
