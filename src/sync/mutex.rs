//! Non-recursive mutex with self-lock detection.
//!
//! A thin wrapper around [`parking_lot::RawMutex`] that remembers which
//! thread holds it. The extra identity word buys two things:
//!
//! - recursive `lock`/`try_lock` from the owning thread trips an assertion
//!   in debug builds instead of deadlocking silently;
//! - [`is_self_locked`](NonRecursiveMutex::is_self_locked) answers "do I
//!   hold this?" without taking any lock, which wait predicates need when
//!   they run under a different mutex.
//!
//! This is a raw lock: it guards no data and pairs with the
//! [`Primitive`](crate::guard::Primitive) policy of
//! [`Guarded`](crate::guard::Guarded), which supplies the RAII tokens.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::RawMutex as _;

use crate::guard::RawLock;
use crate::util::current_thread_id;

const NO_OWNER: u64 = 0;

/// Mutual exclusion primitive that refuses recursive locking.
pub struct NonRecursiveMutex {
    inner: parking_lot::RawMutex,
    /// Id of the owning thread, [`NO_OWNER`] while unlocked. Written by the
    /// thread that holds `inner`, so a thread reading its own id knows it
    /// wrote it; all other readers only get a hint.
    owner: AtomicU64,
}

impl Default for NonRecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NonRecursiveMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonRecursiveMutex")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NonRecursiveMutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: parking_lot::RawMutex::INIT,
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the calling thread already holds it.
    pub fn lock(&self) {
        debug_assert!(!self.is_self_locked(), "recursive lock of NonRecursiveMutex");
        self.inner.lock();
        self.owner.store(current_thread_id(), Ordering::Relaxed);
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the calling thread already holds it.
    pub fn try_lock(&self) -> bool {
        debug_assert!(
            !self.is_self_locked(),
            "recursive try_lock of NonRecursiveMutex"
        );
        let acquired = self.inner.try_lock();
        if acquired {
            self.owner.store(current_thread_id(), Ordering::Relaxed);
        }
        acquired
    }

    /// Releases the mutex. The caller must hold it.
    ///
    /// The owner id is cleared before the underlying mutex is released, so
    /// no thread can acquire the mutex and still observe the previous
    /// owner through [`is_self_locked`](Self::is_self_locked).
    pub fn unlock(&self) {
        debug_assert!(self.is_self_locked(), "unlock by non-owning thread");
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // Safety: the caller holds the mutex (asserted above in debug).
        unsafe { self.inner.unlock() };
    }

    /// Returns true iff the calling thread holds the mutex. Wait-free.
    ///
    /// A relaxed load suffices: a thread that reads its own id previously
    /// stored it (program order) and has not cleared it since. Reads of
    /// other threads' ownership are inherently racy and only a hint.
    #[inline]
    #[must_use]
    pub fn is_self_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }
}

impl RawLock for NonRecursiveMutex {
    #[inline]
    fn lock(&self) {
        NonRecursiveMutex::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        NonRecursiveMutex::try_lock(self)
    }

    #[inline]
    fn unlock(&self) {
        NonRecursiveMutex::unlock(self);
    }
}
