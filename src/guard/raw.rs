//! Raw lock interfaces consumed by the locking policies.
//!
//! These are the two mutex shapes [`Guarded`](crate::guard::Guarded) can
//! bind to: plain mutual exclusion ([`RawLock`]) and read/write locking
//! with promotion and demotion ([`RawRwLock`]). The crate's own
//! primitives implement them; so can any external lock with the same
//! contract.

use crate::error::DeadlockAvoided;

/// Plain mutual-exclusion lock.
///
/// `unlock` must only be called by the thread that locked, with the lock
/// held.
pub trait RawLock {
    /// Acquires the lock, blocking as needed.
    fn lock(&self);
    /// Attempts to acquire without blocking; true on success.
    fn try_lock(&self) -> bool;
    /// Releases the lock.
    fn unlock(&self);
}

/// Read/write lock with read-to-write conversion.
///
/// Calls must be paired per thread: every `rdlock` with one `rdunlock`
/// (or a successful `rd2wrlock`, after which `wrunlock` applies), every
/// `wrlock` with one `wrunlock` (or a `wr2rdlock`, after which `rdunlock`
/// applies). A thread holding a read lock must not call `wrlock`; that is
/// what `rd2wrlock` is for.
pub trait RawRwLock {
    /// Acquires a shared lock.
    fn rdlock(&self);
    /// Releases a shared lock.
    fn rdunlock(&self);
    /// Acquires the exclusive lock.
    fn wrlock(&self);
    /// Releases the exclusive lock.
    fn wrunlock(&self);
    /// Converts a held shared lock into the exclusive lock. Refuses with
    /// [`DeadlockAvoided`] when another conversion is already pending.
    fn rd2wrlock(&self) -> Result<(), DeadlockAvoided>;
    /// Waits until no conversion is pending; part of the recovery protocol
    /// after a refused `rd2wrlock`.
    fn rd2wryield(&self);
    /// Downgrades the exclusive lock to a shared lock with no unlocked
    /// window.
    fn wr2rdlock(&self);
}
