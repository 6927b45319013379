//! Guarded data and its access tokens.
//!
//! [`Guarded<T, P>`] owns a `T` and a locking policy `P`, and refuses any
//! access to the `T` except through a scoped token. The token types
//! encode the legal lock transitions: conversions that would be unsound
//! simply have no constructor.
//!
//! | Token | Minted by | Holds | Releases on drop |
//! |---|---|---|---|
//! | [`ConstReadToken`] | [`Guarded::const_read`] | shared lock | shared lock |
//! | [`ReadToken`] | [`Guarded::read`] | shared lock | shared lock |
//! | [`WriteToken`] | [`Guarded::write`] | exclusive lock | exclusive lock |
//! | [`WriteToReadCarry`] | [`Guarded::carry`] | nothing at first | shared lock, if consumed |
//!
//! Allowed conversions:
//!
//! - `ReadToken` → write access: [`ReadToken::try_promote`] consumes the
//!   token and yields a [`PromotedWriteToken`], or hands the token back
//!   with [`DeadlockAvoided`] when another conversion is pending. The
//!   promoted token can be [`demote`](PromotedWriteToken::demote)d back
//!   into a read token without ever unlocking.
//! - `WriteToken` → read view: [`WriteToken::as_read`] (the write lock
//!   stays held).
//! - `ReadToken` → `ConstReadToken`: [`ReadToken::into_const`].
//! - `WriteToReadCarry` → one `CarryWriteToken` → any number of
//!   `CarryReadToken`s: write first, then read, under one continuous
//!   lock.
//!
//! Forbidden conversions are absent: nothing upgrades a
//! [`ConstReadToken`], nothing clones a token, and
//! [`Guarded::carry`]/[`ReadToken::try_promote`] only exist for
//! [`RwPolicy`] policies; using them with a `Primitive` or `OneThread`
//! policy is a compile error.
//!
//! Functions that only read should take a [`ReadRef`], which every token
//! can produce; that is the by-reference downgrade path.
//!
//! Tokens are `!Send` and `!Sync`: a lock taken on one thread must be
//! released on that thread. They borrow the `Guarded`, so a token can
//! never outlive its data. For the one facility that escapes borrow
//! checking (the object tracker), `Guarded` keeps a debug count of live
//! tokens and asserts it is zero when dropped.

#![allow(unsafe_code)]

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use crate::error::DeadlockAvoided;
use crate::guard::{Policy, RwPolicy};

/// Marker that strips `Send`/`Sync` from the token types.
type NotThreadSafe = PhantomData<*const ()>;

/// Data bound to a locking policy; only tokens can reach the data.
pub struct Guarded<T, P: Policy> {
    policy: P,
    data: UnsafeCell<T>,
    /// Live-token count; checked on drop. Only the tracker tokens can
    /// actually outlive safe borrows, but the count covers every token so
    /// the check is uniform.
    #[cfg(debug_assertions)]
    active_tokens: std::sync::atomic::AtomicI32,
}

// Safety: moving a Guarded between threads moves the T and the policy;
// sharing one hands out data access only under the policy's locking, and
// policies that cannot lock (OneThread) are !Sync and poison this impl.
unsafe impl<T: Send, P: Policy + Send> Send for Guarded<T, P> {}
unsafe impl<T: Send + Sync, P: Policy + Sync> Sync for Guarded<T, P> {}

impl<T: fmt::Debug, P: Policy> fmt::Debug for Guarded<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Deliberately does not lock: printing must never block or
        // interleave with the lock protocol.
        f.debug_struct("Guarded").finish_non_exhaustive()
    }
}

impl<T: Default, P: Policy> Default for Guarded<T, P> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(debug_assertions)]
impl<T, P: Policy> Drop for Guarded<T, P> {
    fn drop(&mut self) {
        let live = self.active_tokens.load(std::sync::atomic::Ordering::Relaxed);
        assert!(live == 0, "Guarded dropped with {live} live access tokens");
    }
}

impl<T, P: Policy> Guarded<T, P> {
    /// Wraps `value` under policy `P`.
    pub fn new(value: T) -> Self {
        Self {
            policy: P::default(),
            data: UnsafeCell::new(value),
            #[cfg(debug_assertions)]
            active_tokens: std::sync::atomic::AtomicI32::new(0),
        }
    }

    /// The policy (and through it the mutex) guarding the data.
    #[inline]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Mutable access without locking: exclusive borrow is proof enough.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Unwraps the data.
    pub fn into_inner(mut self) -> T {
        #[cfg(debug_assertions)]
        {
            // Checked here because the Drop impl is bypassed below.
            let live = self.active_tokens.load(std::sync::atomic::Ordering::Relaxed);
            assert!(live == 0, "Guarded consumed with {live} live access tokens");
        }
        // Safety: the value is read out exactly once and the policy is
        // dropped in place exactly once; `forget` then prevents both the
        // debug Drop impl and a second drop of either field.
        unsafe {
            let value = std::ptr::read(self.data.get());
            std::ptr::drop_in_place(&mut self.policy);
            std::mem::forget(self);
            value
        }
    }

    /// Raw pointer to the data; the tracker uses this to build its
    /// heap-stable back-reference. Dereferencing requires holding the
    /// appropriate lock.
    pub(crate) fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Frees a boxed `Guarded` whose value has already been moved out
    /// with `ptr::read`: drops the policy, deallocates the box, leaves
    /// the (moved-from) value bytes untouched.
    ///
    /// # Safety
    ///
    /// The caller must have moved the value out and must not touch the
    /// box afterwards; no tokens may be live.
    pub(crate) unsafe fn drop_hollow(this: Box<Self>) {
        let mut this = ManuallyDrop::new(this);
        let raw: *mut Self = &mut **this;
        // Safety: per the contract above the policy is still live (only
        // the value was moved out), and the allocation came from Box.
        unsafe {
            #[cfg(debug_assertions)]
            {
                let live = (*raw)
                    .active_tokens
                    .load(std::sync::atomic::Ordering::Relaxed);
                assert!(live == 0, "hollow Guarded freed with {live} live access tokens");
            }
            std::ptr::drop_in_place(&mut (*raw).policy);
            std::alloc::dealloc(raw.cast(), std::alloc::Layout::new::<Self>());
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn token_counter(&self) -> &std::sync::atomic::AtomicI32 {
        &self.active_tokens
    }

    #[inline]
    pub(crate) fn count_token(&self) {
        #[cfg(debug_assertions)]
        self.active_tokens
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn uncount_token(&self) {
        #[cfg(debug_assertions)]
        self.active_tokens
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Takes a shared lock and returns a read token.
    pub fn read(&self) -> ReadToken<'_, T, P> {
        self.policy.lock_shared();
        self.count_token();
        ReadToken {
            guarded: self,
            _not_send: PhantomData,
        }
    }

    /// Takes a shared lock and returns a read-only token that can never
    /// be upgraded.
    pub fn const_read(&self) -> ConstReadToken<'_, T, P> {
        self.policy.lock_shared();
        self.count_token();
        ConstReadToken {
            guarded: self,
            _not_send: PhantomData,
        }
    }

    /// Takes the exclusive lock and returns a write token.
    pub fn write(&self) -> WriteToken<'_, T, P> {
        self.policy.lock_exclusive();
        self.count_token();
        WriteToken {
            guarded: self,
            _not_send: PhantomData,
        }
    }
}

impl<T, P: RwPolicy> Guarded<T, P> {
    /// Creates a write-to-read carry: no lock yet; pass it to
    /// [`WriteToReadCarry::write`] first, then to
    /// [`WriteToReadCarry::read`] any number of times. The carry keeps
    /// the data read-locked from the end of the write until it drops.
    pub fn carry(&self) -> WriteToReadCarry<'_, T, P> {
        self.count_token();
        WriteToReadCarry {
            guarded: self,
            stage: Cell::new(CarryStage::Fresh),
            _not_send: PhantomData,
        }
    }

    /// Waits for a pending read-to-write conversion to settle. Part of
    /// the recovery protocol after [`ReadToken::try_promote`] fails; call
    /// with no tokens held.
    pub fn promote_yield(&self) {
        self.policy.promote_yield();
    }
}

// ── Read-only view ──────────────────────────────────────────────────────

/// Borrowed read-only view of guarded data, produced from any token.
///
/// Functions that only need to read should accept this: every token kind
/// converts into it, so callers choose their own locking strength.
#[derive(Debug, Clone, Copy)]
pub struct ReadRef<'t, T> {
    data: &'t T,
}

impl<T> Deref for ReadRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.data
    }
}

// ── Tokens ──────────────────────────────────────────────────────────────

/// Read token minted from a shared lock; can never be upgraded.
#[must_use = "the lock is released as soon as the token drops"]
pub struct ConstReadToken<'a, T, P: Policy> {
    guarded: &'a Guarded<T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: Policy> Deref for ConstReadToken<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: shared lock held for the token's lifetime.
        unsafe { &*self.guarded.data.get() }
    }
}

impl<'a, T, P: Policy> ConstReadToken<'a, T, P> {
    /// Read-only view borrowing this token.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }
}

impl<T, P: Policy> Drop for ConstReadToken<'_, T, P> {
    fn drop(&mut self) {
        self.guarded.policy.unlock_shared();
        self.guarded.uncount_token();
    }
}

/// Read token that may be promoted to a write token.
#[must_use = "the lock is released as soon as the token drops"]
pub struct ReadToken<'a, T, P: Policy> {
    guarded: &'a Guarded<T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: Policy> Deref for ReadToken<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: shared lock held for the token's lifetime.
        unsafe { &*self.guarded.data.get() }
    }
}

impl<'a, T, P: Policy> ReadToken<'a, T, P> {
    /// Read-only view borrowing this token.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }

    /// Downgrades to a token that can never be upgraded, keeping the
    /// shared lock held throughout.
    pub fn into_const(self) -> ConstReadToken<'a, T, P> {
        let this = ManuallyDrop::new(self);
        // Lock and token count transfer to the new token unchanged.
        ConstReadToken {
            guarded: this.guarded,
            _not_send: PhantomData,
        }
    }
}

impl<'a, T, P: RwPolicy> ReadToken<'a, T, P> {
    /// Converts this read token's shared lock into the exclusive lock.
    ///
    /// On success the token becomes a [`PromotedWriteToken`]; drop it to
    /// release everything, or [`demote`](PromotedWriteToken::demote) it
    /// to get the read token back with the shared lock still held.
    ///
    /// On refusal the read token comes back untouched together with
    /// [`DeadlockAvoided`]; the caller must drop it, call
    /// [`Guarded::promote_yield`], and retry its transaction from the
    /// top, since the data may have changed by then.
    pub fn try_promote(
        self,
    ) -> Result<PromotedWriteToken<'a, T, P>, (Self, DeadlockAvoided)> {
        match self.guarded.policy.try_promote() {
            Ok(()) => {
                let this = ManuallyDrop::new(self);
                // Lock responsibility and the token count transfer to the
                // promoted token.
                Ok(PromotedWriteToken {
                    guarded: this.guarded,
                    _not_send: PhantomData,
                })
            }
            Err(refused) => Err((self, refused)),
        }
    }
}

impl<T, P: Policy> Drop for ReadToken<'_, T, P> {
    fn drop(&mut self) {
        self.guarded.policy.unlock_shared();
        self.guarded.uncount_token();
    }
}

/// Write token: exclusive access for its lifetime.
#[must_use = "the lock is released as soon as the token drops"]
pub struct WriteToken<'a, T, P: Policy> {
    guarded: &'a Guarded<T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: Policy> Deref for WriteToken<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: exclusive lock held for the token's lifetime.
        unsafe { &*self.guarded.data.get() }
    }
}

impl<T, P: Policy> DerefMut for WriteToken<'_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive lock held; `&mut self` makes this the only
        // live reference derived from the token.
        unsafe { &mut *self.guarded.data.get() }
    }
}

impl<'a, T, P: Policy> WriteToken<'a, T, P> {
    /// Read-only view borrowing this token; the exclusive lock stays
    /// held. This is how a write token is passed to read-only functions.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }
}

impl<T, P: Policy> Drop for WriteToken<'_, T, P> {
    fn drop(&mut self) {
        self.guarded.policy.unlock_exclusive();
        self.guarded.uncount_token();
    }
}

/// Write access obtained by promoting a [`ReadToken`].
///
/// Dropping it releases the lock entirely (the exclusive lock is demoted
/// and the resulting shared lock released in turn);
/// [`demote`](Self::demote) instead hands back a read token with the
/// shared lock still held.
#[must_use = "the lock is released as soon as the token drops"]
pub struct PromotedWriteToken<'a, T, P: RwPolicy> {
    guarded: &'a Guarded<T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: RwPolicy> Deref for PromotedWriteToken<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: exclusive lock held (successful promotion).
        unsafe { &*self.guarded.data.get() }
    }
}

impl<T, P: RwPolicy> DerefMut for PromotedWriteToken<'_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive lock held; unique via `&mut self`.
        unsafe { &mut *self.guarded.data.get() }
    }
}

impl<'a, T, P: RwPolicy> PromotedWriteToken<'a, T, P> {
    /// Read-only view borrowing this token; the exclusive lock stays
    /// held.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }

    /// Downgrades back to a read token, keeping the shared lock held
    /// throughout.
    pub fn demote(self) -> ReadToken<'a, T, P> {
        let this = ManuallyDrop::new(self);
        this.guarded.policy.demote();
        ReadToken {
            guarded: this.guarded,
            _not_send: PhantomData,
        }
    }
}

impl<T, P: RwPolicy> Drop for PromotedWriteToken<'_, T, P> {
    fn drop(&mut self) {
        // Demote-then-release is equivalent to a single exclusive
        // release, and keeps the policy's bookkeeping on the same path
        // the explicit demotion takes.
        self.guarded.policy.demote();
        self.guarded.policy.unlock_shared();
        self.guarded.uncount_token();
    }
}

// ── Write-to-read carry ─────────────────────────────────────────────────

/// Keeps data read-locked between a write token and later read tokens.
///
/// Protocol: create with [`Guarded::carry`] (no lock taken), consume once
/// with [`write`](Self::write) (takes the exclusive lock; drop of that
/// token demotes to shared instead of unlocking), then read any number of
/// times with [`read`](Self::read). The shared lock is finally released
/// when the carry drops.
#[must_use = "a carry that is never written through does nothing"]
pub struct WriteToReadCarry<'a, T, P: RwPolicy> {
    guarded: &'a Guarded<T, P>,
    stage: Cell<CarryStage>,
    _not_send: NotThreadSafe,
}

/// Where a carry is in its write-then-read protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CarryStage {
    /// Created, nothing locked yet.
    Fresh,
    /// The write token is live and holds the exclusive lock.
    Writing,
    /// The write token is gone; the carry owns the shared lock.
    Carried,
}

impl<'a, T, P: RwPolicy> WriteToReadCarry<'a, T, P> {
    /// Takes the exclusive lock. Must be called exactly once, before any
    /// [`read`](Self::read).
    ///
    /// # Panics
    ///
    /// Panics if the carry was already written through.
    pub fn write(&self) -> CarryWriteToken<'_, 'a, T, P> {
        assert!(
            self.stage.get() == CarryStage::Fresh,
            "carry written through twice"
        );
        self.guarded.policy.lock_exclusive();
        self.stage.set(CarryStage::Writing);
        CarryWriteToken {
            carry: self,
            _not_send: PhantomData,
        }
    }

    /// Reads under the shared lock the carry holds.
    ///
    /// # Panics
    ///
    /// Panics unless the carry has been written through and the write
    /// token is gone.
    pub fn read(&self) -> CarryReadToken<'_, 'a, T, P> {
        assert!(
            self.stage.get() == CarryStage::Carried,
            "carry read before its write token came and went"
        );
        CarryReadToken {
            carry: self,
            _not_send: PhantomData,
        }
    }
}

impl<T, P: RwPolicy> Drop for WriteToReadCarry<'_, T, P> {
    fn drop(&mut self) {
        // Writing is impossible here: a live write token borrows the
        // carry and would keep it from dropping.
        if self.stage.get() == CarryStage::Carried {
            self.guarded.policy.unlock_shared();
        }
        self.guarded.uncount_token();
    }
}

/// Write token carried by a [`WriteToReadCarry`]; demotes to the shared
/// lock on drop (which the carry then owns).
#[must_use = "the lock is demoted as soon as the token drops"]
pub struct CarryWriteToken<'c, 'a, T, P: RwPolicy> {
    carry: &'c WriteToReadCarry<'a, T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: RwPolicy> Deref for CarryWriteToken<'_, '_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: exclusive lock held for the token's lifetime.
        unsafe { &*self.carry.guarded.data.get() }
    }
}

impl<T, P: RwPolicy> DerefMut for CarryWriteToken<'_, '_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive lock held; unique via `&mut self`.
        unsafe { &mut *self.carry.guarded.data.get() }
    }
}

impl<'c, 'a, T, P: RwPolicy> CarryWriteToken<'c, 'a, T, P> {
    /// Read-only view borrowing this token.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }
}

impl<T, P: RwPolicy> Drop for CarryWriteToken<'_, '_, T, P> {
    fn drop(&mut self) {
        // The carry now owns a shared lock instead of our exclusive one.
        self.carry.guarded.policy.demote();
        self.carry.stage.set(CarryStage::Carried);
    }
}

/// Read token borrowed from a consumed [`WriteToReadCarry`]; does not own
/// the lock, so dropping it releases nothing.
pub struct CarryReadToken<'c, 'a, T, P: RwPolicy> {
    carry: &'c WriteToReadCarry<'a, T, P>,
    _not_send: NotThreadSafe,
}

impl<T, P: RwPolicy> Deref for CarryReadToken<'_, '_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the carry holds the shared lock while it lives, and
        // this token borrows the carry.
        unsafe { &*self.carry.guarded.data.get() }
    }
}

impl<'c, 'a, T, P: RwPolicy> CarryReadToken<'c, 'a, T, P> {
    /// Read-only view borrowing this token.
    #[inline]
    pub fn as_read(&self) -> ReadRef<'_, T> {
        ReadRef { data: &**self }
    }
}
