//! Polymorphic views of guarded data.
//!
//! A function that operates on some base type `B` should not need to know
//! the concrete `T` stored in a [`Guarded<T, P>`]. [`GuardedBase`]
//! erases `T`: it captures the policy of the originating `Guarded` plus a
//! pointer to the `B` inside the `T` (projected through [`AsBase`]), and
//! mints tokens that take the very same locks. `B` may be unsized, so
//! `GuardedBase<'a, dyn Trait, P>` works.
//!
//! The view borrows the `Guarded`, so the data can neither move nor die
//! while any view or token exists; that borrow replaces the keep-alive
//! reference counting a pointer-based design would need.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::guard::{Guarded, Policy};

/// Projects a value onto one of its components or base views.
///
/// Implement this for each `B` your `T` wants to expose through
/// [`GuardedBase`]. Both projections must return the same component.
pub trait AsBase<B: ?Sized> {
    /// Shared projection.
    fn base(&self) -> &B;
    /// Exclusive projection.
    fn base_mut(&mut self) -> &mut B;
}

impl<T> AsBase<T> for T {
    fn base(&self) -> &T {
        self
    }
    fn base_mut(&mut self) -> &mut T {
        self
    }
}

/// Reference-style view of the `B` inside some `Guarded<T, P>`.
///
/// Copyable like any reference; tokens minted from any copy contend on
/// the one shared mutex.
pub struct GuardedBase<'a, B: ?Sized, P: Policy> {
    policy: &'a P,
    base: NonNull<B>,
    #[cfg(debug_assertions)]
    token_counter: &'a std::sync::atomic::AtomicI32,
    _borrow: PhantomData<&'a ()>,
}

impl<B: ?Sized, P: Policy> Clone for GuardedBase<'_, B, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ?Sized, P: Policy> Copy for GuardedBase<'_, B, P> {}

// Safety: the view is a (policy, pointer) pair borrowed from a Guarded
// that outlives it; token minting locks before touching the pointee, so
// sharing the view across threads is as safe as sharing the Guarded.
unsafe impl<B: ?Sized + Send + Sync, P: Policy + Sync> Send for GuardedBase<'_, B, P> {}
unsafe impl<B: ?Sized + Send + Sync, P: Policy + Sync> Sync for GuardedBase<'_, B, P> {}

impl<'a, B: ?Sized, P: Policy> GuardedBase<'a, B, P> {
    /// Builds a view of the `B` inside `guarded`.
    ///
    /// Takes the shared lock for the instant of the projection; the
    /// pointer stays valid afterwards because the `Guarded` is borrowed
    /// for `'a`.
    pub fn new<T: AsBase<B>>(guarded: &'a Guarded<T, P>) -> Self {
        guarded.policy().lock_shared();
        // Safety: shared lock held across the projection.
        let base = NonNull::from(unsafe { &*guarded.data_ptr() }.base());
        guarded.policy().unlock_shared();
        Self {
            policy: guarded.policy(),
            base,
            #[cfg(debug_assertions)]
            token_counter: guarded.token_counter(),
            _borrow: PhantomData,
        }
    }

    #[inline]
    fn count_token(&self) {
        #[cfg(debug_assertions)]
        self.token_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[inline]
    fn uncount_token(&self) {
        #[cfg(debug_assertions)]
        self.token_counter
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Takes the shared lock and returns a read token for the base.
    pub fn read(&self) -> BaseReadToken<'_, 'a, B, P> {
        self.policy.lock_shared();
        self.count_token();
        BaseReadToken {
            view: self,
            _not_send: PhantomData,
        }
    }

    /// Takes the exclusive lock and returns a write token for the base.
    pub fn write(&self) -> BaseWriteToken<'_, 'a, B, P> {
        self.policy.lock_exclusive();
        self.count_token();
        BaseWriteToken {
            view: self,
            _not_send: PhantomData,
        }
    }
}

/// Read token for a [`GuardedBase`]; shared lock held while it lives.
#[must_use = "the lock is released as soon as the token drops"]
pub struct BaseReadToken<'v, 'a, B: ?Sized, P: Policy> {
    view: &'v GuardedBase<'a, B, P>,
    _not_send: PhantomData<*const ()>,
}

impl<B: ?Sized, P: Policy> Deref for BaseReadToken<'_, '_, B, P> {
    type Target = B;

    #[inline]
    fn deref(&self) -> &B {
        // Safety: shared lock held; the pointee outlives the view's
        // borrow of the Guarded.
        unsafe { self.view.base.as_ref() }
    }
}

impl<B: ?Sized, P: Policy> Drop for BaseReadToken<'_, '_, B, P> {
    fn drop(&mut self) {
        self.view.policy.unlock_shared();
        self.view.uncount_token();
    }
}

/// Write token for a [`GuardedBase`]; exclusive lock held while it lives.
#[must_use = "the lock is released as soon as the token drops"]
pub struct BaseWriteToken<'v, 'a, B: ?Sized, P: Policy> {
    view: &'v GuardedBase<'a, B, P>,
    _not_send: PhantomData<*const ()>,
}

impl<B: ?Sized, P: Policy> Deref for BaseWriteToken<'_, '_, B, P> {
    type Target = B;

    #[inline]
    fn deref(&self) -> &B {
        // Safety: exclusive lock held.
        unsafe { self.view.base.as_ref() }
    }
}

impl<B: ?Sized, P: Policy> DerefMut for BaseWriteToken<'_, '_, B, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut B {
        // Safety: exclusive lock held; `&mut self` keeps this reference
        // unique. The pointer write path never aliases the Guarded's own
        // tokens because they contend on the same mutex.
        unsafe { &mut *self.view.base.as_ptr() }
    }
}

impl<B: ?Sized, P: Policy> Drop for BaseWriteToken<'_, '_, B, P> {
    fn drop(&mut self) {
        self.view.policy.unlock_exclusive();
        self.view.uncount_token();
    }
}
