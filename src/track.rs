//! Heap-stable back-references to movable, guarded data.
//!
//! A [`TrackedGuarded`] wraps a value the way
//! [`Guarded`](crate::guard::Guarded) does, and additionally owns a
//! heap-allocated [`ObjectTracker`]: a small object other code can hold
//! (through `Arc`/[`Weak`]) that always knows where the current live
//! instance of the value is and which mutex guards it, even across
//! [`relocate`](TrackedGuarded::relocate) calls and until destruction.
//!
//! Three pieces cooperate:
//!
//! - the tracked value `T` embeds a [`TrackerAnchor`] (exposed through the
//!   [`Trackable`] trait) holding the `Arc<ObjectTracker>`, so the value
//!   itself can hand out its tracker;
//! - [`TrackedGuarded<T, M>`] owns the value behind a boxed
//!   `Guarded<T, ReadWrite<M>>` (boxed so the *wrapper* may move freely
//!   without invalidating the tracker's pointers) plus its own `Arc` to
//!   the tracker;
//! - [`ObjectTracker<T, M>`] holds the `{data pointer, mutex pointer}`
//!   pair, itself guarded by a [`RwSpinLock`] under the crate's own
//!   read/write policy.
//!
//! # Lock order
//!
//! Every path that holds both locks takes the tracker lock first, then
//! the data lock: accessors take the tracker read lock, acquire the data
//! lock, and release the tracker lock; relocation takes the tracker
//! write lock and then the data write lock. Destruction takes only the
//! tracker write lock. The order tracker → data is acyclic, so the
//! facility cannot deadlock against itself.
//!
//! # Relocation protocol
//!
//! [`TrackedGuarded::relocate`] locks the tracker for writing (stalling
//! all accessors), write-locks the old data mutex (draining direct token
//! holders), moves the value into fresh storage with a fresh mutex,
//! re-points the tracker, and only then unlocks the old mutex and the
//! tracker. No accessor can ever observe a stale pointer pair.
//!
//! On destruction the tracker's data pointer is nulled, so later
//! accessors get `None`, and [`Weak`] upgrades fail once the last `Arc`
//! is gone.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crate::guard::{Guarded, RawRwLock, ReadWrite};
use crate::sync::RwSpinLock;
use crate::tracing_compat::trace;

/// Mixin field for values that want a tracker.
///
/// Embed one in your `T` and wire it up through [`Trackable`]; the
/// wrapper links it when the value is adopted.
pub struct TrackerAnchor<T, M: RawRwLock + Default> {
    tracker: Option<Arc<ObjectTracker<T, M>>>,
}

impl<T, M: RawRwLock + Default> std::fmt::Debug for TrackerAnchor<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerAnchor")
            .field("linked", &self.tracker.is_some())
            .finish()
    }
}

impl<T, M: RawRwLock + Default> TrackerAnchor<T, M> {
    /// Creates an unlinked anchor; [`TrackedGuarded::new`] links it.
    #[must_use]
    pub fn new() -> Self {
        Self { tracker: None }
    }

    /// The tracker of the adopted value.
    ///
    /// # Panics
    ///
    /// Panics if the value was never adopted by a [`TrackedGuarded`].
    #[must_use]
    pub fn tracker(&self) -> &Arc<ObjectTracker<T, M>> {
        self.tracker
            .as_ref()
            .expect("anchor not linked: value was never adopted by TrackedGuarded")
    }
}

impl<T, M: RawRwLock + Default> Default for TrackerAnchor<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by values that embed a [`TrackerAnchor`].
pub trait Trackable<M: RawRwLock + Default>: Sized {
    /// The embedded anchor.
    fn anchor(&self) -> &TrackerAnchor<Self, M>;
    /// The embedded anchor, mutably.
    fn anchor_mut(&mut self) -> &mut TrackerAnchor<Self, M>;
}

/// The pointer pair the tracker guards.
struct TrackerState<T, M> {
    /// Current live instance, null after destruction.
    data: *mut T,
    /// Mutex guarding that instance.
    mutex: *const M,
    /// Debug pointer to the live-token counter of the owning `Guarded`,
    /// so tracker tokens participate in the token accounting.
    #[cfg(debug_assertions)]
    token_counter: *const std::sync::atomic::AtomicI32,
}

impl<T, M> TrackerState<T, M> {
    fn unlinked() -> Self {
        Self {
            data: std::ptr::null_mut(),
            mutex: std::ptr::null(),
            #[cfg(debug_assertions)]
            token_counter: std::ptr::null(),
        }
    }

    fn point_at(&mut self, guarded: &Guarded<T, ReadWrite<M>>)
    where
        M: RawRwLock + Default,
    {
        self.data = guarded.data_ptr();
        self.mutex = guarded.policy().mutex();
        #[cfg(debug_assertions)]
        {
            self.token_counter = guarded.token_counter();
        }
    }
}

// Safety: the raw pointers are only dereferenced by tracker operations
// that validate them under the tracker lock, and the pointees are owned
// by a TrackedGuarded that unlinks them before they die.
unsafe impl<T: Send, M: Send> Send for TrackerState<T, M> {}
unsafe impl<T: Send + Sync, M: Sync> Sync for TrackerState<T, M> {}

/// Heap-stable tracker for one [`TrackedGuarded`] value.
///
/// Obtain one with [`TrackedGuarded::tracker`] (or a [`Weak`] with
/// [`TrackedGuarded::tracker_weak`]) and access the data with
/// [`tracked_read`](Self::tracked_read) /
/// [`tracked_write`](Self::tracked_write) at any later time; the
/// accessors report `None` once the value is gone.
pub struct ObjectTracker<T, M: RawRwLock + Default> {
    state: Guarded<TrackerState<T, M>, ReadWrite<RwSpinLock>>,
}

impl<T, M: RawRwLock + Default> std::fmt::Debug for ObjectTracker<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTracker").finish_non_exhaustive()
    }
}

impl<T, M: RawRwLock + Default> ObjectTracker<T, M> {
    fn unlinked() -> Self {
        Self {
            state: Guarded::new(TrackerState::unlinked()),
        }
    }

    /// Clears the data pointer; later accessors observe "gone".
    fn unlink(&self) {
        let mut state = self.state.write();
        state.data = std::ptr::null_mut();
        state.mutex = std::ptr::null();
    }

    /// Read-locks the tracked data and returns a token for it, or `None`
    /// if the data has been destroyed.
    ///
    /// Takes the tracker's read lock, acquires the data's read lock, and
    /// releases the tracker lock: the strict tracker-then-data order.
    pub fn tracked_read(&self) -> Option<TrackerReadToken<T, M>> {
        let state = self.state.read();
        let data = NonNull::new(state.data)?;
        // Safety: non-null implies linked; the pointee and its mutex stay
        // alive at least until relocation or destruction, both of which
        // need the tracker write lock we are blocking.
        let mutex = unsafe { &*state.mutex };
        mutex.rdlock();
        #[cfg(debug_assertions)]
        let token_counter = state.token_counter;
        #[cfg(debug_assertions)]
        // Safety: counter lives inside the Guarded we just read-locked.
        unsafe {
            (*token_counter).fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        drop(state);
        Some(TrackerReadToken {
            data,
            mutex: NonNull::from(mutex),
            #[cfg(debug_assertions)]
            token_counter,
            _not_send: PhantomData,
        })
    }

    /// Write-locks the tracked data and returns a token for it, or `None`
    /// if the data has been destroyed. Same lock order as
    /// [`tracked_read`](Self::tracked_read).
    pub fn tracked_write(&self) -> Option<TrackerWriteToken<T, M>> {
        let state = self.state.read();
        let data = NonNull::new(state.data)?;
        // Safety: as in tracked_read.
        let mutex = unsafe { &*state.mutex };
        mutex.wrlock();
        #[cfg(debug_assertions)]
        let token_counter = state.token_counter;
        #[cfg(debug_assertions)]
        // Safety: counter lives inside the Guarded we just write-locked.
        unsafe {
            (*token_counter).fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        drop(state);
        Some(TrackerWriteToken {
            data,
            mutex: NonNull::from(mutex),
            #[cfg(debug_assertions)]
            token_counter,
            _not_send: PhantomData,
        })
    }

    /// True once the tracked value has been destroyed.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.state.read().data.is_null()
    }
}

/// Read token minted through an [`ObjectTracker`].
///
/// Holds the data's read lock. The token must not outlive the tracked
/// value; destroying the value while tokens are live trips the guarded
/// debug token accounting.
#[must_use = "the lock is released as soon as the token drops"]
pub struct TrackerReadToken<T, M: RawRwLock> {
    data: NonNull<T>,
    mutex: NonNull<M>,
    #[cfg(debug_assertions)]
    token_counter: *const std::sync::atomic::AtomicI32,
    _not_send: PhantomData<*const ()>,
}

impl<T, M: RawRwLock> Deref for TrackerReadToken<T, M> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: read lock held since construction.
        unsafe { self.data.as_ref() }
    }
}

impl<T, M: RawRwLock> Drop for TrackerReadToken<T, M> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        // Safety: the counter outlives the token per the token contract.
        unsafe {
            (*self.token_counter).fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        // Safety: we hold the read lock on exactly this mutex.
        unsafe { self.mutex.as_ref() }.rdunlock();
    }
}

/// Write token minted through an [`ObjectTracker`].
#[must_use = "the lock is released as soon as the token drops"]
pub struct TrackerWriteToken<T, M: RawRwLock> {
    data: NonNull<T>,
    mutex: NonNull<M>,
    #[cfg(debug_assertions)]
    token_counter: *const std::sync::atomic::AtomicI32,
    _not_send: PhantomData<*const ()>,
}

impl<T, M: RawRwLock> Deref for TrackerWriteToken<T, M> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: write lock held since construction.
        unsafe { self.data.as_ref() }
    }
}

impl<T, M: RawRwLock> DerefMut for TrackerWriteToken<T, M> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: write lock held; unique via `&mut self`.
        unsafe { self.data.as_mut() }
    }
}

impl<T, M: RawRwLock> Drop for TrackerWriteToken<T, M> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        // Safety: the counter outlives the token per the token contract.
        unsafe {
            (*self.token_counter).fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        // Safety: we hold the write lock on exactly this mutex.
        unsafe { self.mutex.as_ref() }.wrunlock();
    }
}

/// Guarded, tracked value.
///
/// Behaves like `Guarded<T, ReadWrite<M>>` (the usual tokens are
/// available through [`read`](Self::read) / [`write`](Self::write) /
/// [`const_read`](Self::const_read)), and additionally maintains an
/// [`ObjectTracker`] that survives relocation.
pub struct TrackedGuarded<T: Trackable<M>, M: RawRwLock + Default> {
    /// Boxed so the wrapper can move without invalidating the tracker.
    inner: Box<Guarded<T, ReadWrite<M>>>,
    /// Kept alongside the value so tracker maintenance never has to lock
    /// the data just to find its tracker.
    tracker: Arc<ObjectTracker<T, M>>,
}

impl<T: Trackable<M> + std::fmt::Debug, M: RawRwLock + Default> std::fmt::Debug
    for TrackedGuarded<T, M>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedGuarded").finish_non_exhaustive()
    }
}

impl<T: Trackable<M>, M: RawRwLock + Default> TrackedGuarded<T, M> {
    /// Adopts `value`: allocates its tracker, links the value's anchor,
    /// and guards the value under a fresh mutex.
    pub fn new(mut value: T) -> Self {
        let tracker = Arc::new(ObjectTracker::unlinked());
        value.anchor_mut().tracker = Some(Arc::clone(&tracker));
        let inner = Box::new(Guarded::new(value));
        tracker.state.write().point_at(&inner);
        Self { inner, tracker }
    }

    /// The tracker for this value.
    #[must_use]
    pub fn tracker(&self) -> Arc<ObjectTracker<T, M>> {
        Arc::clone(&self.tracker)
    }

    /// Weak handle to the tracker; upgrades fail once every `Arc` is
    /// gone.
    #[must_use]
    pub fn tracker_weak(&self) -> Weak<ObjectTracker<T, M>> {
        Arc::downgrade(&self.tracker)
    }

    /// Read token for the value (the ordinary guarded path).
    pub fn read(&self) -> crate::guard::ReadToken<'_, T, ReadWrite<M>> {
        self.inner.read()
    }

    /// Const-read token for the value.
    pub fn const_read(&self) -> crate::guard::ConstReadToken<'_, T, ReadWrite<M>> {
        self.inner.const_read()
    }

    /// Write token for the value.
    pub fn write(&self) -> crate::guard::WriteToken<'_, T, ReadWrite<M>> {
        self.inner.write()
    }

    /// Moves the value into fresh storage with a fresh mutex, atomically
    /// re-pointing the tracker.
    ///
    /// Accessors observe no window in which the tracker is stale: the
    /// tracker stays write-locked from before the move until the new
    /// pointers are in place, and the old data mutex stays write-locked
    /// until then as well.
    pub fn relocate(orig: Self) -> Self {
        trace!("relocating tracked value");
        let old = ManuallyDrop::new(orig);
        let tracker = Arc::clone(&old.tracker);

        let inner = {
            // Tracker first, then data: the crate-wide order.
            let mut state = tracker.state.write();
            old.inner.policy().mutex().wrlock();

            // Move the value (anchor and all) into new storage with a new
            // mutex.
            // Safety: the old location is write-locked so nothing reads
            // the moved-from bytes, and `drop_hollow` below frees the old
            // box without dropping the value a second time.
            let value: T = unsafe { std::ptr::read(old.inner.data_ptr()) };
            let inner = Box::new(Guarded::new(value));

            // Re-point the tracker before anyone can look again.
            state.point_at(&inner);

            // Stragglers blocked on the old mutex resume once we unlock;
            // on their next tracker round-trip they land on the new
            // location.
            old.inner.policy().mutex().wrunlock();
            inner
        };

        // Free the hollow shell: the box and its Arc, but not the value.
        // Safety: the value was moved out above; no tokens are live on
        // the old Guarded (relocation takes ownership of the wrapper, and
        // tracker tokens drained under the old mutex's write lock).
        unsafe {
            Guarded::drop_hollow(std::ptr::read(&old.inner));
            drop(std::ptr::read(&old.tracker));
        }

        Self { inner, tracker }
    }
}

impl<T: Trackable<M>, M: RawRwLock + Default> Drop for TrackedGuarded<T, M> {
    fn drop(&mut self) {
        // Null the tracker's pointers before the value dies; accessors
        // that already hold a data lock are contract violations caught by
        // the guarded debug token accounting.
        self.tracker.unlink();
    }
}
