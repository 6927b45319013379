//! Concurrent pointer storage with constant-time insert and erase.
//!
//! Keeps track of a set of raw pointers, typically live objects whose
//! constructors call [`insert`](PointerStorage::insert) and whose
//! destructors call [`erase`](PointerStorage::erase), so that some other
//! party can occasionally visit every live object with
//! [`for_each`](PointerStorage::for_each).
//!
//! Layout: a slot vector plus a lock-free pool of free slot indices,
//! both under one [`RwSpinLock`]. Insert and erase take the *read* lock
//! (they never move the vector, and distinct indices touch distinct
//! slots through atomic pointers); growth and iteration take the *write*
//! lock. A grower converts its read lock in place with `rd2wrlock` and
//! backs off through the documented yield protocol when another grower
//! got there first; this module is the crate's own consumer of the
//! promotion API.
//!
//! Indices refer to slots, not pointers: after `erase(i)`, `i` may be
//! handed out again by the next insert. Erase does not null the slot;
//! the free-list drain in `for_each` does, which keeps erase a single
//! queue push and makes an erase-then-insert reuse the same cache line.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_queue::SegQueue;
use smallvec::SmallVec;

use crate::config::StorageConfig;
use crate::error::DeadlockAvoided;
use crate::sync::RwSpinLock;
use crate::tracing_compat::debug;

/// Thread-safe storage for raw pointers with O(1) insert/erase.
pub struct PointerStorage<T> {
    lock: RwSpinLock,
    /// Slot array. Resized only under the write lock; slot stores go
    /// through the `AtomicPtr`s under the read lock.
    slots: UnsafeCell<Vec<AtomicPtr<T>>>,
    /// Free slot indices. Lock-free so insert/erase stay constant-time.
    free_indices: SegQueue<u32>,
    config: StorageConfig,
}

// Safety: the slot vector is only restructured under the exclusive lock;
// shared-lock access goes through atomic slots. The pointers themselves
// are payload, never dereferenced here.
unsafe impl<T> Send for PointerStorage<T> {}
unsafe impl<T> Sync for PointerStorage<T> {}

impl<T> std::fmt::Debug for PointerStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // No locking here: Debug must stay usable from any context.
        f.debug_struct("PointerStorage").finish_non_exhaustive()
    }
}

impl<T> Default for PointerStorage<T> {
    fn default() -> Self {
        Self::with_config(StorageConfig::from_env())
    }
}

impl<T> PointerStorage<T> {
    /// Creates storage with `initial_capacity` slots.
    #[must_use]
    pub fn new(initial_capacity: u32) -> Self {
        Self::with_config(StorageConfig {
            initial_capacity,
            ..StorageConfig::default()
        })
    }

    /// Creates storage from an explicit config.
    #[must_use]
    pub fn with_config(config: StorageConfig) -> Self {
        let config = config.validated();
        let mut slots = Vec::new();
        let free_indices = SegQueue::new();
        Self::fill(&mut slots, &free_indices, config.initial_capacity);
        Self {
            lock: RwSpinLock::new(),
            slots: UnsafeCell::new(slots),
            free_indices,
            config,
        }
    }

    /// Appends fresh slots and hands their indices to the free pool.
    fn fill(slots: &mut Vec<AtomicPtr<T>>, free_indices: &SegQueue<u32>, target: u32) {
        let old = slots.len();
        slots.resize_with(target as usize, || AtomicPtr::new(std::ptr::null_mut()));
        for index in (old as u32)..target {
            free_indices.push(index);
        }
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.lock.rdlock();
        // Safety: read lock held; the vector cannot be resized.
        let capacity = unsafe { (*self.slots.get()).len() } as u32;
        self.lock.rdunlock();
        capacity
    }

    /// Stores `value` and returns the slot index for a later
    /// [`erase`](Self::erase) or [`get`](Self::get).
    pub fn insert(&self, value: *mut T) -> u32 {
        self.lock.rdlock();
        loop {
            if let Some(index) = self.free_indices.pop() {
                // Safety: read lock held, so the vector is stable; the
                // index came from the free pool, so no other thread
                // writes this slot.
                unsafe {
                    (&*self.slots.get())[index as usize].store(value, Ordering::Release);
                }
                self.lock.rdunlock();
                return index;
            }
            // Free pool exhausted: become the grower.
            self.grow();
        }
    }

    /// Converts the held read lock into the write lock, grows the slot
    /// array, and downgrades back. Returns with the read lock held,
    /// whichever path was taken.
    fn grow(&self) {
        match self.lock.rd2wrlock() {
            Ok(()) => {
                if self.free_indices.is_empty() {
                    // Safety: write lock held, exclusive access.
                    let slots = unsafe { &mut *self.slots.get() };
                    let current = slots.len() as u32;
                    let grown = (f64::from(current) * f64::from(self.config.grow_factor)) as u32;
                    let target = grown.max(current + 1);
                    debug!(from = current, to = target, "growing pointer storage");
                    Self::fill(slots, &self.free_indices, target);
                }
                self.lock.wr2rdlock();
            }
            Err(DeadlockAvoided) => {
                // Another grower is converting; step aside, let it
                // finish, and re-enter. It will have refilled the pool.
                self.lock.rdunlock();
                self.lock.rd2wryield();
                self.lock.rdlock();
            }
        }
    }

    /// Returns the slot index to the free pool. The slot value stays in
    /// place until the index is reused or the next
    /// [`for_each`](Self::for_each) nulls it.
    pub fn erase(&self, index: u32) {
        self.lock.rdlock();
        self.free_indices.push(index);
        self.lock.rdunlock();
    }

    /// Reads the pointer at `index`. Only meaningful between the
    /// `insert` that returned the index and the matching `erase`.
    #[must_use]
    pub fn get(&self, index: u32) -> *mut T {
        self.lock.rdlock();
        // Safety: read lock held; the vector is stable.
        let value = unsafe { (&*self.slots.get())[index as usize].load(Ordering::Acquire) };
        self.lock.rdunlock();
        value
    }

    /// Visits every live pointer under the write lock.
    ///
    /// Freed-but-stale slots are nulled first (draining the free pool),
    /// so the callback sees each live pointer exactly once and no dead
    /// ones. Inserts and erases block for the duration.
    pub fn for_each(&self, mut visit: impl FnMut(*mut T)) {
        self.lock.wrlock();
        // Safety: write lock held, exclusive access.
        let slots = unsafe { &mut *self.slots.get() };

        let mut parked: SmallVec<[u32; 32]> = SmallVec::new();
        while let Some(index) = self.free_indices.pop() {
            slots[index as usize].store(std::ptr::null_mut(), Ordering::Relaxed);
            parked.push(index);
        }

        for slot in slots.iter() {
            let value = slot.load(Ordering::Relaxed);
            if !value.is_null() {
                visit(value);
            }
        }

        // Restore the free pool in reverse, so the most recently freed
        // index is handed out first again.
        for index in parked.iter().rev() {
            self.free_indices.push(*index);
        }
        self.lock.wrunlock();
    }

    /// True when no live pointer is stored. Expensive: drains and
    /// restores the whole free pool under the write lock. Diagnostics
    /// only.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock.wrlock();
        // Safety: write lock held, exclusive access.
        let total = unsafe { (*self.slots.get()).len() };
        let mut parked: SmallVec<[u32; 32]> = SmallVec::new();
        while let Some(index) = self.free_indices.pop() {
            parked.push(index);
        }
        let empty = parked.len() == total;
        for index in parked.iter().rev() {
            self.free_indices.push(*index);
        }
        self.lock.wrunlock();
        empty
    }
}
