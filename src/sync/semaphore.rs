//! Futex-based counting semaphore.
//!
//! Tokens and waiter count share one 64-bit atomic word: the low 32 bits
//! hold the available tokens, the high 32 bits the number of blocked
//! threads. Keeping both in one word lets a waiter register itself and a
//! poster detect waiters with plain fetch-and-adds, and lets a woken
//! thread grab a token and deregister in a single compare-exchange.
//!
//! The futex sleeps on the *token half* of the word, so a `post` that
//! changes the token count either wakes sleepers explicitly or causes
//! their pending `wait` to fail its value check. No wakeup can be lost:
//! a waiter increments the waiter half *before* its blocking load, so any
//! later `post` observes `waiters > 0` and issues a wake.
//!
//! Because of spurious wakeups and races with other waiters, a woken
//! thread cannot assume a token is there for it; it simply retries the
//! grab or goes back to sleep.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sync::futex;
use crate::tracing_compat::trace;

const WAITERS_SHIFT: u32 = 32;
const ONE_WAITER: u64 = 1 << WAITERS_SHIFT;
const TOKENS_MASK: u64 = ONE_WAITER - 1;

/// Counting semaphore with futex-blocked waiters.
#[derive(Debug)]
pub struct Semaphore {
    /// Low 32 bits: available tokens. High 32 bits: blocked threads.
    word: AtomicU64,
}

impl Semaphore {
    /// Creates a semaphore holding `tokens` initial tokens.
    #[must_use]
    pub const fn new(tokens: u32) -> Self {
        Self {
            word: AtomicU64::new(tokens as u64),
        }
    }

    /// Adds `n` tokens and wakes up to `n` blocked threads with a single
    /// system call.
    ///
    /// Token-count overflow is a contract violation and asserts in debug
    /// builds.
    pub fn post(&self, n: u32) {
        let prev = self.word.fetch_add(u64::from(n), Ordering::Release);
        debug_assert!(
            (prev & TOKENS_MASK) + u64::from(n) <= TOKENS_MASK,
            "semaphore token count overflow"
        );
        let waiters = (prev >> WAITERS_SHIFT) as u32;
        if waiters > 0 {
            trace!(tokens = n, waiters, "semaphore post waking sleepers");
            futex::wake(self.tokens_word(), n);
        }
    }

    /// Removes one token, blocking until one is available.
    pub fn wait(&self) {
        let mut word = self.word.load(Ordering::Relaxed);
        // Fast path: grab a token without ever counting as a waiter.
        while word & TOKENS_MASK != 0 {
            match self.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }

        // Going to block: become a waiter first, so no post can miss us.
        word = self.word.fetch_add(ONE_WAITER, Ordering::Relaxed) + ONE_WAITER;
        loop {
            let tokens = (word & TOKENS_MASK) as u32;
            if tokens == 0 {
                trace!(
                    waiters = (word >> WAITERS_SHIFT) as u32,
                    "semaphore wait blocking"
                );
                // Sleeps only while the token half still reads zero; a
                // concurrent post either changes it (futex returns
                // immediately) or wakes us afterwards.
                futex::wait(self.tokens_word(), 0);
                word = self.word.load(Ordering::Relaxed);
            } else {
                // Grab a token and stop being a waiter in one step.
                match self.word.compare_exchange_weak(
                    word,
                    word - ONE_WAITER - 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(current) => word = current,
                }
            }
        }
    }

    /// Attempts to remove one token without blocking. Returns true on
    /// success.
    pub fn try_wait(&self) -> bool {
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            if word & TOKENS_MASK == 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Currently available tokens. Diagnostic snapshot only.
    #[must_use]
    pub fn tokens(&self) -> u32 {
        (self.word.load(Ordering::Relaxed) & TOKENS_MASK) as u32
    }

    /// Currently blocked threads. Diagnostic snapshot only.
    #[must_use]
    pub fn waiters(&self) -> u32 {
        (self.word.load(Ordering::Relaxed) >> WAITERS_SHIFT) as u32
    }

    /// View of the token half of the word for the futex.
    fn tokens_word(&self) -> &AtomicU32 {
        let ptr = self.word.as_ptr().cast::<AtomicU32>();
        // The futex must observe the 32 bits that hold the token count,
        // which sit in the second u32 on big-endian targets.
        #[cfg(target_endian = "big")]
        let ptr = unsafe { ptr.add(1) };
        // Safety: the pointer is within the AtomicU64's storage, properly
        // aligned for u32, and only used for atomic accesses.
        unsafe { &*ptr }
    }
}
