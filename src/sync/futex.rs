//! Platform futex shim.
//!
//! A waiter calls [`wait`] with the value it last observed; the call
//! returns when the word no longer holds that value, when another thread
//! calls [`wake`], or spuriously. Callers must therefore re-examine their
//! state and retry; both users in this crate (the semaphore and its
//! tests) are written as retry loops.
//!
//! On Linux this is the raw `futex(2)` syscall with the `PRIVATE` flag
//! (the words never cross address spaces). Elsewhere the `atomic-wait`
//! crate provides the same wait/wake shape on top of the platform
//! equivalents; it has no multi-wake, so waking `n > 1` threads becomes a
//! wake-all, which is correct because every waiter revalidates.

#![allow(unsafe_code)]

use std::sync::atomic::AtomicU32;

/// Blocks until `word` is observed to differ from `expected`, a wake
/// arrives, or a spurious return happens. Signal interruptions are retried
/// internally.
#[cfg(target_os = "linux")]
pub(crate) fn wait(word: &AtomicU32, expected: u32) {
    loop {
        // Safety: `word` is a valid, aligned u32 for the duration of the
        // call and FUTEX_WAIT does not write through the pointer.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if rc == 0 {
            return;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            // Interrupted by a signal: the value may still match, wait again.
            Some(code) if code == libc::EINTR => continue,
            // EAGAIN: the word changed before we slept. Anything else is a
            // usage error surfaced by the caller's retry loop.
            _ => return,
        }
    }
}

/// Wakes up to `count` threads blocked in [`wait`] on `word`. Returns the
/// number of threads actually woken.
#[cfg(target_os = "linux")]
pub(crate) fn wake(word: &AtomicU32, count: u32) -> u32 {
    // Safety: as above; FUTEX_WAKE only reads the address as a key.
    let woken = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if woken < 0 {
        0
    } else {
        woken as u32
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait(word: &AtomicU32, expected: u32) {
    atomic_wait::wait(word, expected);
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wake(word: &AtomicU32, count: u32) -> u32 {
    if count == 1 {
        atomic_wait::wake_one(word);
    } else {
        atomic_wait::wake_all(word);
    }
    // The platform shims do not report how many threads they woke; callers
    // only use the count for diagnostics.
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_when_value_differs() {
        let word = AtomicU32::new(7);
        // Expected value does not match: must not block.
        wait(&word, 3);
    }

    #[test]
    fn wake_releases_a_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let word2 = Arc::clone(&word);
        let waiter = thread::spawn(move || {
            while word2.load(Ordering::Acquire) == 0 {
                wait(&word2, 0);
            }
        });
        thread::sleep(std::time::Duration::from_millis(10));
        word.store(1, Ordering::Release);
        wake(&word, 1);
        waiter.join().unwrap();
    }
}
