//! Small thread-identity helpers shared by the lock primitives.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of the current thread as a crate-local non-zero integer.
///
/// `std::thread::ThreadId` is opaque and cannot be stored in an atomic, so
/// the lock primitives use ids handed out from a process-wide counter
/// instead. Zero is reserved to mean "no thread".
#[inline]
#[must_use]
pub fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// Returns true while only a single thread has ever passed through here.
///
/// The first caller claims the slot; later calls compare against it.
/// Intended for debug assertions guarding single-threaded state:
///
/// ```
/// use std::sync::atomic::AtomicU64;
/// use tokensync::util::is_single_threaded;
///
/// static OWNER: AtomicU64 = AtomicU64::new(0);
/// assert!(is_single_threaded(&OWNER));
/// ```
#[must_use]
pub fn is_single_threaded(slot: &AtomicU64) -> bool {
    let me = current_thread_id();
    match slot.compare_exchange(0, me, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(_) => true,
        Err(owner) => owner == me,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());
        assert_ne!(here, 0);

        let other = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn single_thread_check_trips_on_second_thread() {
        let slot = AtomicU64::new(0);
        assert!(is_single_threaded(&slot));
        assert!(is_single_threaded(&slot));

        let slot = std::sync::Arc::new(AtomicU64::new(0));
        assert!(is_single_threaded(&slot));
        let slot2 = slot.clone();
        let from_other = thread::spawn(move || is_single_threaded(&slot2))
            .join()
            .unwrap();
        assert!(!from_other);
    }
}
