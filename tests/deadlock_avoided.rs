//! The refused-promotion path, end to end, on the raw lock surface.
//!
//! Two threads hold read locks and both try to convert. Exactly one must
//! be refused; after the loser releases and yields, the winner completes,
//! and the loser's retry then succeeds. Runs against both read/write
//! locks, which share the conversion contract.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tokensync::guard::RawRwLock;
use tokensync::sync::{RwMutex, RwSpinLock};
use tokensync::test_utils::init_test_logging;
use tokensync::{assert_with_log, test_complete, test_phase};

fn race_two_converters<L>(name: &str, lock: Arc<L>)
where
    L: RawRwLock + Send + Sync + 'static,
{
    init_test_logging();
    test_phase!(name);

    let refusals = Arc::new(AtomicU32::new(0));
    let completions = Arc::new(AtomicU32::new(0));
    let both_reading = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let lock = Arc::clone(&lock);
        let refusals = Arc::clone(&refusals);
        let completions = Arc::clone(&completions);
        let both_reading = Arc::clone(&both_reading);
        handles.push(thread::spawn(move || {
            lock.rdlock();
            both_reading.wait();
            loop {
                match lock.rd2wrlock() {
                    Ok(()) => {
                        completions.fetch_add(1, Ordering::Relaxed);
                        lock.wrunlock();
                        break;
                    }
                    Err(_refused) => {
                        refusals.fetch_add(1, Ordering::Relaxed);
                        lock.rdunlock();
                        lock.rd2wryield();
                        lock.rdlock();
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Both readers were in place before either converted, so the second
    // announcer is always refused: exactly one refusal, two completions.
    let refused = refusals.load(Ordering::Relaxed);
    let completed = completions.load(Ordering::Relaxed);
    assert_with_log!(refused == 1, "exactly one refusal", 1u32, refused);
    assert_with_log!(completed == 2, "both converters complete", 2u32, completed);
    test_complete!(name);
}

#[test]
fn spin_lock_refuses_second_converter() {
    race_two_converters("spin_lock_refuses_second_converter", Arc::new(RwSpinLock::new()));
}

#[test]
fn blocking_lock_refuses_second_converter() {
    race_two_converters(
        "blocking_lock_refuses_second_converter",
        Arc::new(RwMutex::new()),
    );
}

#[test]
fn spin_lock_converter_stampede_settles() {
    // Many converters, repeatedly: every round exactly one wins directly
    // and the rest recover; the lock must end fully released.
    init_test_logging();
    test_phase!("spin_lock_converter_stampede_settles");
    let lock = Arc::new(RwSpinLock::new());
    let completions = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        let completions = Arc::clone(&completions);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                lock.rdlock();
                loop {
                    match lock.rd2wrlock() {
                        Ok(()) => {
                            lock.wrunlock();
                            completions.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        Err(_refused) => {
                            lock.rdunlock();
                            lock.rd2wryield();
                            lock.rdlock();
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let completed = completions.load(Ordering::Relaxed);
    assert_with_log!(completed == 2_000, "all conversions landed", 2_000u32, completed);
    assert_with_log!(lock.raw_state() == 0, "terminal state", 0i64, lock.raw_state());
    test_complete!("spin_lock_converter_stampede_settles");
}
