//! Contention stress for both read/write locks through the token API.
//!
//! Every worker repeatedly write-locks a shared ledger, bumps it, then
//! read-locks and promotes to undo the bump, following the documented
//! recovery protocol when the promotion loses a race. Shadow counters
//! verify mutual exclusion the whole time; at the end the ledger must be
//! back at zero and the lock state fully released.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use tokensync::guard::{Guarded, ReadWrite, RwPolicy};
use tokensync::sync::{RwMutex, RwSpinLock};
use tokensync::test_utils::init_test_logging;
use tokensync::{assert_with_log, test_complete, test_phase};

const ITERS: usize = if cfg!(debug_assertions) { 10_000 } else { 100_000 };

#[derive(Default)]
struct Ledger {
    count: i64,
}

#[derive(Default)]
struct Shadow {
    /// Writers inside a critical section; must never exceed 1, and must
    /// be 0 whenever a reader is inside.
    writers: AtomicI32,
    /// Readers inside a critical section.
    readers: AtomicI32,
    /// Highest simultaneous reader count observed.
    max_readers: AtomicI32,
    /// Refused promotions (the DeadlockAvoided path was exercised).
    refusals: AtomicU32,
}

impl Shadow {
    fn enter_write(&self) {
        let writers = self.writers.fetch_add(1, Ordering::AcqRel) + 1;
        let readers = self.readers.load(Ordering::Acquire);
        assert!(writers == 1 && readers == 0, "write exclusion violated");
    }

    fn exit_write(&self) {
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }

    fn enter_read(&self) {
        let readers = self.readers.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            self.writers.load(Ordering::Acquire) == 0,
            "reader overlapped a writer"
        );
        self.max_readers.fetch_max(readers, Ordering::AcqRel);
    }

    fn exit_read(&self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn stress<P>(name: &str)
where
    P: RwPolicy + Send + Sync + 'static,
{
    init_test_logging();
    test_phase!(name);

    let threads = thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .min(8);
    let ledger: Arc<Guarded<Ledger, P>> = Arc::new(Guarded::new(Ledger::default()));
    let shadow = Arc::new(Shadow::default());

    let mut handles = Vec::new();
    for _ in 0..threads {
        let ledger = Arc::clone(&ledger);
        let shadow = Arc::clone(&shadow);
        handles.push(thread::spawn(move || {
            for _ in 0..ITERS {
                {
                    let mut token = ledger.write();
                    shadow.enter_write();
                    token.count += 1;
                    shadow.exit_write();
                }
                loop {
                    let token = ledger.read();
                    shadow.enter_read();
                    let observed = token.count;
                    assert!(observed >= 1, "count must be positive while our bump is live");
                    shadow.exit_read();
                    match token.try_promote() {
                        Ok(mut write) => {
                            shadow.enter_write();
                            write.count -= 1;
                            shadow.exit_write();
                            break;
                        }
                        Err((token, _refused)) => {
                            shadow.refusals.fetch_add(1, Ordering::Relaxed);
                            drop(token);
                            ledger.promote_yield();
                        }
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let final_count = ledger.read().count;
    assert_with_log!(final_count == 0, "ledger balanced", 0i64, final_count);
    if threads > 1 {
        let max_readers = shadow.max_readers.load(Ordering::Acquire);
        assert_with_log!(
            max_readers >= 2,
            "readers actually ran concurrently",
            true,
            max_readers >= 2
        );
    }
    test_complete!(name);
}

#[test]
fn spin_lock_contention_stress() {
    stress::<ReadWrite<RwSpinLock>>("spin_lock_contention_stress");
}

#[test]
fn blocking_lock_contention_stress() {
    stress::<ReadWrite<RwMutex>>("blocking_lock_contention_stress");
}

#[test]
fn spin_lock_state_is_terminal_after_stress() {
    init_test_logging();
    test_phase!("spin_lock_state_is_terminal_after_stress");
    let guarded: Arc<Guarded<Ledger, ReadWrite<RwSpinLock>>> =
        Arc::new(Guarded::new(Ledger::default()));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let guarded = Arc::clone(&guarded);
        handles.push(thread::spawn(move || {
            for _ in 0..2_000 {
                guarded.write().count += 1;
                let _ = guarded.read().count;
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let state = guarded.policy().mutex().raw_state();
    assert_with_log!(state == 0, "packed state fully unlocked", 0i64, state);
    test_complete!("spin_lock_state_is_terminal_after_stress");
}
