//! Concurrent pointer-storage snapshots: no duplicates, no dead
//! pointers, counts consistent with what the mutators did.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tokensync::storage::PointerStorage;
use tokensync::test_utils::init_test_logging;
use tokensync::{assert_with_log, test_complete, test_phase};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = if cfg!(debug_assertions) { 5_000 } else { 25_000 };

#[test]
fn snapshots_under_concurrent_churn() {
    init_test_logging();
    test_phase!("snapshots_under_concurrent_churn");

    let storage: Arc<PointerStorage<u64>> = Arc::new(PointerStorage::new(8));
    let inserted = Arc::new(AtomicUsize::new(0));
    let erased = Arc::new(AtomicUsize::new(0));
    let stop_snapshots = Arc::new(AtomicBool::new(false));

    // Mutators: insert a pointer, keep it for a bit, erase it.
    let mut mutators = Vec::new();
    for thread_index in 0..THREADS {
        let storage = Arc::clone(&storage);
        let inserted = Arc::clone(&inserted);
        let erased = Arc::clone(&erased);
        mutators.push(thread::spawn(move || {
            let mut held: Vec<(u32, *mut u64)> = Vec::new();
            for op in 0..OPS_PER_THREAD {
                let ptr = Box::into_raw(Box::new((thread_index * OPS_PER_THREAD + op) as u64));
                held.push((storage.insert(ptr), ptr));
                inserted.fetch_add(1, Ordering::AcqRel);
                if held.len() > 16 {
                    let (index, ptr) = held.remove(0);
                    storage.erase(index);
                    erased.fetch_add(1, Ordering::AcqRel);
                    // Safety: we created it above and just erased it.
                    drop(unsafe { Box::from_raw(ptr) });
                }
            }
            // Release the tail.
            for (index, ptr) in held {
                storage.erase(index);
                erased.fetch_add(1, Ordering::AcqRel);
                // Safety: as above.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }));
    }

    // Snapshotter: every snapshot must be duplicate-free and its size
    // bounded by what the mutators have done around it.
    let snapshotter = {
        let storage = Arc::clone(&storage);
        let inserted = Arc::clone(&inserted);
        let erased = Arc::clone(&erased);
        let stop = Arc::clone(&stop_snapshots);
        thread::spawn(move || {
            let mut snapshots = 0u32;
            while !stop.load(Ordering::Acquire) {
                // Upper bound: everything inserted so far, minus
                // everything already erased before the snapshot began.
                let erased_before = erased.load(Ordering::Acquire);
                let mut seen = HashSet::new();
                let mut count = 0usize;
                storage.for_each(|ptr| {
                    assert!(seen.insert(ptr as usize), "duplicate pointer in snapshot");
                    count += 1;
                });
                let inserted_after = inserted.load(Ordering::Acquire);
                assert!(
                    count <= inserted_after - erased_before.min(inserted_after),
                    "snapshot larger than possible live set"
                );
                snapshots += 1;
                thread::yield_now();
            }
            snapshots
        })
    };

    for mutator in mutators {
        mutator.join().unwrap();
    }
    stop_snapshots.store(true, Ordering::Release);
    let snapshots = snapshotter.join().unwrap();
    assert_with_log!(snapshots > 0, "snapshotter made progress", true, snapshots > 0);

    // All mutators done and everything erased: storage must be empty.
    let empty = storage.is_empty();
    assert_with_log!(empty, "storage empty after churn", true, empty);
    let mut live = 0;
    storage.for_each(|_| live += 1);
    assert_with_log!(live == 0, "final snapshot empty", 0i32, live);
    test_complete!("snapshots_under_concurrent_churn");
}
