//! Lock and token micro-benchmarks.
//!
//! Measures the uncontended fast paths (the ones that should be a single
//! atomic RMW) and the token overhead on top of them:
//!
//! - read/write acquire+release for the spin lock, the blocking rwlock
//!   and the plain mutex
//! - token mint+drop through `Guarded` for the same locks
//! - semaphore try_wait/post pairs
//!
//! Run: `cargo bench --bench lock_contention`

use criterion::{criterion_group, criterion_main, Criterion};

use tokensync::guard::{Guarded, Primitive, ReadWrite};
use tokensync::sync::{NonRecursiveMutex, RwMutex, RwSpinLock, Semaphore};

fn raw_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("raw_uncontended");

    let spin = RwSpinLock::new();
    group.bench_function("spin_read", |b| {
        b.iter(|| {
            spin.rdlock();
            spin.rdunlock();
        });
    });
    group.bench_function("spin_write", |b| {
        b.iter(|| {
            spin.wrlock();
            spin.wrunlock();
        });
    });

    let blocking = RwMutex::new();
    group.bench_function("blocking_read", |b| {
        b.iter(|| {
            blocking.rdlock();
            blocking.rdunlock();
        });
    });
    group.bench_function("blocking_write", |b| {
        b.iter(|| {
            blocking.wrlock();
            blocking.wrunlock();
        });
    });

    let mutex = NonRecursiveMutex::new();
    group.bench_function("mutex", |b| {
        b.iter(|| {
            mutex.lock();
            mutex.unlock();
        });
    });

    group.finish();
}

fn tokens(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_uncontended");

    let spin_guarded: Guarded<u64, ReadWrite<RwSpinLock>> = Guarded::new(0);
    group.bench_function("spin_read_token", |b| {
        b.iter(|| *spin_guarded.read());
    });
    group.bench_function("spin_write_token", |b| {
        b.iter(|| {
            *spin_guarded.write() += 1;
        });
    });

    let mutex_guarded: Guarded<u64, Primitive<NonRecursiveMutex>> = Guarded::new(0);
    group.bench_function("mutex_write_token", |b| {
        b.iter(|| {
            *mutex_guarded.write() += 1;
        });
    });

    group.finish();
}

fn semaphore(c: &mut Criterion) {
    let mut group = c.benchmark_group("semaphore");

    let sem = Semaphore::new(1);
    group.bench_function("try_wait_post", |b| {
        b.iter(|| {
            assert!(sem.try_wait());
            sem.post(1);
        });
    });

    group.finish();
}

criterion_group!(benches, raw_locks, tokens, semaphore);
criterion_main!(benches);
