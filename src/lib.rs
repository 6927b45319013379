//! Thread-synchronization primitives with a token-based access
//! discipline.
//!
//! The centerpiece is a fair, priority-aware read/write lock family and
//! a wrapper type that makes unsynchronized access to guarded data a
//! compile error:
//!
//! | Piece | What it is |
//! |---|---|
//! | [`sync::RwSpinLock`] | Read/write spin/block hybrid; four counters packed into one 64-bit atomic |
//! | [`sync::RwMutex`] | Condition-variable read/write mutex with the same surface |
//! | [`sync::NonRecursiveMutex`] | Plain mutex with self-lock detection |
//! | [`sync::Semaphore`] | Futex-based counting semaphore |
//! | [`sync::MpscQueue`] | Intrusive lock-free multi-producer/single-consumer queue |
//! | [`guard::Guarded`] | Binds a value to a locking policy; access only through tokens |
//! | [`storage::PointerStorage`] | Concurrent pointer set with O(1) insert/erase |
//! | [`track::ObjectTracker`] | Heap-stable back-reference to movable guarded data |
//!
//! # Access tokens in one example
//!
//! ```
//! use tokensync::guard::{Guarded, ReadWrite};
//! use tokensync::sync::RwSpinLock;
//!
//! struct Account { balance: i64 }
//!
//! let account: Guarded<Account, ReadWrite<RwSpinLock>> =
//!     Guarded::new(Account { balance: 100 });
//!
//! // Concurrent readers:
//! let token = account.read();
//! assert_eq!(token.balance, 100);
//! drop(token);
//!
//! // Exclusive writer:
//! account.write().balance += 1;
//!
//! // A reader that turns out to need to write promotes in place; if
//! // another thread is already promoting, the attempt reports
//! // DeadlockAvoided instead of deadlocking and the caller retries:
//! let token = account.read();
//! match token.try_promote() {
//!     Ok(mut write) => write.balance += 1,
//!     Err((token, _refused)) => {
//!         drop(token);
//!         account.promote_yield();
//!         // ... retry the whole transaction ...
//!     }
//! };
//! ```
//!
//! # Fairness
//!
//! Both read/write locks prefer writers: once a writer waits, new
//! readers hold off, so write-heavy phases cannot be starved by a steady
//! stream of readers. Read-to-write conversion is first-come
//! first-served with at most one pending conversion; the loser of a
//! conversion race gets a recoverable error and a documented retry
//! protocol rather than a deadlock.
//!
//! All waits are indefinite; there are no timeouts. `try_`-variants
//! exist where polling makes sense.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod config;
pub mod error;
pub mod guard;
pub mod storage;
pub mod sync;
pub mod test_logging;
pub mod test_utils;
pub mod track;
pub mod util;

pub(crate) mod tracing_compat;

pub use error::DeadlockAvoided;
