//! Synchronization primitives.
//!
//! The building blocks of the crate, usable on their own or through the
//! [`Guarded`](crate::guard::Guarded) wrapper:
//!
//! - [`NonRecursiveMutex`]: plain mutex with self-lock detection.
//! - [`RwMutex`]: condition-variable read/write mutex with writer
//!   priority and read-to-write promotion.
//! - [`RwSpinLock`]: the packed-state read/write spin/block hybrid with
//!   the same surface as [`RwMutex`].
//! - [`Semaphore`]: futex-based counting semaphore.
//! - [`MpscQueue`]: intrusive lock-free multi-producer single-consumer
//!   queue.
//!
//! The two read/write locks share one operation vocabulary (`rdlock`,
//! `rdunlock`, `wrlock`, `wrunlock`, `rd2wrlock`, `rd2wryield`,
//! `wr2rdlock`), so either can back the
//! [`ReadWrite`](crate::guard::ReadWrite) policy: pick the blocking one
//! for long critical sections, the spinning one for short, hot ones.

mod futex;
mod mpsc_queue;
mod mutex;
mod rwmutex;
mod semaphore;
mod spinlock;

pub use mpsc_queue::{MpscNode, MpscQueue};
pub use mutex::NonRecursiveMutex;
pub use rwmutex::RwMutex;
pub use semaphore::Semaphore;
pub use spinlock::RwSpinLock;
