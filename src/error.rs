//! Error types for tokensync.
//!
//! The crate has exactly one recoverable error: a refused read-to-write
//! promotion. Every other failure mode (recursive self-lock, destroying a
//! guarded value with live tokens, semaphore token overflow, wrong-thread
//! access under the single-thread policy) is a programming bug and asserts
//! in debug builds rather than surfacing as a `Result`.

use thiserror::Error;

/// Returned by read-to-write promotion when another thread already holds a
/// pending conversion.
///
/// Two threads that both hold read locks and both want to upgrade would
/// deadlock: each waits for the other to release its read lock. The lock
/// detects this and refuses the second conversion instead. The caller must
/// release its read lock, call the lock's promotion-yield operation to wait
/// for the winning converter to finish, and then retry its whole
/// transaction from the top (the data may have changed in between).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("read-to-write promotion refused: another thread is already converting")]
pub struct DeadlockAvoided;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_avoided_display() {
        let err = DeadlockAvoided;
        assert!(err.to_string().contains("promotion refused"));
        let copied = err;
        assert_eq!(copied, DeadlockAvoided);
    }
}
