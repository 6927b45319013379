//! Shared helpers for the crate's own tests.
//!
//! Provides the process-wide [`TestLogger`] that the `test_phase!`,
//! `test_complete!` and `assert_with_log!` macros write to. Integration
//! tests use the same entry points, so every test in the crate reports
//! failures the same way: assertion message first, full event log after.

use std::sync::OnceLock;

use crate::test_logging::TestLogger;

static GLOBAL_LOGGER: OnceLock<TestLogger> = OnceLock::new();

/// Initializes the process-wide test logger from `TEST_LOG_LEVEL`.
/// Idempotent; call at the top of every test.
pub fn init_test_logging() {
    let _ = GLOBAL_LOGGER.get_or_init(TestLogger::from_env);
}

/// The process-wide test logger.
///
/// # Panics
///
/// Panics if [`init_test_logging`] has not run yet.
#[must_use]
pub fn test_logger() -> &'static TestLogger {
    GLOBAL_LOGGER
        .get()
        .expect("call init_test_logging() before using the test logger")
}

/// Marks the beginning of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_utils::test_logger().log($crate::test_logging::TestEvent::Phase {
            name: ::std::string::String::from($name),
        });
    };
}

/// Marks the successful end of a named test phase.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_utils::test_logger().log($crate::test_logging::TestEvent::PhaseComplete {
            name: ::std::string::String::from($name),
        });
    };
}

/// Asserts a condition; on failure logs an error event with the expected
/// and actual values and panics with the full report.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            let logger = $crate::test_utils::test_logger();
            logger.error(
                "assert",
                format!(
                    "{}: expected {:?}, got {:?}",
                    $label, $expected, $actual
                ),
            );
            eprintln!("{}", logger.report());
            panic!(
                "assertion failed: {} (expected {:?}, got {:?})",
                $label, $expected, $actual
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_log_phases() {
        init_test_logging();
        crate::test_phase!("macro_check");
        crate::assert_with_log!(1 + 1 == 2, "arithmetic still works", 2, 1 + 1);
        crate::test_complete!("macro_check");
    }
}
