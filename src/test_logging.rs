//! Structured test logging.
//!
//! Captures typed, timestamped events during tests so that a failing
//! concurrency test can dump an ordered account of what the primitives
//! did. The level is configurable through the `TEST_LOG_LEVEL`
//! environment variable (`error`, `warn`, `info`, `debug`, `trace`).
//!
//! # Example
//!
//! ```
//! use tokensync::test_logging::{TestEvent, TestLogLevel, TestLogger};
//!
//! let logger = TestLogger::new(TestLogLevel::Debug);
//! logger.log(TestEvent::Phase { name: "setup".into() });
//! logger.log(TestEvent::LockAcquired { lock: "rwlock", mode: "read" });
//! println!("{}", logger.report());
//! ```

use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Logging verbosity, least to most verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only failures.
    Error,
    /// Warnings and above.
    Warn,
    /// Test phases and completions.
    #[default]
    Info,
    /// Individual lock transitions.
    Debug,
    /// Everything, including per-iteration events.
    Trace,
}

impl TestLogLevel {
    /// Human-readable name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Reads the level from `TEST_LOG_LEVEL`, defaulting to `Info`.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

/// A typed event captured by the logger.
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// A named test phase began.
    Phase {
        /// Phase name.
        name: String,
    },
    /// A named test phase finished.
    PhaseComplete {
        /// Phase name.
        name: String,
    },
    /// A lock was acquired.
    LockAcquired {
        /// Which lock (static label chosen by the test).
        lock: &'static str,
        /// "read", "write", "converted", ...
        mode: &'static str,
    },
    /// A lock was released.
    LockReleased {
        /// Which lock.
        lock: &'static str,
    },
    /// A read-to-write promotion was refused.
    PromotionRefused {
        /// Which lock.
        lock: &'static str,
    },
    /// A worker thread started.
    ThreadSpawn {
        /// Test-assigned worker index.
        index: usize,
    },
    /// A worker thread finished.
    ThreadComplete {
        /// Test-assigned worker index.
        index: usize,
    },
    /// Free-form progress message.
    Custom {
        /// Category for filtering.
        category: &'static str,
        /// Message text.
        message: String,
    },
    /// A failed expectation (captured before panicking).
    Error {
        /// Category for filtering.
        category: &'static str,
        /// Message text.
        message: String,
    },
    /// Something suspicious but not fatal.
    Warn {
        /// Category for filtering.
        category: &'static str,
        /// Message text.
        message: String,
    },
}

impl TestEvent {
    /// Minimum level at which the event is kept.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        match self {
            Self::Error { .. } => TestLogLevel::Error,
            Self::Warn { .. } => TestLogLevel::Warn,
            Self::Phase { .. } | Self::PhaseComplete { .. } => TestLogLevel::Info,
            Self::PromotionRefused { .. }
            | Self::ThreadSpawn { .. }
            | Self::ThreadComplete { .. }
            | Self::Custom { .. } => TestLogLevel::Debug,
            Self::LockAcquired { .. } | Self::LockReleased { .. } => TestLogLevel::Trace,
        }
    }

    /// Short category for the report's statistics block.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Phase { .. } | Self::PhaseComplete { .. } => "phase",
            Self::LockAcquired { .. } | Self::LockReleased { .. } => "lock",
            Self::PromotionRefused { .. } => "promotion",
            Self::ThreadSpawn { .. } | Self::ThreadComplete { .. } => "thread",
            Self::Custom { category, .. }
            | Self::Error { category, .. }
            | Self::Warn { category, .. } => category,
        }
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phase { name } => write!(f, "phase: {name}"),
            Self::PhaseComplete { name } => write!(f, "phase complete: {name}"),
            Self::LockAcquired { lock, mode } => write!(f, "lock acquired: {lock} ({mode})"),
            Self::LockReleased { lock } => write!(f, "lock released: {lock}"),
            Self::PromotionRefused { lock } => write!(f, "promotion refused: {lock}"),
            Self::ThreadSpawn { index } => write!(f, "thread spawn: worker={index}"),
            Self::ThreadComplete { index } => write!(f, "thread complete: worker={index}"),
            Self::Custom { category, message } => write!(f, "[{category}] {message}"),
            Self::Error { category, message } => write!(f, "ERROR [{category}] {message}"),
            Self::Warn { category, message } => write!(f, "WARN [{category}] {message}"),
        }
    }
}

/// A timestamped event record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Time since logger creation.
    pub elapsed: Duration,
    /// The captured event.
    pub event: TestEvent,
}

/// Captures typed events with timestamps and renders reports.
#[derive(Debug)]
pub struct TestLogger {
    level: TestLogLevel,
    events: Mutex<Vec<LogRecord>>,
    start: Instant,
    verbose: bool,
}

impl Default for TestLogger {
    fn default() -> Self {
        Self::new(TestLogLevel::Info)
    }
}

impl TestLogger {
    /// Creates a logger capturing events at `level` and below.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            events: Mutex::new(Vec::new()),
            start: Instant::now(),
            verbose: level >= TestLogLevel::Trace,
        }
    }

    /// Creates a logger from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(TestLogLevel::from_env())
    }

    /// The configured level.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        self.level
    }

    /// Captures `event` if it meets the configured level.
    pub fn log(&self, event: TestEvent) {
        let event_level = event.level();
        if event_level > self.level {
            return;
        }
        let elapsed = self.start.elapsed();
        if self.verbose {
            eprintln!(
                "[{:>10.3}ms] [{:>5}] {}",
                elapsed.as_secs_f64() * 1000.0,
                event_level.name(),
                &event
            );
        }
        self.events
            .lock()
            .expect("logger mutex poisoned")
            .push(LogRecord { elapsed, event });
    }

    /// Captures a free-form progress message.
    pub fn custom(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Custom {
            category,
            message: message.into(),
        });
    }

    /// Captures a failed expectation.
    pub fn error(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Error {
            category,
            message: message.into(),
        });
    }

    /// Number of captured events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().expect("logger mutex poisoned").len()
    }

    /// Snapshot of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<LogRecord> {
        self.events.lock().expect("logger mutex poisoned").clone()
    }

    /// Renders every captured event plus per-category statistics.
    #[must_use]
    pub fn report(&self) -> String {
        let events = self.events.lock().expect("logger mutex poisoned");
        let mut report = String::new();

        let _ = writeln!(report, "=== Test Event Log ({} events) ===", events.len());
        for record in events.iter() {
            let _ = writeln!(
                report,
                "[{:>10.3}ms] [{:>5}] {:>9} | {}",
                record.elapsed.as_secs_f64() * 1000.0,
                record.event.level().name(),
                record.event.category(),
                record.event
            );
        }

        let _ = writeln!(report);
        let _ = writeln!(report, "=== Statistics ===");
        let mut categories: Vec<&'static str> =
            events.iter().map(|r| r.event.category()).collect();
        categories.sort_unstable();
        categories.dedup();
        for category in categories {
            let count = events
                .iter()
                .filter(|r| r.event.category() == category)
                .count();
            let _ = writeln!(report, "{category}: {count}");
        }
        if let Some(last) = events.last() {
            let _ = writeln!(report, "Total duration: {:?}", last.elapsed);
        }
        report
    }

    /// Asserts that no error events were captured.
    ///
    /// # Panics
    ///
    /// Panics with the full report if any error event was logged.
    pub fn assert_no_errors(&self) {
        let errors: Vec<String> = {
            let events = self.events.lock().expect("logger mutex poisoned");
            events
                .iter()
                .filter(|r| matches!(r.event, TestEvent::Error { .. }))
                .map(|r| format!("  - {}", r.event))
                .collect()
        };
        assert!(
            errors.is_empty(),
            "test logged {} errors:\n{}\n\nFull log:\n{}",
            errors.len(),
            errors.join("\n"),
            self.report()
        );
    }

    /// Discards all captured events.
    pub fn clear(&self) {
        self.events.lock().expect("logger mutex poisoned").clear();
    }
}
