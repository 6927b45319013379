//! Optional tracing shim.
//!
//! With the `tracing` feature enabled this re-exports the real `tracing`
//! macros; without it the macros expand to nothing, so slow-path
//! instrumentation costs nothing in the default build. Import sites always
//! go through `crate::tracing_compat` so the feature toggle is invisible to
//! the rest of the crate.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! trace {
        ($($args:tt)*) => {{}};
    }
    macro_rules! debug {
        ($($args:tt)*) => {{}};
    }
    pub(crate) use {debug, trace};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, trace};
