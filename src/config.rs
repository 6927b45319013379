//! Environment-driven configuration.
//!
//! The primitives themselves have no tunables; the only configurable part
//! of the crate is pointer-storage sizing. Values come from defaults
//! overridden by environment variables, and invalid values fall back to the
//! default rather than failing.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `TOKENSYNC_STORAGE_INITIAL_CAPACITY` | slots reserved at construction | 8 |
//! | `TOKENSYNC_STORAGE_GROW_FACTOR` | capacity multiplier on exhaustion | 1.414 |

use std::env;

/// Sizing parameters for [`PointerStorage`](crate::storage::PointerStorage).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageConfig {
    /// Number of slots reserved when the storage is created.
    pub initial_capacity: u32,
    /// Capacity multiplier applied when the free-index pool runs dry.
    /// Values at or below 1.0 are rejected by [`StorageConfig::validated`].
    pub grow_factor: f32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 8,
            grow_factor: 1.414,
        }
    }
}

impl StorageConfig {
    /// Builds a config from the environment, falling back to defaults for
    /// missing or unparseable variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_capacity: parse_env(
                "TOKENSYNC_STORAGE_INITIAL_CAPACITY",
                defaults.initial_capacity,
            ),
            grow_factor: parse_env("TOKENSYNC_STORAGE_GROW_FACTOR", defaults.grow_factor),
        }
        .validated()
    }

    /// Clamps nonsensical values back to the defaults.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.initial_capacity == 0 {
            self.initial_capacity = defaults.initial_capacity;
        }
        if !(self.grow_factor > 1.0) || !self.grow_factor.is_finite() {
            self.grow_factor = defaults.grow_factor;
        }
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
