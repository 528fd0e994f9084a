//! Tracker configuration
//!
//! The tracker has a single tuning knob: the initial capacity of each
//! session's interning table. It can be set in code, from the
//! `CALLTRACK_INTERN_CAPACITY` environment variable, or with the CLI's
//! `--intern-capacity` flag.

use thiserror::Error;

use crate::interning;

/// Environment variable read by [`TrackerConfig::from_env`].
pub const INTERN_CAPACITY_ENV: &str = "CALLTRACK_INTERN_CAPACITY";

/// Largest accepted initial interning-table capacity (2^30 index slots).
///
/// The table is allocated eagerly when a session starts, so a larger request
/// would abort the process instead of failing as a configuration error.
pub const MAX_INTERN_CAPACITY: usize = 1 << 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {INTERN_CAPACITY_ENV} value {value:?}: expected a non-negative integer")]
    InvalidInternCapacity { value: String },

    #[error("intern capacity {value} exceeds the maximum of {max}")]
    InternCapacityTooLarge { value: usize, max: usize },
}

/// Configuration applied to every session a tracker starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Initial interning-table capacity; 0 selects the default
    intern_capacity: usize,
}

impl TrackerConfig {
    /// Build a configuration, rejecting capacities above [`MAX_INTERN_CAPACITY`].
    pub fn new(intern_capacity: usize) -> Result<Self, ConfigError> {
        if intern_capacity > MAX_INTERN_CAPACITY {
            return Err(ConfigError::InternCapacityTooLarge {
                value: intern_capacity,
                max: MAX_INTERN_CAPACITY,
            });
        }
        Ok(Self { intern_capacity })
    }

    /// Requested initial interning-table capacity; 0 selects the default.
    pub fn intern_capacity(&self) -> usize {
        self.intern_capacity
    }

    /// Read the configuration from the environment.
    ///
    /// An unset variable yields the default configuration. A set but
    /// unparsable value is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(INTERN_CAPACITY_ENV) {
            Ok(value) => {
                let intern_capacity = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidInternCapacity { value: value.clone() })?;
                Self::new(intern_capacity)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Index capacity the interning table will actually start with.
    pub fn effective_intern_capacity(&self) -> usize {
        if self.intern_capacity == 0 {
            interning::DEFAULT_CAPACITY
        } else {
            self.intern_capacity.next_power_of_two()
        }
    }
}
