//! Retry backoff: decides how long a failed job waits.

use std::time::Duration;

use crate::error::{Result, SpindleError};

/// Exponential backoff with an integer base.
///
/// delay = base^attempts seconds, where `attempts` is the post-failure count:
///
/// Example with base=2:
/// - first failure (attempts=1): 2s
/// - attempts=2: 4s
/// - attempts=3: 8s
///
/// Uncapped; saturates at `u64::MAX` instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: u32,
}

impl Backoff {
    pub const DEFAULT_BASE: u32 = 2;

    pub fn new(base: u32) -> Result<Self> {
        if base < 1 {
            return Err(SpindleError::Validation(format!(
                "backoff_base must be >= 1, got {base}"
            )));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn delay_secs(&self, attempts: u32) -> u64 {
        u64::from(self.base).saturating_pow(attempts)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_secs(self.delay_secs(attempts))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Self::DEFAULT_BASE,
        }
    }
}
