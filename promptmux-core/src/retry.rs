//! Retry backoff policy
//!
//! Bounded exponential backoff with jitter. The dispatcher owns the retry
//! loop; this type only decides whether another attempt is allowed and how
//! long to wait before it.

use crate::config::RetrySettings;
use rand::Rng;
use std::time::Duration;

/// Backoff schedule for transparent request retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Build the policy from settings
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Total attempts allowed, the first one included
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `failed_attempts` failures.
    ///
    /// Exponential with base 2, capped, with jitter sampled from the upper
    /// half of the window so concurrent retries spread out.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if full.is_zero() {
            return full;
        }
        let half = full / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}
