//! Injected time source
//!
//! All timestamps and age computations flow through [`Clock`] so that tests
//! can drive time deterministically. Timers (timeouts, backoff sleeps) still
//! use `tokio::time` directly, which pairs with [`SystemClock`] under
//! `tokio::time::pause`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source consumed by every component.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant
    fn now(&self) -> Instant;

    /// Milliseconds since the clock was created; used to stamp messages
    fn timestamp_ms(&self) -> u64;
}

/// Production clock backed by `tokio::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Create a clock anchored at the current instant
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timestamp_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Hand-cranked clock for unit tests that run outside a paused runtime.
pub struct ManualClock {
    epoch: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock frozen at its epoch
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    /// Advance the clock
    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn timestamp_ms(&self) -> u64 {
        self.offset_ms.load(Ordering::SeqCst)
    }
}
