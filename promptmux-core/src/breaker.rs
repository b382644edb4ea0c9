//! Per-key circuit breaking
//!
//! One [`CircuitBreaker`] per compatibility key. Consecutive engine failures
//! trip it open; after the open window it half-opens and admits exactly one
//! probe. The probe's outcome decides between closing and re-opening.

use dashmap::DashMap;
use parking_lot::Mutex;
use promptmux_engine::{CompatibilityKey, EngineError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Healthy; counts consecutive failures
    Closed {
        /// Consecutive engine failures so far
        failures: u32,
    },
    /// Failing fast until the deadline
    Open {
        /// When the breaker may half-open
        until: Instant,
    },
    /// Admitting a single probe request
    HalfOpen {
        /// Whether the probe slot is taken
        probe_in_flight: bool,
    },
}

/// Per-key circuit breaker.
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_duration,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Current state (testing and diagnostics)
    pub fn state(&self) -> BreakerState {
        *self.state.lock()
    }

    /// Admission check. An expired `Open` transitions to `HalfOpen` and hands
    /// the caller the probe slot; the returned pass must be resolved with
    /// [`BreakerPass::success`], [`BreakerPass::failure`] or
    /// [`BreakerPass::skip`].
    pub fn try_acquire(self: &Arc<Self>, now: Instant) -> Result<BreakerPass, EngineError> {
        let mut st = self.state.lock();
        match *st {
            BreakerState::Closed { .. } => Ok(BreakerPass::new(self.clone(), false)),
            BreakerState::Open { until } if now >= until => {
                debug!("breaker half-opens, admitting probe");
                *st = BreakerState::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(BreakerPass::new(self.clone(), true))
            },
            BreakerState::Open { until } => Err(EngineError::CircuitOpen {
                retry_after_ms: until.saturating_duration_since(now).as_millis() as u64,
            }),
            BreakerState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    // Only one probe at a time.
                    Err(EngineError::CircuitOpen { retry_after_ms: 0 })
                } else {
                    *st = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Ok(BreakerPass::new(self.clone(), true))
                }
            },
        }
    }
}

/// Outcome slot for one admitted request.
///
/// Dropping an unresolved probe pass frees the probe slot so a crashed driver
/// cannot wedge the breaker half-open forever.
pub struct BreakerPass {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl BreakerPass {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this pass holds the half-open probe slot
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record success. Returns `true` when this closed a previously tripped
    /// breaker (emit `CircuitClosed`).
    pub fn success(mut self) -> bool {
        self.resolved = true;
        let mut st = self.breaker.state.lock();
        let recovered = !matches!(*st, BreakerState::Closed { .. });
        *st = BreakerState::Closed { failures: 0 };
        recovered
    }

    /// Record an engine failure. Returns `true` when this tripped the breaker
    /// open (emit `CircuitOpened`).
    pub fn failure(mut self, now: Instant) -> bool {
        self.resolved = true;
        let mut st = self.breaker.state.lock();
        match *st {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.breaker.threshold {
                    warn!("breaker tripped after {failures} consecutive failures");
                    *st = BreakerState::Open {
                        until: now + self.breaker.open_duration,
                    };
                    true
                } else {
                    *st = BreakerState::Closed { failures };
                    false
                }
            },
            BreakerState::HalfOpen { .. } => {
                warn!("probe failed, breaker re-opens");
                *st = BreakerState::Open {
                    until: now + self.breaker.open_duration,
                };
                true
            },
            BreakerState::Open { .. } => false,
        }
    }

    /// Resolve without counting either way (cancellations, admission noise).
    pub fn skip(mut self) {
        self.resolved = true;
        self.release_probe();
    }

    fn release_probe(&self) {
        if !self.probe {
            return;
        }
        let mut st = self.breaker.state.lock();
        if let BreakerState::HalfOpen { probe_in_flight: true } = *st {
            *st = BreakerState::HalfOpen {
                probe_in_flight: false,
            };
        }
    }
}

impl Drop for BreakerPass {
    fn drop(&mut self) {
        if !self.resolved {
            self.release_probe();
        }
    }
}

/// All breakers, one per compatibility key.
pub struct BreakerRegistry {
    threshold: u32,
    open_duration: Duration,
    breakers: DashMap<CompatibilityKey, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry with shared parameters
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold,
            open_duration,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a key, created on first use
    pub fn for_key(&self, key: CompatibilityKey) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.threshold, self.open_duration)))
            .clone()
    }
}
