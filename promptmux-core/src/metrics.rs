//! Metrics surface
//!
//! Named counters, gauges and histograms the core reports through an injected
//! [`MetricsSink`]. Exporting is an external concern.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Monotonic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    SessionsCreatedTotal,
    SessionsReusedTotal,
    SessionsDestroyedTotal,
    RequestsTotal,
    RequestsFailedTotal,
    CircuitOpenTotal,
    MessagesDroppedTotal,
}

impl Counter {
    /// Exported metric name
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionsCreatedTotal => "sessions_created_total",
            Self::SessionsReusedTotal => "sessions_reused_total",
            Self::SessionsDestroyedTotal => "sessions_destroyed_total",
            Self::RequestsTotal => "requests_total",
            Self::RequestsFailedTotal => "requests_failed_total",
            Self::CircuitOpenTotal => "circuit_open_total",
            Self::MessagesDroppedTotal => "messages_dropped_total",
        }
    }
}

/// Instantaneous values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    SessionsActive,
}

impl Gauge {
    /// Exported metric name
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionsActive => "sessions_active",
        }
    }
}

/// Latency distributions, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Histogram {
    RequestLatencySeconds,
    AcquireLatencySeconds,
}

impl Histogram {
    /// Exported metric name
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestLatencySeconds => "request_latency_seconds",
            Self::AcquireLatencySeconds => "acquire_latency_seconds",
        }
    }
}

/// Consumer of metric updates. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter, by: u64);
    fn gauge(&self, gauge: Gauge, value: i64);
    fn observe(&self, histogram: Histogram, value: f64);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn incr(&self, _counter: Counter, _by: u64) {}
    fn gauge(&self, _gauge: Gauge, _value: i64) {}
    fn observe(&self, _histogram: Histogram, _value: f64) {}
}

/// Aggregates in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    counters: Mutex<HashMap<Counter, u64>>,
    gauges: Mutex<HashMap<Gauge, i64>>,
    histograms: Mutex<HashMap<Histogram, Vec<f64>>>,
}

impl MemoryMetricsSink {
    /// Current value of a counter
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.lock().get(&counter).copied().unwrap_or(0)
    }

    /// Last value of a gauge
    pub fn gauge_value(&self, gauge: Gauge) -> i64 {
        self.gauges.lock().get(&gauge).copied().unwrap_or(0)
    }

    /// Observations recorded for a histogram
    pub fn observations(&self, histogram: Histogram) -> Vec<f64> {
        self.histograms
            .lock()
            .get(&histogram)
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn incr(&self, counter: Counter, by: u64) {
        *self.counters.lock().entry(counter).or_insert(0) += by;
    }

    fn gauge(&self, gauge: Gauge, value: i64) {
        self.gauges.lock().insert(gauge, value);
    }

    fn observe(&self, histogram: Histogram, value: f64) {
        self.histograms.lock().entry(histogram).or_default().push(value);
    }
}
