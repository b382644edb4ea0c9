//! Lifecycle event stream for external auditors
//!
//! The core emits an append-only sequence of [`LifecycleEvent`]s through an
//! injected [`EventSink`]. Durability is the sink's problem.

use parking_lot::Mutex;
use promptmux_engine::{ErrorKind, RequestId, SessionId};
use serde::Serialize;
use tracing::{error, info};

/// Why a pooled session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Evicted after sitting idle past `max_idle`
    IdleTimeout,
    /// Evicted after living past `max_lifetime`
    LifetimeExpired,
    /// Served `max_reuse` requests
    WornOut,
    /// The engine process exited on its own
    ProcessExited,
    /// A request failed in a way that poisons the process
    Error,
    /// Explicitly invalidated
    Invalidated,
    /// The pool is shutting down
    Shutdown,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SessionCreated {
        session_id: SessionId,
        key: String,
    },
    SessionReused {
        session_id: SessionId,
        key: String,
        reuse_count: u32,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    RequestStarted {
        request_id: RequestId,
        session_id: SessionId,
    },
    RequestCompleted {
        request_id: RequestId,
        duration_ms: u64,
    },
    RequestFailed {
        request_id: RequestId,
        kind: ErrorKind,
    },
    CircuitOpened {
        key: String,
    },
    CircuitClosed {
        key: String,
    },
}

/// Consumer of the lifecycle stream.
pub trait EventSink: Send + Sync {
    /// Record one event. Must not block.
    fn emit(&self, event: LifecycleEvent);
}

/// Emits events as structured tracing records.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::RequestFailed { request_id, kind } => {
                error!(target: "promptmux::events", %request_id, %kind, "request failed");
            },
            other => {
                info!(target: "promptmux::events", event = ?other);
            },
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Buffers events in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEventSink {
    /// Copy of everything emitted so far
    pub fn snapshot(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Count of events matching a predicate
    pub fn count(&self, pred: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryEventSink::default();
        sink.emit(LifecycleEvent::CircuitOpened { key: "k".into() });
        sink.emit(LifecycleEvent::CircuitClosed { key: "k".into() });
        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LifecycleEvent::CircuitOpened { .. }));
        assert!(matches!(events[1], LifecycleEvent::CircuitClosed { .. }));
    }

    #[test]
    fn events_serialize_with_discriminant() {
        let v = serde_json::to_value(LifecycleEvent::SessionClosed {
            session_id: SessionId::new(),
            reason: CloseReason::IdleTimeout,
        })
        .unwrap();
        assert_eq!(v["event"], "session_closed");
        assert_eq!(v["reason"], "idle_timeout");
    }
}
