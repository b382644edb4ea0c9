//! # promptmux-core
//!
//! Session-oriented process supervisor and streaming fabric over
//! [`promptmux_engine`]: a bounded, compatibility-keyed session pool, an
//! admission-controlling dispatcher with retry and per-key circuit breaking,
//! and per-request fan-out with independent subscriber backpressure.
//!
//! Transport layers (HTTP, WebSocket, CLI) consume the [`SessionManager`]
//! facade:
//!
//! ```rust,no_run
//! use promptmux_core::{SessionManager, Settings};
//! use promptmux_engine::{EnvCredentials, SessionConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), promptmux_engine::EngineError> {
//! let manager = SessionManager::from_settings(Settings::default(), Arc::new(EnvCredentials))?;
//! let session = manager.create(
//!     SessionConfig::builder()
//!         .working_dir("/workspace")
//!         .max_turns(3)
//!         .allow_tool("Read")
//!         .build(),
//! )?;
//! let (_request, mut stream) = manager.execute(session, "hello", Duration::from_secs(30))?;
//! while let Some(message) = stream.recv().await {
//!     println!("{message:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod session;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use broadcast::{BackpressurePolicy, Broadcaster, SubscriberHandle};
pub use config::{
    BreakerSettings, CancelSettings, EngineSettings, FairnessSettings, PoolSettings,
    RetrySettings, Settings, StreamSettings,
};
pub use dispatcher::{Dispatcher, ExecuteRequest};
pub use events::{CloseReason, EventSink, LifecycleEvent, MemoryEventSink, NullEventSink, TracingEventSink};
pub use manager::SessionManager;
pub use metrics::{
    Counter, Gauge, Histogram, MemoryMetricsSink, MetricsSink, NullMetricsSink,
};
pub use pool::{PoolStats, SessionLease, SessionPool};
pub use retry::RetryPolicy;
pub use session::{CancelConfig, CancelStrategy, Session, SessionState};

// The engine layer is part of the public surface.
pub use promptmux_engine as engine;
