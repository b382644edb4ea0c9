//! The `SessionManager` facade
//!
//! Everything transport layers consume. Built once at startup with explicit
//! dependencies (spawner, clock, sinks) and passed to collaborators by
//! parameter; no process-wide singletons.

use crate::broadcast::{BackpressurePolicy, SubscriberHandle};
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, ExecuteRequest};
use crate::events::{EventSink, TracingEventSink};
use crate::metrics::{MetricsSink, NullMetricsSink};
use crate::pool::{PoolStats, SessionPool};
use crate::session::CancelConfig;
use dashmap::DashMap;
use promptmux_engine::{
    Clock, Credentials, EngineError, EngineLauncher, ProcessSpawner, RequestId, SessionConfig,
    SessionId, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct CallerSession {
    config: Arc<SessionConfig>,
}

struct ManagerInner {
    registry: DashMap<SessionId, CallerSession>,
    pool: SessionPool,
    dispatcher: Dispatcher,
}

/// Facade over the pool, dispatcher and broadcast fabric.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Build a manager with explicit dependencies.
    pub fn new(
        settings: Settings,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        let cancel_cfg = CancelConfig {
            grace: settings.cancel.grace(),
            force: settings.cancel.force(),
            strategy: settings.cancel.strategy,
        };
        let pool = SessionPool::new(
            settings.pool.clone(),
            cancel_cfg,
            spawner,
            clock.clone(),
            events.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(settings, pool.clone(), clock, events, metrics);
        info!("session manager ready");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                registry: DashMap::new(),
                pool,
                dispatcher,
            }),
        })
    }

    /// Production wiring: real engine launcher, system clock, tracing events,
    /// no metrics.
    pub fn from_settings(
        settings: Settings,
        credentials: Arc<dyn Credentials>,
    ) -> Result<Self, EngineError> {
        let launcher = EngineLauncher::new(settings.engine.command.clone(), credentials)?
            .with_max_line_bytes(settings.stream.max_line_size);
        Self::new(
            settings,
            Arc::new(launcher),
            Arc::new(SystemClock::new()),
            Arc::new(TracingEventSink),
            Arc::new(NullMetricsSink),
        )
    }

    /// Register a caller-facing session. Validates the config; no engine
    /// process is spawned until the first `execute`.
    pub fn create(&self, config: SessionConfig) -> Result<SessionId, EngineError> {
        config.validate()?;
        let session_id = SessionId::new();
        self.inner.registry.insert(
            session_id,
            CallerSession {
                config: Arc::new(config),
            },
        );
        Ok(session_id)
    }

    /// Run one prompt on a session. Returns the request id and the primary
    /// message stream, terminated by exactly one of Complete, Error,
    /// Cancelled.
    pub fn execute(
        &self,
        session_id: SessionId,
        prompt: impl Into<String>,
        timeout: Duration,
    ) -> Result<(RequestId, SubscriberHandle), EngineError> {
        self.execute_as(session_id, prompt, timeout, None, None)
    }

    /// `execute` with a fairness bucket and an external cancellation parent.
    pub fn execute_as(
        &self,
        session_id: SessionId,
        prompt: impl Into<String>,
        timeout: Duration,
        user: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<(RequestId, SubscriberHandle), EngineError> {
        let config = self
            .inner
            .registry
            .get(&session_id)
            .map(|s| s.config.clone())
            .ok_or(EngineError::NotFound {
                what: "session",
                id: session_id.to_string(),
            })?;
        self.inner.dispatcher.execute(ExecuteRequest {
            session_id,
            config,
            prompt: prompt.into(),
            timeout,
            user,
            cancel,
        })
    }

    /// Cancel an in-flight request.
    pub fn cancel(&self, request_id: RequestId) -> Result<(), EngineError> {
        self.inner.dispatcher.cancel(request_id)
    }

    /// Attach an additional subscriber to an in-flight request; it receives
    /// the retained recent window, then the live stream.
    pub fn subscribe(
        &self,
        request_id: RequestId,
        policy: BackpressurePolicy,
        capacity: usize,
    ) -> Result<SubscriberHandle, EngineError> {
        self.inner.dispatcher.subscribe(request_id, policy, capacity)
    }

    /// Forget a caller-facing session. Pooled engine processes are reclaimed
    /// by the sweeper independently.
    pub fn close(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.inner
            .registry
            .remove(&session_id)
            .map(|_| ())
            .ok_or(EngineError::NotFound {
                what: "session",
                id: session_id.to_string(),
            })
    }

    /// Pool counters and sizes.
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Preallocate engine processes for a session's key.
    pub async fn warmup(&self, session_id: SessionId, n: usize) -> Result<usize, EngineError> {
        let config = self
            .inner
            .registry
            .get(&session_id)
            .map(|s| s.config.clone())
            .ok_or(EngineError::NotFound {
                what: "session",
                id: session_id.to_string(),
            })?;
        self.inner.pool.warmup(&config, n).await
    }

    /// Stop handing out sessions and tear down the idle pool.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }

    /// Requests currently between admission and terminal (diagnostics).
    pub fn active_requests(&self) -> usize {
        self.inner.dispatcher.active_requests()
    }

    /// Free global concurrency slots (diagnostics).
    pub fn available_permits(&self) -> usize {
        self.inner.dispatcher.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use promptmux_engine::MockSpawner;

    fn manager() -> SessionManager {
        let (spawner, _engines) = MockSpawner::pair();
        SessionManager::new(
            Settings::default(),
            spawner,
            Arc::new(SystemClock::new()),
            Arc::new(NullEventSink),
            Arc::new(NullMetricsSink),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_validates_config() {
        let mgr = manager();
        let bad = SessionConfig::builder().max_turns(0).build();
        assert!(matches!(
            mgr.create(bad),
            Err(EngineError::InvalidConfig { .. })
        ));
        assert!(mgr.create(SessionConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn execute_on_unknown_session_is_not_found() {
        let mgr = manager();
        let err = mgr
            .execute(SessionId::new(), "hello", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { what: "session", .. }));
    }

    #[tokio::test]
    async fn close_is_not_idempotent_by_contract() {
        let mgr = manager();
        let id = mgr.create(SessionConfig::default()).unwrap();
        assert!(mgr.close(id).is_ok());
        assert!(matches!(mgr.close(id), Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let (spawner, _engines) = MockSpawner::pair();
        let mut settings = Settings::default();
        settings.max_concurrent = 0;
        let err = SessionManager::new(
            settings,
            spawner,
            Arc::new(SystemClock::new()),
            Arc::new(NullEventSink),
            Arc::new(NullMetricsSink),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }
}
