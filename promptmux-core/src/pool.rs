//! Bounded session pool keyed by compatibility
//!
//! Idle sessions are reused most-recently-used first (warm caches); new ones
//! are created up to the global and per-key caps; everyone else waits on the
//! pool's condition until a slot frees or the acquire timeout fires. A
//! periodic sweeper evicts idle and over-age sessions. The pool mutex is only
//! ever held for O(1) bookkeeping; spawning and teardown happen outside it.

use crate::config::PoolSettings;
use crate::events::{CloseReason, EventSink, LifecycleEvent};
use crate::metrics::{Counter, Gauge, Histogram, MetricsSink};
use crate::session::{CancelConfig, Session, SessionState};
use parking_lot::Mutex;
use promptmux_engine::{
    Clock, CloseMode, CompatibilityKey, EngineError, ProcessSpawner, SessionConfig, SessionId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pool counters and sizes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Sessions spawned over the pool's lifetime
    pub created: u64,
    /// Checkouts served from an idle session
    pub reused: u64,
    /// Sessions destroyed over the pool's lifetime
    pub destroyed: u64,
    /// Live sessions (idle + checked out)
    pub size: usize,
    /// Currently idle sessions
    pub idle: usize,
    /// Currently leased sessions
    pub checked_out: usize,
    /// Live sessions per compatibility key
    pub per_key: HashMap<String, usize>,
}

struct PoolState {
    idle: Vec<Arc<Session>>,
    /// Idle + leased + reserved-for-spawn
    total: usize,
    per_key: HashMap<CompatibilityKey, usize>,
    created: u64,
    reused: u64,
    destroyed: u64,
    closed: bool,
}

struct PoolInner {
    settings: PoolSettings,
    cancel_cfg: CancelConfig,
    spawner: Arc<dyn ProcessSpawner>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<PoolState>,
    available: Notify,
}

/// Capacity reservation taken under the pool lock before the (slow, unlocked)
/// spawn. Un-reserves itself if the spawn fails or the acquire future is
/// dropped mid-flight.
struct Reservation {
    inner: Arc<PoolInner>,
    key: CompatibilityKey,
    armed: bool,
}

impl Reservation {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        release_slot(&self.inner, self.key);
        self.inner.available.notify_one();
    }
}

fn release_slot(inner: &PoolInner, key: CompatibilityKey) {
    let mut st = inner.state.lock();
    st.total = st.total.saturating_sub(1);
    if let Some(count) = st.per_key.get_mut(&key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            st.per_key.remove(&key);
        }
    }
}

enum AcquireStep {
    Reused(Arc<Session>),
    Create(Reservation),
    /// A victim was scavenged; capacity frees once it is destroyed
    Retry,
    Wait,
}

/// The bounded collection of reusable sessions.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Build a pool and start its sweeper.
    pub fn new(
        settings: PoolSettings,
        cancel_cfg: CancelConfig,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            settings,
            cancel_cfg,
            spawner,
            clock,
            events,
            metrics,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                per_key: HashMap::new(),
                created: 0,
                reused: 0,
                destroyed: 0,
                closed: false,
            }),
            available: Notify::new(),
        });
        spawn_sweeper(&inner);
        Self { inner }
    }

    /// Check a session out for the given config, waiting up to `timeout` when
    /// the pool is at capacity. `timeout` of zero fails immediately when no
    /// slot is free.
    pub async fn acquire(
        &self,
        config: &Arc<SessionConfig>,
        timeout: Duration,
    ) -> Result<SessionLease, EngineError> {
        let key = config.key();
        let start = self.inner.clock.now();
        let deadline = start + timeout;

        loop {
            let mut expired: Vec<(Arc<Session>, CloseReason)> = Vec::new();
            let step = {
                let mut st = self.inner.state.lock();
                if st.closed {
                    return Err(EngineError::internal("session pool is shut down"));
                }

                // Cull unusable idle sessions of this key while scanning.
                let now = self.inner.clock.now();
                let mut i = 0;
                while i < st.idle.len() {
                    if st.idle[i].key() == key && !self.is_reusable(&st.idle[i], now) {
                        let session = st.idle.swap_remove(i);
                        let reason = self.stale_reason(&session, now);
                        expired.push((session, reason));
                    } else {
                        i += 1;
                    }
                }

                // Most-recently-used healthy match keeps caches warm.
                let best = st
                    .idle
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.key() == key)
                    .max_by_key(|(_, s)| s.last_used())
                    .map(|(i, _)| i);

                if let Some(i) = best {
                    let session = st.idle.swap_remove(i);
                    st.reused += 1;
                    AcquireStep::Reused(session)
                } else {
                    let per_key = st.per_key.get(&key).copied().unwrap_or(0);
                    if per_key >= self.settings().max_per_key {
                        AcquireStep::Wait
                    } else if st.total < self.settings().max_size {
                        st.total += 1;
                        *st.per_key.entry(key).or_insert(0) += 1;
                        AcquireStep::Create(Reservation {
                            inner: self.inner.clone(),
                            key,
                            armed: true,
                        })
                    } else if let Some(victim) = {
                        // At capacity with no compatible idle session: scavenge
                        // the least-recently-used idle victim of another key
                        // rather than stalling until the sweeper runs.
                        let lru = st
                            .idle
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, s)| s.last_used())
                            .map(|(i, _)| i);
                        lru.map(|i| st.idle.swap_remove(i))
                    } {
                        expired.push((victim, CloseReason::Invalidated));
                        AcquireStep::Retry
                    } else {
                        AcquireStep::Wait
                    }
                }
            };

            for (session, reason) in expired {
                destroy(&self.inner, session, reason).await;
            }

            match step {
                AcquireStep::Reused(session) => {
                    let reuse_count = session.mark_reused();
                    debug!(session_id = %session.id(), reuse_count, "reusing pooled session");
                    self.inner.events.emit(LifecycleEvent::SessionReused {
                        session_id: session.id(),
                        key: key.to_string(),
                        reuse_count,
                    });
                    self.inner.metrics.incr(Counter::SessionsReusedTotal, 1);
                    self.observe_acquire(start);
                    return Ok(self.lease(session));
                },
                AcquireStep::Create(reservation) => {
                    match self.create_session(config).await {
                        Ok(session) => {
                            reservation.defuse();
                            self.note_created(&session);
                            self.observe_acquire(start);
                            return Ok(self.lease(session));
                        },
                        Err(e) => {
                            // Reservation drop releases the slot.
                            warn!("failed to spawn pooled session: {e}");
                            return Err(e);
                        },
                    }
                },
                AcquireStep::Retry => {},
                AcquireStep::Wait => {
                    let now = self.inner.clock.now();
                    let remaining = deadline.saturating_duration_since(now);
                    if remaining.is_zero() {
                        return Err(EngineError::PoolExhausted);
                    }
                    let notified = self.inner.available.notified();
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return Err(EngineError::PoolExhausted);
                    }
                },
            }
        }
    }

    /// Preallocate up to `n` idle sessions for the config's key, bounded by
    /// the pool caps. Returns how many were actually created.
    pub async fn warmup(
        &self,
        config: &Arc<SessionConfig>,
        n: usize,
    ) -> Result<usize, EngineError> {
        let key = config.key();
        let mut added = 0;
        for _ in 0..n {
            let reservation = {
                let mut st = self.inner.state.lock();
                if st.closed {
                    break;
                }
                let per_key = st.per_key.get(&key).copied().unwrap_or(0);
                if st.total >= self.settings().max_size || per_key >= self.settings().max_per_key {
                    break;
                }
                st.total += 1;
                *st.per_key.entry(key).or_insert(0) += 1;
                Reservation {
                    inner: self.inner.clone(),
                    key,
                    armed: true,
                }
            };
            let session = self.create_session(config).await?;
            reservation.defuse();
            self.note_created(&session);
            self.inner.state.lock().idle.push(session);
            self.inner.available.notify_one();
            added += 1;
        }
        if added > 0 {
            info!(added, key = %key, "pool warmed up");
        }
        Ok(added)
    }

    /// Force-destroy an idle session irrespective of its health. Returns
    /// `false` when the session is not currently idle in the pool.
    pub async fn invalidate(&self, session_id: SessionId) -> bool {
        let session = {
            let mut st = self.inner.state.lock();
            let Some(i) = st.idle.iter().position(|s| s.id() == session_id) else {
                return false;
            };
            st.idle.swap_remove(i)
        };
        destroy(&self.inner, session, CloseReason::Invalidated).await;
        true
    }

    /// Current counters and sizes.
    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock();
        PoolStats {
            created: st.created,
            reused: st.reused,
            destroyed: st.destroyed,
            size: st.total,
            idle: st.idle.len(),
            checked_out: st.total - st.idle.len(),
            per_key: st
                .per_key
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    /// Stop handing out sessions and tear the idle set down.
    pub async fn shutdown(&self) {
        let drained = {
            let mut st = self.inner.state.lock();
            st.closed = true;
            std::mem::take(&mut st.idle)
        };
        for session in drained {
            destroy(&self.inner, session, CloseReason::Shutdown).await;
        }
        self.inner.available.notify_waiters();
    }

    fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    fn lease(&self, session: Arc<Session>) -> SessionLease {
        SessionLease {
            session: Some(session),
            inner: self.inner.clone(),
        }
    }

    fn observe_acquire(&self, start: Instant) {
        let elapsed = self.inner.clock.now().saturating_duration_since(start);
        self.inner
            .metrics
            .observe(Histogram::AcquireLatencySeconds, elapsed.as_secs_f64());
    }

    fn note_created(&self, session: &Arc<Session>) {
        let total = {
            let mut st = self.inner.state.lock();
            st.created += 1;
            st.total
        };
        self.inner.metrics.incr(Counter::SessionsCreatedTotal, 1);
        self.inner.metrics.gauge(Gauge::SessionsActive, total as i64);
        self.inner.events.emit(LifecycleEvent::SessionCreated {
            session_id: session.id(),
            key: session.key().to_string(),
        });
    }

    async fn create_session(&self, config: &Arc<SessionConfig>) -> Result<Arc<Session>, EngineError> {
        let process = self.inner.spawner.spawn(config).await?;
        Session::start(
            SessionId::new(),
            config.clone(),
            process,
            self.inner.clock.clone(),
            self.inner.cancel_cfg,
        )
    }

    fn is_reusable(&self, session: &Arc<Session>, now: Instant) -> bool {
        session.state() == SessionState::Idle
            && session.is_alive()
            && session.reuse_count() < self.settings().max_reuse
            && now.saturating_duration_since(session.created_at())
                < max_lifetime_of(&self.inner, session)
    }

    fn stale_reason(&self, session: &Arc<Session>, now: Instant) -> CloseReason {
        if !session.is_alive() {
            CloseReason::ProcessExited
        } else if session.state() != SessionState::Idle {
            CloseReason::Error
        } else if session.reuse_count() >= self.settings().max_reuse {
            CloseReason::WornOut
        } else if now.saturating_duration_since(session.created_at())
            >= max_lifetime_of(&self.inner, session)
        {
            CloseReason::LifetimeExpired
        } else {
            CloseReason::Invalidated
        }
    }
}

/// Per-session eviction windows: the caller may only tighten the pool-wide
/// defaults, never widen them.
fn max_idle_of(inner: &PoolInner, session: &Arc<Session>) -> Duration {
    session.config().max_idle.min(inner.settings.max_idle())
}

fn max_lifetime_of(inner: &PoolInner, session: &Arc<Session>) -> Duration {
    session.config().max_lifetime.min(inner.settings.max_lifetime())
}

/// Exclusive checkout of one session.
///
/// Dropping the lease without an explicit release still returns the session
/// to the pool (or destroys it), so permits survive panics and early exits.
pub struct SessionLease {
    session: Option<Arc<Session>>,
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").finish()
    }
}

impl SessionLease {
    /// The leased session
    pub fn session(&self) -> &Arc<Session> {
        self.session.as_ref().expect("session lease already released")
    }

    /// Return the session: healthy idle sessions go back to the pool, all
    /// others are destroyed.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            give_back(&self.inner, session).await;
        }
    }

    /// Destroy the session irrespective of state.
    pub async fn invalidate(mut self, reason: CloseReason) {
        if let Some(session) = self.session.take() {
            destroy(&self.inner, session, reason).await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                give_back(&inner, session).await;
            });
        } else {
            // No runtime left; account for the slot and let the process
            // handle's drop backstop reap the child.
            release_slot(&inner, session.key());
            let mut st = inner.state.lock();
            st.destroyed += 1;
        }
    }
}

async fn give_back(inner: &Arc<PoolInner>, session: Arc<Session>) {
    let pool = SessionPool {
        inner: inner.clone(),
    };
    let now = inner.clock.now();
    let to_destroy = {
        let mut st = inner.state.lock();
        if st.closed {
            Some((session, CloseReason::Shutdown))
        } else if pool.is_reusable(&session, now) {
            st.idle.push(session);
            None
        } else {
            let reason = pool.stale_reason(&session, now);
            Some((session, reason))
        }
    };
    match to_destroy {
        None => inner.available.notify_one(),
        Some((session, reason)) => destroy(inner, session, reason).await,
    }
}

/// Release the slot first so waiters can proceed, then close the process.
/// Teardown never happens under the pool lock.
async fn destroy(inner: &Arc<PoolInner>, session: Arc<Session>, reason: CloseReason) {
    let total = {
        let mut st = inner.state.lock();
        st.total = st.total.saturating_sub(1);
        if let Some(count) = st.per_key.get_mut(&session.key()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                st.per_key.remove(&session.key());
            }
        }
        st.destroyed += 1;
        st.total
    };
    inner.available.notify_one();
    inner.metrics.incr(Counter::SessionsDestroyedTotal, 1);
    inner.metrics.gauge(Gauge::SessionsActive, total as i64);
    inner.events.emit(LifecycleEvent::SessionClosed {
        session_id: session.id(),
        reason,
    });
    debug!(session_id = %session.id(), ?reason, "destroying session");
    session.close(CloseMode::Graceful, reason).await;
}

fn spawn_sweeper(inner: &Arc<PoolInner>) {
    let interval = (inner.settings.max_idle().min(inner.settings.max_lifetime()) / 4)
        .max(Duration::from_secs(1));
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            sweep(&inner).await;
        }
    });
}

async fn sweep(inner: &Arc<PoolInner>) {
    let now = inner.clock.now();
    let victims: Vec<(Arc<Session>, CloseReason)> = {
        let mut st = inner.state.lock();
        if st.closed {
            return;
        }
        let mut victims = Vec::new();

        // Dead and over-age sessions go unconditionally.
        let mut i = 0;
        while i < st.idle.len() {
            let s = &st.idle[i];
            let reason = if !s.is_alive() || s.state() != SessionState::Idle {
                Some(CloseReason::ProcessExited)
            } else if now.saturating_duration_since(s.created_at()) >= max_lifetime_of(inner, s) {
                Some(CloseReason::LifetimeExpired)
            } else {
                None
            };
            if let Some(reason) = reason {
                victims.push((st.idle.swap_remove(i), reason));
            } else {
                i += 1;
            }
        }

        // Idle-timeout eviction respects the min_size floor, oldest first.
        let mut idle_expired: Vec<usize> = st
            .idle
            .iter()
            .enumerate()
            .filter(|&(_, s)| {
                now.saturating_duration_since(s.last_used()) >= max_idle_of(inner, s)
            })
            .map(|(i, _)| i)
            .collect();
        idle_expired.sort_by_key(|&i| st.idle[i].last_used());
        let evictable = st.idle.len().saturating_sub(inner.settings.min_size);
        idle_expired.truncate(evictable);
        // Remove from the back so earlier indices stay valid.
        idle_expired.sort_unstable_by(|a, b| b.cmp(a));
        for i in idle_expired {
            victims.push((st.idle.swap_remove(i), CloseReason::IdleTimeout));
        }
        victims
    };

    for (session, reason) in victims {
        destroy(inner, session, reason).await;
    }
}
