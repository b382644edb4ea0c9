//! Admission control and request driving
//!
//! The dispatcher sits between callers and the pool. Admission order: per-key
//! circuit breaker (fail fast), global concurrency slot, pool checkout. The
//! global slots come from a FIFO semaphore, or, when per-user fairness is
//! configured, from a gate that grants them round-robin across users with
//! pending work. Every step honours the request deadline and the caller's
//! cancellation token. One driver task per request runs the retry loop and
//! emits the single terminal message; slots and leases are RAII, so no exit
//! path can leak them.

use crate::breaker::{BreakerPass, BreakerRegistry};
use crate::broadcast::{BackpressurePolicy, Broadcaster, SubscriberHandle};
use crate::config::Settings;
use crate::events::{CloseReason, EventSink, LifecycleEvent};
use crate::metrics::{Counter, Histogram, MetricsSink};
use crate::pool::SessionPool;
use crate::retry::RetryPolicy;
use crate::session::{AttemptOutcome, Session};
use dashmap::DashMap;
use promptmux_engine::{
    CancelReason, Clock, CompatibilityKey, EngineError, ErrorKind, Message, MessagePayload,
    RequestId, SessionConfig, SessionId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One prompt execution as submitted by the facade.
pub struct ExecuteRequest {
    /// Caller-facing session identity (for events)
    pub session_id: SessionId,
    /// Engine configuration; decides the pool key
    pub config: Arc<SessionConfig>,
    /// The prompt to run
    pub prompt: String,
    /// Overall budget from admission to terminal message
    pub timeout: Duration,
    /// Fairness bucket, when per-user limits are configured
    pub user: Option<String>,
    /// Caller's cancellation token; a child token is derived from it
    pub cancel: Option<CancellationToken>,
}

struct ActiveRequest {
    token: CancellationToken,
    broadcaster: Arc<Broadcaster>,
}

struct RequestCtx {
    request_id: RequestId,
    key: CompatibilityKey,
    config: Arc<SessionConfig>,
    prompt: String,
    budget: Duration,
    deadline: Instant,
    token: CancellationToken,
    broadcaster: Arc<Broadcaster>,
}

enum RequestResult {
    Completed(Message),
    Cancelled(CancelReason),
    Failed(EngineError),
}

struct FairState {
    /// Unclaimed global slots
    free: usize,
    /// Slots held per user
    in_flight: HashMap<String, usize>,
    /// Users with queued waiters, in turn order
    rotation: VecDeque<String>,
    /// Waiting requests per user, FIFO
    waiting: HashMap<String, VecDeque<oneshot::Sender<FairnessToken>>>,
}

/// Round-robin scheduler over the global concurrency slots.
///
/// When fairness is configured this gate replaces the plain semaphore:
/// requests queue per user and freed slots are granted by rotating across
/// users with pending work, so a user issuing an endless stream of requests
/// cannot starve everyone else out of the global capacity the way FIFO
/// permit hand-off would. `max_per_user` additionally caps one user's
/// concurrent share.
struct FairnessGate {
    max_per_user: usize,
    state: parking_lot::Mutex<FairState>,
}

impl FairnessGate {
    fn new(slots: usize, max_per_user: usize) -> Self {
        Self {
            max_per_user: max_per_user.max(1),
            state: parking_lot::Mutex::new(FairState {
                free: slots,
                in_flight: HashMap::new(),
                rotation: VecDeque::new(),
                waiting: HashMap::new(),
            }),
        }
    }

    fn free_slots(&self) -> usize {
        self.state.lock().free
    }

    /// Take a slot, queueing behind this user's earlier requests and taking
    /// turns with other users when the gate is contended.
    async fn acquire(self: &Arc<Self>, user: &str) -> Result<FairnessToken, EngineError> {
        let rx = {
            let mut st = self.state.lock();
            let used = st.in_flight.get(user).copied().unwrap_or(0);
            let queued = st.waiting.get(user).is_some_and(|q| !q.is_empty());
            // Jumping the queue here would be fine capacity-wise but would
            // reorder this user's own requests.
            if st.free > 0 && used < self.max_per_user && !queued {
                st.free -= 1;
                *st.in_flight.entry(user.to_string()).or_insert(0) += 1;
                return Ok(FairnessToken::new(self.clone(), user));
            }
            let (tx, rx) = oneshot::channel();
            st.waiting.entry(user.to_string()).or_default().push_back(tx);
            if !st.rotation.iter().any(|u| u == user) {
                st.rotation.push_back(user.to_string());
            }
            rx
        };
        // The granter accounts the slot and sends the token itself; if this
        // waiter is abandoned mid-flight the unclaimed token's drop returns
        // the slot, so nothing can leak.
        rx.await
            .map_err(|_| EngineError::internal("fairness gate dropped"))
    }
}

fn dec_in_flight(st: &mut FairState, user: &str) {
    if let Some(n) = st.in_flight.get_mut(user) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            st.in_flight.remove(user);
        }
    }
}

/// Grant free slots to waiting users in rotation. Dead waiters (dropped
/// receivers) are skipped and their accounting undone.
fn pump(gate: &Arc<FairnessGate>, st: &mut FairState) {
    let mut budget = st.rotation.len();
    while st.free > 0 && budget > 0 {
        let Some(user) = st.rotation.pop_front() else {
            break;
        };
        budget -= 1;

        let used = st.in_flight.get(&user).copied().unwrap_or(0);
        if used >= gate.max_per_user {
            if st.waiting.get(&user).is_some_and(|q| !q.is_empty()) {
                st.rotation.push_back(user);
            } else {
                st.waiting.remove(&user);
            }
            continue;
        }

        let mut granted = false;
        while let Some(tx) = st.waiting.get_mut(&user).and_then(|q| q.pop_front()) {
            st.free -= 1;
            *st.in_flight.entry(user.clone()).or_insert(0) += 1;
            match tx.send(FairnessToken::new(gate.clone(), &user)) {
                Ok(()) => {
                    granted = true;
                    break;
                },
                Err(mut token) => {
                    // Disarm before dropping: the gate lock is held here.
                    token.armed = false;
                    st.free += 1;
                    dec_in_flight(st, &user);
                },
            }
        }

        if st.waiting.get(&user).is_some_and(|q| !q.is_empty()) {
            st.rotation.push_back(user);
        } else {
            st.waiting.remove(&user);
        }
        if granted {
            // Progress was made; allow a fresh rotation pass.
            budget = st.rotation.len();
        }
    }
}

/// One granted slot; returning it re-pumps the rotation.
struct FairnessToken {
    gate: Arc<FairnessGate>,
    user: String,
    armed: bool,
}

impl FairnessToken {
    fn new(gate: Arc<FairnessGate>, user: &str) -> Self {
        Self {
            gate,
            user: user.to_string(),
            armed: true,
        }
    }
}

impl Drop for FairnessToken {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let gate = self.gate.clone();
        let mut st = gate.state.lock();
        st.free += 1;
        dec_in_flight(&mut st, &self.user);
        pump(&gate, &mut st);
    }
}

/// Either kind of global admission slot, released on drop.
#[allow(dead_code)]
enum AdmissionSlot {
    Permit(OwnedSemaphorePermit),
    Token(FairnessToken),
}

struct DispatcherInner {
    settings: Settings,
    semaphore: Arc<Semaphore>,
    pool: SessionPool,
    breakers: BreakerRegistry,
    fairness: Option<Arc<FairnessGate>>,
    retry: RetryPolicy,
    active: DashMap<RequestId, ActiveRequest>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

/// The admission controller between callers and the pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Build a dispatcher over an existing pool.
    pub fn new(
        settings: Settings,
        pool: SessionPool,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let breakers = BreakerRegistry::new(
            settings.breaker.threshold,
            settings.breaker.open_duration(),
        );
        let fairness = settings
            .fairness
            .max_per_user
            .map(|cap| Arc::new(FairnessGate::new(settings.max_concurrent, cap)));
        let retry = RetryPolicy::new(&settings.retry);
        Self {
            inner: Arc::new(DispatcherInner {
                semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
                settings,
                pool,
                breakers,
                fairness,
                retry,
                active: DashMap::new(),
                clock,
                events,
                metrics,
            }),
        }
    }

    /// Admit one request. The breaker is consulted synchronously so an open
    /// circuit fails fast; everything else happens on the driver task. The
    /// returned stream carries the request's messages through its terminal.
    pub fn execute(
        &self,
        req: ExecuteRequest,
    ) -> Result<(RequestId, SubscriberHandle), EngineError> {
        let key = req.config.key();
        let breaker = self.inner.breakers.for_key(key);
        let first_pass = breaker.try_acquire(self.inner.clock.now())?;

        let request_id = RequestId::new();
        let stream = &self.inner.settings.stream;
        let broadcaster = Broadcaster::new(
            request_id,
            stream.history_window,
            stream.block_timeout(),
            self.inner.metrics.clone(),
        );
        let primary = broadcaster.subscribe(stream.backpressure_policy, stream.buffer_size);
        let token = req
            .cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();

        self.inner.active.insert(
            request_id,
            ActiveRequest {
                token: token.clone(),
                broadcaster: broadcaster.clone(),
            },
        );
        self.inner.metrics.incr(Counter::RequestsTotal, 1);
        self.inner.events.emit(LifecycleEvent::RequestStarted {
            request_id,
            session_id: req.session_id,
        });
        debug!(%request_id, session_id = %req.session_id, "request admitted");

        let ctx = RequestCtx {
            request_id,
            key,
            config: req.config,
            prompt: req.prompt,
            budget: req.timeout,
            deadline: self.inner.clock.now() + req.timeout,
            token,
            broadcaster,
        };
        let inner = self.inner.clone();
        tokio::spawn(drive(inner, ctx, first_pass, req.user));
        Ok((request_id, primary))
    }

    /// Cancel a request. Idempotent for a request already winding down.
    pub fn cancel(&self, request_id: RequestId) -> Result<(), EngineError> {
        match self.inner.active.get(&request_id) {
            Some(entry) => {
                entry.token.cancel();
                Ok(())
            },
            None => Err(EngineError::NotFound {
                what: "request",
                id: request_id.to_string(),
            }),
        }
    }

    /// Attach a late subscriber to an in-flight request.
    pub fn subscribe(
        &self,
        request_id: RequestId,
        policy: BackpressurePolicy,
        capacity: usize,
    ) -> Result<SubscriberHandle, EngineError> {
        self.inner
            .active
            .get(&request_id)
            .map(|entry| entry.broadcaster.subscribe(policy, capacity))
            .ok_or(EngineError::NotFound {
                what: "request",
                id: request_id.to_string(),
            })
    }

    /// Free global concurrency slots (diagnostics).
    pub fn available_permits(&self) -> usize {
        match &self.inner.fairness {
            Some(gate) => gate.free_slots(),
            None => self.inner.semaphore.available_permits(),
        }
    }

    /// Requests currently between admission and terminal (diagnostics).
    pub fn active_requests(&self) -> usize {
        self.inner.active.len()
    }
}

/// Driver: retry loop, terminal emission, accounting. Exactly one terminal
/// message reaches the broadcaster per request.
async fn drive(
    inner: Arc<DispatcherInner>,
    ctx: RequestCtx,
    first_pass: BreakerPass,
    user: Option<String>,
) {
    let started = inner.clock.now();
    let result = run_with_retries(&inner, &ctx, first_pass, user.as_deref()).await;

    let ts = inner.clock.timestamp_ms();
    let terminal = match &result {
        RequestResult::Completed(msg) => msg.clone(),
        RequestResult::Cancelled(reason) => {
            Message::new(MessagePayload::Cancelled { reason: *reason }, ts)
        },
        // Deadline misses surface as Cancelled{Timeout} on the stream while
        // keeping Timeout as the failure kind in events.
        RequestResult::Failed(EngineError::Timeout { .. }) => Message::new(
            MessagePayload::Cancelled {
                reason: CancelReason::Timeout,
            },
            ts,
        ),
        RequestResult::Failed(error) => Message::new(
            MessagePayload::Error {
                kind: error.kind(),
                detail: error.to_string(),
            },
            ts,
        ),
    };
    ctx.broadcaster.broadcast(terminal).await;
    inner.active.remove(&ctx.request_id);

    let elapsed = inner.clock.now().saturating_duration_since(started);
    inner
        .metrics
        .observe(Histogram::RequestLatencySeconds, elapsed.as_secs_f64());
    match result {
        RequestResult::Completed(_) => {
            inner.events.emit(LifecycleEvent::RequestCompleted {
                request_id: ctx.request_id,
                duration_ms: elapsed.as_millis() as u64,
            });
        },
        RequestResult::Cancelled(reason) => {
            inner.metrics.incr(Counter::RequestsFailedTotal, 1);
            inner.events.emit(LifecycleEvent::RequestFailed {
                request_id: ctx.request_id,
                kind: match reason {
                    CancelReason::Caller => ErrorKind::Cancelled,
                    CancelReason::Timeout => ErrorKind::Timeout,
                },
            });
        },
        RequestResult::Failed(error) => {
            inner.metrics.incr(Counter::RequestsFailedTotal, 1);
            inner.events.emit(LifecycleEvent::RequestFailed {
                request_id: ctx.request_id,
                kind: error.kind(),
            });
        },
    }
}

async fn run_with_retries(
    inner: &Arc<DispatcherInner>,
    ctx: &RequestCtx,
    first_pass: BreakerPass,
    user: Option<&str>,
) -> RequestResult {
    let mut next_pass = Some(first_pass);
    let mut delivered_total: u64 = 0;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let pass = match next_pass.take() {
            Some(pass) => pass,
            None => {
                match inner
                    .breakers
                    .for_key(ctx.key)
                    .try_acquire(inner.clock.now())
                {
                    Ok(pass) => pass,
                    Err(e) => return RequestResult::Failed(e),
                }
            },
        };

        match attempt_once(inner, ctx, user, &mut delivered_total).await {
            RequestResult::Completed(msg) => {
                if pass.success() {
                    inner.events.emit(LifecycleEvent::CircuitClosed {
                        key: ctx.key.to_string(),
                    });
                }
                return RequestResult::Completed(msg);
            },
            RequestResult::Cancelled(reason) => {
                pass.skip();
                return RequestResult::Cancelled(reason);
            },
            RequestResult::Failed(error) => {
                if error.implicates_engine() {
                    if pass.failure(inner.clock.now()) {
                        inner.metrics.incr(Counter::CircuitOpenTotal, 1);
                        inner.events.emit(LifecycleEvent::CircuitOpened {
                            key: ctx.key.to_string(),
                        });
                    }
                } else {
                    pass.skip();
                }

                // A retry must be invisible to subscribers: once any message
                // was delivered, replaying the prompt would duplicate output.
                let can_retry = error.is_retryable()
                    && delivered_total == 0
                    && attempt < inner.retry.max_attempts();
                if !can_retry {
                    return RequestResult::Failed(error);
                }
                let delay = inner.retry.backoff(attempt);
                if inner.clock.now() + delay >= ctx.deadline {
                    return RequestResult::Failed(error);
                }
                warn!(
                    request_id = %ctx.request_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed ({error}), retrying on a fresh session"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = ctx.token.cancelled() => {
                        return RequestResult::Cancelled(CancelReason::Caller)
                    },
                }
            },
        }
    }
}

/// One admission + execution attempt. The global slot and the pool lease are
/// both scoped to this function.
async fn attempt_once(
    inner: &Arc<DispatcherInner>,
    ctx: &RequestCtx,
    user: Option<&str>,
    delivered_total: &mut u64,
) -> RequestResult {
    let remaining = ctx
        .deadline
        .saturating_duration_since(inner.clock.now());
    if remaining.is_zero() {
        return RequestResult::Failed(timeout_error(ctx));
    }

    // Global admission slot, honouring deadline and cancellation. With
    // fairness configured the slots are dispensed by the round-robin gate
    // (requests without a user share one anonymous bucket); otherwise the
    // plain semaphore hands them out FIFO.
    let _slot = if let Some(gate) = &inner.fairness {
        let bucket = user.unwrap_or("");
        tokio::select! {
            acquired = tokio::time::timeout(remaining, gate.acquire(bucket)) => match acquired {
                Ok(Ok(token)) => AdmissionSlot::Token(token),
                Ok(Err(e)) => return RequestResult::Failed(e),
                Err(_) => return RequestResult::Failed(timeout_error(ctx)),
            },
            _ = ctx.token.cancelled() => return RequestResult::Cancelled(CancelReason::Caller),
        }
    } else {
        tokio::select! {
            acquired = tokio::time::timeout(remaining, inner.semaphore.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => AdmissionSlot::Permit(permit),
                    Ok(Err(_)) => {
                        return RequestResult::Failed(EngineError::internal(
                            "dispatcher semaphore closed",
                        ))
                    },
                    Err(_) => return RequestResult::Failed(timeout_error(ctx)),
                }
            },
            _ = ctx.token.cancelled() => return RequestResult::Cancelled(CancelReason::Caller),
        }
    };

    let remaining = ctx
        .deadline
        .saturating_duration_since(inner.clock.now());
    let lease = tokio::select! {
        acquired = inner.pool.acquire(&ctx.config, remaining) => match acquired {
            Ok(lease) => lease,
            Err(e) => return RequestResult::Failed(e),
        },
        _ = ctx.token.cancelled() => return RequestResult::Cancelled(CancelReason::Caller),
    };

    let session = lease.session().clone();
    let outcome_rx = match session
        .begin(ctx.request_id, &ctx.prompt, ctx.broadcaster.clone())
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            lease.invalidate(CloseReason::Error).await;
            return RequestResult::Failed(e);
        },
    };

    let outcome = supervise(inner, ctx, &session, outcome_rx).await;
    let result = match outcome {
        Ok(AttemptOutcome::Completed { terminal, messages }) => {
            *delivered_total += messages;
            RequestResult::Completed(terminal)
        },
        Ok(AttemptOutcome::Cancelled { reason, messages }) => {
            *delivered_total += messages;
            RequestResult::Cancelled(reason)
        },
        Ok(AttemptOutcome::Failed { error, messages }) => {
            *delivered_total += messages;
            RequestResult::Failed(error)
        },
        Err(e) => RequestResult::Failed(e),
    };
    // Unhealthy sessions (crashed, poisoned by cancel, auth-failed) are
    // destroyed by the release health check; a retry therefore always starts
    // from a fresh pool acquire.
    lease.release().await;
    result
}

/// Wait for the attempt outcome, converting caller cancellation and deadline
/// expiry into `Session::cancel`. After a cancel the outcome must arrive
/// within grace + force; the extra second is slack for scheduling.
async fn supervise(
    inner: &Arc<DispatcherInner>,
    ctx: &RequestCtx,
    session: &Arc<Session>,
    mut outcome_rx: oneshot::Receiver<AttemptOutcome>,
) -> Result<AttemptOutcome, EngineError> {
    let settle_window =
        inner.settings.cancel.grace() + inner.settings.cancel.force() + Duration::from_secs(1);
    let interrupt = tokio::select! {
        outcome = &mut outcome_rx => {
            return outcome.map_err(|_| EngineError::internal("session router dropped the request"));
        },
        _ = ctx.token.cancelled() => CancelReason::Caller,
        _ = tokio::time::sleep_until(ctx.deadline) => CancelReason::Timeout,
    };
    debug!(request_id = %ctx.request_id, reason = ?interrupt, "interrupting session");
    session.cancel(ctx.request_id, interrupt).await;
    settle(outcome_rx, settle_window).await
}

async fn settle(
    outcome_rx: oneshot::Receiver<AttemptOutcome>,
    window: Duration,
) -> Result<AttemptOutcome, EngineError> {
    match tokio::time::timeout(window, outcome_rx).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Err(EngineError::internal("session router dropped the request")),
        Err(_) => Err(EngineError::internal(
            "cancellation did not settle within its bound",
        )),
    }
}

fn timeout_error(ctx: &RequestCtx) -> EngineError {
    EngineError::Timeout {
        elapsed_ms: ctx.budget.as_millis() as u64,
    }
}
