//! One conversation: a live engine process plus its state machine
//!
//! ```text
//!          spawn
//!   (∅) ─────────────▶ Idle
//!                       │  begin(request)
//!                       ▼
//!                     Running ───── terminal ──▶ Idle
//!                       │
//!                       │  close / eviction / process exit
//!                       ▼
//!                     Closing ──── exit observed ────▶ Closed
//! ```
//!
//! A router task owns the parser stream: it forwards non-terminal messages to
//! the in-flight request's broadcaster and reports the attempt outcome on a
//! oneshot. `Idle → Running` is the only admission point and is a single
//! atomic step under the state mutex.

use crate::broadcast::Broadcaster;
use crate::events::CloseReason;
use futures::StreamExt;
use parking_lot::Mutex;
use promptmux_engine::{
    message_stream, CancelReason, Clock, CloseMode, CompatibilityKey, EngineError, ErrorKind,
    Message, MessagePayload, ProcessHandle, RequestId, SessionConfig, SessionId, DEFAULT_FORCE,
    DEFAULT_GRACE,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How cancellation approaches the engine.
///
/// `CloseStdin` ends the conversation unconditionally: the session cannot be
/// reused afterwards. `Sentinel` asks the engine to stop cooperatively and
/// keeps the session reusable when the engine yields in time; engines that
/// ignore the sentinel are force-closed all the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStrategy {
    /// Close the engine's stdin immediately
    #[default]
    CloseStdin,
    /// Write a `{"type":"cancel"}` line and leave stdin open
    Sentinel,
}

/// Cancellation timing knobs, shared by session and pool teardown.
#[derive(Debug, Clone, Copy)]
pub struct CancelConfig {
    /// Window the engine gets to yield after a cancel
    pub grace: Duration,
    /// Window between SIGTERM and SIGKILL
    pub force: Duration,
    /// Cooperative-vs-hard cancellation
    pub strategy: CancelStrategy,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(2_000),
            force: Duration::from_millis(1_000),
            strategy: CancelStrategy::CloseStdin,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for a prompt
    Idle,
    /// Serving exactly one request
    Running {
        /// The request holding exclusive access
        request_id: RequestId,
    },
    /// Teardown initiated; waiting for the process to exit
    Closing,
    /// Process reaped
    Closed {
        /// Why the session went away
        reason: CloseReason,
    },
}

/// How one attempt on a session ended. Reported to the dispatcher, which owns
/// terminal-message emission.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    /// Engine finished normally; `terminal` is its `complete` message
    Completed { terminal: Message, messages: u64 },
    /// A requested cancellation took effect
    Cancelled { reason: CancelReason, messages: u64 },
    /// The attempt failed; the session may or may not survive
    Failed { error: EngineError, messages: u64 },
}

struct ActiveRequest {
    request_id: RequestId,
    broadcaster: Arc<Broadcaster>,
    outcome: Option<oneshot::Sender<AttemptOutcome>>,
    cancel_requested: Option<CancelReason>,
    messages: u64,
}

impl ActiveRequest {
    fn finish(mut self, outcome: AttemptOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct SessionShared {
    id: SessionId,
    state: Mutex<SessionState>,
    active: AsyncMutex<Option<ActiveRequest>>,
    last_used: Mutex<Instant>,
    created_at: Instant,
    reuse_count: AtomicU32,
    /// Cancellation made the session unusable (stdin closed / force killed)
    poisoned: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    clock: Arc<dyn Clock>,
}

impl SessionShared {
    fn touch(&self) {
        *self.last_used.lock() = self.clock.now();
    }

    fn to_idle(&self) {
        let mut st = self.state.lock();
        if matches!(*st, SessionState::Running { .. }) {
            *st = SessionState::Idle;
        }
    }

    fn to_closing(&self) {
        let mut st = self.state.lock();
        if !matches!(*st, SessionState::Closed { .. }) {
            *st = SessionState::Closing;
        }
    }

    fn to_closed(&self) {
        let reason = self
            .close_reason
            .lock()
            .unwrap_or(CloseReason::ProcessExited);
        *self.state.lock() = SessionState::Closed { reason };
    }
}

/// One pooled engine-process session.
pub struct Session {
    id: SessionId,
    key: CompatibilityKey,
    config: Arc<SessionConfig>,
    process: ProcessHandle,
    cancel_cfg: CancelConfig,
    shared: Arc<SessionShared>,
}

impl Session {
    /// Wrap a freshly spawned process and start its router task.
    pub(crate) fn start(
        id: SessionId,
        config: Arc<SessionConfig>,
        process: ProcessHandle,
        clock: Arc<dyn Clock>,
        cancel_cfg: CancelConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let events = process
            .take_events()
            .ok_or_else(|| EngineError::internal("process event stream already consumed"))?;
        let now = clock.now();
        let shared = Arc::new(SessionShared {
            id,
            state: Mutex::new(SessionState::Idle),
            active: AsyncMutex::new(None),
            last_used: Mutex::new(now),
            created_at: now,
            reuse_count: AtomicU32::new(0),
            poisoned: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            clock: clock.clone(),
        });
        let stream = message_stream(events, clock);
        tokio::spawn(route_messages(shared.clone(), stream));
        Ok(Arc::new(Self {
            id,
            key: config.key(),
            config,
            process,
            cancel_cfg,
            shared,
        }))
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Pool bucketing key
    pub fn key(&self) -> CompatibilityKey {
        self.key
    }

    /// The config this session was spawned from
    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Whether the engine process is still running
    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// When the session last carried traffic
    pub fn last_used(&self) -> Instant {
        *self.shared.last_used.lock()
    }

    /// When the session was created
    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    /// Requests served via pool reuse
    pub fn reuse_count(&self) -> u32 {
        self.shared.reuse_count.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_reused(&self) -> u32 {
        self.shared.touch();
        self.shared.reuse_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn set_close_reason(&self, reason: CloseReason) {
        self.shared.close_reason.lock().get_or_insert(reason);
    }

    /// Begin one prompt execution.
    ///
    /// Atomically admits the request (`Idle → Running`), installs its
    /// broadcaster for the router, and writes the line-framed prompt. The
    /// returned receiver resolves with the attempt outcome.
    pub(crate) async fn begin(
        &self,
        request_id: RequestId,
        prompt: &str,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<oneshot::Receiver<AttemptOutcome>, EngineError> {
        {
            let mut st = self.shared.state.lock();
            match *st {
                SessionState::Idle => {
                    *st = SessionState::Running { request_id };
                },
                other => {
                    return Err(EngineError::internal(format!(
                        "prompt admitted on session {} in state {other:?}",
                        self.id
                    )));
                },
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut active = self.shared.active.lock().await;
            *active = Some(ActiveRequest {
                request_id,
                broadcaster,
                outcome: Some(tx),
                cancel_requested: None,
                messages: 0,
            });
        }

        let frame = json!({"type": "user", "content": prompt}).to_string();
        if let Err(e) = self.process.write_line(frame) {
            self.shared.active.lock().await.take();
            self.shared.to_closing();
            return Err(e);
        }
        self.shared.touch();
        debug!(session_id = %self.id, %request_id, "prompt dispatched");
        Ok(rx)
    }

    /// Cancel the in-flight request, if it is the given one.
    ///
    /// Always results in a terminal `Cancelled` outcome for the request. The
    /// engine gets `grace` to yield; a watchdog force-closes the process group
    /// afterwards, so the outcome arrives within `grace + force` of this call.
    /// Returns `false` when the request is not in flight on this session.
    pub(crate) async fn cancel(&self, request_id: RequestId, reason: CancelReason) -> bool {
        {
            let mut active = self.shared.active.lock().await;
            match active.as_mut() {
                Some(req) if req.request_id == request_id => {
                    if req.cancel_requested.is_some() {
                        return true;
                    }
                    req.cancel_requested = Some(reason);
                },
                _ => return false,
            }
        }

        match self.cancel_cfg.strategy {
            CancelStrategy::Sentinel => {
                // Cooperative: the engine may finish the turn and stay usable.
                if let Err(e) = self.process.write_line(json!({"type": "cancel"}).to_string()) {
                    debug!(session_id = %self.id, "cancel sentinel rejected ({e}), closing stdin");
                    self.shared.poisoned.store(true, Ordering::SeqCst);
                    self.process.close_stdin();
                }
            },
            CancelStrategy::CloseStdin => {
                self.shared.poisoned.store(true, Ordering::SeqCst);
                self.process.close_stdin();
            },
        }

        // Watchdog: if the engine has not yielded a terminal by the end of the
        // grace window, tear the process group down. The router then reports
        // the Cancelled outcome off the exit.
        let shared = self.shared.clone();
        let teardown = self.process.teardown();
        let grace = self.cancel_cfg.grace;
        let force = self.cancel_cfg.force;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_running = {
                let active = shared.active.lock().await;
                matches!(&*active, Some(req) if req.request_id == request_id)
            };
            if !still_running {
                return;
            }
            warn!(session_id = %shared.id, %request_id, "engine ignored cancel, force-closing");
            shared.poisoned.store(true, Ordering::SeqCst);
            shared.close_reason.lock().get_or_insert(CloseReason::Invalidated);
            shared.to_closing();
            teardown.force_close(force).await;
        });
        true
    }

    /// Tear the session down. The router observes the exit and settles any
    /// in-flight request. Teardown uses the process-level grace window, which
    /// is wider than the cancel grace.
    pub(crate) async fn close(&self, mode: CloseMode, reason: CloseReason) {
        self.set_close_reason(reason);
        self.shared.to_closing();
        self.process
            .close(mode, DEFAULT_GRACE, DEFAULT_FORCE)
            .await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .field("reuse_count", &self.reuse_count())
            .finish()
    }
}

/// Session-fatal error kinds: the process is corrupt or the credentials are
/// bad, so the session must not be reused.
fn is_fatal(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ProcessCrashed
            | ErrorKind::PartialFailure
            | ErrorKind::StreamProtocol
            | ErrorKind::AuthFailed
            | ErrorKind::SpawnFailed
    )
}

fn engine_error_from(kind: ErrorKind, detail: &str, after_first_message: bool) -> EngineError {
    match kind {
        ErrorKind::AuthFailed => EngineError::AuthFailed {
            detail: detail.to_string(),
        },
        ErrorKind::InsufficientCredits => EngineError::InsufficientCredits,
        ErrorKind::ProcessCrashed => EngineError::ProcessCrashed {
            exit_code: None,
            after_first_message,
        },
        ErrorKind::PartialFailure => EngineError::ProcessCrashed {
            exit_code: None,
            after_first_message: true,
        },
        ErrorKind::StreamProtocol => EngineError::stream_protocol(detail),
        _ => EngineError::internal(detail),
    }
}

/// The session's router: single consumer of the parser stream.
async fn route_messages(
    shared: Arc<SessionShared>,
    stream: impl futures::Stream<Item = Message> + Send,
) {
    futures::pin_mut!(stream);
    while let Some(msg) = stream.next().await {
        shared.touch();
        let mut active = shared.active.lock().await;
        match msg.payload {
            MessagePayload::Complete { .. } => {
                let Some(req) = active.take() else {
                    debug!(session_id = %shared.id, "complete with no request in flight");
                    continue;
                };
                let messages = req.messages;
                let outcome = match req.cancel_requested {
                    Some(reason) => {
                        // The engine yielded inside the grace window. The
                        // session survives only a cooperative cancel.
                        if shared.poisoned.load(Ordering::SeqCst) {
                            shared.to_closing();
                        } else {
                            shared.to_idle();
                        }
                        AttemptOutcome::Cancelled { reason, messages }
                    },
                    None => {
                        shared.to_idle();
                        AttemptOutcome::Completed {
                            terminal: msg,
                            messages,
                        }
                    },
                };
                req.finish(outcome);
            },
            MessagePayload::Error { kind, ref detail } => {
                let fatal = is_fatal(kind);
                if let Some(req) = active.take() {
                    let messages = req.messages;
                    let outcome = match req.cancel_requested {
                        Some(reason) => AttemptOutcome::Cancelled { reason, messages },
                        None => AttemptOutcome::Failed {
                            error: engine_error_from(kind, detail, messages > 0),
                            messages,
                        },
                    };
                    if fatal {
                        shared.to_closing();
                    } else {
                        shared.to_idle();
                    }
                    req.finish(outcome);
                } else if fatal {
                    shared.to_closing();
                }
            },
            _ => {
                if let Some(req) = active.as_mut() {
                    if req.cancel_requested.is_some() {
                        // Output racing a cancellation is moot.
                        continue;
                    }
                    req.messages += 1;
                    let broadcaster = req.broadcaster.clone();
                    // Release the slot before suspending on a Block
                    // subscriber, so cancel() can still get in.
                    drop(active);
                    broadcaster.broadcast(msg).await;
                }
            },
        }
    }

    // Parser stream over: the process is gone.
    let mut active = shared.active.lock().await;
    if let Some(req) = active.take() {
        let messages = req.messages;
        let outcome = match req.cancel_requested {
            Some(reason) => AttemptOutcome::Cancelled { reason, messages },
            None => AttemptOutcome::Failed {
                error: EngineError::ProcessCrashed {
                    exit_code: None,
                    after_first_message: messages > 0,
                },
                messages,
            },
        };
        req.finish(outcome);
    }
    shared.to_closed();
    debug!(session_id = %shared.id, "session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BackpressurePolicy;
    use promptmux_engine::{MockBehavior, MockSpawner, ProcessSpawner, SystemClock};

    async fn started_session(
        spawner: &Arc<MockSpawner>,
        cancel_cfg: CancelConfig,
    ) -> Arc<Session> {
        let config = Arc::new(SessionConfig::default());
        let process = spawner.spawn(&config).await.unwrap();
        Session::start(
            SessionId::new(),
            config,
            process,
            Arc::new(SystemClock::new()),
            cancel_cfg,
        )
        .unwrap()
    }

    fn test_broadcaster() -> Arc<Broadcaster> {
        Broadcaster::new(
            RequestId::new(),
            256,
            Duration::from_millis(200),
            Arc::new(crate::metrics::NullMetricsSink),
        )
    }

    #[tokio::test]
    async fn completes_and_returns_to_idle() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        assert_eq!(session.state(), SessionState::Idle);

        let broadcaster = test_broadcaster();
        let mut sub = broadcaster.subscribe(BackpressurePolicy::DropOldest, 16);
        let request_id = RequestId::new();
        let outcome_rx = session
            .begin(request_id, "hello", broadcaster.clone())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Running { request_id });

        let mut engine = engines.recv().await.unwrap();
        let prompt: serde_json::Value =
            serde_json::from_str(&engine.next_prompt().await.unwrap()).unwrap();
        assert_eq!(prompt["type"], "user");
        assert_eq!(prompt["content"], "hello");

        engine.text("hi").await;
        engine.complete().await;

        let outcome = outcome_rx.await.unwrap();
        match outcome {
            AttemptOutcome::Completed { messages, terminal } => {
                assert_eq!(messages, 1);
                assert!(terminal.is_terminal());
            },
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Idle);

        let delivered = sub.recv().await.unwrap();
        assert!(matches!(delivered.payload, MessagePayload::Text { .. }));
    }

    #[tokio::test]
    async fn second_prompt_while_running_is_rejected() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        let _outcome = session
            .begin(RequestId::new(), "one", test_broadcaster())
            .await
            .unwrap();
        let err = session
            .begin(RequestId::new(), "two", test_broadcaster())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
        let _ = engines.recv().await.unwrap();
    }

    #[tokio::test]
    async fn engine_error_line_fails_request_but_keeps_session() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        let outcome_rx = session
            .begin(RequestId::new(), "spend", test_broadcaster())
            .await
            .unwrap();

        let engine = engines.recv().await.unwrap();
        engine.error("billing", "credit balance exhausted").await;

        match outcome_rx.await.unwrap() {
            AttemptOutcome::Failed { error, .. } => {
                assert!(matches!(error, EngineError::InsufficientCredits));
            },
            other => panic!("expected Failed, got {other:?}"),
        }
        // Credit exhaustion does not poison the process.
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn crash_mid_request_fails_and_closes() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        let outcome_rx = session
            .begin(RequestId::new(), "hello", test_broadcaster())
            .await
            .unwrap();

        let engine = engines.recv().await.unwrap();
        engine.text("partial").await;
        engine.exit(Some(137)).await;

        match outcome_rx.await.unwrap() {
            AttemptOutcome::Failed { error, messages } => {
                assert_eq!(messages, 1);
                assert!(matches!(
                    error,
                    EngineError::ProcessCrashed {
                        after_first_message: true,
                        ..
                    }
                ));
            },
            other => panic!("expected Failed, got {other:?}"),
        }
        // Router drains the Exited sentinel and lands in Closed.
        tokio::task::yield_now().await;
        assert!(matches!(session.state(), SessionState::Closed { .. }));
    }

    #[tokio::test]
    async fn auth_failure_in_stderr_is_fatal() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        let outcome_rx = session
            .begin(RequestId::new(), "hello", test_broadcaster())
            .await
            .unwrap();

        let engine = engines.recv().await.unwrap();
        engine.write_stderr("Authentication failed: token expired");
        engine.exit(Some(1)).await;

        match outcome_rx.await.unwrap() {
            AttemptOutcome::Failed { error, .. } => {
                assert!(matches!(error, EngineError::AuthFailed { .. }));
            },
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_cancel_is_forced_within_the_window() {
        let (spawner, mut engines) = MockSpawner::pair();
        spawner.set_default_behavior(MockBehavior::unresponsive());
        let session = started_session(&spawner, CancelConfig::default()).await;

        let request_id = RequestId::new();
        let outcome_rx = session
            .begin(request_id, "long task", test_broadcaster())
            .await
            .unwrap();
        let _engine = engines.recv().await.unwrap();

        let started = Instant::now();
        assert!(session.cancel(request_id, CancelReason::Caller).await);
        match outcome_rx.await.unwrap() {
            AttemptOutcome::Cancelled { reason, .. } => {
                assert_eq!(reason, CancelReason::Caller);
            },
            other => panic!("expected Cancelled, got {other:?}"),
        }
        // Bounded by grace (2s) + force (1s).
        assert!(started.elapsed() <= Duration::from_secs(3));
        tokio::task::yield_now().await;
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn cancel_of_unknown_request_is_refused() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;
        let _outcome = session
            .begin(RequestId::new(), "hello", test_broadcaster())
            .await
            .unwrap();
        let _ = engines.recv().await.unwrap();
        assert!(!session.cancel(RequestId::new(), CancelReason::Caller).await);
    }

    #[tokio::test]
    async fn sentinel_cancel_keeps_session_usable_when_engine_yields() {
        let (spawner, mut engines) = MockSpawner::pair();
        let cancel_cfg = CancelConfig {
            strategy: CancelStrategy::Sentinel,
            ..CancelConfig::default()
        };
        let session = started_session(&spawner, cancel_cfg).await;

        let request_id = RequestId::new();
        let outcome_rx = session
            .begin(request_id, "long task", test_broadcaster())
            .await
            .unwrap();
        let mut engine = engines.recv().await.unwrap();
        let _prompt = engine.next_prompt().await.unwrap();

        assert!(session.cancel(request_id, CancelReason::Caller).await);
        // The engine sees the sentinel and winds the turn down.
        let sentinel: serde_json::Value =
            serde_json::from_str(&engine.next_prompt().await.unwrap()).unwrap();
        assert_eq!(sentinel["type"], "cancel");
        engine.complete().await;

        assert!(matches!(
            outcome_rx.await.unwrap(),
            AttemptOutcome::Cancelled { .. }
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn close_stdin_cancel_poisons_the_session() {
        let (spawner, mut engines) = MockSpawner::pair();
        let session = started_session(&spawner, CancelConfig::default()).await;

        let request_id = RequestId::new();
        let outcome_rx = session
            .begin(request_id, "long task", test_broadcaster())
            .await
            .unwrap();
        let _engine = engines.recv().await.unwrap();

        assert!(session.cancel(request_id, CancelReason::Caller).await);
        // Default mock behavior: engine exits when stdin closes.
        assert!(matches!(
            outcome_rx.await.unwrap(),
            AttemptOutcome::Cancelled { .. }
        ));
        tokio::task::yield_now().await;
        assert!(!matches!(session.state(), SessionState::Idle));
    }
}
