//! In-memory mock spawner for tests and simulations
//!
//! Each spawn hands the test a [`ScriptedEngine`]: the test plays the engine
//! side of the wire (emit lines, exit, hang) and observes everything the
//! system wrote to the process.

use super::ProcessSpawner;
use crate::errors::{EngineError, Result};
use crate::process::{ExitInfo, ProcessEvent, ProcessHandle, SharedStderr, StderrTail};
use crate::types::SessionConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// How one mock engine behaves.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fail the spawn itself with this detail
    pub fail_spawn: Option<String>,
    /// Exit with code 0 when stdin is closed (the real engine does)
    pub exit_on_stdin_close: bool,
    /// Exit (signal death, code `None`) when any signal is delivered
    pub die_on_signal: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_spawn: None,
            exit_on_stdin_close: true,
            die_on_signal: true,
        }
    }
}

impl MockBehavior {
    /// Behavior whose spawn fails
    pub fn fail_spawn(detail: impl Into<String>) -> Self {
        Self {
            fail_spawn: Some(detail.into()),
            ..Self::default()
        }
    }

    /// Behavior that ignores stdin closure; only signals kill it
    pub fn unresponsive() -> Self {
        Self {
            exit_on_stdin_close: false,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct ExitDriver {
    exited: Arc<AtomicBool>,
    exit_tx: Arc<watch::Sender<Option<ExitInfo>>>,
    event_tx: mpsc::Sender<ProcessEvent>,
    stderr: SharedStderr,
}

impl ExitDriver {
    async fn exit(&self, code: Option<i32>) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        let tail = self.stderr.lock().expect("stderr tail poisoned").snapshot();
        let _ = self.exit_tx.send(Some(ExitInfo { code }));
        let _ = self
            .event_tx
            .send(ProcessEvent::Exited {
                code,
                stderr_tail: tail,
            })
            .await;
    }
}

/// Test-side controls for one spawned mock engine.
pub struct ScriptedEngine {
    /// Zero-based spawn ordinal across the owning spawner
    pub spawn_index: usize,
    /// The config the session was spawned with
    pub config: SessionConfig,
    event_tx: mpsc::Sender<ProcessEvent>,
    prompts: mpsc::UnboundedReceiver<String>,
    signals: Arc<Mutex<Vec<i32>>>,
    driver: ExitDriver,
}

impl ScriptedEngine {
    /// Emit one raw stdout line
    pub async fn emit_raw(&self, line: &str) {
        let _ = self
            .event_tx
            .send(ProcessEvent::Line(line.as_bytes().to_vec()))
            .await;
    }

    /// Emit one JSON object line
    pub async fn emit_json(&self, value: Value) {
        self.emit_raw(&value.to_string()).await;
    }

    /// Emit a `text` message
    pub async fn text(&self, content: &str) {
        self.emit_json(json!({"type": "text", "text": content})).await;
    }

    /// Emit the terminal `complete` message
    pub async fn complete(&self) {
        self.emit_json(json!({"type": "complete"})).await;
    }

    /// Emit an `error` message
    pub async fn error(&self, code: &str, message: &str) {
        self.emit_json(json!({"type": "error", "code": code, "message": message}))
            .await;
    }

    /// Append a line to the captured stderr tail
    pub fn write_stderr(&self, line: &str) {
        self.driver
            .stderr
            .lock()
            .expect("stderr tail poisoned")
            .push_line(line);
    }

    /// Next prompt line written to the engine's stdin
    pub async fn next_prompt(&mut self) -> Option<String> {
        self.prompts.recv().await
    }

    /// Make the engine exit
    pub async fn exit(&self, code: Option<i32>) {
        self.driver.exit(code).await;
    }

    /// Signals delivered to the process group so far
    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().expect("signal log poisoned").clone()
    }
}

/// [`ProcessSpawner`] that manufactures scripted engines.
pub struct MockSpawner {
    engines_tx: mpsc::UnboundedSender<ScriptedEngine>,
    behaviors: Mutex<VecDeque<MockBehavior>>,
    default_behavior: Mutex<MockBehavior>,
    spawned: AtomicUsize,
}

impl MockSpawner {
    /// Create a spawner and the receiver tests take engines from
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedEngine>) {
        let (engines_tx, engines_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                engines_tx,
                behaviors: Mutex::new(VecDeque::new()),
                default_behavior: Mutex::new(MockBehavior::default()),
                spawned: AtomicUsize::new(0),
            }),
            engines_rx,
        )
    }

    /// Queue a behavior for the next spawn; falls back to the default after
    /// the queue drains
    pub fn push_behavior(&self, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .expect("behavior queue poisoned")
            .push_back(behavior);
    }

    /// Replace the default behavior
    pub fn set_default_behavior(&self, behavior: MockBehavior) {
        *self.default_behavior.lock().expect("behavior poisoned") = behavior;
    }

    /// Number of spawn attempts so far (including failed ones)
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        self.behaviors
            .lock()
            .expect("behavior queue poisoned")
            .pop_front()
            .unwrap_or_else(|| self.default_behavior.lock().expect("behavior poisoned").clone())
    }
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    async fn spawn(&self, config: &SessionConfig) -> Result<ProcessHandle> {
        let spawn_index = self.spawned.fetch_add(1, Ordering::SeqCst);
        let behavior = self.next_behavior();
        if let Some(detail) = behavior.fail_spawn {
            return Err(EngineError::SpawnFailed { detail });
        }

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(1);
        let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(64);
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<i32>();
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel::<String>();
        let stderr: SharedStderr = Arc::new(Mutex::new(StderrTail::new(64 * 1024)));
        let signals = Arc::new(Mutex::new(Vec::new()));

        let driver = ExitDriver {
            exited: Arc::new(AtomicBool::new(false)),
            exit_tx: Arc::new(exit_tx),
            event_tx: event_tx.clone(),
            stderr: stderr.clone(),
        };

        // Stdin forwarder: observes prompts, simulates exit-on-EOF.
        let forward_driver = driver.clone();
        let exit_on_stdin_close = behavior.exit_on_stdin_close;
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                let _ = prompt_tx.send(line);
            }
            if exit_on_stdin_close {
                forward_driver.exit(Some(0)).await;
            }
        });

        // Signal handler: records deliveries, simulates signal death.
        let signal_driver = driver.clone();
        let signal_log = signals.clone();
        let die_on_signal = behavior.die_on_signal;
        tokio::spawn(async move {
            while let Some(sig) = signal_rx.recv().await {
                signal_log.lock().expect("signal log poisoned").push(sig);
                if die_on_signal {
                    signal_driver.exit(None).await;
                }
            }
        });

        let engine = ScriptedEngine {
            spawn_index,
            config: config.clone(),
            event_tx,
            prompts: prompt_rx,
            signals,
            driver,
        };
        let _ = self.engines_tx.send(engine);

        Ok(ProcessHandle::from_parts(
            None,
            stdin_tx,
            event_rx,
            exit_rx,
            stderr,
            Some(signal_tx),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CloseMode;
    use std::time::Duration;

    #[tokio::test]
    async fn scripted_round_trip() {
        let (spawner, mut engines) = MockSpawner::pair();
        let handle = spawner.spawn(&SessionConfig::default()).await.unwrap();
        let mut engine = engines.recv().await.unwrap();
        assert_eq!(engine.spawn_index, 0);

        handle.write_line(r#"{"type":"user","content":"hi"}"#.into()).unwrap();
        assert_eq!(
            engine.next_prompt().await.as_deref(),
            Some(r#"{"type":"user","content":"hi"}"#)
        );

        engine.text("hello").await;
        engine.complete().await;

        let mut events = handle.take_events().unwrap();
        assert!(matches!(events.recv().await, Some(ProcessEvent::Line(_))));
        assert!(matches!(events.recv().await, Some(ProcessEvent::Line(_))));

        engine.exit(Some(0)).await;
        assert!(matches!(
            events.recv().await,
            Some(ProcessEvent::Exited { code: Some(0), .. })
        ));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn spawn_failure_behavior() {
        let (spawner, _engines) = MockSpawner::pair();
        spawner.push_behavior(MockBehavior::fail_spawn("engine missing"));
        let err = spawner.spawn(&SessionConfig::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailed { .. }));
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn graceful_close_exits_on_stdin_close() {
        let (spawner, mut engines) = MockSpawner::pair();
        let handle = spawner.spawn(&SessionConfig::default()).await.unwrap();
        let _engine = engines.recv().await.unwrap();

        handle
            .close(
                CloseMode::Graceful,
                Duration::from_secs(1),
                Duration::from_millis(100),
            )
            .await;
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn unresponsive_engine_dies_on_signal() {
        let (spawner, mut engines) = MockSpawner::pair();
        spawner.set_default_behavior(MockBehavior::unresponsive());
        let handle = spawner.spawn(&SessionConfig::default()).await.unwrap();
        let engine = engines.recv().await.unwrap();

        handle
            .close(
                CloseMode::Graceful,
                Duration::from_millis(50),
                Duration::from_millis(100),
            )
            .await;
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_code(), None);
        assert_eq!(engine.signals(), vec![libc::SIGTERM]);
    }
}
