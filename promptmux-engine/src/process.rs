//! Engine child-process supervision
//!
//! One [`ProcessHandle`] owns one engine child: a writer task feeds stdin from
//! a capacity-1 channel, a monitor task reads line-framed stdout with a hard
//! per-line cap and reaps the child, and stderr is collected into a bounded
//! tail for error diagnosis. Teardown signals the whole process group so
//! descendants cannot outlive the session.

use crate::errors::{EngineError, Result};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Hard cap on one stdout line; longer lines abort the stream
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
/// Retained stderr tail for diagnosis
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;
/// Default wait for natural exit after closing stdin
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// Default wait between SIGTERM and SIGKILL
pub const DEFAULT_FORCE: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a process emits towards its consuming session
#[derive(Debug)]
pub enum ProcessEvent {
    /// One newline-terminated stdout line, newline stripped
    Line(Vec<u8>),
    /// The stdout stream broke protocol; no further lines follow
    StreamError(EngineError),
    /// Terminal sentinel: the child exited
    Exited {
        /// Exit code; `None` when killed by signal
        code: Option<i32>,
        /// Snapshot of the stderr tail at exit
        stderr_tail: String,
    },
}

/// How to tear a process down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Close stdin and wait for natural exit before escalating
    Graceful,
    /// Signal the process group immediately
    Forced,
}

/// Recorded exit of the child
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by signal
    pub code: Option<i32>,
}

/// Bounded ring of recent stderr output.
#[derive(Debug)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    cap: usize,
}

impl StderrTail {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            cap,
        }
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        self.buf.extend(line.as_bytes());
        self.buf.push_back(b'\n');
        while self.buf.len() > self.cap {
            self.buf.pop_front();
        }
    }

    /// Current tail contents, lossily decoded
    pub fn snapshot(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut out = String::from_utf8_lossy(a).into_owned();
        out.push_str(&String::from_utf8_lossy(b));
        out
    }
}

pub(crate) type SharedStderr = Arc<Mutex<StderrTail>>;

const AUTH_PATTERNS: &[&str] = &["authentication", "unauthorized", "api key", "invalid token"];
const CREDIT_PATTERNS: &[&str] = &["insufficient credit", "credit balance", "out of credits"];

/// Scan a stderr tail for failures the engine reports out-of-band.
///
/// Authentication failures must invalidate the session and are never retried,
/// so they are detected here rather than trusted to appear on stdout.
pub fn classify_stderr(tail: &str) -> Option<EngineError> {
    for line in tail.lines() {
        let lower = line.to_lowercase();
        if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Some(EngineError::AuthFailed {
                detail: line.trim().to_string(),
            });
        }
        if CREDIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Some(EngineError::InsufficientCredits);
        }
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    /// A complete line was read into the buffer
    Line,
    /// End of stream with no pending data
    Eof,
    /// The line exceeded the cap before a newline was seen
    TooLong,
}

/// Read one newline-terminated line without ever buffering more than `max`
/// bytes of it. The trailing newline is consumed but not stored. A final
/// unterminated line at EOF is returned as a line.
pub(crate) async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead> {
    line.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if line.len() + pos > max {
                    reader.consume(pos + 1);
                    return Ok(LineRead::TooLong);
                }
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                return Ok(LineRead::Line);
            },
            None => {
                let n = available.len();
                if line.len() + n > max {
                    reader.consume(n);
                    return Ok(LineRead::TooLong);
                }
                line.extend_from_slice(available);
                reader.consume(n);
            },
        }
    }
}

/// Cheap clonable teardown capability for a process, usable without access to
/// the owning [`ProcessHandle`] (the session's cancel watchdog holds one).
#[derive(Clone)]
pub struct ProcessTeardown {
    pid: Option<u32>,
    signal_tx: Option<mpsc::UnboundedSender<i32>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessTeardown {
    /// Whether the child has not exited yet
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    fn signal(&self, sig: i32) {
        if let Some(ref tx) = self.signal_tx {
            let _ = tx.send(sig);
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // Negative of the pgid is implied by killpg; the child was made a
            // group leader at spawn.
            unsafe {
                libc::killpg(pid as i32, sig);
            }
        }
    }

    async fn wait_exit(&self, window: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        if rx.borrow().is_some() {
            return true;
        }
        tokio::time::timeout(window, async {
            while rx.changed().await.is_ok() {
                if rx.borrow().is_some() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// SIGTERM the process group, wait `force`, then SIGKILL.
    pub async fn force_close(&self, force: Duration) {
        if !self.is_alive() {
            return;
        }
        self.signal(libc::SIGTERM);
        if self.wait_exit(force).await {
            return;
        }
        warn!(pid = ?self.pid, "process ignored SIGTERM, sending SIGKILL");
        self.signal(libc::SIGKILL);
        let _ = self.wait_exit(Duration::from_secs(1)).await;
    }
}

/// Handle to one live engine child.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    events: Mutex<Option<mpsc::Receiver<ProcessEvent>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stderr: SharedStderr,
    signal_tx: Option<mpsc::UnboundedSender<i32>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

impl ProcessHandle {
    pub(crate) fn from_parts(
        pid: Option<u32>,
        stdin_tx: mpsc::Sender<String>,
        events: mpsc::Receiver<ProcessEvent>,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
        stderr: SharedStderr,
        signal_tx: Option<mpsc::UnboundedSender<i32>>,
    ) -> Self {
        Self {
            pid,
            stdin_tx: Mutex::new(Some(stdin_tx)),
            events: Mutex::new(Some(events)),
            exit_rx,
            stderr,
            signal_tx,
        }
    }

    /// OS process id, when backed by a real child
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has not exited yet
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code once the child has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_rx.borrow().and_then(|info| info.code)
    }

    /// Current stderr tail
    pub fn stderr_snapshot(&self) -> String {
        self.stderr.lock().expect("stderr tail poisoned").snapshot()
    }

    /// Take the event stream. Yields `None` after the first call: the stream
    /// is consumed by exactly one session.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.events.lock().expect("events slot poisoned").take()
    }

    /// Queue one line for the child's stdin.
    ///
    /// The channel holds at most one outstanding prompt; a second write while
    /// one is queued is an invariant violation upstream.
    pub fn write_line(&self, line: String) -> Result<()> {
        if let Some(info) = *self.exit_rx.borrow() {
            return Err(EngineError::ProcessCrashed {
                exit_code: info.code,
                after_first_message: false,
            });
        }
        let guard = self.stdin_tx.lock().expect("stdin slot poisoned");
        let tx = guard
            .as_ref()
            .ok_or_else(|| EngineError::internal("stdin already closed"))?;
        tx.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::internal("a prompt is already outstanding on this process")
            },
            mpsc::error::TrySendError::Closed(_) => EngineError::ProcessCrashed {
                exit_code: self.exit_code(),
                after_first_message: false,
            },
        })
    }

    /// Close the child's stdin. Idempotent.
    pub fn close_stdin(&self) {
        self.stdin_tx.lock().expect("stdin slot poisoned").take();
    }

    /// Teardown capability detached from this handle
    pub fn teardown(&self) -> ProcessTeardown {
        ProcessTeardown {
            pid: self.pid,
            signal_tx: self.signal_tx.clone(),
            exit_rx: self.exit_rx.clone(),
        }
    }

    /// Tear the child down.
    ///
    /// `Graceful` closes stdin and waits up to `grace` for natural exit before
    /// escalating; escalation SIGTERMs the process group, waits `force`, then
    /// SIGKILLs.
    pub async fn close(&self, mode: CloseMode, grace: Duration, force: Duration) {
        let teardown = self.teardown();
        if !teardown.is_alive() {
            self.close_stdin();
            return;
        }
        if mode == CloseMode::Graceful {
            self.close_stdin();
            if teardown.wait_exit(grace).await {
                return;
            }
            debug!(pid = ?self.pid, "graceful close timed out, escalating");
        }
        teardown.force_close(force).await;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Last-resort reaping when the owner vanished without closing.
        if self.exit_rx.borrow().is_none() {
            self.teardown().signal(libc::SIGKILL);
        }
    }
}

/// Spawn the prepared command and wire up the supervision tasks.
pub(crate) fn launch(mut cmd: Command, max_line_bytes: usize) -> Result<ProcessHandle> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| EngineError::SpawnFailed {
        detail: e.to_string(),
    })?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::internal("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::internal("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::internal("child stderr not captured"))?;

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(1);
    let (event_tx, event_rx) = mpsc::channel::<ProcessEvent>(EVENT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
    let stderr_tail: SharedStderr = Arc::new(Mutex::new(StderrTail::new(STDERR_TAIL_BYTES)));

    // Stdin writer: drains the prompt channel until it is closed.
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("failed to write to engine stdin: {e}");
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("failed to write newline to engine stdin: {e}");
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("failed to flush engine stdin: {e}");
                break;
            }
        }
        // Dropping stdin here closes the pipe.
    });

    // Stderr collector: retains a bounded tail for post-mortem classification.
    let tail_for_collector = stderr_tail.clone();
    let stderr_task = tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            debug!("engine stderr: {line}");
            tail_for_collector
                .lock()
                .expect("stderr tail poisoned")
                .push_line(&line);
        }
    });

    // Monitor: reads stdout line by line, then reaps the child and emits the
    // terminal Exited sentinel.
    let tail_for_monitor = stderr_tail.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            match read_line_bounded(&mut reader, &mut line, max_line_bytes).await {
                Ok(LineRead::Line) => {
                    if event_tx.send(ProcessEvent::Line(line.clone())).await.is_err() {
                        break;
                    }
                },
                Ok(LineRead::Eof) => break,
                Ok(LineRead::TooLong) => {
                    let _ = event_tx
                        .send(ProcessEvent::StreamError(EngineError::stream_protocol(
                            format!("stdout line exceeds {max_line_bytes} bytes"),
                        )))
                        .await;
                    break;
                },
                Err(e) => {
                    let _ = event_tx
                        .send(ProcessEvent::StreamError(EngineError::stream_protocol(
                            format!("stdout read failed: {e}"),
                        )))
                        .await;
                    break;
                },
            }
        }

        // The child may still be running after a protocol abort; wait() then
        // returns once teardown signals the group.
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!("failed to reap engine process: {e}");
                None
            },
        };
        // Let the stderr collector drain the pipe before snapshotting.
        let _ = tokio::time::timeout(Duration::from_millis(500), stderr_task).await;
        let tail = tail_for_monitor
            .lock()
            .expect("stderr tail poisoned")
            .snapshot();
        debug!(?code, "engine process exited");
        let _ = exit_tx.send(Some(ExitInfo { code }));
        let _ = event_tx
            .send(ProcessEvent::Exited {
                code,
                stderr_tail: tail,
            })
            .await;
    });

    Ok(ProcessHandle::from_parts(
        pid,
        stdin_tx,
        event_rx,
        exit_rx,
        stderr_tail,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn read_all(input: &[u8], max: usize) -> Vec<(LineRead, Vec<u8>)> {
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        let mut line = Vec::new();
        let mut out = Vec::new();
        loop {
            let kind = read_line_bounded(&mut reader, &mut line, max).await.unwrap();
            let stop = kind != LineRead::Line;
            out.push((kind, line.clone()));
            if stop {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn reads_lines_and_eof() {
        let got = read_all(b"alpha\nbeta\n", 64).await;
        assert_eq!(got[0], (LineRead::Line, b"alpha".to_vec()));
        assert_eq!(got[1], (LineRead::Line, b"beta".to_vec()));
        assert_eq!(got[2].0, LineRead::Eof);
    }

    #[tokio::test]
    async fn final_unterminated_line_is_returned() {
        let got = read_all(b"alpha\ntail", 64).await;
        assert_eq!(got[1], (LineRead::Line, b"tail".to_vec()));
        assert_eq!(got[2].0, LineRead::Eof);
    }

    #[tokio::test]
    async fn line_of_exactly_max_parses() {
        let input = [vec![b'x'; 16], b"\n".to_vec()].concat();
        let got = read_all(&input, 16).await;
        assert_eq!(got[0].0, LineRead::Line);
        assert_eq!(got[0].1.len(), 16);
    }

    #[tokio::test]
    async fn line_of_max_plus_one_is_too_long() {
        let input = [vec![b'x'; 17], b"\n".to_vec()].concat();
        let got = read_all(&input, 16).await;
        assert_eq!(got[0].0, LineRead::TooLong);
    }

    #[tokio::test]
    async fn oversized_line_without_newline_is_too_long() {
        // No newline in the whole stream; must not buffer unboundedly.
        let input = vec![b'x'; 64];
        let got = read_all(&input, 16).await;
        assert_eq!(got[0].0, LineRead::TooLong);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::new(16);
        tail.push_line("aaaaaaaaaa");
        tail.push_line("bbbbbbbbbb");
        let snap = tail.snapshot();
        assert!(snap.len() <= 16);
        assert!(snap.contains("bbbbbbbbbb"));
    }

    #[test]
    fn classify_auth_failure() {
        let err = classify_stderr("Authentication failed: token expired\n").unwrap();
        assert!(matches!(err, EngineError::AuthFailed { .. }));

        let err = classify_stderr("request rejected: Unauthorized\n").unwrap();
        assert!(matches!(err, EngineError::AuthFailed { .. }));
    }

    #[test]
    fn classify_credit_exhaustion() {
        let err = classify_stderr("error: insufficient credit balance\n").unwrap();
        assert!(matches!(err, EngineError::InsufficientCredits));
    }

    #[test]
    fn ordinary_stderr_is_not_classified() {
        assert!(classify_stderr("warning: slow startup\n").is_none());
        assert!(classify_stderr("").is_none());
    }

    #[tokio::test]
    async fn write_line_fails_after_exit() {
        let (stdin_tx, _stdin_rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(Some(ExitInfo { code: Some(0) }));
        let handle = ProcessHandle::from_parts(
            None,
            stdin_tx,
            event_rx,
            exit_rx,
            Arc::new(Mutex::new(StderrTail::new(64))),
            None,
        );
        let err = handle.write_line("hello".into()).unwrap_err();
        assert!(matches!(err, EngineError::ProcessCrashed { .. }));
        drop(exit_tx);
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let (stdin_tx, _stdin_rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::channel(4);
        let (_exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle::from_parts(
            None,
            stdin_tx,
            event_rx,
            exit_rx,
            Arc::new(Mutex::new(StderrTail::new(64))),
            None,
        );
        assert!(handle.take_events().is_some());
        assert!(handle.take_events().is_none());
    }
}
