//! Supervised subprocess transport for the agent CLI.
//!
//! [`ProcessTransport`] owns one spawned agent process and turns its stdout
//! into tagged [`IoMessage`]s delivered to bounded subscriber channels.
//! Compared to ad-hoc spawning it adds the supervision the SDK relies on:
//!
//! - stdout is split and decoded through [`crate::codec`], so partial reads,
//!   oversized lines, and undecodable lines surface as typed payloads
//!   instead of tearing the stream down;
//! - stderr accumulates in a capped ring that keeps the newest bytes;
//! - when the last subscriber goes away, a headless timeout elapses and the
//!   process is terminated rather than orphaned;
//! - shutdown escalates: end-of-input, then a termination signal after
//!   `grace`, then a hard kill.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};

use crate::codec::{self, LineBuffer, LineEvent};
use crate::error::{Error, Result};

/// How long a transport survives with no subscribers before it terminates
/// itself.
pub const DEFAULT_HEADLESS_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait after end-of-input before escalating to a termination signal.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Wait after the termination signal before escalating to a hard kill.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(2);

/// Cap on retained stderr bytes; the newest bytes win.
pub const DEFAULT_MAX_STDERR_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on concurrently attached subscribers.
pub const MAX_SUBSCRIBERS: usize = 8;

const SUBSCRIBER_CHANNEL_DEPTH: usize = 256;

/// What to launch. Environment pairs are layered over the inherited parent
/// environment.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

/// Decoded payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum IoPayload {
    /// One stdout line that decoded as JSON.
    Json(Value),
    /// The line buffer discarded an oversized line.
    Overflow { discarded: usize },
    /// One stdout line that was not valid JSON, truncated for reporting.
    DecodeFailure { excerpt: String },
    /// The process exited. Terminal: nothing follows it.
    Exit { status: ExitInfo },
}

/// Normalized exit status. Signal deaths map to `128 + signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A tagged message from one transport.
#[derive(Debug, Clone, PartialEq)]
pub struct IoMessage {
    /// Identifies the subscription the message was delivered through.
    pub tag: u64,
    pub payload: IoPayload,
}

/// Observable process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(ExitInfo),
}

/// A subscriber's receiving end.
#[derive(Debug)]
pub struct Subscription {
    pub tag: u64,
    rx: mpsc::Receiver<IoMessage>,
}

impl Subscription {
    /// Receive the next message; `None` after the transport shuts down and
    /// all pending messages were taken.
    pub async fn recv(&mut self) -> Option<IoMessage> {
        self.rx.recv().await
    }

    /// Discard every message currently queued, so a reused subscription
    /// cannot leak frames from an earlier turn into the next one.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

enum KillRequest {
    Terminate,
    Kill,
}

struct Inner {
    stdin: Mutex<Option<ChildStdin>>,
    // Sync mutex: never held across an await.
    subscribers: std::sync::Mutex<Vec<(u64, mpsc::Sender<IoMessage>)>>,
    stderr: std::sync::Mutex<VecDeque<u8>>,
    max_stderr: usize,
    status_tx: watch::Sender<ProcessStatus>,
    status_rx: watch::Receiver<ProcessStatus>,
    kill_tx: mpsc::UnboundedSender<KillRequest>,
    next_tag: AtomicU64,
    headless_timeout: Duration,
    pid: Option<u32>,
}

/// Handle to one supervised agent subprocess.
#[derive(Clone)]
pub struct ProcessTransport {
    inner: Arc<Inner>,
}

impl ProcessTransport {
    /// Spawn the process and attach the first subscriber.
    ///
    /// Exactly one subscriber exists from the start; more can be attached
    /// with [`subscribe`](Self::subscribe) up to [`MAX_SUBSCRIBERS`].
    pub fn spawn(spec: SpawnSpec) -> Result<(Self, Subscription)> {
        Self::spawn_with_headless_timeout(spec, DEFAULT_HEADLESS_TIMEOUT)
    }

    /// Spawn with an explicit headless timeout (tests shrink it).
    pub fn spawn_with_headless_timeout(
        spec: SpawnSpec,
        headless_timeout: Duration,
    ) -> Result<(Self, Subscription)> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::transport(format!("failed to spawn {}: {e}", spec.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("child stdout is unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::transport("child stderr is unavailable"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("child stdin is unavailable"))?;

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            stdin: Mutex::new(Some(stdin)),
            subscribers: std::sync::Mutex::new(Vec::new()),
            stderr: std::sync::Mutex::new(VecDeque::new()),
            max_stderr: DEFAULT_MAX_STDERR_BUFFER_SIZE,
            status_tx,
            status_rx,
            kill_tx,
            next_tag: AtomicU64::new(1),
            headless_timeout,
            pid: child.id(),
        });

        let transport = Self {
            inner: inner.clone(),
        };
        let subscription = transport.attach_subscriber()?;

        tokio::spawn(stderr_task(inner.clone(), stderr));
        tokio::spawn(reader_task(inner.clone(), stdout));
        tokio::spawn(headless_monitor(inner.clone()));
        tokio::spawn(waiter_task(inner, child, kill_rx));

        Ok((transport, subscription))
    }

    /// Attach an additional subscriber.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.attach_subscriber()
    }

    fn attach_subscriber(&self) -> Result<Subscription> {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("subscriber table poisoned");
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(Error::transport(format!(
                "subscriber limit reached ({MAX_SUBSCRIBERS})"
            )));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_DEPTH);
        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        subscribers.push((tag, tx));
        Ok(Subscription { tag, rx })
    }

    /// Write bytes to the agent's stdin.
    ///
    /// Fails with a `not connected` transport error once the process has
    /// exited or input was ended.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.status() != ProcessStatus::Running {
            return Err(Error::transport("not connected"));
        }
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::transport("not connected"))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close the agent's stdin, signalling end of input.
    pub async fn end_input(&self) {
        let mut guard = self.inner.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Current process status.
    pub fn status(&self) -> ProcessStatus {
        *self.inner.status_rx.borrow()
    }

    /// The retained stderr tail, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        let buf = self.inner.stderr.lock().expect("stderr lock poisoned");
        let (a, b) = buf.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Wait for the process to exit, returning its normalized status.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.inner.status_rx.clone();
        loop {
            if let ProcessStatus::Exited(info) = *rx.borrow() {
                return info;
            }
            if rx.changed().await.is_err() {
                return ExitInfo { code: -1 };
            }
        }
    }

    /// Escalating shutdown: end input and wait `grace`; signal termination
    /// and wait [`DEFAULT_TERM_GRACE`]; then hard-kill.
    pub async fn close(&self, grace: Duration) -> ExitInfo {
        self.end_input().await;
        if let Ok(info) = tokio::time::timeout(grace, self.wait_exit()).await {
            return info;
        }
        debug!("agent did not exit after end-of-input; sending terminate signal");
        let _ = self.inner.kill_tx.send(KillRequest::Terminate);
        if let Ok(info) = tokio::time::timeout(DEFAULT_TERM_GRACE, self.wait_exit()).await {
            return info;
        }
        warn!("agent ignored terminate signal; killing");
        self.force_close().await
    }

    /// Skip straight to the hard kill.
    pub async fn force_close(&self) -> ExitInfo {
        let _ = self.inner.kill_tx.send(KillRequest::Kill);
        self.wait_exit().await
    }
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("pid", &self.inner.pid)
            .field("status", &*self.inner.status_rx.borrow())
            .finish()
    }
}

async fn reader_task(inner: Arc<Inner>, mut stdout: tokio::process::ChildStdout) {
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 8 * 1024];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for event in buffer.push(&chunk[..n]) {
                    fan_out(&inner, line_event_to_payload(event)).await;
                }
            }
            Err(e) => {
                debug!("stdout read failed: {e}");
                break;
            }
        }
    }

    if let Some(event) = buffer.finish() {
        fan_out(&inner, line_event_to_payload(event)).await;
    }

    // The exit payload is delivered by the waiter once the status is known.
}

fn line_event_to_payload(event: LineEvent) -> IoPayload {
    match event {
        LineEvent::Line(line) => match codec::decode_line(&line) {
            Ok(value) => IoPayload::Json(value),
            Err(_) => IoPayload::DecodeFailure {
                excerpt: codec::decode_excerpt(&line),
            },
        },
        LineEvent::Overflow { discarded } => IoPayload::Overflow { discarded },
    }
}

async fn fan_out(inner: &Arc<Inner>, payload: IoPayload) {
    let senders: Vec<(u64, mpsc::Sender<IoMessage>)> = {
        let subscribers = inner
            .subscribers
            .lock()
            .expect("subscriber table poisoned");
        subscribers.clone()
    };

    let mut any_dead = false;
    for (tag, sender) in &senders {
        let message = IoMessage {
            tag: *tag,
            payload: payload.clone(),
        };
        // Bounded send: a slow consumer backpressures the reader.
        if sender.send(message).await.is_err() {
            any_dead = true;
        }
    }

    if any_dead {
        let mut subscribers = inner
            .subscribers
            .lock()
            .expect("subscriber table poisoned");
        subscribers.retain(|(_, s)| !s.is_closed());
    }
}

/// Terminate the process once every subscriber has been gone for the
/// headless timeout, so the agent never outlives its audience.
async fn headless_monitor(inner: Arc<Inner>) {
    let tick = (inner.headless_timeout / 4).max(Duration::from_millis(10));
    let mut headless_since: Option<Instant> = None;
    loop {
        if !matches!(*inner.status_rx.borrow(), ProcessStatus::Running) {
            return;
        }
        let headless = {
            let subscribers = inner
                .subscribers
                .lock()
                .expect("subscriber table poisoned");
            subscribers.iter().all(|(_, s)| s.is_closed())
        };
        if headless {
            let since = *headless_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= inner.headless_timeout {
                warn!(
                    "transport headless for {:?}; terminating",
                    inner.headless_timeout
                );
                let _ = inner.kill_tx.send(KillRequest::Kill);
                return;
            }
        } else {
            headless_since = None;
        }
        tokio::time::sleep(tick).await;
    }
}

async fn stderr_task(inner: Arc<Inner>, mut stderr: tokio::process::ChildStderr) {
    let mut chunk = [0u8; 4 * 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = inner.stderr.lock().expect("stderr lock poisoned");
                buf.extend(&chunk[..n]);
                while buf.len() > inner.max_stderr {
                    buf.pop_front();
                }
            }
        }
    }
}

async fn waiter_task(
    inner: Arc<Inner>,
    mut child: tokio::process::Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillRequest>,
) {
    let mut pending: Option<KillRequest> = None;
    let status = loop {
        if let Some(request) = pending.take() {
            apply_kill(&mut child, inner.pid, request);
        }
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv() => {
                // recv() cannot return None while this task holds `inner`
                // (and with it the sender); treat it as a spurious wakeup.
                pending = request;
            }
        }
    };

    let info = match status {
        Ok(status) => ExitInfo {
            code: normalize_exit_status(status),
        },
        Err(e) => {
            warn!("wait() on agent process failed: {e}");
            ExitInfo { code: -1 }
        }
    };

    let _ = inner.status_tx.send(ProcessStatus::Exited(info));
    fan_out(&inner, IoPayload::Exit { status: info }).await;

    // Closing the senders lets subscribers observe end-of-stream after the
    // exit message.
    inner
        .subscribers
        .lock()
        .expect("subscriber table poisoned")
        .clear();
}

fn apply_kill(child: &mut tokio::process::Child, pid: Option<u32>, request: KillRequest) {
    match request {
        KillRequest::Terminate => {
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                    return;
                }
            }
            let _ = pid;
            let _ = child.start_kill();
        }
        KillRequest::Kill => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn normalize_exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn normalize_exit_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> SpawnSpec {
        let mut spec = SpawnSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), script.to_string()];
        spec
    }

    #[tokio::test]
    async fn test_spawn_reads_json_lines() {
        let (transport, mut sub) =
            ProcessTransport::spawn(sh(r#"printf '{"a":1}\n{"b":2}\n'"#)).unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload, IoPayload::Json(serde_json::json!({"a": 1})));
        let second = sub.recv().await.unwrap();
        assert_eq!(second.payload, IoPayload::Json(serde_json::json!({"b": 2})));

        let exit = sub.recv().await.unwrap();
        assert_eq!(
            exit.payload,
            IoPayload::Exit {
                status: ExitInfo { code: 0 }
            }
        );
        assert_eq!(
            transport.status(),
            ProcessStatus::Exited(ExitInfo { code: 0 })
        );
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_kill_stream() {
        let (_transport, mut sub) =
            ProcessTransport::spawn(sh(r#"printf 'not json\n{"ok":true}\n'"#)).unwrap();

        let first = sub.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            IoPayload::DecodeFailure { ref excerpt } if excerpt == "not json"
        ));
        let second = sub.recv().await.unwrap();
        assert_eq!(
            second.payload,
            IoPayload::Json(serde_json::json!({"ok": true}))
        );
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let (transport, mut sub) =
            ProcessTransport::spawn(sh("echo oops >&2; exit 3")).unwrap();

        let exit = sub.recv().await.unwrap();
        assert_eq!(
            exit.payload,
            IoPayload::Exit {
                status: ExitInfo { code: 3 }
            }
        );
        // stderr task races the exit notification by a hair.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.stderr_tail().contains("oops"));
    }

    #[tokio::test]
    async fn test_send_and_end_input() {
        let (transport, mut sub) = ProcessTransport::spawn(sh("cat")).unwrap();

        transport.send(b"{\"echo\":1}\n").await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, IoPayload::Json(serde_json::json!({"echo": 1})));

        transport.end_input().await;
        let exit = sub.recv().await.unwrap();
        assert!(matches!(exit.payload, IoPayload::Exit { status } if status.success()));

        // After exit, send reports not-connected.
        let err = transport.send(b"late\n").await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_close_escalates_to_kill() {
        // Ignores EOF on stdin and sleeps; close() must escalate.
        let (transport, _sub) =
            ProcessTransport::spawn(sh("trap '' TERM; sleep 30")).unwrap();

        let info = transport.close(Duration::from_millis(100)).await;
        assert!(!info.success());
        // SIGKILL normalizes to 137.
        assert_eq!(info.code, 137);
    }

    #[tokio::test]
    async fn test_force_close() {
        let (transport, _sub) = ProcessTransport::spawn(sh("sleep 30")).unwrap();
        let info = transport.force_close().await;
        assert_eq!(info.code, 137);
    }

    #[tokio::test]
    async fn test_headless_termination() {
        let (transport, sub) = ProcessTransport::spawn_with_headless_timeout(
            sh("sleep 30"),
            Duration::from_millis(100),
        )
        .unwrap();

        drop(sub);
        // Trigger fan-out so subscriber death is observed.
        let info = tokio::time::timeout(Duration::from_secs(5), transport.wait_exit())
            .await
            .expect("headless transport should have terminated");
        assert!(!info.success());
    }

    #[tokio::test]
    async fn test_subscription_drain() {
        let (_transport, mut sub) =
            ProcessTransport::spawn(sh(r#"printf '{"n":1}\n{"n":2}\n{"n":3}\n'"#)).unwrap();

        // Let the reader flush everything into the channel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let drained = sub.drain();
        assert!(drained >= 3, "expected at least 3 drained, got {drained}");
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let (transport, _sub) = ProcessTransport::spawn(sh("sleep 5")).unwrap();
        let mut extras = Vec::new();
        for _ in 0..(MAX_SUBSCRIBERS - 1) {
            extras.push(transport.subscribe().unwrap());
        }
        assert!(transport.subscribe().is_err());
        transport.force_close().await;
    }
}
