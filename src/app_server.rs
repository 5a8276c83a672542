//! Persistent JSON-RPC transport against `codex app-server`.
//!
//! One connection speaks newline-delimited JSON-RPC over the agent's stdio
//! and multiplexes any number of threads and turns:
//!
//! - client requests carry an integer `id` and are correlated to responses
//!   through a pending map; a dedicated writer task serializes frames so
//!   concurrent requests never interleave bytes on the pipe;
//! - notifications are decoded through [`crate::events`] and fanned out to
//!   per-thread subscriptions by `threadId`;
//! - server-initiated requests (approval flows) are routed to the thread's
//!   [`ApprovalMediator`] and answered with the wire decision.
//!
//! The connection state machine is `Connecting` → `Ready` ⇄ `Draining`,
//! with `Failed` on initialize timeout, transport exit, or an unrecoverable
//! decode error. [`AppServerConnection::over_streams`] builds a connection
//! on any byte pair, which is how the test suite scripts the server side.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::approval::{ApprovalMediator, CommandApprovalRequest, FileChangeApprovalRequest};
use crate::error::{Error, Result};
use crate::events::ThreadEvent;
use crate::options::CodexOptions;
use crate::process::{IoPayload, ProcessTransport, SpawnSpec};
use crate::telemetry::{self, events as tevents};

/// How long the `initialize` handshake may take.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

const THREAD_CHANNEL_DEPTH: usize = 256;
const WRITER_CHANNEL_DEPTH: usize = 64;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Draining,
    Failed,
}

enum RpcReply {
    Result(Value),
    Error { code: i64, message: String },
}

struct ConnectionInner {
    writer_tx: mpsc::Sender<String>,
    pending: Mutex<HashMap<i64, oneshot::Sender<RpcReply>>>,
    threads: Mutex<HashMap<String, mpsc::Sender<ThreadEvent>>>,
    approvals: Mutex<HashMap<String, ApprovalMediator>>,
    default_approval: Mutex<ApprovalMediator>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    next_id: AtomicI64,
    user_agent: std::sync::Mutex<Option<String>>,
    process: Option<Arc<ProcessTransport>>,
}

/// Shared handle to one app-server session. Cloning is cheap; all clones
/// speak through the same connection. Release with [`close`](Self::close).
#[derive(Clone)]
pub struct AppServerConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for AppServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServerConnection")
            .field("state", &self.state())
            .finish()
    }
}

impl AppServerConnection {
    /// Spawn `codex app-server` and complete the handshake.
    pub async fn connect(options: &CodexOptions) -> Result<AppServerConnection> {
        let program = options
            .codex_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("codex"));
        let mut spec = SpawnSpec::new(program.display().to_string());
        spec.args = vec!["app-server".to_string()];
        if let Some(base_url) = &options.base_url {
            spec.env
                .push((crate::config::BASE_URL_ENV.to_string(), base_url.clone()));
        }
        if let Some(api_key) = &options.api_key {
            spec.env
                .push(("CODEX_API_KEY".to_string(), api_key.clone()));
            spec.env
                .push(("OPENAI_API_KEY".to_string(), api_key.clone()));
        }

        let (transport, subscription) = ProcessTransport::spawn(spec)?;
        let transport = Arc::new(transport);

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(WRITER_CHANNEL_DEPTH);
        let inner = Self::build_inner(writer_tx, Some(transport.clone()));

        // Writer task: the only code that touches the agent's stdin.
        let writer_transport = transport.clone();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if writer_transport.send(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: decoded JSON lines arrive as transport messages.
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(message) = subscription.recv().await {
                match message.payload {
                    IoPayload::Json(value) => dispatch_line(&reader_inner, value).await,
                    IoPayload::DecodeFailure { excerpt } => {
                        debug!("app-server emitted undecodable line: {excerpt}");
                    }
                    IoPayload::Overflow { discarded } => {
                        warn!("app-server line overflow, {discarded} bytes dropped");
                    }
                    IoPayload::Exit { .. } => break,
                }
            }
            connection_lost(&reader_inner).await;
        });

        let connection = AppServerConnection { inner };
        connection.initialize().await?;
        Ok(connection)
    }

    /// Build a connection over an arbitrary byte pair (tests, embedding).
    /// Performs the same `initialize` handshake as [`connect`](Self::connect).
    pub async fn over_streams<R, W>(reader: R, writer: W) -> Result<AppServerConnection>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(WRITER_CHANNEL_DEPTH);
        let inner = Self::build_inner(writer_tx, None);

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = writer_rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => dispatch_line(&reader_inner, value).await,
                            Err(e) => debug!("undecodable app-server line: {e}"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            connection_lost(&reader_inner).await;
        });

        let connection = AppServerConnection { inner };
        connection.initialize().await?;
        Ok(connection)
    }

    fn build_inner(
        writer_tx: mpsc::Sender<String>,
        process: Option<Arc<ProcessTransport>>,
    ) -> Arc<ConnectionInner> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Arc::new(ConnectionInner {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            default_approval: Mutex::new(ApprovalMediator::new(None)),
            state_tx,
            state_rx,
            next_id: AtomicI64::new(1),
            user_agent: std::sync::Mutex::new(None),
            process,
        })
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "clientInfo": {
                "name": "codex-sdk-rust",
                "title": "Codex SDK for Rust",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        let handshake = self.request("initialize", params);
        let result = match tokio::time::timeout(INITIALIZE_TIMEOUT, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = self.inner.state_tx.send(ConnectionState::Failed);
                return Err(Error::transport("app-server initialize timed out"));
            }
        };

        if let Some(user_agent) = result.get("userAgent").and_then(Value::as_str) {
            *self.inner.user_agent.lock().expect("user_agent poisoned") =
                Some(user_agent.to_string());
        }

        self.notify("initialized", json!({})).await?;
        let _ = self.inner.state_tx.send(ConnectionState::Ready);
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// The server's advertised user agent, once the handshake completed.
    pub fn user_agent(&self) -> Option<String> {
        self.inner
            .user_agent
            .lock()
            .expect("user_agent poisoned")
            .clone()
    }

    /// Send one request and await its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        match self.state() {
            ConnectionState::Failed => {
                return Err(Error::transport("app-server connection failed"));
            }
            ConnectionState::Draining => {
                return Err(Error::transport("app-server connection is draining"));
            }
            _ => {}
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let frame = json!({"id": id, "method": method, "params": params}).to_string() + "\n";
        if self.inner.writer_tx.send(frame).await.is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(Error::transport("app-server writer is gone"));
        }

        match rx.await {
            Ok(RpcReply::Result(value)) => Ok(value),
            Ok(RpcReply::Error { code, message }) => {
                if code == -32601 {
                    Err(Error::UnsupportedFeature(method.to_string()))
                } else {
                    Err(Error::transport(format!("{method} failed: {message}")))
                }
            }
            Err(_) => Err(Error::transport("app-server connection closed mid-request")),
        }
    }

    /// Send one notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({"method": method, "params": params}).to_string() + "\n";
        self.inner
            .writer_tx
            .send(frame)
            .await
            .map_err(|_| Error::transport("app-server writer is gone"))
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// `thread/start` → the new thread id.
    pub async fn thread_start(&self, params: Value) -> Result<String> {
        let result = self.request("thread/start", params).await?;
        result
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::stream("thread/start response has no thread id"))
    }

    /// `turn/start` — events stream back as notifications.
    pub async fn turn_start(&self, params: Value) -> Result<Value> {
        self.request("turn/start", params).await
    }

    /// `turn/interrupt` the active turn of a thread.
    pub async fn turn_interrupt(&self, thread_id: &str) -> Result<()> {
        self.request("turn/interrupt", json!({"threadId": thread_id}))
            .await
            .map(|_| ())
    }

    /// `thread/resume` a persisted thread into this connection.
    pub async fn thread_resume(&self, thread_id: &str) -> Result<Value> {
        self.request("thread/resume", json!({"threadId": thread_id}))
            .await
    }

    /// `thread/fork` → the forked thread's id.
    pub async fn thread_fork(&self, thread_id: &str) -> Result<String> {
        let result = self
            .request("thread/fork", json!({"threadId": thread_id}))
            .await?;
        result
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::stream("thread/fork response has no thread id"))
    }

    /// `thread/list` persisted threads.
    pub async fn thread_list(&self) -> Result<Value> {
        self.request("thread/list", json!({})).await
    }

    /// `skills/list` available skills.
    pub async fn skills_list(&self) -> Result<Value> {
        self.request("skills/list", json!({})).await
    }

    /// `mcpServerStatus/list`, falling back to the older `mcpServers/list`
    /// on servers that predate the rename.
    pub async fn mcp_server_status_list(&self) -> Result<Value> {
        match self.request("mcpServerStatus/list", json!({})).await {
            Err(Error::UnsupportedFeature(_)) => self.request("mcpServers/list", json!({})).await,
            other => other,
        }
    }

    /// `turn/compact`. Servers that removed the method surface
    /// [`Error::UnsupportedFeature`].
    pub async fn turn_compact(&self, thread_id: &str) -> Result<Value> {
        self.request("turn/compact", json!({"threadId": thread_id}))
            .await
            .map_err(|e| match e {
                Error::UnsupportedFeature(_) => {
                    Error::UnsupportedFeature("turn/compact".to_string())
                }
                other => other,
            })
    }

    /// Fuzzy file search in the agent's workspace.
    pub async fn fuzzy_file_search(&self, query: &str) -> Result<Value> {
        self.request("fuzzyFileSearch", json!({"query": query}))
            .await
    }

    /// `command/writeStdin` — feed a running command's stdin.
    pub async fn write_stdin(&self, item_id: &str, data: &str) -> Result<Value> {
        self.request(
            "command/writeStdin",
            json!({"itemId": item_id, "data": data}),
        )
        .await
    }

    /// Read the agent's merged configuration.
    pub async fn config_read(&self) -> Result<Value> {
        self.request("config/read", json!({})).await
    }

    /// Write configuration values.
    pub async fn config_write(&self, values: Value) -> Result<Value> {
        self.request("config/write", values).await
    }

    // ------------------------------------------------------------------
    // Subscriptions & approval routing
    // ------------------------------------------------------------------

    /// Subscribe to a thread's notifications. One subscription per thread;
    /// re-subscribing replaces the previous receiver.
    pub async fn subscribe_thread(&self, thread_id: &str) -> mpsc::Receiver<ThreadEvent> {
        let (tx, rx) = mpsc::channel(THREAD_CHANNEL_DEPTH);
        self.inner
            .threads
            .lock()
            .await
            .insert(thread_id.to_string(), tx);
        rx
    }

    /// Drop a thread subscription.
    pub async fn unsubscribe_thread(&self, thread_id: &str) {
        self.inner.threads.lock().await.remove(thread_id);
    }

    /// Route approval requests for a thread to this mediator.
    pub async fn set_thread_approval(&self, thread_id: &str, mediator: ApprovalMediator) {
        self.inner
            .approvals
            .lock()
            .await
            .insert(thread_id.to_string(), mediator);
    }

    /// Mediator used when no thread-specific one is registered.
    pub async fn set_default_approval(&self, mediator: ApprovalMediator) {
        *self.inner.default_approval.lock().await = mediator;
    }

    /// Release the connection: stop accepting requests and shut the
    /// subprocess down (when this connection owns one).
    pub async fn close(&self) {
        let _ = self.inner.state_tx.send(ConnectionState::Draining);
        if let Some(process) = &self.inner.process {
            process.close(Duration::from_secs(2)).await;
        }
        let _ = self.inner.state_tx.send(ConnectionState::Failed);
    }
}

async fn connection_lost(inner: &Arc<ConnectionInner>) {
    let _ = inner.state_tx.send(ConnectionState::Failed);
    inner.pending.lock().await.clear();
    inner.threads.lock().await.clear();
}

/// Classify one inbound line and dispatch it.
async fn dispatch_line(inner: &Arc<ConnectionInner>, value: Value) {
    let has_id = value.get("id").is_some();
    let has_method = value.get("method").is_some();

    if has_id && has_method {
        // Server-initiated request: answered off the reader task so a slow
        // approval policy never stalls other notifications.
        let inner = inner.clone();
        tokio::spawn(async move {
            handle_server_request(&inner, value).await;
        });
    } else if has_id {
        handle_response(inner, value).await;
    } else if has_method {
        handle_notification(inner, value).await;
    } else {
        debug!("app-server line is neither request, response, nor notification");
    }
}

async fn handle_response(inner: &Arc<ConnectionInner>, value: Value) {
    let Some(id) = value.get("id").and_then(Value::as_i64) else {
        debug!("response with non-integer id ignored");
        return;
    };
    let Some(tx) = inner.pending.lock().await.remove(&id) else {
        debug!("response for unknown request id {id}");
        return;
    };
    let reply = match value.get("error") {
        Some(error) => RpcReply::Error {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        },
        None => RpcReply::Result(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(reply);
}

async fn handle_notification(inner: &Arc<ConnectionInner>, value: Value) {
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let event = ThreadEvent::from_notification(&method, params);

    let targets: Vec<mpsc::Sender<ThreadEvent>> = {
        let threads = inner.threads.lock().await;
        match event.thread_id() {
            Some(thread_id) => threads.get(thread_id).cloned().into_iter().collect(),
            // Connection-scoped notifications go to every subscriber.
            None => threads.values().cloned().collect(),
        }
    };

    for target in targets {
        let _ = target.send(event.clone()).await;
    }
}

async fn handle_server_request(inner: &Arc<ConnectionInner>, value: Value) {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    let response = match method.as_str() {
        "item/commandExecution/requestApproval" => {
            let decision = decide_command(inner, &params).await;
            json!({"id": id, "result": {"decision": decision}})
        }
        "item/fileChange/requestApproval" => {
            let decision = decide_file(inner, &params).await;
            json!({"id": id, "result": {"decision": decision}})
        }
        other => {
            json!({"id": id, "error": {"code": -32601, "message": format!("unknown method {other}")}})
        }
    };

    let frame = response.to_string() + "\n";
    let _ = inner.writer_tx.send(frame).await;
}

/// Safe-command markers let a request through without consulting a policy;
/// telemetry is still emitted.
fn safe_command_marker(params: &Value) -> bool {
    params
        .get("requiresApproval")
        .and_then(Value::as_bool)
        .map(|v| !v)
        .unwrap_or(false)
        || params
            .get("approvedByPolicy")
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

async fn mediator_for(inner: &Arc<ConnectionInner>, thread_id: Option<&str>) -> ApprovalMediator {
    if let Some(thread_id) = thread_id {
        if let Some(mediator) = inner.approvals.lock().await.get(thread_id) {
            return mediator.clone();
        }
    }
    inner.default_approval.lock().await.clone()
}

async fn decide_command(inner: &Arc<ConnectionInner>, params: &Value) -> Value {
    let call_id = str_field(params, "callId");
    if safe_command_marker(params) {
        telemetry::emit(
            tevents::APPROVAL_REQUESTED,
            json!({"tool": "command_execution", "call_id": call_id, "safe_command": true}),
        );
        telemetry::emit(
            tevents::APPROVAL_APPROVED,
            json!({"tool": "command_execution", "call_id": call_id, "safe_command": true}),
        );
        return json!("accept");
    }

    let request = CommandApprovalRequest {
        call_id,
        command: str_field(params, "command"),
        cwd: opt_str_field(params, "cwd"),
        reason: opt_str_field(params, "reason"),
        proposed_execpolicy_amendment: params
            .get("proposedExecpolicyAmendment")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
        thread_id: opt_str_field(params, "threadId"),
        turn_id: opt_str_field(params, "turnId"),
    };

    let mediator = mediator_for(inner, request.thread_id.as_deref()).await;
    mediator.decide_command(&request).await
}

async fn decide_file(inner: &Arc<ConnectionInner>, params: &Value) -> Value {
    let request = FileChangeApprovalRequest {
        call_id: str_field(params, "callId"),
        changes: params.get("changes").cloned().unwrap_or(Value::Null),
        reason: opt_str_field(params, "reason"),
        thread_id: opt_str_field(params, "threadId"),
        turn_id: opt_str_field(params, "turnId"),
    };

    let mediator = mediator_for(inner, request.thread_id.as_deref()).await;
    mediator.decide_file(&request).await
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
