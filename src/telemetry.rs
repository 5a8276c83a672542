//! Telemetry spine: a fixed event catalog emitted at span boundaries.
//!
//! The SDK does not ship an exporter; events flow to a host-installed sink,
//! or to the `log` facade (target `codex_sdk::telemetry`) when no sink is
//! set. Start-style events carry `system_time`, stop-style events carry
//! `duration_ms`, and both carry a `span` token linking them together plus
//! whatever metadata the call site knows (`thread_id`, `turn_id`,
//! `originator`).

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use serde_json::{Map, Value};

/// The documented event catalog. Nothing else is emitted.
pub mod events {
    pub const THREAD_START: &str = "thread.start";
    pub const THREAD_STOP: &str = "thread.stop";
    pub const THREAD_EXCEPTION: &str = "thread.exception";
    pub const THREAD_TOKEN_USAGE_UPDATED: &str = "thread.token_usage.updated";
    pub const TURN_DIFF_UPDATED: &str = "turn.diff.updated";
    pub const TURN_COMPACTION_STARTED: &str = "turn.compaction.started";
    pub const TURN_COMPACTION_COMPLETED: &str = "turn.compaction.completed";
    pub const TOOL_START: &str = "tool.start";
    pub const TOOL_SUCCESS: &str = "tool.success";
    pub const TOOL_FAILURE: &str = "tool.failure";
    pub const APPROVAL_REQUESTED: &str = "approval.requested";
    pub const APPROVAL_APPROVED: &str = "approval.approved";
    pub const APPROVAL_DENIED: &str = "approval.denied";
    pub const APPROVAL_TIMEOUT: &str = "approval.timeout";
    pub const MCP_TOOL_CALL_START: &str = "mcp.tool_call.start";
    pub const MCP_TOOL_CALL_SUCCESS: &str = "mcp.tool_call.success";
    pub const MCP_TOOL_CALL_FAILURE: &str = "mcp.tool_call.failure";
    pub const RATE_LIMITED: &str = "rate_limit.rate_limited";
}

type Sink = Box<dyn Fn(&str, &Value) + Send + Sync>;

static SINK: OnceLock<Sink> = OnceLock::new();
static NEXT_SPAN: AtomicU64 = AtomicU64::new(1);

/// Install a process-wide sink. Only the first call wins; returns whether
/// this call installed it.
pub fn set_sink<F>(sink: F) -> bool
where
    F: Fn(&str, &Value) + Send + Sync + 'static,
{
    SINK.set(Box::new(sink)).is_ok()
}

/// Emit one catalog event.
pub fn emit(name: &str, payload: Value) {
    match SINK.get() {
        Some(sink) => sink(name, &payload),
        None => debug!(target: "codex_sdk::telemetry", "{name} {payload}"),
    }
}

/// Whether OTLP export is opted in via `CODEX_OTLP_ENABLE`.
///
/// Honors `1`/`true` (on) and `0`/`false` (off), case-insensitively;
/// anything else, including absence, is off.
pub fn otlp_enabled() -> bool {
    match std::env::var("CODEX_OTLP_ENABLE") {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true"),
        Err(_) => false,
    }
}

/// An in-flight span. Emits its start event on construction and exactly one
/// of stop/exception on completion, sharing a token so the pair can be
/// joined downstream.
#[must_use = "finish or fail the span to emit its closing event"]
pub struct Span {
    stop_event: &'static str,
    exception_event: &'static str,
    token: u64,
    started: Instant,
    meta: Map<String, Value>,
}

impl Span {
    /// Open a span. `meta` should carry `thread_id`, `turn_id`, and
    /// `originator` when known.
    pub fn begin(
        start_event: &'static str,
        stop_event: &'static str,
        exception_event: &'static str,
        meta: Map<String, Value>,
    ) -> Span {
        let token = NEXT_SPAN.fetch_add(1, Ordering::Relaxed);
        let mut payload = meta.clone();
        payload.insert("span".into(), Value::from(token));
        payload.insert("system_time".into(), Value::from(unix_millis()));
        emit(start_event, Value::Object(payload));
        Span {
            stop_event,
            exception_event,
            token,
            started: Instant::now(),
            meta,
        }
    }

    /// Convenience for the `thread.*` span triple.
    pub fn thread(meta: Map<String, Value>) -> Span {
        Span::begin(
            events::THREAD_START,
            events::THREAD_STOP,
            events::THREAD_EXCEPTION,
            meta,
        )
    }

    /// Add metadata discovered mid-span (e.g. the thread id once the first
    /// event names it).
    pub fn record(&mut self, key: &str, value: Value) {
        self.meta.insert(key.to_string(), value);
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Close successfully, emitting the stop event with `duration_ms`.
    pub fn finish(self) {
        self.close(None);
    }

    /// Close with an error, emitting the exception event.
    pub fn fail(self, error: &str) {
        self.close(Some(error.to_string()));
    }

    fn close(self, error: Option<String>) {
        let mut payload = self.meta;
        payload.insert("span".into(), Value::from(self.token));
        payload.insert(
            "duration_ms".into(),
            Value::from(self.started.elapsed().as_millis() as u64),
        );
        let event = match error {
            Some(message) => {
                payload.insert("error".into(), Value::String(message));
                self.exception_event
            }
            None => self.stop_event,
        };
        emit(event, Value::Object(payload));
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a metadata map from known identifiers.
pub fn meta(
    thread_id: Option<&str>,
    turn_id: Option<&str>,
    originator: &str,
) -> Map<String, Value> {
    let mut map = Map::new();
    if let Some(thread_id) = thread_id {
        map.insert("thread_id".into(), Value::String(thread_id.to_string()));
    }
    if let Some(turn_id) = turn_id {
        map.insert("turn_id".into(), Value::String(turn_id.to_string()));
    }
    map.insert("originator".into(), Value::String(originator.to_string()));
    map
}
