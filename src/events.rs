//! Typed events and items decoded from the agent's wire output.
//!
//! The agent speaks two casings of the same vocabulary: the exec transport
//! emits one JSON object per line with a dotted snake_case `type`
//! discriminator (`thread.started`, `turn.completed`, …), and the app-server
//! transport delivers JSON-RPC notifications with slash-separated camelCase
//! methods (`thread/started`, `item/agentMessage/delta`, …). Both narrow into
//! the same closed sums here: [`ThreadEvent`] and [`ThreadItem`].
//!
//! Parsing is strict about required fields and lenient about extras. Unknown
//! event types are preserved losslessly as [`ThreadEvent::Raw`] so that newer
//! agent binaries keep working against this SDK. For every known variant,
//! `ThreadEvent::parse(e.to_value()) == e` — the codec test suite and
//! `tests/event_roundtrip_test.rs` hold the codec to that.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// USAGE & RATE LIMITS
// ============================================================================

/// Cumulative token counters for a thread.
///
/// Monotonically non-decreasing over successful turns; the turn engine adds
/// per-event deltas into the thread's running total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "cachedInputTokens")]
    pub cached_input_tokens: u64,
    #[serde(default, alias = "outputTokens")]
    pub output_tokens: u64,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: u64,
}

impl Usage {
    /// Add another usage record into this one, component-wise.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// Component-wise difference, saturating at zero.
    pub fn delta_from(&self, earlier: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            cached_input_tokens: self
                .cached_input_tokens
                .saturating_sub(earlier.cached_input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            total_tokens: self.total_tokens.saturating_sub(earlier.total_tokens),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Usage::default()
    }
}

/// Last known rate-limit window state reported by the agent.
///
/// Shapes vary across agent versions, so unrecognized fields ride along in
/// `extras` and survive re-serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    #[serde(
        default,
        alias = "primaryUsedPercent",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary_used_percent: Option<f64>,
    #[serde(
        default,
        alias = "secondaryUsedPercent",
        skip_serializing_if = "Option::is_none"
    )]
    pub secondary_used_percent: Option<f64>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

// ============================================================================
// ITEMS
// ============================================================================

/// Progress state of a long-running item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[serde(alias = "inProgress")]
    InProgress,
    Completed,
    Failed,
}

/// One file touched by a [`ThreadItem::FileChange`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUpdateChange {
    pub path: String,
    pub kind: FileChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Add,
    Update,
    Delete,
    Move,
}

/// One entry of a [`ThreadItem::TodoList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// A unit of agent output within a turn.
///
/// Closed sum: unknown item types cause the enclosing event to fall back to
/// [`ThreadEvent::Raw`] rather than producing a lossy placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadItem {
    #[serde(alias = "agentMessage")]
    AgentMessage {
        #[serde(default)]
        id: String,
        text: String,
    },
    /// Structured reasoning. `summary` and `content` stay as arrays; the
    /// folder never flattens them into one string.
    Reasoning {
        #[serde(default)]
        id: String,
        #[serde(default)]
        summary: Vec<String>,
        #[serde(default)]
        content: Vec<String>,
    },
    #[serde(alias = "commandExecution")]
    CommandExecution {
        #[serde(default)]
        id: String,
        command: String,
        #[serde(default, alias = "aggregatedOutput")]
        aggregated_output: String,
        #[serde(
            default,
            alias = "exitCode",
            skip_serializing_if = "Option::is_none"
        )]
        exit_code: Option<i32>,
        status: ItemStatus,
    },
    #[serde(alias = "fileChange")]
    FileChange {
        #[serde(default)]
        id: String,
        changes: Vec<FileUpdateChange>,
        status: ItemStatus,
    },
    #[serde(alias = "mcpToolCall")]
    McpToolCall {
        #[serde(default)]
        id: String,
        server: String,
        tool: String,
        status: ItemStatus,
    },
    #[serde(alias = "webSearch")]
    WebSearch {
        #[serde(default)]
        id: String,
        query: String,
    },
    #[serde(alias = "todoList")]
    TodoList {
        #[serde(default)]
        id: String,
        items: Vec<TodoItem>,
    },
    #[serde(alias = "ghostSnapshot")]
    GhostSnapshot {
        #[serde(default)]
        id: String,
        #[serde(alias = "commitInfo")]
        commit_info: Value,
    },
    /// Host-produced tool output bridged back to the agent by the auto-run
    /// loop.
    #[serde(alias = "toolOutput")]
    ToolOutput {
        #[serde(default)]
        id: String,
        #[serde(default, alias = "callId")]
        call_id: String,
        output: Value,
    },
}

impl ThreadItem {
    /// The item's id, when the agent assigned one.
    pub fn id(&self) -> &str {
        match self {
            ThreadItem::AgentMessage { id, .. }
            | ThreadItem::Reasoning { id, .. }
            | ThreadItem::CommandExecution { id, .. }
            | ThreadItem::FileChange { id, .. }
            | ThreadItem::McpToolCall { id, .. }
            | ThreadItem::WebSearch { id, .. }
            | ThreadItem::TodoList { id, .. }
            | ThreadItem::GhostSnapshot { id, .. }
            | ThreadItem::ToolOutput { id, .. } => id,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Final status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
}

/// Error detail attached to a failed turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnError {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// Stage marker for compaction events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStage {
    Started,
    Completed,
}

/// A decoded agent event.
///
/// Known variants map 1:1 onto the exec transport's dotted `type` strings
/// (serialized form). Anything else is preserved as [`ThreadEvent::Raw`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(alias = "threadId")]
        thread_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        metadata: Map<String, Value>,
    },

    #[serde(rename = "turn.started")]
    TurnStarted {
        #[serde(
            default,
            alias = "threadId",
            skip_serializing_if = "Option::is_none"
        )]
        thread_id: Option<String>,
        #[serde(alias = "turnId")]
        turn_id: String,
    },

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(
            default,
            alias = "threadId",
            skip_serializing_if = "Option::is_none"
        )]
        thread_id: Option<String>,
        #[serde(alias = "turnId")]
        turn_id: String,
        status: TurnStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TurnError>,
        #[serde(
            default,
            alias = "finalResponse",
            skip_serializing_if = "Option::is_none"
        )]
        final_response: Option<ThreadItem>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// The agent paused for tool output; auto-run resumes with this token.
    #[serde(rename = "turn.continuation")]
    TurnContinuation { token: String },

    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },

    /// In-order fragment of an agent message, keyed by `(turn_id, item_id)`.
    #[serde(rename = "item.agent_message.delta")]
    AgentMessageDelta {
        #[serde(
            default,
            alias = "threadId",
            skip_serializing_if = "Option::is_none"
        )]
        thread_id: Option<String>,
        #[serde(
            default,
            alias = "turnId",
            skip_serializing_if = "Option::is_none"
        )]
        turn_id: Option<String>,
        #[serde(alias = "itemId")]
        item_id: String,
        delta: String,
    },

    /// Cumulative usage plus the amount added by the most recent server
    /// event. `delta` defaults to zero when the wire omits it; the turn
    /// engine computes it from the previous cumulative value.
    #[serde(rename = "thread.token_usage.updated")]
    TokenUsageUpdated {
        #[serde(
            default,
            alias = "threadId",
            skip_serializing_if = "Option::is_none"
        )]
        thread_id: Option<String>,
        usage: Usage,
        #[serde(default, skip_serializing_if = "Usage::is_zero")]
        delta: Usage,
        #[serde(
            default,
            alias = "rateLimits",
            skip_serializing_if = "Option::is_none"
        )]
        rate_limits: Option<RateLimitSnapshot>,
    },

    #[serde(rename = "turn.diff.updated")]
    TurnDiffUpdated {
        #[serde(
            default,
            alias = "turnId",
            skip_serializing_if = "Option::is_none"
        )]
        turn_id: Option<String>,
        diff: String,
    },

    #[serde(rename = "turn.compaction")]
    TurnCompaction {
        stage: CompactionStage,
        #[serde(default)]
        compaction: Value,
    },

    #[serde(rename = "account.updated")]
    AccountUpdated {
        #[serde(default)]
        account: Value,
    },

    #[serde(rename = "account.login_completed")]
    LoginCompleted {
        #[serde(default)]
        account: Value,
    },

    #[serde(rename = "account.rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(alias = "rateLimits")]
        rate_limits: RateLimitSnapshot,
    },

    /// The agent asked the host to run a registered tool.
    #[serde(rename = "tool_call.requested")]
    ToolCallRequested {
        #[serde(alias = "callId")]
        call_id: String,
        tool: String,
        #[serde(default)]
        arguments: Value,
        /// Safe-command marker: `false` means no approval is needed.
        #[serde(
            default,
            alias = "requiresApproval",
            skip_serializing_if = "Option::is_none"
        )]
        requires_approval: Option<bool>,
        /// Safe-command marker: the agent-side policy already approved it.
        #[serde(
            default,
            alias = "approvedByPolicy",
            skip_serializing_if = "Option::is_none"
        )]
        approved_by_policy: Option<bool>,
    },

    #[serde(rename = "tool_call.completed")]
    ToolCallCompleted {
        #[serde(alias = "callId")]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(
            default,
            alias = "threadId",
            skip_serializing_if = "Option::is_none"
        )]
        thread_id: Option<String>,
        #[serde(
            default,
            alias = "turnId",
            skip_serializing_if = "Option::is_none"
        )]
        turn_id: Option<String>,
    },

    /// Forward-compatibility catch-all. `method` is the unrecognized `type`
    /// or notification method; `params` the original payload, untouched.
    #[serde(skip)]
    Raw { method: String, params: Value },
}

impl ThreadEvent {
    /// Decode one exec-JSONL object into an event.
    ///
    /// Unknown `type` values (and known types whose payload fails to parse,
    /// such as an unrecognized item kind) are preserved as [`Self::Raw`].
    /// Objects without a string `type` are an error: the line is not an
    /// event at all.
    pub fn parse(value: &Value) -> Result<ThreadEvent> {
        let ty = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::stream("event object has no 'type' field"))?;

        match serde_json::from_value::<ThreadEvent>(value.clone()) {
            Ok(event) => Ok(event),
            Err(_) => Ok(ThreadEvent::Raw {
                method: ty.to_string(),
                params: value.clone(),
            }),
        }
    }

    /// Re-serialize to the exec-JSONL object form.
    ///
    /// For known variants, `ThreadEvent::parse(&e.to_value()) == e`.
    /// [`Self::Raw`] returns its captured payload verbatim.
    pub fn to_value(&self) -> Value {
        match self {
            ThreadEvent::Raw { params, .. } => params.clone(),
            other => serde_json::to_value(other)
                .expect("BUG: known event variants always serialize"),
        }
    }

    /// Map an app-server notification onto an event.
    ///
    /// Handles shape differences (the RPC `turn/completed` nests a `turn`
    /// object; usage fields are camelCased) and preserves unknown methods as
    /// [`Self::Raw`] without loss.
    pub fn from_notification(method: &str, params: Value) -> ThreadEvent {
        let mapped = match method {
            "thread/started" => retag(params.clone(), "thread.started"),
            "turn/started" => retag(params.clone(), "turn.started"),
            "turn/completed" => normalize_rpc_turn_completed(&params),
            "turn/continuation" => retag(params.clone(), "turn.continuation"),
            "item/started" => retag(params.clone(), "item.started"),
            "item/updated" => retag(params.clone(), "item.updated"),
            "item/completed" => retag(params.clone(), "item.completed"),
            "item/agentMessage/delta" => retag(params.clone(), "item.agent_message.delta"),
            "thread/tokenUsage/updated" => retag(params.clone(), "thread.token_usage.updated"),
            "turn/diff/updated" => retag(params.clone(), "turn.diff.updated"),
            "turn/compaction/started" => compaction(params.clone(), CompactionStage::Started),
            "turn/compaction/completed" => compaction(params.clone(), CompactionStage::Completed),
            "account/updated" => retag(params.clone(), "account.updated"),
            "account/loginCompleted" => retag(params.clone(), "account.login_completed"),
            "account/rateLimits/updated" => retag(params.clone(), "account.rate_limits.updated"),
            "item/toolCall/requested" => retag(params.clone(), "tool_call.requested"),
            "item/toolCall/completed" => retag(params.clone(), "tool_call.completed"),
            "error" => retag(params.clone(), "error"),
            _ => None,
        };

        match mapped.and_then(|v| ThreadEvent::parse(&v).ok()) {
            Some(ThreadEvent::Raw { .. }) | None => ThreadEvent::Raw {
                method: method.to_string(),
                params,
            },
            Some(event) => event,
        }
    }

    /// The thread id carried by this event, when any.
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            ThreadEvent::ThreadStarted { thread_id, .. } => Some(thread_id),
            ThreadEvent::TurnStarted { thread_id, .. }
            | ThreadEvent::TurnCompleted { thread_id, .. }
            | ThreadEvent::AgentMessageDelta { thread_id, .. }
            | ThreadEvent::TokenUsageUpdated { thread_id, .. }
            | ThreadEvent::Error { thread_id, .. } => thread_id.as_deref(),
            ThreadEvent::Raw { params, .. } => params
                .get("threadId")
                .or_else(|| params.get("thread_id"))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

fn retag(params: Value, ty: &str) -> Option<Value> {
    let mut obj = params.as_object()?.clone();
    obj.insert("type".to_string(), Value::String(ty.to_string()));
    Some(Value::Object(obj))
}

fn compaction(params: Value, stage: CompactionStage) -> Option<Value> {
    let stage = match stage {
        CompactionStage::Started => "started",
        CompactionStage::Completed => "completed",
    };
    Some(serde_json::json!({
        "type": "turn.compaction",
        "stage": stage,
        "compaction": params,
    }))
}

/// The RPC `turn/completed` nests `{turn: {id, items, status, error}}`;
/// flatten it into the exec shape, deriving `final_response` from the last
/// agent message item.
fn normalize_rpc_turn_completed(params: &Value) -> Option<Value> {
    let turn = params.get("turn")?;
    let turn_id = params
        .get("turnId")
        .or_else(|| turn.get("id"))
        .and_then(Value::as_str)?;

    let final_response = turn
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .rev()
                .find(|item| {
                    matches!(
                        item.get("type").and_then(Value::as_str),
                        Some("agentMessage") | Some("agent_message")
                    )
                })
                .cloned()
        });

    let mut obj = Map::new();
    obj.insert("type".into(), Value::String("turn.completed".into()));
    if let Some(thread_id) = params.get("threadId") {
        obj.insert("thread_id".into(), thread_id.clone());
    }
    obj.insert("turn_id".into(), Value::String(turn_id.to_string()));
    obj.insert(
        "status".into(),
        turn.get("status").cloned().unwrap_or(Value::Null),
    );
    if let Some(error) = turn.get("error").filter(|e| !e.is_null()) {
        obj.insert("error".into(), error.clone());
    }
    if let Some(item) = final_response {
        obj.insert("final_response".into(), item);
    }
    if let Some(usage) = turn.get("usage").filter(|u| !u.is_null()) {
        obj.insert("usage".into(), usage.clone());
    }
    Some(Value::Object(obj))
}
