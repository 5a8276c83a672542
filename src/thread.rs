//! Thread state, turn inputs, turn results, and event folding.
//!
//! A [`Thread`]'s mutable state lives here; the turn engine in
//! [`crate::client`] is its only writer. [`TurnFolder`] is the pure
//! accumulator that reduces a turn's event stream into a [`TurnResult`]:
//! message deltas concatenate in order by `(turn_id, item_id)`, reasoning
//! stays structured, usage accumulates, rate-limit snapshots replace, and
//! pending tool-call requests collect for the auto-run loop.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::events::{
    RateLimitSnapshot, ThreadEvent, ThreadItem, TurnStatus, Usage,
};

/// Literal first-block text that resets a thread's identity.
pub const RESET_SENTINEL: &str = "/new";

/// One block of structured turn input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBlock {
    Text { text: String },
    /// Pre-encoded image (data URI).
    Image { data: String },
    /// Image on the local filesystem; staged before sending.
    LocalImage { path: PathBuf },
}

/// Turn input: a plain string (both transports) or a block list
/// (app-server only).
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadInput {
    Text(String),
    Blocks(Vec<InputBlock>),
}

impl From<&str> for ThreadInput {
    fn from(text: &str) -> Self {
        ThreadInput::Text(text.to_string())
    }
}

impl From<String> for ThreadInput {
    fn from(text: String) -> Self {
        ThreadInput::Text(text)
    }
}

impl From<Vec<InputBlock>> for ThreadInput {
    fn from(blocks: Vec<InputBlock>) -> Self {
        ThreadInput::Blocks(blocks)
    }
}

impl ThreadInput {
    /// Detect and strip the reset sentinel. Returns `(was_reset, rest)`.
    ///
    /// The sentinel counts only as the *first* text block (or the entire
    /// plain-string input); `/new` later in the conversation is content.
    pub(crate) fn take_reset(self) -> (bool, ThreadInput) {
        match self {
            ThreadInput::Text(text) if text.trim() == RESET_SENTINEL => {
                (true, ThreadInput::Text(String::new()))
            }
            ThreadInput::Blocks(blocks) => match blocks.first() {
                Some(InputBlock::Text { text }) if text.trim() == RESET_SENTINEL => {
                    (true, ThreadInput::Blocks(blocks[1..].to_vec()))
                }
                _ => (false, ThreadInput::Blocks(blocks)),
            },
            other => (false, other),
        }
    }

    /// The plain-text rendering used by the exec transport's positional
    /// prompt argument. Block lists are not renderable here.
    pub(crate) fn as_exec_prompt(&self) -> Result<String> {
        match self {
            ThreadInput::Text(text) => Ok(text.clone()),
            ThreadInput::Blocks(_) => Err(Error::UnsupportedInput {
                transport: "exec".to_string(),
            }),
        }
    }

    /// Local images referenced by the input (staged by the exec transport).
    pub(crate) fn local_images(&self) -> Vec<PathBuf> {
        match self {
            ThreadInput::Text(_) => Vec::new(),
            ThreadInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    InputBlock::LocalImage { path } => Some(path.clone()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// The camelCased block-list payload for `turn/start`.
    pub(crate) fn to_rpc_blocks(&self) -> Result<Vec<Value>> {
        match self {
            ThreadInput::Text(text) => Ok(vec![json!({"type": "text", "text": text})]),
            ThreadInput::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    InputBlock::Text { text } => Ok(json!({"type": "text", "text": text})),
                    InputBlock::Image { data } => Ok(json!({"type": "image", "data": data})),
                    InputBlock::LocalImage { path } => Ok(json!({
                        "type": "localImage",
                        "path": path.display().to_string(),
                    })),
                })
                .collect(),
        }
    }
}

/// A tool call the agent asked the host to run.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub requires_approval: Option<bool>,
    pub approved_by_policy: Option<bool>,
}

impl PendingToolCall {
    /// Safe-command marker: approval can be skipped (telemetry still
    /// emitted).
    pub fn is_pre_approved(&self) -> bool {
        self.requires_approval == Some(false) || self.approved_by_policy == Some(true)
    }
}

/// Outcome of one `run` / `run_turn` call.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Every event observed, in arrival order (all attempts).
    pub events: Vec<ThreadEvent>,
    /// Items completed during the run.
    pub items: Vec<ThreadItem>,
    /// The final agent message, when one was produced.
    pub final_response: Option<ThreadItem>,
    /// Usage added by this run (delta, not the thread's running total).
    pub usage: Usage,
    /// Auto-run attempts consumed.
    pub attempts: u32,
    /// Set when the agent is still waiting for tool output.
    pub continuation: Option<String>,
    /// Transport-specific residue (pending tool calls to bridge, diffs).
    pub raw: Value,
}

impl TurnResult {
    /// The final response's text, when it is an agent message.
    pub fn final_text(&self) -> Option<&str> {
        match &self.final_response {
            Some(ThreadItem::AgentMessage { text, .. }) => Some(text),
            _ => None,
        }
    }
}

/// Mutable thread state. Owned by [`crate::client::Thread`] behind a lock
/// so turns on the same thread are serialized.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub thread_id: Option<String>,
    pub usage: Usage,
    pub rate_limits: Option<RateLimitSnapshot>,
    /// User-supplied identity labels; cleared by the reset sentinel.
    pub labels: HashMap<String, String>,
    /// Host metadata unrelated to identity; preserved across resets.
    pub metadata: Map<String, Value>,
    /// Tool calls left unanswered by the previous turn.
    pub pending_tool_calls: Vec<PendingToolCall>,
}

impl ThreadState {
    /// Apply the reset sentinel: identity goes, host metadata stays.
    pub fn reset_identity(&mut self) {
        self.thread_id = None;
        self.labels.clear();
        self.pending_tool_calls.clear();
    }
}

/// Reduces one turn's event stream.
#[derive(Debug, Default)]
pub(crate) struct TurnFolder {
    pub events: Vec<ThreadEvent>,
    pub items: Vec<ThreadItem>,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub final_response: Option<ThreadItem>,
    pub continuation: Option<String>,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub rate_limits: Option<RateLimitSnapshot>,
    pub diff: Option<String>,
    pub completed: Option<(TurnStatus, Option<String>)>,
    message_deltas: HashMap<(String, String), String>,
    last_cumulative: Usage,
    usage_delta: Usage,
    baseline: Usage,
}

impl TurnFolder {
    /// `baseline` is the thread's cumulative usage before this turn; wire
    /// totals are diffed against it when the agent omits explicit deltas.
    pub fn new(baseline: Usage) -> TurnFolder {
        TurnFolder {
            last_cumulative: baseline.clone(),
            baseline,
            ..TurnFolder::default()
        }
    }

    /// Fold one event. Returns `true` once the turn has completed.
    pub fn fold(&mut self, event: &ThreadEvent) -> bool {
        match event {
            ThreadEvent::ThreadStarted { thread_id, .. } => {
                self.thread_id = Some(thread_id.clone());
            }
            ThreadEvent::TurnStarted {
                thread_id, turn_id, ..
            } => {
                if let Some(thread_id) = thread_id {
                    self.thread_id.get_or_insert_with(|| thread_id.clone());
                }
                self.turn_id = Some(turn_id.clone());
            }
            ThreadEvent::AgentMessageDelta {
                turn_id,
                item_id,
                delta,
                ..
            } => {
                let key = (
                    turn_id.clone().unwrap_or_default(),
                    item_id.clone(),
                );
                self.message_deltas.entry(key).or_default().push_str(delta);
            }
            ThreadEvent::ItemStarted { .. } | ThreadEvent::ItemUpdated { .. } => {}
            ThreadEvent::ItemCompleted { item } => {
                self.items.push(item.clone());
                if matches!(item, ThreadItem::AgentMessage { .. }) {
                    self.final_response = Some(item.clone());
                }
            }
            ThreadEvent::TokenUsageUpdated {
                usage,
                delta,
                rate_limits,
                ..
            } => {
                let step = if delta.is_zero() {
                    usage.delta_from(&self.last_cumulative)
                } else {
                    delta.clone()
                };
                self.usage_delta.add(&step);
                self.last_cumulative = usage.clone();
                if let Some(snapshot) = rate_limits {
                    self.rate_limits = Some(snapshot.clone());
                }
            }
            ThreadEvent::RateLimitsUpdated { rate_limits } => {
                self.rate_limits = Some(rate_limits.clone());
            }
            ThreadEvent::TurnDiffUpdated { diff, .. } => {
                self.diff = Some(diff.clone());
            }
            ThreadEvent::TurnContinuation { token } => {
                self.continuation = Some(token.clone());
            }
            ThreadEvent::ToolCallRequested {
                call_id,
                tool,
                arguments,
                requires_approval,
                approved_by_policy,
            } => {
                self.pending_tool_calls.push(PendingToolCall {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    arguments: arguments.clone(),
                    requires_approval: *requires_approval,
                    approved_by_policy: *approved_by_policy,
                });
            }
            ThreadEvent::ToolCallCompleted { call_id, .. } => {
                self.pending_tool_calls.retain(|call| &call.call_id != call_id);
            }
            ThreadEvent::TurnCompleted {
                turn_id,
                status,
                error,
                final_response,
                usage,
                ..
            } => {
                self.turn_id.get_or_insert_with(|| turn_id.clone());
                if let Some(item) = final_response {
                    self.final_response = Some(item.clone());
                }
                if let Some(turn_usage) = usage {
                    // turn.completed reports the turn's own usage. It only
                    // fills in when no incremental usage events preceded it.
                    if self.usage_delta.is_zero() {
                        self.usage_delta = turn_usage.clone();
                        let mut cumulative = self.baseline.clone();
                        cumulative.add(turn_usage);
                        self.last_cumulative = cumulative;
                    }
                }
                self.completed =
                    Some((*status, error.as_ref().map(|e| e.message.clone())));
            }
            ThreadEvent::TurnCompaction { .. }
            | ThreadEvent::AccountUpdated { .. }
            | ThreadEvent::LoginCompleted { .. }
            | ThreadEvent::Error { .. }
            | ThreadEvent::Raw { .. } => {}
        }

        self.events.push(event.clone());
        matches!(event, ThreadEvent::TurnCompleted { .. })
    }

    /// Whether any message deltas were folded for the given item.
    pub fn assembled_message(&self, turn_id: &str, item_id: &str) -> Option<&str> {
        self.message_deltas
            .get(&(turn_id.to_string(), item_id.to_string()))
            .map(String::as_str)
    }

    /// Usage added by this turn.
    pub fn usage_delta(&self) -> Usage {
        self.usage_delta.clone()
    }

    /// The thread's cumulative usage as last reported on the wire.
    pub fn cumulative_usage(&self) -> Usage {
        self.last_cumulative.clone()
    }

    /// Build the result, or the typed error for a failed turn.
    pub fn into_result(self, attempts: u32) -> Result<TurnResult> {
        match &self.completed {
            Some((TurnStatus::Failed, message)) => Err(Error::TurnFailed {
                message: message
                    .clone()
                    .unwrap_or_else(|| "no error detail".to_string()),
            }),
            Some((TurnStatus::Completed, _)) => {
                let raw = json!({
                    "pending_tool_calls": self
                        .pending_tool_calls
                        .iter()
                        .map(|call| json!({
                            "call_id": call.call_id,
                            "tool": call.tool,
                            "arguments": call.arguments,
                        }))
                        .collect::<Vec<Value>>(),
                    "diff": self.diff,
                });
                Ok(TurnResult {
                    usage: self.usage_delta.clone(),
                    events: self.events,
                    items: self.items,
                    final_response: self.final_response,
                    attempts,
                    continuation: self.continuation,
                    raw,
                })
            }
            None => Err(Error::transport(
                "event stream ended without turn.completed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: Value) -> ThreadEvent {
        ThreadEvent::parse(&value).unwrap()
    }

    #[test]
    fn test_reset_sentinel_plain_text() {
        let (reset, rest) = ThreadInput::from("/new").take_reset();
        assert!(reset);
        assert_eq!(rest, ThreadInput::Text(String::new()));

        let (reset, rest) = ThreadInput::from("hello /new world").take_reset();
        assert!(!reset);
        assert_eq!(rest, ThreadInput::Text("hello /new world".to_string()));
    }

    #[test]
    fn test_reset_sentinel_first_block_only() {
        let input = ThreadInput::Blocks(vec![
            InputBlock::Text {
                text: "/new".to_string(),
            },
            InputBlock::LocalImage {
                path: "/tmp/example.png".into(),
            },
        ]);
        let (reset, rest) = input.take_reset();
        assert!(reset);
        assert_eq!(
            rest,
            ThreadInput::Blocks(vec![InputBlock::LocalImage {
                path: "/tmp/example.png".into()
            }])
        );

        // Sentinel in a later block is content, not a reset.
        let input = ThreadInput::Blocks(vec![
            InputBlock::Text {
                text: "context".to_string(),
            },
            InputBlock::Text {
                text: "/new".to_string(),
            },
        ]);
        let (reset, _) = input.take_reset();
        assert!(!reset);
    }

    #[test]
    fn test_block_input_rejected_by_exec() {
        let input = ThreadInput::Blocks(vec![InputBlock::Text {
            text: "hi".to_string(),
        }]);
        let err = input.as_exec_prompt().unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedInput { ref transport } if transport == "exec"
        ));
    }

    #[test]
    fn test_rpc_blocks_are_camel_cased() {
        let input = ThreadInput::Blocks(vec![
            InputBlock::Text {
                text: "look".to_string(),
            },
            InputBlock::LocalImage {
                path: "/tmp/pic.png".into(),
            },
        ]);
        let blocks = input.to_rpc_blocks().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "localImage");
        assert_eq!(blocks[1]["path"], "/tmp/pic.png");
    }

    #[test]
    fn test_reset_identity_preserves_host_metadata() {
        let mut state = ThreadState::default();
        state.thread_id = Some("thr_old".to_string());
        state.labels.insert("topic".into(), "legacy".into());
        state
            .metadata
            .insert("host_tag".into(), Value::String("kept".into()));

        state.reset_identity();
        assert!(state.thread_id.is_none());
        assert!(state.labels.is_empty());
        assert_eq!(state.metadata["host_tag"], "kept");
    }

    #[test]
    fn test_folder_basic_turn() {
        let mut folder = TurnFolder::new(Usage::default());
        assert!(!folder.fold(&event(
            json!({"type": "thread.started", "thread_id": "thr_abc123"})
        )));
        assert!(!folder.fold(&event(
            json!({"type": "turn.started", "thread_id": "thr_abc123", "turn_id": "turn_def"})
        )));
        assert!(!folder.fold(&event(json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "id": "m_1", "text": "Hello from Codex!"}
        }))));
        assert!(folder.fold(&event(json!({
            "type": "turn.completed", "thread_id": "thr_abc123", "turn_id": "turn_def",
            "status": "completed",
            "usage": {"input_tokens": 12, "cached_input_tokens": 0, "output_tokens": 9, "total_tokens": 21}
        }))));

        assert_eq!(folder.thread_id.as_deref(), Some("thr_abc123"));
        let result = folder.into_result(1).unwrap();
        assert_eq!(result.events.len(), 4);
        assert_eq!(result.usage.total_tokens, 21);
        assert_eq!(result.final_text(), Some("Hello from Codex!"));
    }

    #[test]
    fn test_folder_concatenates_deltas_in_order() {
        let mut folder = TurnFolder::new(Usage::default());
        for delta in ["Hel", "lo ", "world"] {
            folder.fold(&event(json!({
                "type": "item.agent_message.delta",
                "turn_id": "t_1", "item_id": "m_1", "delta": delta
            })));
        }
        // A different item accumulates independently.
        folder.fold(&event(json!({
            "type": "item.agent_message.delta",
            "turn_id": "t_1", "item_id": "m_2", "delta": "other"
        })));

        assert_eq!(folder.assembled_message("t_1", "m_1"), Some("Hello world"));
        assert_eq!(folder.assembled_message("t_1", "m_2"), Some("other"));
    }

    #[test]
    fn test_folder_usage_accumulates_and_snapshots_replace() {
        let baseline = Usage {
            input_tokens: 100,
            cached_input_tokens: 0,
            output_tokens: 50,
            total_tokens: 150,
        };
        let mut folder = TurnFolder::new(baseline);

        // Wire reports cumulative totals; the folder derives deltas.
        folder.fold(&event(json!({
            "type": "thread.token_usage.updated",
            "usage": {"input_tokens": 110, "cached_input_tokens": 0, "output_tokens": 55, "total_tokens": 165},
            "rate_limits": {"primary_used_percent": 10.0}
        })));
        folder.fold(&event(json!({
            "type": "thread.token_usage.updated",
            "usage": {"input_tokens": 120, "cached_input_tokens": 0, "output_tokens": 60, "total_tokens": 180},
            "rate_limits": {"primary_used_percent": 25.0}
        })));

        let delta = folder.usage_delta();
        assert_eq!(delta.input_tokens, 20);
        assert_eq!(delta.total_tokens, 30);
        // Latest snapshot wins.
        assert_eq!(
            folder.rate_limits.as_ref().unwrap().primary_used_percent,
            Some(25.0)
        );
    }

    #[test]
    fn test_folder_reasoning_stays_structured() {
        let mut folder = TurnFolder::new(Usage::default());
        folder.fold(&event(json!({
            "type": "item.completed",
            "item": {"type": "reasoning", "id": "r_1",
                     "summary": ["first", "second"], "content": ["detail"]}
        })));
        match &folder.items[0] {
            ThreadItem::Reasoning {
                summary, content, ..
            } => {
                assert_eq!(summary.len(), 2);
                assert_eq!(content.len(), 1);
            }
            other => panic!("expected Reasoning, got {other:?}"),
        }
    }

    #[test]
    fn test_folder_pending_tool_calls() {
        let mut folder = TurnFolder::new(Usage::default());
        folder.fold(&event(json!({
            "type": "tool_call.requested", "call_id": "call_1",
            "tool": "get_weather", "arguments": {"city": "Paris"}
        })));
        folder.fold(&event(json!({
            "type": "tool_call.requested", "call_id": "call_2",
            "tool": "search", "arguments": {}, "requires_approval": false
        })));
        assert_eq!(folder.pending_tool_calls.len(), 2);
        assert!(!folder.pending_tool_calls[0].is_pre_approved());
        assert!(folder.pending_tool_calls[1].is_pre_approved());

        // Answered calls drop out.
        folder.fold(&event(json!({
            "type": "tool_call.completed", "call_id": "call_1", "output": {}
        })));
        assert_eq!(folder.pending_tool_calls.len(), 1);
    }

    #[test]
    fn test_folder_continuation_token() {
        let mut folder = TurnFolder::new(Usage::default());
        folder.fold(&event(json!({"type": "turn.continuation", "token": "cont-1"})));
        folder.fold(&event(json!({
            "type": "turn.completed", "turn_id": "t_1", "status": "completed"
        })));
        let result = folder.into_result(1).unwrap();
        assert_eq!(result.continuation.as_deref(), Some("cont-1"));
    }

    #[test]
    fn test_folder_failed_turn_is_error() {
        let mut folder = TurnFolder::new(Usage::default());
        folder.fold(&event(json!({
            "type": "turn.completed", "turn_id": "t_1", "status": "failed",
            "error": {"message": "model overloaded"}
        })));
        let err = folder.into_result(1).unwrap_err();
        assert!(matches!(
            err,
            Error::TurnFailed { ref message } if message == "model overloaded"
        ));
    }

    #[test]
    fn test_folder_truncated_stream_is_error() {
        let mut folder = TurnFolder::new(Usage::default());
        folder.fold(&event(json!({"type": "turn.started", "turn_id": "t_1"})));
        let err = folder.into_result(1).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
