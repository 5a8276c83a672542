//! The turn engine: `Codex` and `Thread`.
//!
//! A [`Codex`] holds the SDK-wide options; [`Thread`]s carry conversational
//! state across turns. Each `run_*` call merges options, normalizes input
//! (including the `/new` reset sentinel), picks the thread's transport,
//! folds the event stream into a [`TurnResult`], and updates the thread.
//! When the agent pauses for tool output, the auto-run loop consults
//! approvals, invokes the tool registry, and re-enters the engine with the
//! bridged outputs until the continuation clears or `max_turns` runs out.
//!
//! Turns on one thread are serialized behind the thread's state lock;
//! threads sharing an app-server connection run concurrently.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::app_server::AppServerConnection;
use crate::approval::{ApprovalMediator, ToolApprovalRequest};
use crate::cancel;
use crate::config;
use crate::error::{Error, Result};
use crate::events::{RateLimitSnapshot, ThreadEvent, Usage};
use crate::exec::{self, ResumeSpec};
use crate::options::{CodexOptions, EffectiveOptions, ThreadOptions, TransportKind, TurnOptions};
use crate::registry::{ToolContext, ToolRegistry};
use crate::retry::{detect_rate_limit, rate_limit_delay};
use crate::streaming::{StreamHub, StreamingResult};
use crate::telemetry::{self, Span, events as tevents};
use crate::thread::{PendingToolCall, ThreadInput, ThreadState, TurnFolder, TurnResult};

/// Entry point: SDK-wide options plus thread construction.
///
/// # Examples
///
/// ```rust,no_run
/// use codex_sdk::{Codex, CodexOptions, ThreadOptions};
///
/// # async fn example() -> codex_sdk::Result<()> {
/// let codex = Codex::new(CodexOptions::builder().model("gpt-5").build()?);
/// let thread = codex.start_thread(ThreadOptions::default());
/// let result = thread.run("Summarize the repo layout").await?;
/// println!("{}", result.final_text().unwrap_or(""));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Codex {
    options: Arc<CodexOptions>,
}

impl Codex {
    pub fn new(options: CodexOptions) -> Codex {
        Codex {
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &CodexOptions {
        &self.options
    }

    /// Create a fresh thread. The server assigns its id on the first turn.
    pub fn start_thread(&self, options: ThreadOptions) -> Thread {
        Thread {
            codex: self.options.clone(),
            options: Arc::new(options),
            state: Arc::new(tokio::sync::Mutex::new(ThreadState::default())),
        }
    }

    /// Bind a thread to a known server-side id without replaying events.
    pub fn resume_thread(&self, thread_id: impl Into<String>, options: ThreadOptions) -> Thread {
        let thread = self.start_thread(options);
        {
            let state = thread.state.clone();
            let thread_id = thread_id.into();
            // The lock is uncontended here; the thread was just built.
            if let Ok(mut state) = state.try_lock() {
                state.thread_id = Some(thread_id);
            }
        }
        thread
    }

    /// Open a persistent app-server connection using these options.
    pub async fn connect_app_server(&self) -> Result<AppServerConnection> {
        AppServerConnection::connect(&self.options).await
    }
}

/// One conversational context. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Thread {
    codex: Arc<CodexOptions>,
    options: Arc<ThreadOptions>,
    state: Arc<tokio::sync::Mutex<ThreadState>>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("transport", &self.options.transport())
            .finish()
    }
}

impl Thread {
    /// The server-assigned thread id, once known.
    pub async fn id(&self) -> Option<String> {
        self.state.lock().await.thread_id.clone()
    }

    /// Cumulative usage over this thread's successful turns.
    pub async fn usage(&self) -> Usage {
        self.state.lock().await.usage.clone()
    }

    /// The most recent rate-limit snapshot the agent reported.
    pub async fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.state.lock().await.rate_limits.clone()
    }

    /// Attach an identity label (cleared by the `/new` reset sentinel).
    pub async fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .await
            .labels
            .insert(key.into(), value.into());
    }

    pub async fn labels(&self) -> std::collections::HashMap<String, String> {
        self.state.lock().await.labels.clone()
    }

    /// Attach host metadata (preserved across resets).
    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.metadata.insert(key.into(), value);
    }

    /// Run a turn with default options, auto-running tool continuations.
    pub async fn run(&self, input: impl Into<ThreadInput>) -> Result<TurnResult> {
        self.run_with(input, TurnOptions::default()).await
    }

    /// Run a turn, auto-running tool continuations up to `max_turns`.
    pub async fn run_with(
        &self,
        input: impl Into<ThreadInput>,
        options: TurnOptions,
    ) -> Result<TurnResult> {
        run_loop(self.context(), input.into(), options, None, true).await
    }

    /// Run exactly one turn: no continuation loop. A pending continuation
    /// token is returned on the result instead of being auto-run.
    pub async fn run_turn(
        &self,
        input: impl Into<ThreadInput>,
        options: TurnOptions,
    ) -> Result<TurnResult> {
        run_loop(self.context(), input.into(), options, None, false).await
    }

    /// Run a turn as a lazy, cancellable, multi-consumer stream. No work
    /// happens until the first consumer attaches or `wait` is called.
    pub fn run_streamed(
        &self,
        input: impl Into<ThreadInput>,
        options: TurnOptions,
    ) -> StreamingResult {
        let hub = StreamHub::new();
        let producer_hub = hub.clone();
        let context = self.context();
        let input = input.into();
        let producer = Box::pin(async move {
            let result = run_loop(context, input, options, Some(producer_hub.clone()), true).await;
            match result {
                Ok(result) => producer_hub.finish(Ok(result)),
                Err(error) => {
                    let error = Arc::new(error);
                    producer_hub.emit_error(error.clone()).await;
                    producer_hub.finish(Err(error));
                }
            }
        });
        StreamingResult::new(hub, producer)
    }

    /// Interrupt the in-flight turn. App-server transport only; the exec
    /// transport cancels through its cancellation token instead.
    pub async fn interrupt(&self) -> Result<()> {
        match &self.options.transport() {
            TransportKind::AppServer(connection) => {
                let thread_id = self
                    .id()
                    .await
                    .ok_or_else(|| Error::invalid_input("thread has no id yet"))?;
                connection.turn_interrupt(&thread_id).await
            }
            TransportKind::Exec => Err(Error::UnsupportedFeature(
                "turn/interrupt on the exec transport".to_string(),
            )),
        }
    }

    /// Ask the agent to compact the thread's history. Servers without the
    /// method surface [`Error::UnsupportedFeature`].
    pub async fn compact(&self) -> Result<Value> {
        match &self.options.transport() {
            TransportKind::AppServer(connection) => {
                let thread_id = self
                    .id()
                    .await
                    .ok_or_else(|| Error::invalid_input("thread has no id yet"))?;
                connection.turn_compact(&thread_id).await
            }
            TransportKind::Exec => Err(Error::UnsupportedFeature(
                "turn/compact on the exec transport".to_string(),
            )),
        }
    }

    /// Fork this thread server-side, returning a new [`Thread`] bound to
    /// the forked id. App-server transport only.
    pub async fn fork(&self) -> Result<Thread> {
        match &self.options.transport() {
            TransportKind::AppServer(connection) => {
                let thread_id = self
                    .id()
                    .await
                    .ok_or_else(|| Error::invalid_input("thread has no id yet"))?;
                let forked_id = connection.thread_fork(&thread_id).await?;
                let forked = Thread {
                    codex: self.codex.clone(),
                    options: self.options.clone(),
                    state: Arc::new(tokio::sync::Mutex::new(ThreadState::default())),
                };
                forked.state.lock().await.thread_id = Some(forked_id);
                Ok(forked)
            }
            TransportKind::Exec => Err(Error::UnsupportedFeature(
                "thread/fork on the exec transport".to_string(),
            )),
        }
    }

    /// Run a `codex review --base <ref>` turn. Exec transport only.
    pub async fn review(&self, base_ref: &str, options: TurnOptions) -> Result<TurnResult> {
        if !matches!(self.options.transport(), TransportKind::Exec) {
            return Err(Error::UnsupportedFeature(
                "review on the app-server transport".to_string(),
            ));
        }
        let effective = EffectiveOptions::resolve(&self.codex, &self.options, &options)?;
        let mut state = self.state.lock().await;

        let turn = exec::start_review(&effective, base_ref)?;
        let mut events = turn.events;
        let mut folder = TurnFolder::new(state.usage.clone());
        let fold = fold_exec_stream(&mut events, &mut folder, None).await;
        fold?;
        let outcome = apply_outcome(folder, &mut state)?;
        Ok(finish_result(outcome, 1))
    }

    fn context(&self) -> RunContext {
        RunContext {
            codex: self.codex.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
        }
    }
}

struct RunContext {
    codex: Arc<CodexOptions>,
    options: Arc<ThreadOptions>,
    state: Arc<tokio::sync::Mutex<ThreadState>>,
}

/// Everything a single completed turn contributed.
struct TurnOutcome {
    events: Vec<ThreadEvent>,
    items: Vec<crate::events::ThreadItem>,
    final_response: Option<crate::events::ThreadItem>,
    usage_delta: Usage,
    continuation: Option<String>,
    pending: Vec<PendingToolCall>,
    raw: Value,
}

fn finish_result(outcome: TurnOutcome, attempts: u32) -> TurnResult {
    TurnResult {
        events: outcome.events,
        items: outcome.items,
        final_response: outcome.final_response,
        usage: outcome.usage_delta,
        attempts,
        continuation: outcome.continuation,
        raw: outcome.raw,
    }
}

/// The engine pipeline shared by `run_with`, `run_turn`, and
/// `run_streamed`.
async fn run_loop(
    context: RunContext,
    input: ThreadInput,
    options: TurnOptions,
    hub: Option<Arc<StreamHub>>,
    auto_run: bool,
) -> Result<TurnResult> {
    let effective = EffectiveOptions::resolve(&context.codex, &context.options, &options)?;

    // Turns on one thread are serialized here.
    let mut state = context.state.lock().await;

    let (reset, current_input) = input.take_reset();
    if reset {
        state.reset_identity();
    }

    let span = Span::thread(telemetry::meta(
        state.thread_id.as_deref(),
        None,
        &config::originator(),
    ));

    let timeout = effective.timeout;
    let body = run_attempts(
        &context,
        &effective,
        &options,
        &mut state,
        current_input,
        hub,
        auto_run,
    );
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, body).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(limit.as_millis() as u64)),
        },
        None => body.await,
    };

    match &result {
        Ok(_) => span.finish(),
        Err(error) => span.fail(&error.to_string()),
    }
    result
}

async fn run_attempts(
    context: &RunContext,
    effective: &EffectiveOptions,
    options: &TurnOptions,
    state: &mut ThreadState,
    mut current_input: ThreadInput,
    hub: Option<Arc<StreamHub>>,
    auto_run: bool,
) -> Result<TurnResult> {
    let mut attempts: u32 = 0;
    let mut events: Vec<ThreadEvent> = Vec::new();
    let mut items = Vec::new();
    let mut usage = Usage::default();

    loop {
        attempts += 1;
        let outcome =
            run_attempt_with_retry(context, effective, state, &current_input, hub.as_deref())
                .await?;

        events.extend(outcome.events.iter().cloned());
        items.extend(outcome.items.iter().cloned());
        usage.add(&outcome.usage_delta);

        let Some(continuation) = outcome.continuation.clone() else {
            return Ok(TurnResult {
                usage,
                events,
                items,
                attempts,
                ..finish_result(outcome, attempts)
            });
        };

        if !auto_run {
            return Ok(TurnResult {
                usage,
                events,
                items,
                attempts,
                ..finish_result(outcome, attempts)
            });
        }

        if attempts >= effective.max_turns {
            return Err(Error::MaxTurnsExceeded {
                attempts,
                continuation,
            });
        }

        if hub
            .as_deref()
            .is_some_and(StreamHub::after_turn_requested)
        {
            // Cancelled between turns: hand back the continuation intact.
            return Ok(TurnResult {
                usage,
                events,
                items,
                attempts,
                ..finish_result(outcome, attempts)
            });
        }

        let outputs = bridge_tool_outputs(context, state, &outcome.pending).await?;
        current_input = ThreadInput::Text(
            serde_json::to_string(&outputs).expect("tool outputs are valid JSON"),
        );

        if let Some(observer) = &options.on_continuation {
            observer(attempts);
        }
        if let Some(backoff) = &options.continuation_backoff {
            tokio::time::sleep(backoff.delay_for(attempts - 1)).await;
        }
    }
}

/// One turn, wrapped in classified retry and rate-limit handling.
async fn run_attempt_with_retry(
    context: &RunContext,
    effective: &EffectiveOptions,
    state: &mut ThreadState,
    input: &ThreadInput,
    hub: Option<&StreamHub>,
) -> Result<TurnOutcome> {
    let retry = effective.retry.clone();
    let max_attempts = retry.as_ref().map_or(
        if effective.retry_rate_limits { 4 } else { 1 },
        |config| config.max_attempts,
    );

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = run_single_turn(context, effective, state, input, hub).await;
        let err = match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        if attempt >= max_attempts {
            return Err(err);
        }

        if effective.retry_rate_limits {
            if let Some(info) = detect_rate_limit(&err) {
                let config = retry.clone().unwrap_or_default();
                let delay = rate_limit_delay(&config, &info, attempt - 1);
                telemetry::emit(
                    tevents::RATE_LIMITED,
                    json!({
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "retry_after_ms": info.retry_after_ms,
                    }),
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        match &retry {
            Some(config) if err.is_retryable() => {
                tokio::time::sleep(config.delay_for(attempt - 1)).await;
            }
            _ => return Err(err),
        }
    }
}

async fn run_single_turn(
    context: &RunContext,
    effective: &EffectiveOptions,
    state: &mut ThreadState,
    input: &ThreadInput,
    hub: Option<&StreamHub>,
) -> Result<TurnOutcome> {
    match context.options.transport() {
        TransportKind::Exec => run_exec_turn(effective, state, input, hub).await,
        TransportKind::AppServer(connection) => {
            let connection = connection.clone();
            run_rpc_turn(context, effective, state, input, hub, connection).await
        }
    }
}

async fn run_exec_turn(
    effective: &EffectiveOptions,
    state: &mut ThreadState,
    input: &ThreadInput,
    hub: Option<&StreamHub>,
) -> Result<TurnOutcome> {
    let prompt = input.as_exec_prompt()?;
    let resume = match &state.thread_id {
        Some(thread_id) => ResumeSpec::ThreadId(thread_id.clone()),
        None => ResumeSpec::None,
    };

    let prompt_arg = if prompt.is_empty() {
        None
    } else {
        Some(prompt.as_str())
    };
    let turn = exec::start_turn(effective, &resume, prompt_arg)?;

    if let Some(token) = &effective.cancellation_token {
        cancel::registry().register(token.clone(), &turn.transport);
    }

    let mut events = turn.events;
    let mut folder = TurnFolder::new(state.usage.clone());
    let fold = fold_exec_stream(&mut events, &mut folder, hub).await;

    if let Some(token) = &effective.cancellation_token {
        cancel::registry().unregister(token);
    }
    if fold.is_err() {
        turn.transport.force_close().await;
    }
    fold?;

    apply_outcome(folder, state)
}

async fn run_rpc_turn(
    context: &RunContext,
    effective: &EffectiveOptions,
    state: &mut ThreadState,
    input: &ThreadInput,
    hub: Option<&StreamHub>,
    connection: AppServerConnection,
) -> Result<TurnOutcome> {
    let thread_id = match &state.thread_id {
        Some(thread_id) => thread_id.clone(),
        None => {
            let thread_id = connection
                .thread_start(build_thread_start_params(effective))
                .await?;
            state.thread_id = Some(thread_id.clone());
            thread_id
        }
    };

    let mediator = ApprovalMediator::new(context.options.approval_policy.clone());
    connection.set_thread_approval(&thread_id, mediator).await;

    let mut subscription = connection.subscribe_thread(&thread_id).await;
    let params = build_turn_start_params(&thread_id, input, effective)?;
    let started = connection.turn_start(params).await;
    if let Err(error) = started {
        connection.unsubscribe_thread(&thread_id).await;
        return Err(error);
    }

    let mut folder = TurnFolder::new(state.usage.clone());
    let fold = fold_rpc_stream(&mut subscription, &mut folder, hub, effective).await;
    connection.unsubscribe_thread(&thread_id).await;
    fold?;

    apply_outcome(folder, state)
}

async fn fold_exec_stream(
    events: &mut tokio::sync::mpsc::Receiver<Result<ThreadEvent>>,
    folder: &mut TurnFolder,
    hub: Option<&StreamHub>,
) -> Result<()> {
    let mut cancel_rx = hub.map(StreamHub::cancel_watch);
    loop {
        let next = match &mut cancel_rx {
            Some(cancel) => {
                tokio::select! {
                    next = events.recv() => next,
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return Err(Error::Cancelled);
                        }
                        continue;
                    }
                }
            }
            None => events.recv().await,
        };

        match next {
            Some(Ok(event)) => {
                if let Some(hub) = hub {
                    hub.emit(event.clone()).await;
                }
                let done = folder.fold(&event);
                if let Some(hub) = hub {
                    hub.set_usage(folder.cumulative_usage());
                }
                if done {
                    return Ok(());
                }
            }
            Some(Err(error)) => return Err(error),
            None => return Ok(()),
        }
    }
}

async fn fold_rpc_stream(
    subscription: &mut tokio::sync::mpsc::Receiver<ThreadEvent>,
    folder: &mut TurnFolder,
    hub: Option<&StreamHub>,
    effective: &EffectiveOptions,
) -> Result<()> {
    let mut cancel_rx = hub.map(StreamHub::cancel_watch);
    loop {
        let recv = async {
            match effective.stream_idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, subscription.recv()).await {
                    Ok(next) => Ok(next),
                    Err(_) => Err(Error::transport_retryable(format!(
                        "stream idle timeout after {} ms with no agent output",
                        idle.as_millis()
                    ))),
                },
                None => Ok(subscription.recv().await),
            }
        };

        let next = match &mut cancel_rx {
            Some(cancel) => {
                tokio::select! {
                    next = recv => next?,
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return Err(Error::Cancelled);
                        }
                        continue;
                    }
                }
            }
            None => recv.await?,
        };

        match next {
            Some(event) => {
                if let Some(hub) = hub {
                    hub.emit(event.clone()).await;
                }
                let done = folder.fold(&event);
                if let Some(hub) = hub {
                    hub.set_usage(folder.cumulative_usage());
                }
                if done {
                    return Ok(());
                }
            }
            None => {
                return Err(Error::transport(
                    "app-server connection closed mid-turn",
                ));
            }
        }
    }
}

/// Commit a completed fold into thread state and package the outcome.
fn apply_outcome(folder: TurnFolder, state: &mut ThreadState) -> Result<TurnOutcome> {
    let thread_id = folder.thread_id.clone();
    let rate_limits = folder.rate_limits.clone();
    let usage_delta = folder.usage_delta();
    let pending = folder.pending_tool_calls.clone();

    let result = folder.into_result(1)?;

    // thread_id is immutable once bound (only the reset sentinel clears it).
    if state.thread_id.is_none() {
        state.thread_id = thread_id;
    }
    state.usage.add(&usage_delta);
    if let Some(snapshot) = rate_limits {
        state.rate_limits = Some(snapshot);
    }
    state.pending_tool_calls = pending.clone();

    Ok(TurnOutcome {
        events: result.events,
        items: result.items,
        final_response: result.final_response,
        usage_delta,
        continuation: result.continuation,
        pending,
        raw: result.raw,
    })
}

/// Execute the pending tool calls and shape their outputs for the next
/// turn: ordered by the request list, nested lists flattened, identical
/// outputs for the same call deduplicated.
async fn bridge_tool_outputs(
    context: &RunContext,
    state: &ThreadState,
    pending: &[PendingToolCall],
) -> Result<Vec<Value>> {
    let registry = ToolRegistry::global();
    let mediator = context
        .options
        .approval_policy
        .as_ref()
        .map(|policy| ApprovalMediator::new(Some(policy.clone())));

    let mut outputs = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for call in pending {
        if call.is_pre_approved() {
            telemetry::emit(
                tevents::APPROVAL_REQUESTED,
                json!({"tool": call.tool, "call_id": call.call_id, "safe_command": true}),
            );
            telemetry::emit(
                tevents::APPROVAL_APPROVED,
                json!({"tool": call.tool, "call_id": call.call_id, "safe_command": true}),
            );
        } else if let Some(mediator) = &mediator {
            let request = ToolApprovalRequest {
                call_id: call.call_id.clone(),
                tool: call.tool.clone(),
                arguments: call.arguments.clone(),
                thread_id: state.thread_id.clone(),
                turn_id: None,
            };
            mediator.review_tool(&request).await?;
        }

        let output = registry
            .invoke(
                &call.tool,
                call.arguments.clone(),
                ToolContext {
                    call_id: call.call_id.clone(),
                    thread_id: state.thread_id.clone(),
                    turn_id: None,
                },
            )
            .await?;

        for value in flatten_outputs(output) {
            let key = (call.call_id.clone(), value.to_string());
            if seen.insert(key) {
                outputs.push(json!({
                    "type": "tool_output",
                    "call_id": call.call_id,
                    "output": value,
                }));
            }
        }
    }

    Ok(outputs)
}

fn flatten_outputs(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.into_iter().flat_map(flatten_outputs).collect(),
        other => vec![other],
    }
}

fn build_thread_start_params(effective: &EffectiveOptions) -> Value {
    let mut params = Map::new();
    if let Some(model) = &effective.model {
        params.insert("model".into(), Value::String(model.clone()));
    }
    if let Some(cwd) = &effective.working_directory {
        params.insert("cwd".into(), Value::String(cwd.display().to_string()));
    }
    if let Some(mode) = effective.approval_mode {
        params.insert(
            "approvalPolicy".into(),
            Value::String(mode.as_str().to_string()),
        );
    }
    if let Some(sandbox) = &effective.sandbox {
        params.insert(
            "sandbox".into(),
            Value::String(sandbox.mode.as_str().to_string()),
        );
    }
    params.insert("config".into(), effective.config_map.clone());
    if let Some(instructions) = &effective.base_instructions {
        params.insert(
            "baseInstructions".into(),
            Value::String(instructions.clone()),
        );
    }
    if let Some(instructions) = &effective.developer_instructions {
        params.insert(
            "developerInstructions".into(),
            Value::String(instructions.clone()),
        );
    }
    if let Some(personality) = &effective.personality {
        params.insert(
            "personality".into(),
            Value::String(personality.as_str().to_string()),
        );
    }
    params.insert("experimentalRawEvents".into(), Value::Bool(false));
    Value::Object(params)
}

fn build_turn_start_params(
    thread_id: &str,
    input: &ThreadInput,
    effective: &EffectiveOptions,
) -> Result<Value> {
    let mut params = Map::new();
    params.insert("threadId".into(), Value::String(thread_id.to_string()));
    params.insert("input".into(), Value::Array(input.to_rpc_blocks()?));
    if let Some(model) = &effective.model {
        params.insert("model".into(), Value::String(model.clone()));
    }
    if let Some(effort) = effective.reasoning_effort {
        params.insert("effort".into(), Value::String(effort.as_str().to_string()));
    }
    if let Some(sandbox) = &effective.sandbox {
        params.insert("sandboxPolicy".into(), sandbox.to_wire());
    }
    if let Some(personality) = &effective.personality {
        params.insert(
            "personality".into(),
            Value::String(personality.as_str().to_string()),
        );
    }
    if let Some(schema) = &effective.output_schema {
        params.insert("outputSchema".into(), schema.clone());
    }
    Ok(Value::Object(params))
}
