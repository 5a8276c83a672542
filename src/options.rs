//! Configuration surface: SDK-wide, per-thread, and per-turn options.
//!
//! Options are layered. The effective value of any field is the rightmost
//! non-`None` in:
//!
//! ```text
//! built-in default → CodexOptions → derived-from-fields → ThreadOptions → TurnOptions
//! ```
//!
//! Explicit `false` / `Personality::None` / zero values are values, not
//! absences, and are preserved. Option structs are immutable once built;
//! builders validate and reject out-of-range fields at construction time.
//!
//! Config overrides (`--config key=value`) accept both flat dotted keys and
//! nested maps. Nested maps are flattened (`{"model": {"personality": "x"}}`
//! becomes `model.personality = "x"`), values are rendered in TOML syntax
//! (strings quoted, everything else bare), and all layers are emitted in
//! precedence order so the agent binary's own last-wins parsing reproduces
//! the SDK's merge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::app_server::AppServerConnection;
use crate::approval::ApprovalPolicy;
use crate::error::{Error, Result};
use crate::retry::RetryConfig;

// ============================================================================
// ENUMS
// ============================================================================

/// Reasoning-effort level requested from the model.
///
/// `None` is an explicit level (reasoning off), distinct from not setting
/// the field at all, which defers to the agent's own configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::XHigh => "xhigh",
        }
    }

    /// Coerce to the model's supported set. Mini-tier models cap out at
    /// `high`; requesting `xhigh` on one silently downgrades.
    pub fn coerce_for_model(self, model: &str) -> Self {
        if self == ReasoningEffort::XHigh && is_mini_tier(model) {
            return ReasoningEffort::High;
        }
        self
    }
}

fn is_mini_tier(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("mini") || model.contains("nano")
}

impl std::str::FromStr for ReasoningEffort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ReasoningEffort::None),
            "minimal" => Ok(ReasoningEffort::Minimal),
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "xhigh" => Ok(ReasoningEffort::XHigh),
            other => Err(Error::invalid_input(format!(
                "unknown reasoning effort '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sandbox flavor forwarded to the agent. Enforcement happens in the agent,
/// not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    /// CLI flag form (`--sandbox <value>`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }

    fn wire_type(&self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "readOnly",
            SandboxMode::WorkspaceWrite => "workspaceWrite",
            SandboxMode::DangerFullAccess => "dangerFullAccess",
        }
    }
}

/// Full sandbox policy: the mode plus its workspace-write refinements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub mode: SandboxMode,
    pub writable_roots: Vec<PathBuf>,
    pub network_access: bool,
    pub exclude_tmpdir_env_var: bool,
    pub exclude_slash_tmp: bool,
}

impl SandboxPolicy {
    pub fn read_only() -> Self {
        Self::new(SandboxMode::ReadOnly)
    }

    pub fn workspace_write() -> Self {
        Self::new(SandboxMode::WorkspaceWrite)
    }

    pub fn danger_full_access() -> Self {
        Self::new(SandboxMode::DangerFullAccess)
    }

    fn new(mode: SandboxMode) -> Self {
        Self {
            mode,
            writable_roots: Vec::new(),
            network_access: false,
            exclude_tmpdir_env_var: false,
            exclude_slash_tmp: false,
        }
    }

    pub fn with_writable_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.writable_roots.push(root.into());
        self
    }

    pub fn with_network_access(mut self, allow: bool) -> Self {
        self.network_access = allow;
        self
    }

    /// Tagged record shape used by `turn/start` params.
    pub fn to_wire(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.mode.wire_type().into()));
        if self.mode == SandboxMode::WorkspaceWrite {
            obj.insert(
                "writableRoots".into(),
                Value::Array(
                    self.writable_roots
                        .iter()
                        .map(|p| Value::String(p.display().to_string()))
                        .collect(),
                ),
            );
            obj.insert("networkAccess".into(), Value::Bool(self.network_access));
            obj.insert(
                "excludeTmpdirEnvVar".into(),
                Value::Bool(self.exclude_tmpdir_env_var),
            );
            obj.insert(
                "excludeSlashTmp".into(),
                Value::Bool(self.exclude_slash_tmp),
            );
        }
        Value::Object(obj)
    }
}

/// When the agent should ask the host for approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    Untrusted,
    OnFailure,
    OnRequest,
    Never,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMode::Untrusted => "untrusted",
            ApprovalMode::OnFailure => "on-failure",
            ApprovalMode::OnRequest => "on-request",
            ApprovalMode::Never => "never",
        }
    }
}

/// Web-search posture. `DisabledExplicit` is forwarded; `Default` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebSearchMode {
    #[default]
    Default,
    Enabled,
    DisabledExplicit,
}

/// Personality variant. `None` is the explicit "no personality" value and is
/// forwarded, unlike leaving the field unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Personality {
    None,
    Named(String),
}

impl Personality {
    pub fn as_str(&self) -> &str {
        match self {
            Personality::None => "none",
            Personality::Named(name) => name,
        }
    }
}

/// Whether the agent persists this thread into its session history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryPolicy {
    #[default]
    Persist,
    Ephemeral,
}

/// Terminal color behavior forwarded as `--color`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
    Auto,
}

impl ColorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorMode::Always => "always",
            ColorMode::Never => "never",
            ColorMode::Auto => "auto",
        }
    }
}

/// Transport carrying a thread's turns.
#[derive(Clone, Default)]
pub enum TransportKind {
    /// One subprocess per turn, JSON-Lines on stdout.
    #[default]
    Exec,
    /// A shared persistent JSON-RPC session.
    AppServer(AppServerConnection),
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Exec => "exec",
            TransportKind::AppServer(_) => "app_server",
        }
    }
}

impl std::fmt::Debug for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Validate a transport selector string from host configuration.
///
/// Only `"exec"` and `"app_server"` exist; anything else is a typed
/// [`Error::InvalidTransport`].
pub fn validate_transport_selector(selector: &str) -> Result<()> {
    match selector {
        "exec" | "app_server" => Ok(()),
        other => Err(Error::InvalidTransport(other.to_string())),
    }
}

// ============================================================================
// CODEX-WIDE OPTIONS
// ============================================================================

/// SDK-wide configuration, constructed once per host process.
#[derive(Clone, Default)]
pub struct CodexOptions {
    pub(crate) codex_path: Option<PathBuf>,
    pub(crate) base_url: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) model: Option<String>,
    pub(crate) reasoning_effort: Option<ReasoningEffort>,
    pub(crate) config_overrides: Vec<(String, Value)>,
    pub(crate) history: HistoryPolicy,
    pub(crate) telemetry_prefix: String,
}

/// API keys never appear in logs.
impl std::fmt::Debug for CodexOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodexOptions")
            .field("codex_path", &self.codex_path)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("config_overrides", &self.config_overrides.len())
            .field("history", &self.history)
            .finish()
    }
}

impl CodexOptions {
    pub fn builder() -> CodexOptionsBuilder {
        CodexOptionsBuilder::default()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn telemetry_prefix(&self) -> &str {
        &self.telemetry_prefix
    }
}

#[derive(Default)]
pub struct CodexOptionsBuilder {
    codex_path: Option<PathBuf>,
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    reasoning_effort: Option<ReasoningEffort>,
    config_overrides: Vec<(String, Value)>,
    history: Option<HistoryPolicy>,
    telemetry_prefix: Option<String>,
}

impl CodexOptionsBuilder {
    /// Path to the agent binary; defaults to `codex` on `PATH`.
    pub fn codex_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.codex_path = Some(path.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    /// Add one config override. `value` may be a scalar, array, or nested
    /// map (flattened at emission time).
    pub fn config_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config_overrides.push((key.into(), value.into()));
        self
    }

    pub fn history(mut self, history: HistoryPolicy) -> Self {
        self.history = Some(history);
        self
    }

    pub fn telemetry_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.telemetry_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<CodexOptions> {
        if let Some(url) = &self.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::config(
                    "base_url must start with http:// or https://",
                ));
            }
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(Error::config("model cannot be empty or whitespace"));
            }
        }
        validate_overrides(&self.config_overrides)?;
        Ok(CodexOptions {
            codex_path: self.codex_path,
            base_url: self.base_url,
            api_key: self.api_key,
            model: self.model,
            reasoning_effort: self.reasoning_effort,
            config_overrides: self.config_overrides,
            history: self.history.unwrap_or_default(),
            telemetry_prefix: self.telemetry_prefix.unwrap_or_else(|| "codex".to_string()),
        })
    }
}

// ============================================================================
// THREAD OPTIONS
// ============================================================================

/// Per-thread configuration.
#[derive(Clone, Default)]
pub struct ThreadOptions {
    pub(crate) transport: TransportKind,
    pub(crate) sandbox: Option<SandboxPolicy>,
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) additional_directories: Vec<PathBuf>,
    pub(crate) skip_git_repo_check: bool,
    pub(crate) approval_mode: Option<ApprovalMode>,
    pub(crate) approval_policy: Option<Arc<dyn ApprovalPolicy>>,
    pub(crate) web_search: WebSearchMode,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) retry_rate_limits: bool,
    pub(crate) stream_idle_timeout: Option<Duration>,
    pub(crate) personality: Option<Personality>,
    pub(crate) model: Option<String>,
    pub(crate) reasoning_effort: Option<ReasoningEffort>,
    pub(crate) full_auto: bool,
    pub(crate) dangerously_bypass_approvals_and_sandbox: bool,
    pub(crate) profile: Option<String>,
    pub(crate) oss: bool,
    pub(crate) local_provider: Option<String>,
    pub(crate) color: Option<ColorMode>,
    pub(crate) output_last_message: Option<PathBuf>,
    pub(crate) base_instructions: Option<String>,
    pub(crate) developer_instructions: Option<String>,
    pub(crate) config_overrides: Vec<(String, Value)>,
}

impl std::fmt::Debug for ThreadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadOptions")
            .field("transport", &self.transport)
            .field("sandbox", &self.sandbox)
            .field("working_directory", &self.working_directory)
            .field("approval_mode", &self.approval_mode)
            .field(
                "approval_policy",
                &self.approval_policy.as_ref().map(|_| "<policy>"),
            )
            .field("model", &self.model)
            .field("config_overrides", &self.config_overrides.len())
            .finish()
    }
}

impl ThreadOptions {
    pub fn builder() -> ThreadOptionsBuilder {
        ThreadOptionsBuilder::default()
    }

    pub fn transport(&self) -> &TransportKind {
        &self.transport
    }
}

#[derive(Default)]
pub struct ThreadOptionsBuilder {
    options: ThreadOptions,
}

impl ThreadOptionsBuilder {
    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.options.transport = transport;
        self
    }

    pub fn sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.options.sandbox = Some(sandbox);
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_directory = Some(dir.into());
        self
    }

    pub fn additional_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.additional_directories.push(dir.into());
        self
    }

    pub fn skip_git_repo_check(mut self, skip: bool) -> Self {
        self.options.skip_git_repo_check = skip;
        self
    }

    pub fn approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.options.approval_mode = Some(mode);
        self
    }

    pub fn approval_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.options.approval_policy = Some(policy);
        self
    }

    pub fn web_search(mut self, mode: WebSearchMode) -> Self {
        self.options.web_search = mode;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.options.retry = Some(config);
        self
    }

    pub fn retry_rate_limits(mut self, enabled: bool) -> Self {
        self.options.retry_rate_limits = enabled;
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.stream_idle_timeout = Some(timeout);
        self
    }

    pub fn personality(mut self, personality: Personality) -> Self {
        self.options.personality = Some(personality);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.options.reasoning_effort = Some(effort);
        self
    }

    pub fn full_auto(mut self, enabled: bool) -> Self {
        self.options.full_auto = enabled;
        self
    }

    pub fn dangerously_bypass_approvals_and_sandbox(mut self, enabled: bool) -> Self {
        self.options.dangerously_bypass_approvals_and_sandbox = enabled;
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.options.profile = Some(profile.into());
        self
    }

    pub fn oss(mut self, enabled: bool) -> Self {
        self.options.oss = enabled;
        self
    }

    pub fn local_provider(mut self, provider: impl Into<String>) -> Self {
        self.options.local_provider = Some(provider.into());
        self
    }

    pub fn color(mut self, color: ColorMode) -> Self {
        self.options.color = Some(color);
        self
    }

    pub fn output_last_message(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.output_last_message = Some(path.into());
        self
    }

    pub fn base_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.options.base_instructions = Some(instructions.into());
        self
    }

    pub fn developer_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.options.developer_instructions = Some(instructions.into());
        self
    }

    pub fn config_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.config_overrides.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<ThreadOptions> {
        validate_overrides(&self.options.config_overrides)?;
        if let Some(model) = &self.options.model {
            if model.trim().is_empty() {
                return Err(Error::config("model cannot be empty or whitespace"));
            }
        }
        Ok(self.options)
    }
}

// ============================================================================
// TURN OPTIONS
// ============================================================================

/// Per-call configuration: a superset of [`ThreadOptions`] projected onto a
/// single turn.
#[derive(Clone, Default)]
pub struct TurnOptions {
    pub(crate) model: Option<String>,
    pub(crate) reasoning_effort: Option<ReasoningEffort>,
    pub(crate) sandbox: Option<SandboxPolicy>,
    pub(crate) personality: Option<Personality>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) cancellation_token: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) output_schema: Option<Value>,
    pub(crate) max_turns: Option<u32>,
    pub(crate) images: Vec<PathBuf>,
    pub(crate) stream_idle_timeout: Option<Duration>,
    pub(crate) config_overrides: Vec<(String, Value)>,
    /// Backoff applied between auto-run continuations.
    pub(crate) continuation_backoff: Option<RetryConfig>,
    /// Observer invoked with the attempt number before each continuation.
    pub(crate) on_continuation: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

impl std::fmt::Debug for TurnOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOptions")
            .field("model", &self.model)
            .field("cancellation_token", &self.cancellation_token)
            .field("timeout", &self.timeout)
            .field("max_turns", &self.max_turns)
            .field("images", &self.images.len())
            .finish()
    }
}

impl TurnOptions {
    pub fn builder() -> TurnOptionsBuilder {
        TurnOptionsBuilder::default()
    }
}

#[derive(Default)]
pub struct TurnOptionsBuilder {
    options: TurnOptions,
    invalid_max_turns: bool,
}

impl TurnOptionsBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.options.reasoning_effort = Some(effort);
        self
    }

    pub fn sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.options.sandbox = Some(sandbox);
        self
    }

    pub fn personality(mut self, personality: Personality) -> Self {
        self.options.personality = Some(personality);
        self
    }

    /// Extra environment for the spawned subprocess, layered over the
    /// inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn cancellation_token(mut self, token: impl Into<String>) -> Self {
        self.options.cancellation_token = Some(token.into());
        self
    }

    /// Overall wall-clock limit for the turn (auto-run included).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// JSON-Schema document constraining the final response.
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.options.output_schema = Some(schema);
        self
    }

    /// Auto-run bound. Must be at least 1.
    pub fn max_turns(mut self, max_turns: u32) -> Self {
        if max_turns == 0 {
            self.invalid_max_turns = true;
        }
        self.options.max_turns = Some(max_turns);
        self
    }

    /// Attach a local image (`--image` on the exec transport).
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.images.push(path.into());
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.stream_idle_timeout = Some(timeout);
        self
    }

    pub fn config_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.config_overrides.push((key.into(), value.into()));
        self
    }

    /// Backoff between auto-run continuations (same primitives as retry).
    pub fn continuation_backoff(mut self, config: RetryConfig) -> Self {
        self.options.continuation_backoff = Some(config);
        self
    }

    /// Observe each auto-run continuation before it starts.
    pub fn on_continuation<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.options.on_continuation = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> Result<TurnOptions> {
        if self.invalid_max_turns {
            return Err(Error::invalid_input("max_turns must be at least 1"));
        }
        validate_overrides(&self.options.config_overrides)?;
        Ok(self.options)
    }
}

// ============================================================================
// EFFECTIVE OPTIONS
// ============================================================================

/// The merged projection consumed by the transports. Built per call;
/// rightmost non-`None` layer wins per field.
#[derive(Debug, Clone)]
pub(crate) struct EffectiveOptions {
    pub codex_path: PathBuf,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub sandbox: Option<SandboxPolicy>,
    pub working_directory: Option<PathBuf>,
    pub additional_directories: Vec<PathBuf>,
    pub skip_git_repo_check: bool,
    pub approval_mode: Option<ApprovalMode>,
    pub web_search: WebSearchMode,
    pub personality: Option<Personality>,
    pub full_auto: bool,
    pub dangerously_bypass_approvals_and_sandbox: bool,
    pub profile: Option<String>,
    pub oss: bool,
    pub local_provider: Option<String>,
    pub color: Option<ColorMode>,
    pub output_last_message: Option<PathBuf>,
    pub base_instructions: Option<String>,
    pub developer_instructions: Option<String>,
    pub history: HistoryPolicy,
    pub env: HashMap<String, String>,
    pub cancellation_token: Option<String>,
    pub timeout: Option<Duration>,
    pub output_schema: Option<Value>,
    pub max_turns: u32,
    pub images: Vec<PathBuf>,
    pub stream_idle_timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
    pub retry_rate_limits: bool,
    /// Formatted `key=value` pairs, all layers, precedence order.
    pub config_overrides: Vec<String>,
    /// The same overrides merged last-wins into a nested map (the shape the
    /// app-server's `config` parameter takes).
    pub config_map: Value,
}

/// Default auto-run bound when the caller does not set one.
pub(crate) const DEFAULT_MAX_TURNS: u32 = 10;

impl EffectiveOptions {
    pub(crate) fn resolve(
        codex: &CodexOptions,
        thread: &ThreadOptions,
        turn: &TurnOptions,
    ) -> Result<EffectiveOptions> {
        let model = turn
            .model
            .clone()
            .or_else(|| thread.model.clone())
            .or_else(|| codex.model.clone());

        let reasoning_effort = turn
            .reasoning_effort
            .or(thread.reasoning_effort)
            .or(codex.reasoning_effort)
            .map(|effort| match &model {
                Some(model) => effort.coerce_for_model(model),
                None => effort,
            });

        let layers = collect_override_layers(codex, thread, turn, model.as_deref(), reasoning_effort);
        let config_overrides = format_layers(&layers)?;
        let config_map = merged_config_map(&layers);

        Ok(EffectiveOptions {
            codex_path: codex
                .codex_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("codex")),
            base_url: codex.base_url.clone(),
            api_key: codex.api_key.clone(),
            model,
            reasoning_effort,
            sandbox: turn.sandbox.clone().or_else(|| thread.sandbox.clone()),
            working_directory: thread.working_directory.clone(),
            additional_directories: thread.additional_directories.clone(),
            skip_git_repo_check: thread.skip_git_repo_check,
            approval_mode: thread.approval_mode,
            web_search: thread.web_search,
            personality: turn
                .personality
                .clone()
                .or_else(|| thread.personality.clone()),
            full_auto: thread.full_auto,
            dangerously_bypass_approvals_and_sandbox: thread
                .dangerously_bypass_approvals_and_sandbox,
            profile: thread.profile.clone(),
            oss: thread.oss,
            local_provider: thread.local_provider.clone(),
            color: thread.color,
            output_last_message: thread.output_last_message.clone(),
            base_instructions: thread.base_instructions.clone(),
            developer_instructions: thread.developer_instructions.clone(),
            history: codex.history,
            env: turn.env.clone(),
            cancellation_token: turn.cancellation_token.clone(),
            timeout: turn.timeout,
            output_schema: turn.output_schema.clone(),
            max_turns: turn.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            images: turn.images.clone(),
            stream_idle_timeout: turn.stream_idle_timeout.or(thread.stream_idle_timeout),
            retry: thread.retry.clone(),
            retry_rate_limits: thread.retry_rate_limits,
            config_overrides,
            config_map,
        })
    }
}

// ============================================================================
// CONFIG OVERRIDE FLATTENING
// ============================================================================

/// Collect every override layer as flattened `(path, value)` pairs in
/// strict precedence order: global options, derived-from-fields,
/// thread-level, per-turn. Later entries win downstream, and every layer
/// stays visible so the agent binary reproduces the same merge.
pub(crate) fn collect_override_layers(
    codex: &CodexOptions,
    thread: &ThreadOptions,
    turn: &TurnOptions,
    model: Option<&str>,
    reasoning_effort: Option<ReasoningEffort>,
) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    append_layer(&mut out, &codex.config_overrides);

    // Derived layer: first-class fields projected onto config keys.
    if let Some(model) = model {
        out.push(("model".to_string(), Value::String(model.to_string())));
    }
    if let Some(effort) = reasoning_effort {
        out.push((
            "model_reasoning_effort".to_string(),
            Value::String(effort.as_str().to_string()),
        ));
    }
    match thread.web_search {
        WebSearchMode::Default => {}
        WebSearchMode::Enabled => out.push(("tools.web_search".to_string(), Value::Bool(true))),
        WebSearchMode::DisabledExplicit => {
            out.push(("tools.web_search".to_string(), Value::Bool(false)));
        }
    }
    if let Some(mode) = thread.approval_mode {
        out.push((
            "approval_policy".to_string(),
            Value::String(mode.as_str().to_string()),
        ));
    }
    if codex.history == HistoryPolicy::Ephemeral {
        out.push((
            "history.persistence".to_string(),
            Value::String("none".to_string()),
        ));
    }

    append_layer(&mut out, &thread.config_overrides);
    append_layer(&mut out, &turn.config_overrides);
    out
}

fn append_layer(out: &mut Vec<(String, Value)>, layer: &[(String, Value)]) {
    for (key, value) in layer {
        out.extend(flatten_override(key, value));
    }
}

/// Render the layers as `path=value` strings for `--config` arguments.
fn format_layers(layers: &[(String, Value)]) -> Result<Vec<String>> {
    layers
        .iter()
        .map(|(path, value)| Ok(format!("{path}={}", format_override_value(path, value)?)))
        .collect()
}

/// Merge the layers last-wins into a nested JSON map — the shape the
/// app-server's `config` parameter expects.
pub(crate) fn merged_config_map(layers: &[(String, Value)]) -> Value {
    let mut root = Map::new();
    for (path, value) in layers {
        let mut node = &mut root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.insert(segment.to_string(), value.clone());
            } else {
                let child = node
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                node = child.as_object_mut().expect("just ensured object");
            }
        }
    }
    Value::Object(root)
}

/// Flatten a possibly-nested override into dotted leaf paths.
///
/// `("model", {"personality": "friendly"})` yields
/// `("model.personality", "friendly")`. Non-map values are already leaves.
/// A total function: ordering inside a map follows the map's key order.
pub fn flatten_override(key: &str, value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(map) => {
            let mut out = Vec::new();
            for (child_key, child_value) in map {
                let path = format!("{key}.{child_key}");
                out.extend(flatten_override(&path, child_value));
            }
            out
        }
        other => vec![(key.to_string(), other.clone())],
    }
}

/// Render one override value in TOML syntax: strings quoted, booleans and
/// numbers bare, arrays bracketed, maps (inside arrays) as inline tables.
///
/// Values TOML cannot represent (null, non-finite floats) fail fast with
/// the offending path.
pub fn format_override_value(path: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(Error::InvalidConfigOverride {
                        path: path.to_string(),
                        value: n.to_string(),
                    });
                }
            }
            Ok(n.to_string())
        }
        Value::Array(items) => {
            let rendered: Result<Vec<String>> = items
                .iter()
                .map(|item| format_override_value(path, item))
                .collect();
            Ok(format!("[{}]", rendered?.join(", ")))
        }
        Value::Object(map) => {
            let rendered: Result<Vec<String>> = map
                .iter()
                .map(|(k, v)| Ok(format!("{k} = {}", format_override_value(path, v)?)))
                .collect();
            Ok(format!("{{{}}}", rendered?.join(", ")))
        }
        Value::Null => Err(Error::InvalidConfigOverride {
            path: path.to_string(),
            value: "null".to_string(),
        }),
    }
}

/// Fail-fast validation run at builder time, before anything spawns.
fn validate_overrides(overrides: &[(String, Value)]) -> Result<()> {
    for (key, value) in overrides {
        for (path, leaf) in flatten_override(key, value) {
            format_override_value(&path, &leaf)?;
        }
    }
    Ok(())
}
