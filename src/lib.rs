//! # Codex SDK for Rust
//!
//! An embeddable SDK that drives the Codex agent CLI on behalf of a host
//! program and exposes its streaming, multi-turn, tool-using interaction
//! model as a typed, concurrent, observable API.
//!
//! The SDK does not implement a language model. It supervises the agent
//! binary as a child process — or holds a persistent JSON-RPC session
//! against the same binary — and translates between your typed calls and
//! the agent's two wire protocols.
//!
//! ## Two transports, one event stream
//!
//! - **Exec** — one subprocess per turn speaking JSON-Lines
//!   (`codex exec --json`). The default; nothing to connect or release.
//! - **App-server** — a persistent JSON-RPC session (`codex app-server`)
//!   multiplexing many threads over one connection, with server-initiated
//!   approval requests answered by your [`ApprovalPolicy`].
//!
//! Both produce the same typed [`ThreadEvent`] stream.
//!
//! ## A turn in five lines
//!
//! ```rust,no_run
//! use codex_sdk::{Codex, CodexOptions, ThreadOptions};
//!
//! #[tokio::main]
//! async fn main() -> codex_sdk::Result<()> {
//!     let codex = Codex::new(CodexOptions::builder().model("gpt-5").build()?);
//!     let thread = codex.start_thread(ThreadOptions::default());
//!     let result = thread.run("Explain this repository").await?;
//!     println!("{}", result.final_text().unwrap_or("<no response>"));
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use codex_sdk::{Codex, CodexOptions, ThreadOptions, TurnOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> codex_sdk::Result<()> {
//!     let codex = Codex::new(CodexOptions::builder().build()?);
//!     let thread = codex.start_thread(ThreadOptions::default());
//!
//!     let streaming = thread.run_streamed("Refactor the parser", TurnOptions::default());
//!     let mut events = streaming.raw_events();
//!     while let Some(event) = events.next().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **client**: the turn engine (`Codex`, `Thread`) and auto-run loop
//! - **events**: the closed event/item sums decoded from both wire formats
//! - **process**: supervised subprocess transport with escalating shutdown
//! - **exec** / **app_server**: the two turn transports
//! - **options**: layered configuration with config-override flattening
//! - **retry** / **approval** / **cancel**: the mediators around a turn
//! - **streaming**: lazy multi-consumer event streams
//! - **registry**: process-wide tool registration and metrics
//! - **telemetry** / **config** / **attachments** / **codec**: the spine

/// Persistent JSON-RPC transport against `codex app-server`.
pub mod app_server;

/// Approval policies and the mediator that runs them.
pub mod approval;

/// Content-addressed attachment staging.
pub mod attachments;

/// Cancellation-token registry.
pub mod cancel;

/// Line-buffer codec for the agent's stdout.
pub mod codec;

/// Environment discovery and session enumeration.
pub mod config;

/// Typed events and items.
pub mod events;

/// Process-wide tool registry and function-tool schemas.
pub mod registry;

/// Retry and rate-limit mediators.
pub mod retry;

/// Streaming result surface.
pub mod streaming;

/// Telemetry spine.
pub mod telemetry;

mod client;
mod error;
mod exec;
mod options;
mod process;
mod thread;

// --- Core API ---

pub use client::{Codex, Thread};

// --- Errors ---

pub use error::{Error, Result};

// --- Events & items ---

pub use events::{
    CompactionStage, FileChangeKind, FileUpdateChange, ItemStatus, RateLimitSnapshot, ThreadEvent,
    ThreadItem, TodoItem, TurnError, TurnStatus, Usage,
};

// --- Options ---

pub use options::{
    ApprovalMode, CodexOptions, CodexOptionsBuilder, ColorMode, HistoryPolicy, Personality,
    ReasoningEffort, SandboxMode, SandboxPolicy, ThreadOptions, ThreadOptionsBuilder,
    TransportKind, TurnOptions, TurnOptionsBuilder, validate_transport_selector,
};

// --- Transports ---

pub use app_server::{AppServerConnection, ConnectionState};
pub use process::{
    ExitInfo, IoMessage, IoPayload, ProcessStatus, ProcessTransport, SpawnSpec, Subscription,
};

// --- Mediators ---

pub use approval::{
    ApprovalDecision, ApprovalHints, ApprovalPolicy, CommandApprovalRequest,
    FileChangeApprovalRequest, ToolApprovalRequest,
};
pub use retry::{BackoffStrategy, RetryConfig};

// --- Streaming ---

pub use streaming::{CancelMode, EventStream, RunEvent, StreamingResult};

// --- Threads & results ---

pub use thread::{InputBlock, PendingToolCall, RESET_SENTINEL, ThreadInput, TurnResult};

// --- Tools ---

pub use registry::{Tool, ToolBuilder, ToolContext, ToolMetrics, ToolOptions, ToolRegistry, tool};

/// The most commonly used names in one import.
///
/// ```rust
/// use codex_sdk::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ApprovalDecision, ApprovalPolicy, Codex, CodexOptions, Error, Result, RetryConfig,
        SandboxPolicy, StreamingResult, Thread, ThreadEvent, ThreadInput, ThreadItem,
        ThreadOptions, TurnOptions, TurnResult, Usage, tool,
    };
}
