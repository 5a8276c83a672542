//! Error types for the Codex SDK
//!
//! Errors form a flat taxonomy that callers pattern-match on. Transport and
//! subprocess failures carry enough context (exit status, stderr tail,
//! retryability) for the retry mediator in [`crate::retry`] to classify them
//! without string inspection.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure: spawn error, broken pipe, not connected,
    /// idle timeout, line-buffer overflow.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        /// Whether the retry mediator may re-attempt the turn.
        retryable: bool,
    },

    /// The agent subprocess exited with a non-zero status.
    ///
    /// Exits caused by signals are normalized to `128 + signal` before this
    /// variant is constructed. The captured stderr tail is attached verbatim.
    #[error("agent process exited with status {exit_status}: {stderr}")]
    ExecFailed { exit_status: i32, stderr: String },

    /// Overall turn timeout (`TurnOptions::timeout`) elapsed.
    #[error("turn timed out after {ms} ms")]
    Timeout { ms: u64 },

    /// A rate limit was reported by the agent or detected in its output.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Server-provided wait hint, when one was present.
        retry_after_ms: Option<u64>,
        message: String,
    },

    /// An approval policy refused a tool call, command, or file change.
    /// Async policies that time out surface here with reason
    /// `"approval timeout"`.
    #[error("approval denied for {tool}: {reason}")]
    ApprovalDenied { tool: String, reason: String },

    /// The named tool is registered but gated off by its enablement predicate.
    #[error("tool '{0}' is disabled")]
    ToolDisabled(String),

    /// A tool name was registered twice; registration is insert-if-absent.
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The agent reported the turn itself as failed.
    #[error("turn failed: {message}")]
    TurnFailed { message: String },

    /// A registered tool's handler returned an error.
    #[error("tool '{name}' failed: {inner}")]
    ToolCallFailed { name: String, inner: Box<Error> },

    /// A config-override value cannot be represented in TOML
    /// (non-finite float, unsupported shape). Raised before spawning.
    #[error("invalid config override value at '{path}': {value}")]
    InvalidConfigOverride { path: String, value: String },

    /// An unknown transport selector was supplied.
    #[error("invalid transport: {0}")]
    InvalidTransport(String),

    /// The input shape is not supported by the selected transport
    /// (structured block lists require the app-server transport).
    #[error("input not supported by the {transport} transport")]
    UnsupportedInput { transport: String },

    /// The auto-run loop exhausted `max_turns` with a continuation token
    /// still pending.
    #[error("max turns exceeded after {attempts} attempts (continuation pending)")]
    MaxTurnsExceeded { attempts: u32, continuation: String },

    /// A guardrail tripped or rejected around a turn. The SDK carries the
    /// taxonomy; the guardrail layers themselves live above the engine.
    #[error("guardrail '{name}' ({kind}) tripped at {stage}")]
    Guardrail {
        stage: String,
        name: String,
        kind: String,
    },

    /// An optional subsystem or RPC method is not available on this agent
    /// version (e.g. `turn/compact` on servers that removed it).
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The turn was cancelled through a cancellation token or
    /// `StreamingResult::cancel`.
    #[error("turn cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error from the subprocess or staging directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Streaming error
    #[error("streaming error: {0}")]
    Stream(String),
}

impl Error {
    /// Create a non-retryable transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a retryable transport error
    pub fn transport_retryable(msg: impl Into<String>) -> Self {
        Error::Transport {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an exec-failure error from a normalized exit status and a
    /// stderr tail. Signal exits must already be mapped to `128 + signal`.
    pub fn exec_failed(exit_status: i32, stderr: impl Into<String>) -> Self {
        Error::ExecFailed {
            exit_status,
            stderr: stderr.into(),
        }
    }

    /// Create a rate-limit error, optionally carrying a server wait hint
    pub fn rate_limit(retry_after_ms: Option<u64>, msg: impl Into<String>) -> Self {
        Error::RateLimit {
            retry_after_ms,
            message: msg.into(),
        }
    }

    /// Create an approval-denied error
    pub fn approval_denied(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ApprovalDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a turn timeout error
    pub fn timeout(ms: u64) -> Self {
        Error::Timeout { ms }
    }

    /// Whether a subprocess exit status indicates a transient failure.
    ///
    /// `128 + SIGTERM/SIGKILL/SIGPIPE` (143, 137, 141) and the sysexits
    /// temporary-failure codes 69 (`EX_UNAVAILABLE`) and 75 (`EX_TEMPFAIL`)
    /// are retryable. 0 and 1 are not.
    pub fn exit_status_is_retryable(exit_status: i32) -> bool {
        matches!(exit_status, 137 | 141 | 143 | 69 | 75)
    }

    /// Default retryability classification used by the retry mediator.
    ///
    /// Covers timeouts, connection-flavored transport errors, rate limits,
    /// HTTP-style 5xx/429 messages reported by the agent, stream resets, and
    /// transport errors already marked retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { retryable, message } => {
                *retryable
                    || message.contains("econnrefused")
                    || message.contains("econnreset")
                    || message.contains("closed")
                    || message.contains("nxdomain")
                    || has_transient_http_status(message)
            }
            Error::Timeout { .. } => true,
            Error::RateLimit { .. } => true,
            Error::Stream(_) => true,
            Error::ExecFailed {
                exit_status,
                stderr,
            } => {
                Error::exit_status_is_retryable(*exit_status)
                    || has_transient_http_status(stderr)
            }
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Whether an agent-reported message carries a transient HTTP status:
/// a 5xx server error or a 429 rate limit. 4xx client errors stay final.
fn has_transient_http_status(message: &str) -> bool {
    message.contains("429")
        || message.contains("500")
        || message.contains("502")
        || message.contains("503")
        || message.contains("504")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors() {
        let err = Error::transport("not connected");
        assert!(matches!(
            err,
            Error::Transport {
                retryable: false,
                ..
            }
        ));
        assert_eq!(err.to_string(), "transport error: not connected");

        let err = Error::transport_retryable("stream idle timeout after 100 ms");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_exec_failed_display() {
        let err = Error::exec_failed(2, "boom");
        assert_eq!(err.to_string(), "agent process exited with status 2: boom");
    }

    #[test]
    fn test_exit_status_classification() {
        // 128 + SIGKILL / SIGPIPE / SIGTERM
        assert!(Error::exit_status_is_retryable(137));
        assert!(Error::exit_status_is_retryable(141));
        assert!(Error::exit_status_is_retryable(143));
        // sysexits temporary failures
        assert!(Error::exit_status_is_retryable(69));
        assert!(Error::exit_status_is_retryable(75));
        // clean and generic failures are final
        assert!(!Error::exit_status_is_retryable(0));
        assert!(!Error::exit_status_is_retryable(1));
        assert!(!Error::exit_status_is_retryable(2));
    }

    #[test]
    fn test_is_retryable_defaults() {
        assert!(Error::timeout(5000).is_retryable());
        assert!(Error::rate_limit(Some(250), "429").is_retryable());
        assert!(Error::stream("reset by peer").is_retryable());
        assert!(Error::exec_failed(75, "").is_retryable());
        assert!(!Error::exec_failed(1, "").is_retryable());
        assert!(!Error::config("bad").is_retryable());
        assert!(!Error::invalid_input("bad").is_retryable());
        assert!(
            !Error::ApprovalDenied {
                tool: "shell".into(),
                reason: "denied".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_connection_flavored_transport_is_retryable() {
        let err = Error::transport("spawn failed: econnrefused");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_transient_http_statuses_are_retryable() {
        // 5xx server errors reported by the agent are transient.
        assert!(Error::transport("500 Internal Server Error").is_retryable());
        assert!(Error::transport("upstream returned 502").is_retryable());
        assert!(Error::transport("503 Service Unavailable").is_retryable());
        assert!(Error::transport("504 Gateway Timeout").is_retryable());
        // So is a 429, even before rate-limit handling sees it.
        assert!(Error::transport("HTTP 429 Too Many Requests").is_retryable());
        // 4xx client errors are final.
        assert!(!Error::transport("404 Not Found").is_retryable());
        assert!(!Error::transport("400 Bad Request").is_retryable());
    }

    #[test]
    fn test_exec_failed_stderr_http_status_is_retryable() {
        // Exit code 1 alone is final, but a 5xx in the captured stderr
        // marks the failure transient.
        assert!(Error::exec_failed(1, "HTTP 503 from api.openai.com").is_retryable());
        assert!(Error::exec_failed(1, "got 429, backing off").is_retryable());
        assert!(!Error::exec_failed(1, "invalid prompt").is_retryable());
    }

    #[test]
    fn test_max_turns_display() {
        let err = Error::MaxTurnsExceeded {
            attempts: 2,
            continuation: "cont-auto-run".into(),
        };
        assert_eq!(
            err.to_string(),
            "max turns exceeded after 2 attempts (continuation pending)"
        );
    }

    #[test]
    fn test_guardrail_display() {
        let err = Error::Guardrail {
            stage: "pre".into(),
            name: "pii".into(),
            kind: "tripwire".into(),
        };
        assert_eq!(err.to_string(), "guardrail 'pii' (tripwire) tripped at pre");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
