//! Approval mediator for side-effecting agent actions.
//!
//! An [`ApprovalPolicy`] reviews three kinds of requests: host tool calls,
//! shell commands, and file changes. Policies are async; a slow or external
//! decision simply awaits, and the mediator bounds it with a timeout that
//! translates into a deny (reason `"approval timeout"`).
//!
//! Decisions can carry hints. `execpolicy_amendment` (an argv prefix) maps
//! to the app-server's `acceptWithExecpolicyAmendment` decision;
//! `grant_root` maps to `acceptForSession` for file-change approvals.
//!
//! # Examples
//!
//! ```rust,no_run
//! use codex_sdk::approval::{ApprovalDecision, ApprovalPolicy, CommandApprovalRequest};
//! use async_trait::async_trait;
//!
//! struct NoDeletes;
//!
//! #[async_trait]
//! impl ApprovalPolicy for NoDeletes {
//!     async fn review_command(&self, request: &CommandApprovalRequest) -> ApprovalDecision {
//!         if request.command.contains("rm -rf") {
//!             ApprovalDecision::deny("destructive command")
//!         } else {
//!             ApprovalDecision::allow()
//!         }
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::telemetry::{self, events};

/// How long the mediator waits for a policy before denying.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Optional refinements attached to an allow decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalHints {
    /// Argv the agent may run without re-asking (command approvals).
    pub execpolicy_amendment: Option<Vec<String>>,
    /// Root the agent may keep writing under for this session (file
    /// approvals).
    pub grant_root: Option<PathBuf>,
}

/// Outcome of one review.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Allow,
    AllowWith(ApprovalHints),
    Deny { reason: String },
}

impl ApprovalDecision {
    pub fn allow() -> Self {
        ApprovalDecision::Allow
    }

    pub fn allow_with(hints: ApprovalHints) -> Self {
        ApprovalDecision::AllowWith(hints)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        ApprovalDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        !matches!(self, ApprovalDecision::Deny { .. })
    }
}

/// A host-tool invocation awaiting review.
#[derive(Debug, Clone)]
pub struct ToolApprovalRequest {
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

/// A shell command the agent wants to execute.
#[derive(Debug, Clone)]
pub struct CommandApprovalRequest {
    pub call_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub reason: Option<String>,
    /// Amendment the agent proposes; a policy may echo it back to grant it.
    pub proposed_execpolicy_amendment: Option<Vec<String>>,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

/// A file modification the agent wants to apply.
#[derive(Debug, Clone)]
pub struct FileChangeApprovalRequest {
    pub call_id: String,
    pub changes: Value,
    pub reason: Option<String>,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

/// Reviewable policy. Every entry point defaults to allow so hosts only
/// implement the checks they care about; a thread with *no* policy at all
/// fails closed instead (see [`ApprovalMediator`]).
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn review_tool(&self, request: &ToolApprovalRequest) -> ApprovalDecision {
        let _ = request;
        ApprovalDecision::allow()
    }

    async fn review_command(&self, request: &CommandApprovalRequest) -> ApprovalDecision {
        let _ = request;
        ApprovalDecision::allow()
    }

    async fn review_file(&self, request: &FileChangeApprovalRequest) -> ApprovalDecision {
        let _ = request;
        ApprovalDecision::allow()
    }
}

/// Runs reviews with timeout, telemetry, and wire mapping.
#[derive(Clone)]
pub struct ApprovalMediator {
    policy: Option<Arc<dyn ApprovalPolicy>>,
    timeout: Duration,
}

impl ApprovalMediator {
    pub fn new(policy: Option<Arc<dyn ApprovalPolicy>>) -> Self {
        Self {
            policy,
            timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Review a host tool call. Returns the denial as a typed error so the
    /// auto-run loop can surface it.
    pub async fn review_tool(&self, request: &ToolApprovalRequest) -> Result<ApprovalDecision> {
        let decision = self
            .run_review(&request.tool, &request.call_id, |policy| {
                let request = request.clone();
                async move { policy.review_tool(&request).await }
            })
            .await;
        match decision {
            ApprovalDecision::Deny { reason } => {
                Err(Error::approval_denied(&request.tool, reason))
            }
            allow => Ok(allow),
        }
    }

    /// Review a command-execution request and map the decision to its
    /// app-server wire form.
    pub async fn decide_command(&self, request: &CommandApprovalRequest) -> Value {
        let decision = self
            .run_review("command_execution", &request.call_id, |policy| {
                let request = request.clone();
                async move { policy.review_command(&request).await }
            })
            .await;
        command_decision_to_wire(&decision)
    }

    /// Review a file-change request and map the decision to its app-server
    /// wire form.
    pub async fn decide_file(&self, request: &FileChangeApprovalRequest) -> Value {
        let decision = self
            .run_review("file_change", &request.call_id, |policy| {
                let request = request.clone();
                async move { policy.review_file(&request).await }
            })
            .await;
        file_decision_to_wire(&decision)
    }

    async fn run_review<F, Fut>(&self, tool: &str, call_id: &str, review: F) -> ApprovalDecision
    where
        F: FnOnce(Arc<dyn ApprovalPolicy>) -> Fut,
        Fut: std::future::Future<Output = ApprovalDecision>,
    {
        let started = Instant::now();
        telemetry::emit(
            events::APPROVAL_REQUESTED,
            json!({"tool": tool, "call_id": call_id}),
        );

        let Some(policy) = self.policy.clone() else {
            // Fail closed: nothing was configured to say yes.
            let decision = ApprovalDecision::deny("no approval policy configured");
            self.emit_outcome(tool, call_id, started, &decision, false);
            return decision;
        };

        match tokio::time::timeout(self.timeout, review(policy)).await {
            Ok(decision) => {
                self.emit_outcome(tool, call_id, started, &decision, false);
                decision
            }
            Err(_) => {
                let decision = ApprovalDecision::deny("approval timeout");
                self.emit_outcome(tool, call_id, started, &decision, true);
                decision
            }
        }
    }

    fn emit_outcome(
        &self,
        tool: &str,
        call_id: &str,
        started: Instant,
        decision: &ApprovalDecision,
        timed_out: bool,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let (event, reason) = if timed_out {
            (events::APPROVAL_TIMEOUT, None)
        } else {
            match decision {
                ApprovalDecision::Deny { reason } => {
                    (events::APPROVAL_DENIED, Some(reason.clone()))
                }
                _ => (events::APPROVAL_APPROVED, None),
            }
        };
        telemetry::emit(
            event,
            json!({
                "tool": tool,
                "call_id": call_id,
                "duration_ms": duration_ms,
                "reason": reason,
            }),
        );
    }
}

/// Command decisions: `accept`, `decline`, or the amendment object.
pub(crate) fn command_decision_to_wire(decision: &ApprovalDecision) -> Value {
    match decision {
        ApprovalDecision::Allow => json!("accept"),
        ApprovalDecision::AllowWith(hints) => match &hints.execpolicy_amendment {
            Some(argv) => json!({
                "acceptWithExecpolicyAmendment": {"execpolicyAmendment": argv}
            }),
            None => json!("accept"),
        },
        ApprovalDecision::Deny { .. } => json!("decline"),
    }
}

/// File decisions: a `grant_root` hint upgrades accept to
/// `acceptForSession`.
pub(crate) fn file_decision_to_wire(decision: &ApprovalDecision) -> Value {
    match decision {
        ApprovalDecision::Allow => json!("accept"),
        ApprovalDecision::AllowWith(hints) => {
            if hints.grant_root.is_some() {
                json!("acceptForSession")
            } else {
                json!("accept")
            }
        }
        ApprovalDecision::Deny { .. } => json!("decline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(ApprovalDecision);

    #[async_trait]
    impl ApprovalPolicy for Scripted {
        async fn review_command(&self, _request: &CommandApprovalRequest) -> ApprovalDecision {
            self.0.clone()
        }

        async fn review_file(&self, _request: &FileChangeApprovalRequest) -> ApprovalDecision {
            self.0.clone()
        }

        async fn review_tool(&self, _request: &ToolApprovalRequest) -> ApprovalDecision {
            self.0.clone()
        }
    }

    struct Hanging;

    #[async_trait]
    impl ApprovalPolicy for Hanging {
        async fn review_command(&self, _request: &CommandApprovalRequest) -> ApprovalDecision {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ApprovalDecision::allow()
        }
    }

    fn command_request() -> CommandApprovalRequest {
        CommandApprovalRequest {
            call_id: "call_1".into(),
            command: "npm install".into(),
            cwd: None,
            reason: None,
            proposed_execpolicy_amendment: Some(vec!["npm".into(), "install".into()]),
            thread_id: None,
            turn_id: None,
        }
    }

    #[tokio::test]
    async fn test_allow_maps_to_accept() {
        let mediator = ApprovalMediator::new(Some(Arc::new(Scripted(ApprovalDecision::allow()))));
        let wire = mediator.decide_command(&command_request()).await;
        assert_eq!(wire, json!("accept"));
    }

    #[tokio::test]
    async fn test_execpolicy_amendment_wire_shape() {
        let hints = ApprovalHints {
            execpolicy_amendment: Some(vec!["npm".into(), "install".into()]),
            grant_root: None,
        };
        let mediator = ApprovalMediator::new(Some(Arc::new(Scripted(
            ApprovalDecision::allow_with(hints),
        ))));
        let wire = mediator.decide_command(&command_request()).await;
        assert_eq!(
            wire,
            json!({"acceptWithExecpolicyAmendment": {"execpolicyAmendment": ["npm", "install"]}})
        );
    }

    #[tokio::test]
    async fn test_grant_root_maps_to_accept_for_session() {
        let hints = ApprovalHints {
            execpolicy_amendment: None,
            grant_root: Some("/workspace".into()),
        };
        let mediator = ApprovalMediator::new(Some(Arc::new(Scripted(
            ApprovalDecision::allow_with(hints),
        ))));
        let request = FileChangeApprovalRequest {
            call_id: "call_2".into(),
            changes: json!([]),
            reason: None,
            thread_id: None,
            turn_id: None,
        };
        assert_eq!(mediator.decide_file(&request).await, json!("acceptForSession"));
    }

    #[tokio::test]
    async fn test_deny_maps_to_decline() {
        let mediator =
            ApprovalMediator::new(Some(Arc::new(Scripted(ApprovalDecision::deny("nope")))));
        assert_eq!(
            mediator.decide_command(&command_request()).await,
            json!("decline")
        );
    }

    #[tokio::test]
    async fn test_no_policy_fails_closed() {
        let mediator = ApprovalMediator::new(None);
        assert_eq!(
            mediator.decide_command(&command_request()).await,
            json!("decline")
        );
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let mediator = ApprovalMediator::new(Some(Arc::new(Hanging)))
            .with_timeout(Duration::from_millis(20));
        assert_eq!(
            mediator.decide_command(&command_request()).await,
            json!("decline")
        );
    }

    #[tokio::test]
    async fn test_tool_review_denial_is_typed() {
        let mediator =
            ApprovalMediator::new(Some(Arc::new(Scripted(ApprovalDecision::deny("blocked")))));
        let request = ToolApprovalRequest {
            call_id: "call_3".into(),
            tool: "get_weather".into(),
            arguments: json!({}),
            thread_id: None,
            turn_id: None,
        };
        let err = mediator.review_tool(&request).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ApprovalDenied { ref tool, ref reason }
                if tool == "get_weather" && reason == "blocked"
        ));
    }
}
