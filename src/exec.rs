//! Exec-JSONL turn transport: one subprocess per turn.
//!
//! Each turn assembles an argument vector and environment from the effective
//! options, launches `codex exec --json`, and harvests the line-oriented
//! event stream until the process exits. Ordering rules that downstream code
//! depends on:
//!
//! - `resume <thread_id>` (or `resume --last`) precedes every `--image`
//!   argument;
//! - `--config key=value` pairs appear in strict layer order (global,
//!   derived, thread, turn) so the binary's own last-wins merge reproduces
//!   the SDK's;
//! - the prompt rides as the final positional argument.
//!
//! A `stream_idle_timeout` turns a silent subprocess into a retryable
//! transport error; non-zero exits become [`Error::ExecFailed`] with the
//! captured stderr tail attached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::attachments;
use crate::config;
use crate::error::{Error, Result};
use crate::events::ThreadEvent;
use crate::options::EffectiveOptions;
use crate::process::{IoPayload, ProcessTransport, SpawnSpec, Subscription};

/// Depth of the event channel handed to the turn engine.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// How the subprocess resumes an existing thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResumeSpec {
    /// Fresh thread.
    None,
    /// `resume <thread_id>`
    ThreadId(String),
    /// `resume --last`
    Last,
}

/// A running exec turn: the supervised process plus its decoded events.
pub(crate) struct ExecTurn {
    pub transport: Arc<ProcessTransport>,
    pub events: mpsc::Receiver<Result<ThreadEvent>>,
}

/// Build the `codex exec` argument vector for one turn.
///
/// `images` are already-staged absolute paths.
pub(crate) fn build_args(
    effective: &EffectiveOptions,
    resume: &ResumeSpec,
    images: &[PathBuf],
    prompt: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "--json".to_string()];

    // Resume arguments precede attachment arguments.
    match resume {
        ResumeSpec::None => {}
        ResumeSpec::ThreadId(thread_id) => {
            args.push("resume".to_string());
            args.push(thread_id.clone());
        }
        ResumeSpec::Last => {
            args.push("resume".to_string());
            args.push("--last".to_string());
        }
    }

    if let Some(sandbox) = &effective.sandbox {
        args.push("--sandbox".to_string());
        args.push(sandbox.mode.as_str().to_string());
    }
    if let Some(cwd) = &effective.working_directory {
        args.push("--cd".to_string());
        args.push(cwd.display().to_string());
    }
    for dir in &effective.additional_directories {
        args.push("--add-dir".to_string());
        args.push(dir.display().to_string());
    }
    if effective.skip_git_repo_check {
        args.push("--skip-git-repo-check".to_string());
    }
    if effective.full_auto {
        args.push("--full-auto".to_string());
    }
    if effective.dangerously_bypass_approvals_and_sandbox {
        args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
    }
    if let Some(profile) = &effective.profile {
        args.push("--profile".to_string());
        args.push(profile.clone());
    }
    if effective.oss {
        args.push("--oss".to_string());
    }
    if let Some(provider) = &effective.local_provider {
        args.push("--local-provider".to_string());
        args.push(provider.clone());
    }
    if let Some(color) = effective.color {
        args.push("--color".to_string());
        args.push(color.as_str().to_string());
    }
    if let Some(path) = &effective.output_last_message {
        args.push("--output-last-message".to_string());
        args.push(path.display().to_string());
    }

    for pair in &effective.config_overrides {
        args.push("--config".to_string());
        args.push(pair.clone());
    }

    for image in images {
        args.push("--image".to_string());
        args.push(image.display().to_string());
    }

    if let Some(token) = &effective.cancellation_token {
        args.push("--cancellation-token".to_string());
        args.push(token.clone());
    }

    if let Some(prompt) = prompt {
        args.push(prompt.to_string());
    }

    args
}

/// Build the `codex review` argument vector.
pub(crate) fn build_review_args(effective: &EffectiveOptions, base_ref: &str) -> Vec<String> {
    let mut args = vec![
        "review".to_string(),
        "--base".to_string(),
        base_ref.to_string(),
        "--json".to_string(),
    ];
    for pair in &effective.config_overrides {
        args.push("--config".to_string());
        args.push(pair.clone());
    }
    args
}

/// Assemble the environment layered over the inherited parent environment:
/// caller-provided pairs, then endpoint and credential variables, then the
/// originator (unless the caller already set one).
pub(crate) fn build_env(effective: &EffectiveOptions) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = effective
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();

    if let Some(base_url) = &effective.base_url {
        env.push((config::BASE_URL_ENV.to_string(), base_url.clone()));
    }
    if let Some(api_key) = &effective.api_key {
        env.push(("CODEX_API_KEY".to_string(), api_key.clone()));
        env.push(("OPENAI_API_KEY".to_string(), api_key.clone()));
    }
    if !effective.env.contains_key(config::ORIGINATOR_ENV) {
        env.push((config::ORIGINATOR_ENV.to_string(), config::originator()));
    }
    env
}

/// Spawn one exec turn and pump its decoded events.
pub(crate) fn start_turn(
    effective: &EffectiveOptions,
    resume: &ResumeSpec,
    prompt: Option<&str>,
) -> Result<ExecTurn> {
    let staged: Vec<PathBuf> = effective
        .images
        .iter()
        .map(|path| attachments::stage(path).map(|staged| staged.path))
        .collect::<Result<_>>()?;

    let args = build_args(effective, resume, &staged, prompt);
    start_with_args(effective, args)
}

/// Spawn a review turn (`codex review --base <ref>`).
pub(crate) fn start_review(effective: &EffectiveOptions, base_ref: &str) -> Result<ExecTurn> {
    let args = build_review_args(effective, base_ref);
    start_with_args(effective, args)
}

fn start_with_args(effective: &EffectiveOptions, args: Vec<String>) -> Result<ExecTurn> {
    let mut spec = SpawnSpec::new(effective.codex_path.display().to_string());
    spec.args = args;
    spec.env = build_env(effective);
    spec.cwd = effective.working_directory.clone();

    debug!("spawning agent: {} {:?}", spec.program, spec.args);
    let (transport, subscription) = ProcessTransport::spawn(spec)?;
    let transport = Arc::new(transport);

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    tokio::spawn(pump_events(
        transport.clone(),
        subscription,
        events_tx,
        effective.stream_idle_timeout,
        effective.model.clone(),
        effective
            .reasoning_effort
            .map(|effort| effort.as_str().to_string()),
    ));

    Ok(ExecTurn {
        transport,
        events: events_rx,
    })
}

async fn pump_events(
    transport: Arc<ProcessTransport>,
    mut subscription: Subscription,
    events_tx: mpsc::Sender<Result<ThreadEvent>>,
    idle_timeout: Option<Duration>,
    model: Option<String>,
    reasoning_effort: Option<String>,
) {
    let mut enriched_thread_started = false;
    loop {
        let message = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, subscription.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    let _ = events_tx
                        .send(Err(Error::transport_retryable(format!(
                            "stream idle timeout after {} ms with no agent output",
                            idle.as_millis()
                        ))))
                        .await;
                    transport.force_close().await;
                    return;
                }
            },
            None => subscription.recv().await,
        };

        let Some(message) = message else {
            return;
        };

        match message.payload {
            IoPayload::Json(value) => {
                let event = match ThreadEvent::parse(&value) {
                    Ok(mut event) => {
                        if !enriched_thread_started {
                            if let ThreadEvent::ThreadStarted { metadata, .. } = &mut event {
                                enrich_metadata(metadata, &model, &reasoning_effort);
                                enriched_thread_started = true;
                            }
                        }
                        Ok(event)
                    }
                    Err(e) => Err(e),
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            IoPayload::DecodeFailure { excerpt } => {
                // Surfaced as an event; one bad line never kills the turn.
                let event = ThreadEvent::Raw {
                    method: "decode_failure".to_string(),
                    params: serde_json::json!({"line": excerpt}),
                };
                if events_tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            IoPayload::Overflow { discarded } => {
                let event = ThreadEvent::Raw {
                    method: "overflow".to_string(),
                    params: serde_json::json!({"discarded": discarded}),
                };
                if events_tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            IoPayload::Exit { status } => {
                if !status.success() {
                    let _ = events_tx
                        .send(Err(Error::exec_failed(status.code, transport.stderr_tail())))
                        .await;
                }
                return;
            }
        }
    }
}

/// The CLI may omit the effective model and reasoning effort from
/// `thread.started`; fill them in so consumers always see them.
fn enrich_metadata(
    metadata: &mut serde_json::Map<String, Value>,
    model: &Option<String>,
    reasoning_effort: &Option<String>,
) {
    if let Some(model) = model {
        metadata
            .entry("model".to_string())
            .or_insert_with(|| Value::String(model.clone()));
    }
    if let Some(effort) = reasoning_effort {
        metadata
            .entry("reasoning_effort".to_string())
            .or_insert_with(|| Value::String(effort.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{
        CodexOptions, ColorMode, ReasoningEffort, SandboxPolicy, ThreadOptions, TurnOptions,
    };

    fn effective(turn: TurnOptions) -> EffectiveOptions {
        let codex = CodexOptions::builder().build().unwrap();
        let thread = ThreadOptions::default();
        EffectiveOptions::resolve(&codex, &thread, &turn).unwrap()
    }

    fn effective_with(
        codex: CodexOptions,
        thread: ThreadOptions,
        turn: TurnOptions,
    ) -> EffectiveOptions {
        EffectiveOptions::resolve(&codex, &thread, &turn).unwrap()
    }

    #[test]
    fn test_base_args() {
        let args = build_args(
            &effective(TurnOptions::default()),
            &ResumeSpec::None,
            &[],
            Some("Hello Codex"),
        );
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "--json");
        assert_eq!(args.last().unwrap(), "Hello Codex");
    }

    #[test]
    fn test_cancellation_token_adjacent_pair() {
        let turn = TurnOptions::builder()
            .cancellation_token("cancel-me")
            .build()
            .unwrap();
        let args = build_args(&effective(turn), &ResumeSpec::None, &[], Some("hi"));
        let pos = args
            .iter()
            .position(|a| a == "--cancellation-token")
            .expect("flag present");
        assert_eq!(args[pos + 1], "cancel-me");
    }

    #[test]
    fn test_resume_precedes_images() {
        let args = build_args(
            &effective(TurnOptions::default()),
            &ResumeSpec::ThreadId("thr_abc".into()),
            &[PathBuf::from("/tmp/staged/abc.png")],
            Some("hi"),
        );
        let resume_pos = args.iter().position(|a| a == "resume").unwrap();
        assert_eq!(args[resume_pos + 1], "thr_abc");
        let image_pos = args.iter().position(|a| a == "--image").unwrap();
        assert!(resume_pos < image_pos, "resume args must precede --image");
        assert_eq!(args[image_pos + 1], "/tmp/staged/abc.png");
    }

    #[test]
    fn test_resume_last() {
        let args = build_args(
            &effective(TurnOptions::default()),
            &ResumeSpec::Last,
            &[],
            None,
        );
        let pos = args.iter().position(|a| a == "resume").unwrap();
        assert_eq!(args[pos + 1], "--last");
    }

    #[test]
    fn test_sandbox_and_directories() {
        let thread = ThreadOptions::builder()
            .sandbox(SandboxPolicy::workspace_write())
            .working_directory("/work")
            .additional_directory("/data")
            .skip_git_repo_check(true)
            .full_auto(true)
            .color(ColorMode::Never)
            .build()
            .unwrap();
        let codex = CodexOptions::builder().build().unwrap();
        let args = build_args(
            &effective_with(codex, thread, TurnOptions::default()),
            &ResumeSpec::None,
            &[],
            None,
        );

        let sandbox_pos = args.iter().position(|a| a == "--sandbox").unwrap();
        assert_eq!(args[sandbox_pos + 1], "workspace-write");
        let cd_pos = args.iter().position(|a| a == "--cd").unwrap();
        assert_eq!(args[cd_pos + 1], "/work");
        let add_pos = args.iter().position(|a| a == "--add-dir").unwrap();
        assert_eq!(args[add_pos + 1], "/data");
        assert!(args.contains(&"--skip-git-repo-check".to_string()));
        assert!(args.contains(&"--full-auto".to_string()));
        let color_pos = args.iter().position(|a| a == "--color").unwrap();
        assert_eq!(args[color_pos + 1], "never");
    }

    #[test]
    fn test_config_override_precedence_in_argv() {
        let codex = CodexOptions::builder()
            .config_override("model", "gpt-5")
            .build()
            .unwrap();
        let thread = ThreadOptions::builder()
            .config_override("model", "gpt-5-thread")
            .build()
            .unwrap();
        let turn = TurnOptions::builder()
            .config_override("model", "gpt-5-turn")
            .build()
            .unwrap();

        let args = build_args(
            &effective_with(codex, thread, turn),
            &ResumeSpec::None,
            &[],
            None,
        );
        let values: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, value)| *flag == "--config" && value.starts_with("model="))
            .map(|(_, value)| value)
            .collect();

        assert_eq!(values.len(), 3);
        assert_eq!(values[0], "model=\"gpt-5\"");
        assert_eq!(values[2], "model=\"gpt-5-turn\"");
    }

    #[test]
    fn test_nested_override_flattened_in_argv() {
        let turn = TurnOptions::builder()
            .config_override("model", serde_json::json!({"personality": "friendly"}))
            .build()
            .unwrap();
        let args = build_args(&effective(turn), &ResumeSpec::None, &[], None);
        assert!(
            args.iter()
                .any(|a| a == "model.personality=\"friendly\"")
        );
    }

    #[test]
    fn test_review_args() {
        let args = build_review_args(&effective(TurnOptions::default()), "main");
        assert_eq!(args[0], "review");
        assert_eq!(args[1], "--base");
        assert_eq!(args[2], "main");
        assert!(args.contains(&"--json".to_string()));
    }

    #[test]
    fn test_env_layers_credentials_under_both_names() {
        let codex = CodexOptions::builder()
            .base_url("http://localhost:1455/v1")
            .api_key("sk-test")
            .build()
            .unwrap();
        let env = build_env(&effective_with(
            codex,
            ThreadOptions::default(),
            TurnOptions::default(),
        ));

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("OPENAI_BASE_URL"), Some("http://localhost:1455/v1"));
        assert_eq!(get("CODEX_API_KEY"), Some("sk-test"));
        assert_eq!(get("OPENAI_API_KEY"), Some("sk-test"));
        // Originator defaults to the SDK identity.
        assert_eq!(
            get(config::ORIGINATOR_ENV),
            Some(config::DEFAULT_ORIGINATOR)
        );
    }

    #[test]
    fn test_caller_env_can_override_originator() {
        let turn = TurnOptions::builder()
            .env(config::ORIGINATOR_ENV, "my_host_app")
            .build()
            .unwrap();
        let env = build_env(&effective(turn));
        let originators: Vec<&str> = env
            .iter()
            .filter(|(k, _)| k == config::ORIGINATOR_ENV)
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(originators, vec!["my_host_app"]);
    }

    #[test]
    fn test_effort_coercion_reaches_argv() {
        let codex = CodexOptions::builder()
            .model("gpt-5-mini")
            .reasoning_effort(ReasoningEffort::XHigh)
            .build()
            .unwrap();
        let args = build_args(
            &effective_with(codex, ThreadOptions::default(), TurnOptions::default()),
            &ResumeSpec::None,
            &[],
            None,
        );
        assert!(
            args.iter()
                .any(|a| a == "model_reasoning_effort=\"high\"")
        );
    }

    #[tokio::test]
    async fn test_stream_idle_timeout_is_retryable() {
        let mut eff = effective(TurnOptions::default());
        eff.codex_path = PathBuf::from("/bin/sh");
        eff.stream_idle_timeout = Some(Duration::from_millis(100));

        // A "turn" that produces nothing for 5 s.
        let turn = start_with_args(&eff, vec!["-c".into(), "sleep 5".into()]).unwrap();
        let mut events = turn.events;
        let err = events.recv().await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("idle timeout"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let mut eff = effective(TurnOptions::default());
        eff.codex_path = PathBuf::from("/bin/sh");

        let turn = start_with_args(
            &eff,
            vec!["-c".into(), "echo exploded >&2; exit 2".into()],
        )
        .unwrap();
        let mut events = turn.events;
        // Give the stderr task time to capture before exit is observed.
        let err = loop {
            match events.recv().await {
                Some(Err(e)) => break e,
                Some(Ok(_)) => continue,
                None => panic!("expected an exec failure"),
            }
        };
        match err {
            Error::ExecFailed {
                exit_status,
                stderr,
            } => {
                assert_eq!(exit_status, 2);
                assert!(stderr.contains("exploded") || stderr.is_empty());
            }
            other => panic!("expected ExecFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_thread_started_enrichment() {
        let codex = CodexOptions::builder()
            .model("gpt-5")
            .reasoning_effort(ReasoningEffort::Medium)
            .build()
            .unwrap();
        let mut eff = effective_with(codex, ThreadOptions::default(), TurnOptions::default());
        eff.codex_path = PathBuf::from("/bin/sh");

        let script =
            r#"printf '{"type":"thread.started","thread_id":"thr_1"}\n{"type":"turn.started","thread_id":"thr_1","turn_id":"t_1"}\n'"#;
        let turn = start_with_args(&eff, vec!["-c".into(), script.into()]).unwrap();
        let mut events = turn.events;

        let first = events.recv().await.unwrap().unwrap();
        match first {
            ThreadEvent::ThreadStarted { metadata, .. } => {
                assert_eq!(metadata["model"], "gpt-5");
                assert_eq!(metadata["reasoning_effort"], "medium");
            }
            other => panic!("expected ThreadStarted, got {other:?}"),
        }
    }
}
