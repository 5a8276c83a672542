//! Environment discovery and agent-home helpers.
//!
//! The SDK owns no persisted state, but it needs to agree with the agent CLI
//! about where things live: the agent home (`CODEX_HOME`, defaulting to
//! `~/.codex`), the session directory it writes `*.jsonl` transcripts into,
//! and the originator string stamped on telemetry and forwarded to the
//! subprocess.

use std::path::{Path, PathBuf};

use log::debug;
use serde_json::Value;

use crate::codec;
use crate::error::Result;

/// Env var naming the agent home directory.
pub const CODEX_HOME_ENV: &str = "CODEX_HOME";

/// Env var overriding the SDK identity forwarded to the agent.
pub const ORIGINATOR_ENV: &str = "CODEX_INTERNAL_ORIGINATOR_OVERRIDE";

/// Default SDK identity.
pub const DEFAULT_ORIGINATOR: &str = "codex_sdk_rust";

/// Env var the agent reads for endpoint discovery.
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

/// The originator string: the override env var if set and non-empty,
/// otherwise [`DEFAULT_ORIGINATOR`].
pub fn originator() -> String {
    match std::env::var(ORIGINATOR_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => DEFAULT_ORIGINATOR.to_string(),
    }
}

/// The agent home: `$CODEX_HOME` if set, else `~/.codex`.
pub fn codex_home() -> PathBuf {
    match std::env::var_os(CODEX_HOME_ENV) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codex"),
    }
}

/// Where the agent persists session transcripts.
pub fn sessions_dir() -> PathBuf {
    codex_home().join("sessions")
}

/// Enumerate persisted sessions, newest-named last.
pub fn list_sessions() -> Result<Vec<PathBuf>> {
    list_sessions_in(&sessions_dir())
}

/// Enumerate `*.jsonl` session files under an explicit directory.
/// A missing directory is an empty list, not an error.
pub fn list_sessions_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sessions = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}

/// Read one session transcript, decoding each line as JSON.
///
/// Undecodable lines are skipped with a debug log; a truncated transcript
/// from a crashed agent should not make history unreadable.
pub fn read_session_lines(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match codec::decode_line(line) {
            Ok(value) => lines.push(value),
            Err(e) => debug!("skipping undecodable session line in {}: {e}", path.display()),
        }
    }
    Ok(lines)
}
