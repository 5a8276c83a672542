//! Content-addressed staging for attachments.
//!
//! Files handed to the agent are copied into a staging directory named by
//! their SHA-256, so staging the same content twice yields the same path and
//! the exec transport can pass stable absolute `--image` arguments. Cleanup
//! of the staging directory is the host's concern; nothing here blocks on
//! it.

use std::path::{Path, PathBuf};

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::config;
use crate::error::Result;

/// A file staged for the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    /// Absolute content-addressed path inside the staging directory.
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the contents.
    pub checksum: String,
}

/// Default staging directory, under the agent home.
pub fn staging_dir() -> PathBuf {
    config::codex_home().join("sdk").join("attachments")
}

/// Stage a file into the default staging directory.
pub fn stage(source: &Path) -> Result<StagedAttachment> {
    stage_in(&staging_dir(), source)
}

/// Stage a file into an explicit directory.
///
/// Idempotent by checksum: identical contents map to the identical path,
/// and an already-present target is not rewritten.
pub fn stage_in(dir: &Path, source: &Path) -> Result<StagedAttachment> {
    let bytes = std::fs::read(source)?;
    let checksum = hex_digest(&bytes);

    let file_name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{checksum}.{ext}"),
        None => checksum.clone(),
    };
    let path = dir.join(file_name);

    if !path.exists() {
        std::fs::create_dir_all(dir)?;
        std::fs::write(&path, &bytes)?;
    }

    Ok(StagedAttachment { path, checksum })
}

/// Encode a file as a `data:` URI for the app-server's pre-encoded image
/// input block.
pub fn to_data_uri(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
