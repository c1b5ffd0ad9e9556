// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-workspace
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Maximum length of a sanitized path segment.
const SEGMENT_MAX: usize = 128;

/// Segment used when sanitization leaves nothing behind.
const SEGMENT_DEFAULT: &str = "default";

/// Errors from workspace resolution.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// A relative path would resolve outside the workspace root.
    #[error("path escapes workspace root: {path}")]
    PathEscape {
        /// The offending input path.
        path: String,
    },

    /// The work root exists but is not a directory.
    #[error("work root is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The work root is not writable by this process.
    #[error("work root is not writable: {0}")]
    NotWritable(PathBuf),

    /// Underlying filesystem failure.
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reduce one path segment to `[A-Za-z0-9._-]`, capped at 128 characters.
///
/// Disallowed characters are dropped; an empty result becomes `default`.
#[must_use]
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(SEGMENT_MAX)
        .collect();
    if cleaned.is_empty() {
        SEGMENT_DEFAULT.to_string()
    } else {
        cleaned
    }
}

/// Resolve `rel` inside `root`, refusing anything that could escape.
///
/// Rejected inputs: absolute paths (including `\`-rooted and drive-letter
/// forms), any `..` segment, and any join whose lexical normalization does
/// not keep `root` as a prefix. Backslashes are treated as separators before
/// checking, so mixed-separator escapes are caught on every platform. The
/// target itself need not exist.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf, WorkspaceError> {
    let escape = || WorkspaceError::PathEscape {
        path: rel.to_string(),
    };

    let normalized = rel.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(escape());
    }

    let mut joined = root.to_path_buf();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(escape()),
            s => joined.push(s),
        }
    }

    // Belt and braces: the segment filter above already forbids traversal,
    // but the prefix must hold on the lexically-normalized result too.
    if !normalize_lexically(&joined).starts_with(normalize_lexically(root)) {
        return Err(escape());
    }

    Ok(joined)
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Identifies one work root below the base directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkScope {
    /// Owning user.
    pub user_id: String,
    /// Owning project.
    pub project_id: String,
    /// Workspace within the project.
    pub workspace_id: String,
    /// Optional session sub-scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl WorkScope {
    /// The sanitized relative path of this scope under the base directory.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(sanitize_segment(&self.user_id));
        path.push(sanitize_segment(&self.project_id));
        path.push(sanitize_segment(&self.workspace_id));
        if let Some(session) = &self.session_id {
            path.push(sanitize_segment(session));
        }
        path
    }
}

/// Create (if needed) and validate the work root for `scope` under `base`.
pub fn ensure_work_root(base: &Path, scope: &WorkScope) -> Result<PathBuf, WorkspaceError> {
    ensure_root(base.join(scope.relative_path()))
}

/// Create (if needed) and validate an arbitrary work root path.
///
/// The directory is created recursively, then verified to be a writable
/// directory by creating and removing a probe file — permission bits alone
/// don't answer "can this process write here" on every platform.
pub fn ensure_root(root: PathBuf) -> Result<PathBuf, WorkspaceError> {
    fs::create_dir_all(&root)?;

    let meta = fs::metadata(&root)?;
    if !meta.is_dir() {
        return Err(WorkspaceError::NotADirectory(root));
    }

    let probe = root.join(".tbx-write-probe");
    let probed = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&probe)
        .and_then(|mut f| f.write_all(b"ok"));
    let _ = fs::remove_file(&probe);
    if probed.is_err() {
        return Err(WorkspaceError::NotWritable(root));
    }

    debug!(target: "tbx.workspace", root = %root.display(), "work root ready");
    Ok(root)
}

/// Create and validate a work root from an already-expanded layout
/// template such as `u1/p1/default/s1`.
///
/// Every `/`-separated segment is sanitized; empty segments are dropped.
pub fn ensure_templated_root(base: &Path, expanded_rel: &str) -> Result<PathBuf, WorkspaceError> {
    let mut path = base.to_path_buf();
    for segment in expanded_rel.split('/').filter(|s| !s.trim().is_empty()) {
        path.push(sanitize_segment(segment));
    }
    ensure_root(path)
}

/// Whether a workspace last seen alive at `live_at_ms` is still live.
#[must_use]
pub fn is_live(now_ms: i64, live_at_ms: i64, ttl_ms: u64) -> bool {
    now_ms.saturating_sub(live_at_ms) <= ttl_ms as i64
}
