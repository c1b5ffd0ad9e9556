// SPDX-License-Identifier: MIT OR Apache-2.0
//! READ_FILE and UPDATE_FILE handlers.

use crate::{ToolError, args};
use serde_json::{Value, json};
use std::path::Path;
use tbx_config::ToolLimits;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub(crate) async fn read_file(
    work_root: &Path,
    arguments: &Value,
    limits: &ToolLimits,
) -> Result<Value, ToolError> {
    let filepath = args::req_str(arguments, "filepath")?;
    let path = tbx_workspace::resolve_within(work_root, filepath)?;

    let meta = tokio::fs::metadata(&path).await?;
    if !meta.is_file() {
        return Err(ToolError::NotAFile(filepath.to_string()));
    }

    let max = limits.read_file_max_bytes;
    let total = meta.len();
    let mut buf = Vec::with_capacity(total.min(max as u64) as usize);
    tokio::fs::File::open(&path)
        .await?
        .take(max as u64)
        .read_to_end(&mut buf)
        .await?;

    Ok(json!({
        "filepath": filepath,
        "content": String::from_utf8_lossy(&buf),
        "truncated": total > max as u64,
        "bytes": buf.len(),
    }))
}

pub(crate) async fn update_file(work_root: &Path, arguments: &Value) -> Result<Value, ToolError> {
    let filepath = args::req_str(arguments, "filepath")?;
    let content = args::req_str(arguments, "content")?;
    let append = args::opt_bool(arguments, "append", false);
    let mkdirp = args::opt_bool(arguments, "mkdirp", true);

    let path = tbx_workspace::resolve_within(work_root, filepath)?;
    if mkdirp {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;

    Ok(json!({
        "filepath": filepath,
        "bytesWritten": content.len(),
        "append": append,
    }))
}
