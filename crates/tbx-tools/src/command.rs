// SPDX-License-Identifier: MIT OR Apache-2.0
//! RUN_COMMAND: bounded shell execution inside the work root.

use crate::{ToolError, args, output};
use serde_json::{Value, json};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tbx_config::ToolLimits;
use tokio::process::Command;

/// Hard bounds on the per-request timeout, in seconds.
const TIMEOUT_MIN_SECS: u64 = 1;
const TIMEOUT_MAX_SECS: u64 = 600;

pub(crate) async fn run_command(
    work_root: &Path,
    arguments: &Value,
    limits: &ToolLimits,
) -> Result<Value, ToolError> {
    let command = args::req_str(arguments, "command")?;
    let timeout_secs = args::opt_u64(arguments, "timeoutSeconds")
        .unwrap_or(limits.command_timeout_secs)
        .clamp(TIMEOUT_MIN_SECS, TIMEOUT_MAX_SECS);

    let child = Command::new("sh")
        .args(["-c", command])
        .current_dir(work_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let out = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| ToolError::CommandTimeout(timeout_secs))??;

    // Non-zero exit codes are results, not errors.
    let exit_code = out.status.code().unwrap_or(-1);
    let (stdout, stdout_truncated) = output::cap_output(&out.stdout, limits.output_max_bytes);
    let (stderr, stderr_truncated) = output::cap_output(&out.stderr, limits.output_max_bytes);

    Ok(json!({
        "exitCode": exit_code,
        "stdout": stdout,
        "stderr": stderr,
        "stdoutTruncated": stdout_truncated,
        "stderrTruncated": stderr_truncated,
    }))
}
