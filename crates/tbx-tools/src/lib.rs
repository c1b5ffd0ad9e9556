// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-tools
#![deny(unsafe_code)]

mod args;
mod command;
mod files;
mod output;

pub use output::cap_output;

use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tbx_config::{MirrorSettings, ToolLimits};
use tbx_core::{ToolRequest, ToolResponse};
use tbx_mirror::{MirrorClient, SyncOptions};
use tracing::{debug, warn};

/// Tool name: bounded file read.
pub const READ_FILE: &str = "READ_FILE";
/// Tool name: file write/append.
pub const UPDATE_FILE: &str = "UPDATE_FILE";
/// Tool name: bounded shell execution.
pub const RUN_COMMAND: &str = "RUN_COMMAND";
/// Tool name: object-store synchronization.
pub const GCS_SYNC: &str = "GCS_SYNC";

/// Errors a tool handler can raise.
///
/// These surface as `{ result: null, error }` on the response — a delivered
/// outcome, not a transport failure.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// A required argument was absent or had the wrong type.
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    /// READ_FILE target is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// Path resolution failed (traversal attempt or bad root).
    #[error(transparent)]
    Workspace(#[from] tbx_workspace::WorkspaceError),

    /// RUN_COMMAND exceeded its deadline.
    #[error("command timed out after {0}s")]
    CommandTimeout(u64),

    /// GCS_SYNC failed against the object store.
    #[error(transparent)]
    Mirror(#[from] tbx_mirror::MirrorError),

    /// Filesystem failure inside a handler.
    #[error("tool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The executor's tool runtime, bound to one work root.
///
/// One runtime serves one session; callers serialize dispatch (the
/// executor runs one tool at a time because tool side effects share the
/// workspace).
#[derive(Debug, Clone)]
pub struct ToolRuntime {
    work_root: PathBuf,
    limits: ToolLimits,
    mirror: MirrorSettings,
    mirror_prefix: String,
    gcs_token: Option<String>,
}

impl ToolRuntime {
    /// Create a runtime over `work_root`.
    ///
    /// `mirror_prefix` is the already-expanded object-name prefix for this
    /// scope (templates are a configuration concern, not a tool concern).
    pub fn new(
        work_root: impl Into<PathBuf>,
        limits: ToolLimits,
        mirror: MirrorSettings,
        mirror_prefix: impl Into<String>,
    ) -> Self {
        Self {
            work_root: work_root.into(),
            limits,
            mirror,
            mirror_prefix: mirror_prefix.into(),
            gcs_token: None,
        }
    }

    /// Use `token` for object-store calls when a request carries none.
    ///
    /// The duplex endpoint forwards its `X-Gcs-Token` header this way.
    #[must_use]
    pub fn with_gcs_token(mut self, token: Option<String>) -> Self {
        self.gcs_token = token;
        self
    }

    /// The sandbox root all file tools resolve against.
    #[must_use]
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Execute one request, always producing a deliverable response.
    ///
    /// Unknown tool names yield `{ result: null }` with no error; handler
    /// failures yield `{ result: null, error }`. Neither is a transport
    /// failure — the cursor advances either way.
    pub async fn handle(&self, request: &ToolRequest) -> ToolResponse {
        let call = request.tool_call.normalized();
        let name = call.function.name.as_str();
        let args = call
            .function
            .arguments
            .as_ref()
            .map(|a| a.as_value())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        debug!(target: "tbx.tools", id = %request.id, tool = name, "dispatching tool");
        match self.dispatch(name, &args).await {
            Ok(Some(result)) => ToolResponse::ok(&request.id, result),
            Ok(None) => {
                warn!(target: "tbx.tools", id = %request.id, tool = name, "unknown tool; delivering null result");
                ToolResponse::no_op(&request.id)
            }
            Err(e) => {
                warn!(target: "tbx.tools", id = %request.id, tool = name, error = %e, "tool failed");
                ToolResponse::failed(&request.id, e.to_string())
            }
        }
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<Option<Value>, ToolError> {
        let result = match name {
            READ_FILE => files::read_file(&self.work_root, args, &self.limits).await?,
            UPDATE_FILE => files::update_file(&self.work_root, args).await?,
            RUN_COMMAND => command::run_command(&self.work_root, args, &self.limits).await?,
            GCS_SYNC => self.sync_blobs(args).await?,
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    async fn sync_blobs(&self, args: &Value) -> Result<Value, ToolError> {
        let bucket = args::opt_str(args, "bucket")
            .map(str::to_string)
            .or_else(|| self.mirror.bucket.clone())
            .ok_or(ToolError::MissingArgument("bucket"))?;
        let prefix = args::opt_str(args, "prefix")
            .map(str::to_string)
            .unwrap_or_else(|| self.mirror_prefix.clone());
        let token = args::opt_str(args, "token")
            .map(str::to_string)
            .or_else(|| self.gcs_token.clone());

        let client = MirrorClient::new(
            &self.mirror.base_url,
            bucket,
            token,
            self.mirror.billing_project.clone(),
        );
        let report = tbx_mirror::sync(
            &client,
            &self.work_root,
            &SyncOptions {
                prefix,
                enable_upload: self.mirror.enable_upload,
                download_concurrency: self.mirror.download_concurrency,
                upload_concurrency: self.mirror.upload_concurrency,
            },
        )
        .await?;

        Ok(json!({
            "listed": report.listed,
            "downloaded": report.downloaded,
            "uploaded": report.uploaded,
            "skipped": report.skipped,
            "conflicts": report.conflicts,
        }))
    }
}
