// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool requests and responses exchanged between producer and executor.

use crate::event::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation sent to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Request id, normally the upstream event id.
    pub id: String,
    /// The tool call to execute.
    pub tool_call: ToolCall,
}

/// The executor's answer to a [`ToolRequest`].
///
/// `result` is serialized even when null: `{ id, result: null, error }` is
/// the wire shape for a tool-level failure, and `{ id, result: null }` with
/// no error is the delivered-but-no-op shape for unknown tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Echoed request id.
    pub id: String,
    /// Tool result on success; `null` otherwise.
    #[serde(default)]
    pub result: Option<Value>,
    /// Tool-level failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    /// A successful response carrying `result`.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// A tool-level failure: `result` is null and `error` explains why.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// The delivered-but-no-op response for unknown tool names.
    pub fn no_op(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: None,
        }
    }

    /// Whether this response represents a tool-level failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of running a tool handler, before it is stamped with a request id.
///
/// Tool handlers always yield one of these; transport failures travel as
/// `Err` on a separate axis and never become a `ToolOutcome`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The handler produced a result value.
    Success(Value),
    /// The handler failed; the message is surfaced to the orchestrator.
    Error(String),
}

impl ToolOutcome {
    /// Stamp this outcome with a request id, producing the wire response.
    #[must_use]
    pub fn into_response(self, id: impl Into<String>) -> ToolResponse {
        match self {
            Self::Success(value) => ToolResponse::ok(id, value),
            Self::Error(message) => ToolResponse::failed(id, message),
        }
    }
}

/// How the producer treats a tool-level `error` payload.
///
/// Upstream deployments disagreed on this, so it is a configuration knob.
/// The default, [`ErrorDelivery::Advance`], counts the error as a delivered
/// outcome: the callback fires and the cursor advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDelivery {
    /// Tool errors are delivered outcomes; callback fires, cursor advances.
    #[default]
    Advance,
    /// Tool errors are rejections; callback skipped, cursor not advanced.
    Reject,
}

impl std::str::FromStr for ErrorDelivery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advance" => Ok(Self::Advance),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown error delivery policy: {other}")),
        }
    }
}
