// SPDX-License-Identifier: MIT OR Apache-2.0
//! Upstream workflow events and the tool-call payloads they carry.
//!
//! Events arrive over SSE from the workflow engine. Their `arguments` field
//! is dynamically encoded upstream — sometimes an object, sometimes a
//! string holding JSON — so it is modelled as an explicit variant and
//! normalized exactly once before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool-call arguments as they appear on the wire.
///
/// Upstream encodes arguments either as a JSON object or as a string that
/// *may* contain JSON. [`ToolArguments::normalize`] collapses the string
/// form into the object form where possible; object-shaped inputs are never
/// round-tripped through a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    /// Structured arguments.
    Object(Map<String, Value>),
    /// String-encoded arguments, possibly JSON, possibly opaque.
    Raw(String),
}

impl ToolArguments {
    /// Parse a string-encoded JSON object into the structured form.
    ///
    /// Raw strings that do not parse to a JSON object are left untouched —
    /// some tools accept opaque string arguments.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Self::Raw(s) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Object(map)) => Self::Object(map),
                _ => Self::Raw(s),
            },
            other => other,
        }
    }

    /// View the arguments as a [`Value`] for handler-side field access.
    #[must_use]
    pub fn as_value(&self) -> Value {
        match self {
            Self::Object(map) => Value::Object(map.clone()),
            Self::Raw(s) => Value::String(s.clone()),
        }
    }

    /// An empty argument object.
    #[must_use]
    pub fn empty() -> Self {
        Self::Object(Map::new())
    }
}

/// The function half of a tool call: a name plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Registered tool name, e.g. `READ_FILE`.
    pub name: String,
    /// Arguments in either wire encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<ToolArguments>,
}

/// A tool invocation requested by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// The function to invoke.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Return a copy of this call with its arguments normalized.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            function: FunctionCall {
                name: self.function.name.clone(),
                arguments: self
                    .function
                    .arguments
                    .clone()
                    .map(ToolArguments::normalize),
            },
        }
    }
}

/// One event from the upstream workflow stream.
///
/// Unknown upstream fields are preserved in `extra` so enrichment does not
/// drop anything the callback sink may care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Upstream event id; falls back to the SSE `id:` field when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Upstream creation time (RFC-3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,

    /// The tool call, when this event requests one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,

    /// Callback to deliver the tool result through, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,

    /// Any other upstream fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_deserialize_from_object() {
        let args: ToolArguments = serde_json::from_value(json!({"filepath": "a.txt"})).unwrap();
        match args {
            ToolArguments::Object(map) => assert_eq!(map["filepath"], "a.txt"),
            ToolArguments::Raw(_) => panic!("expected object"),
        }
    }

    #[test]
    fn arguments_deserialize_from_string() {
        let args: ToolArguments =
            serde_json::from_value(json!("{\"filepath\":\"a.txt\"}")).unwrap();
        assert!(matches!(args, ToolArguments::Raw(_)));
    }

    #[test]
    fn normalize_parses_string_encoded_object() {
        let args = ToolArguments::Raw("{\"filepath\":\"a.txt\"}".into()).normalize();
        match args {
            ToolArguments::Object(map) => assert_eq!(map["filepath"], "a.txt"),
            ToolArguments::Raw(_) => panic!("expected object after normalize"),
        }
    }

    #[test]
    fn normalize_keeps_opaque_string() {
        let args = ToolArguments::Raw("not json at all".into()).normalize();
        assert_eq!(args, ToolArguments::Raw("not json at all".into()));
    }

    #[test]
    fn normalize_keeps_non_object_json() {
        // A bare JSON array is not an argument object; leave it opaque.
        let args = ToolArguments::Raw("[1,2,3]".into()).normalize();
        assert_eq!(args, ToolArguments::Raw("[1,2,3]".into()));
    }

    #[test]
    fn normalize_is_idempotent_on_objects() {
        let args: ToolArguments = serde_json::from_value(json!({"k": 1})).unwrap();
        assert_eq!(args.clone().normalize(), args);
    }

    #[test]
    fn event_preserves_unknown_fields() {
        let event: WorkflowEvent = serde_json::from_value(json!({
            "id": "e1",
            "create_time": "2024-05-01T00:00:00Z",
            "tool_call": {"function": {"name": "READ_FILE", "arguments": {"filepath": "a.txt"}}},
            "callback_id": "cb1",
            "workflow_run": "r42"
        }))
        .unwrap();

        assert_eq!(event.id.as_deref(), Some("e1"));
        assert_eq!(event.callback_id.as_deref(), Some("cb1"));
        assert_eq!(event.extra["workflow_run"], "r42");

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["workflow_run"], "r42");
    }

    #[test]
    fn event_without_tool_call_parses() {
        let event: WorkflowEvent =
            serde_json::from_value(json!({"id": "e2", "note": "heartbeat"})).unwrap();
        assert!(event.tool_call.is_none());
    }
}
