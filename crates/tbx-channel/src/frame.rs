// SPDX-License-Identifier: MIT OR Apache-2.0
//! The NDJSON line grammar on the duplex stream.
//!
//! Every complete line is either a JSON object or a bare control token.
//! Control tokens keep the connection alive and never match a request;
//! unparseable lines are discarded without tearing the connection down.

use serde_json::Value;

/// A keepalive/control token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// `ready <ts>` — the peer accepted the stream.
    Ready(String),
    /// `ping <ts>` — periodic heartbeat.
    Ping(String),
    /// `error <detail>` — peer-side note; informational only.
    ErrorNote(String),
}

/// One parsed line from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON object (request or response payload).
    Json(Value),
    /// A control token.
    Control(ControlFrame),
    /// Blank line.
    Empty,
    /// Anything else; discarded, connection retained.
    Unparseable(String),
}

impl Frame {
    /// Parse one newline-delimited line (without its terminator).
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Self::Empty;
        }
        if let Some(rest) = line.strip_prefix("ready ") {
            return Self::Control(ControlFrame::Ready(rest.trim().to_string()));
        }
        if line == "ready" {
            return Self::Control(ControlFrame::Ready(String::new()));
        }
        if let Some(rest) = line.strip_prefix("ping ") {
            return Self::Control(ControlFrame::Ping(rest.trim().to_string()));
        }
        if line == "ping" {
            return Self::Control(ControlFrame::Ping(String::new()));
        }
        if let Some(rest) = line.strip_prefix("error ") {
            return Self::Control(ControlFrame::ErrorNote(rest.trim().to_string()));
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => Self::Json(value),
            _ => Self::Unparseable(line.to_string()),
        }
    }
}

/// Render a JSON value as one newline-terminated NDJSON line.
#[must_use]
pub fn to_line(value: &Value) -> String {
    let mut line = value.to_string();
    line.push('\n');
    line
}

/// Render a `ready` control line.
#[must_use]
pub fn ready_line(timestamp_ms: i64) -> String {
    format!("ready {timestamp_ms}\n")
}

/// Render a `ping` control line.
#[must_use]
pub fn ping_line(timestamp_ms: i64) -> String {
    format!("ping {timestamp_ms}\n")
}
