// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable wire contract for Tool Bridge.
//!
//! Producers, executors, and the supervisor all speak the types in this
//! crate; nothing here performs I/O.

/// Progress cursor through the upstream event stream.
pub mod cursor;
/// Upstream workflow events and tool-call payloads.
pub mod event;
/// The consumer lock (project lease) document.
pub mod lock;
/// Tool requests, responses, and outcomes.
pub mod message;
/// Routing attributes and the canonical AAD encoding.
pub mod route;

pub use cursor::{Cursor, CursorTimestamp};
pub use event::{FunctionCall, ToolArguments, ToolCall, WorkflowEvent};
pub use lock::{ConsumerLock, ConsumerType, clamp_lease_ms};
pub use message::{ErrorDelivery, ToolOutcome, ToolRequest, ToolResponse};
pub use route::{ChannelSide, RouteAttrs};

/// Envelope scheme identifier carried in the `v` field of every sealed frame.
pub const ENVELOPE_SCHEME: &str = "a256gcm:v1";

/// Payload type attribute used for tool traffic on both fabrics.
pub const MESSAGE_KIND_TOOL: &str = "tool";

/// Lower bound for a lease duration in milliseconds (5 seconds).
pub const LEASE_MIN_MS: u64 = 5_000;

/// Upper bound for a lease duration in milliseconds (1 hour).
pub const LEASE_MAX_MS: u64 = 3_600_000;

/// Default lease duration in milliseconds (10 minutes).
pub const LEASE_DEFAULT_MS: u64 = 600_000;
