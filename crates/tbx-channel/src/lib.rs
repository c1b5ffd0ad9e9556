// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-channel
#![deny(unsafe_code)]

/// Reconnect backoff policy.
pub mod backoff;
/// Duplex NDJSON client.
pub mod duplex;
/// NDJSON frame grammar shared by both peers.
pub mod frame;
/// Pub/sub fabric: REST client, subscription admin, and requester.
pub mod pubsub;

pub use backoff::Backoff;
pub use duplex::{DuplexClient, DuplexConfig};
pub use frame::{ControlFrame, Frame};
pub use pubsub::{PubSubClient, PubSubRequester, ReceivedMessage, request_filter, response_filter};

use async_trait::async_trait;
use tbx_core::{ToolRequest, ToolResponse};

/// Errors raised by either exchange fabric.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// Could not establish the connection.
    #[error("channel connect failed: {0}")]
    ConnectFailed(String),

    /// The response stream ended while a request was outstanding.
    #[error("channel stream ended")]
    StreamEnded,

    /// The response stream failed.
    #[error("channel stream error: {0}")]
    StreamError(String),

    /// The in-flight request was not answered within the send timeout.
    #[error("send timed out")]
    SendTimeout,

    /// Writing a request frame failed.
    #[error("channel write error: {0}")]
    WriteError(String),

    /// The channel was closed; queued requests are rejected with this.
    #[error("channel stopped")]
    Stopped,

    /// A frame could not be sealed or opened.
    #[error("envelope failure: {0}")]
    Envelope(String),

    /// The fabric's HTTP surface answered with an unexpected status.
    #[error("channel transport returned {status} for {context}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// Network-level failure.
    #[error("channel transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// A request/response fabric to the executor.
///
/// Implementations serialize callers: requests are dispatched FIFO with at
/// most one in flight, and the i-th `send` resolves with the i-th response.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    /// Send one request and await its response.
    async fn send(&self, request: ToolRequest) -> Result<ToolResponse, ChannelError>;

    /// Tear the channel down; pending requests reject with [`ChannelError::Stopped`].
    async fn close(&self);
}

impl std::fmt::Debug for dyn ToolChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ToolChannel")
    }
}
