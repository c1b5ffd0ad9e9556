// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-events
#![deny(unsafe_code)]

/// Cursor read/write client.
pub mod cursors;
/// The cursor-advancing event pump.
pub mod pump;
/// Incremental server-sent-events parser.
pub mod sse;

pub use cursors::CursorClient;
pub use pump::{EventPump, PumpConfig};
pub use sse::{SseFrame, SseParser};

/// Errors from the event pump and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum EventsError {
    /// The workflow engine answered with an unexpected status.
    #[error("workflow engine returned {status} for {context}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// Network-level failure.
    #[error("workflow engine request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The exchange fabric failed while delivering a request.
    #[error(transparent)]
    Channel(#[from] tbx_channel::ChannelError),
}
