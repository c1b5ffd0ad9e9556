// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-mirror
#![deny(unsafe_code)]

mod client;
mod manifest;
mod sync;

pub use client::{MirrorClient, RemoteObject, UploadOutcome};
pub use manifest::{MANIFEST_FILE, Manifest, ManifestEntry};
pub use sync::{SyncOptions, SyncReport, sync};

/// Errors from mirroring operations.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The object store answered with an unexpected status.
    #[error("object store returned {status} for {context}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// Network-level failure talking to the object store.
    #[error("object store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("mirror I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest file exists but cannot be parsed.
    #[error("manifest is corrupt: {0}")]
    Manifest(#[from] serde_json::Error),

    /// A remote object name resolved outside the work root.
    #[error(transparent)]
    Workspace(#[from] tbx_workspace::WorkspaceError),
}
