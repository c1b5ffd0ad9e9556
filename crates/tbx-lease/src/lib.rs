// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! tbx-lease
#![deny(unsafe_code)]

mod manager;
mod refresh;
mod store;

pub use manager::{AcquireOutcome, LeaseManager, LeaseStatus, ReleaseOutcome};
pub use refresh::{REFRESH_FLOOR, RefreshExit, refresh_interval, run_refresh_loop};
pub use store::{MemoryStore, ProjectDoc, ProjectStore, StoreError, Versioned};

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The project document does not exist.
    #[error("project not found: {user_id}/{project_id}")]
    ProjectNotFound {
        /// Owning user.
        user_id: String,
        /// Missing project.
        project_id: String,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
