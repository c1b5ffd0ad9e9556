// SPDX-License-Identifier: MIT OR Apache-2.0
//! The project-document store abstraction.
//!
//! The real store is an external document database offering per-document
//! transactions; this trait reduces that to versioned reads and
//! compare-and-swap writes, which is all the lease needs. The in-memory
//! implementation backs tests and single-node deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tbx_core::ConsumerLock;
use tokio::sync::RwLock;

/// Errors from the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The compare-and-swap lost: the document changed under us.
    #[error("document version changed concurrently")]
    VersionMismatch,

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The project document, as far as the bridge cares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDoc {
    /// The active consumer lock, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_lock: Option<ConsumerLock>,

    /// Startup progress strings published by the supervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_progress: Option<Vec<String>>,

    /// Any other fields the wider system keeps on the document.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A document together with its store version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The document.
    pub value: T,
    /// Monotonic version used for compare-and-swap.
    pub version: u64,
}

/// Versioned read + compare-and-swap write over project documents.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Read a project document with its version; `None` when absent.
    async fn get(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<Versioned<ProjectDoc>>, StoreError>;

    /// Write `doc` only if the stored version still equals `expected`.
    ///
    /// Returns the new version. Fails with [`StoreError::VersionMismatch`]
    /// when someone else won the race.
    async fn put_if_version(
        &self,
        user_id: &str,
        project_id: &str,
        doc: ProjectDoc,
        expected: u64,
    ) -> Result<u64, StoreError>;
}

/// In-memory store with genuine CAS semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<(String, String), Versioned<ProjectDoc>>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the project document if it does not exist yet.
    ///
    /// Project CRUD is out of scope for the bridge; this exists so
    /// single-node deployments and tests have something to lease against.
    pub async fn ensure_project(&self, user_id: &str, project_id: &str) {
        let mut docs = self.docs.write().await;
        docs.entry((user_id.to_string(), project_id.to_string()))
            .or_insert_with(|| Versioned {
                value: ProjectDoc::default(),
                version: 1,
            });
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<Versioned<ProjectDoc>>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(&(user_id.to_string(), project_id.to_string()))
            .cloned())
    }

    async fn put_if_version(
        &self,
        user_id: &str,
        project_id: &str,
        doc: ProjectDoc,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let key = (user_id.to_string(), project_id.to_string());
        let Some(current) = docs.get_mut(&key) else {
            return Err(StoreError::Backend(format!(
                "project {user_id}/{project_id} vanished"
            )));
        };
        if current.version != expected {
            return Err(StoreError::VersionMismatch);
        }
        current.value = doc;
        current.version += 1;
        Ok(current.version)
    }
}
