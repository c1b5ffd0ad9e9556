// SPDX-License-Identifier: MIT OR Apache-2.0
//! Startup progress strings on the project document.

use std::sync::Arc;
use std::time::Duration;
use tbx_lease::{ProjectStore, StoreError};
use tracing::debug;

/// How long stale progress may linger before the watchdog clears it.
const PROGRESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Publishes a monotonic sequence of status strings under the project
/// document while a start request is in flight.
///
/// `clear` removes them on success or cancellation; a watchdog clears them
/// anyway once the timeout passes, so an abandoned start never leaves a
/// stuck progress trail.
pub struct ProgressReporter {
    store: Arc<dyn ProjectStore>,
    user_id: String,
    project_id: String,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

impl ProgressReporter {
    /// Start reporting for one project.
    pub fn new(store: Arc<dyn ProjectStore>, user_id: &str, project_id: &str) -> Self {
        let watchdog = tokio::spawn({
            let store = Arc::clone(&store);
            let user_id = user_id.to_string();
            let project_id = project_id.to_string();
            async move {
                tokio::time::sleep(PROGRESS_TIMEOUT).await;
                let _ = write_progress(&store, &user_id, &project_id, None).await;
            }
        });
        Self {
            store,
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            watchdog: Some(watchdog),
        }
    }

    /// Append one stage to the progress list. Best-effort.
    pub async fn push(&self, stage: &str) {
        debug!(target: "tbx.daemon", project = %self.project_id, stage, "startup progress");
        let _ = append_stage(&self.store, &self.user_id, &self.project_id, stage).await;
    }

    /// Clear the progress list and disarm the watchdog.
    pub async fn clear(mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        let _ = write_progress(&self.store, &self.user_id, &self.project_id, None).await;
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        // Dropped without `clear` (start failed mid-way): the watchdog
        // stays armed and cleans up after the timeout.
    }
}

async fn append_stage(
    store: &Arc<dyn ProjectStore>,
    user_id: &str,
    project_id: &str,
    stage: &str,
) -> Result<(), StoreError> {
    loop {
        let Some(versioned) = store.get(user_id, project_id).await? else {
            return Ok(());
        };
        let mut doc = versioned.value.clone();
        doc.consumer_progress
            .get_or_insert_with(Vec::new)
            .push(stage.to_string());
        match store
            .put_if_version(user_id, project_id, doc, versioned.version)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionMismatch) => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_progress(
    store: &Arc<dyn ProjectStore>,
    user_id: &str,
    project_id: &str,
    progress: Option<Vec<String>>,
) -> Result<(), StoreError> {
    loop {
        let Some(versioned) = store.get(user_id, project_id).await? else {
            return Ok(());
        };
        let mut doc = versioned.value.clone();
        doc.consumer_progress = progress.clone();
        match store
            .put_if_version(user_id, project_id, doc, versioned.version)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionMismatch) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbx_lease::MemoryStore;

    #[tokio::test]
    async fn stages_accumulate_monotonically_and_clear() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_project("u", "p").await;
        let store: Arc<dyn ProjectStore> = store.clone();

        let reporter = ProgressReporter::new(Arc::clone(&store), "u", "p");
        reporter.push("workspace ready").await;
        reporter.push("lease acquired").await;

        let doc = store.get("u", "p").await.unwrap().unwrap().value;
        assert_eq!(
            doc.consumer_progress.as_deref().unwrap(),
            ["workspace ready", "lease acquired"]
        );

        reporter.clear().await;
        let doc = store.get("u", "p").await.unwrap().unwrap().value;
        assert!(doc.consumer_progress.is_none());
    }
}
