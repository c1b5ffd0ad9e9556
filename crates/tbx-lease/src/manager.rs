// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lease acquire/refresh/release over the CAS store.

use crate::store::{ProjectStore, StoreError};
use crate::LeaseError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tbx_core::{ConsumerLock, ConsumerType, clamp_lease_ms};
use tracing::{debug, info};

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum AcquireOutcome {
    /// No valid lock existed; a fresh one was installed.
    Acquired {
        /// The installed lock.
        lock: ConsumerLock,
    },
    /// The caller already held the lock; its lease was extended.
    Refreshed {
        /// The refreshed lock.
        lock: ConsumerLock,
    },
    /// A different consumer holds an unexpired lock.
    Conflict {
        /// The current holder.
        holder: ConsumerLock,
        /// Lease milliseconds remaining.
        ms_remaining: u64,
    },
}

/// Result of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ReleaseOutcome {
    /// The lock was removed.
    Released,
    /// There was nothing to release.
    NotHeld,
    /// A different consumer holds the lock and `force` was not set.
    Conflict,
}

/// Point-in-time lease status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    /// Whether an unexpired lock exists.
    pub locked: bool,
    /// Milliseconds remaining on the lease (zero when unlocked).
    pub ms_remaining: u64,
    /// The holder, when locked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<ConsumerLock>,
}

/// The lease manager: every mutation is a CAS transaction on the project
/// document, retried on lost races, so concurrent callers linearize.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ProjectStore>,
}

impl LeaseManager {
    /// A manager over `store`.
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Acquire or refresh the lock for `consumer_id`.
    pub async fn acquire(
        &self,
        user_id: &str,
        project_id: &str,
        consumer_id: &str,
        lease_ms: Option<u64>,
        consumer_type: ConsumerType,
    ) -> Result<AcquireOutcome, LeaseError> {
        let lease_ms = clamp_lease_ms(lease_ms);

        loop {
            let versioned = self.read(user_id, project_id).await?;
            let now = Utc::now().timestamp_millis();
            let mut doc = versioned.value.clone();

            let outcome = match doc.consumer_lock.as_mut() {
                Some(lock) if !lock.is_expired(now) && lock.consumer_id != consumer_id => {
                    return Ok(AcquireOutcome::Conflict {
                        ms_remaining: lock.ms_remaining(now),
                        holder: lock.clone(),
                    });
                }
                Some(lock) if !lock.is_expired(now) => {
                    lock.refresh(lease_ms, now);
                    AcquireOutcome::Refreshed { lock: lock.clone() }
                }
                _ => {
                    let lock = ConsumerLock::install(consumer_id, consumer_type, lease_ms, now);
                    doc.consumer_lock = Some(lock.clone());
                    AcquireOutcome::Acquired { lock }
                }
            };

            match self
                .store
                .put_if_version(user_id, project_id, doc, versioned.version)
                .await
            {
                Ok(_) => {
                    match &outcome {
                        AcquireOutcome::Acquired { .. } => {
                            info!(target: "tbx.lease", user_id, project_id, consumer_id, lease_ms, "lease acquired");
                        }
                        AcquireOutcome::Refreshed { .. } => {
                            debug!(target: "tbx.lease", user_id, project_id, consumer_id, "lease refreshed");
                        }
                        AcquireOutcome::Conflict { .. } => {}
                    }
                    return Ok(outcome);
                }
                Err(StoreError::VersionMismatch) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the lock.
    ///
    /// Without `force`, only the named holder may release; `force` removes
    /// whatever is there.
    pub async fn release(
        &self,
        user_id: &str,
        project_id: &str,
        consumer_id: Option<&str>,
        force: bool,
    ) -> Result<ReleaseOutcome, LeaseError> {
        loop {
            let versioned = self.read(user_id, project_id).await?;
            let mut doc = versioned.value.clone();

            let Some(lock) = &doc.consumer_lock else {
                return Ok(ReleaseOutcome::NotHeld);
            };
            if !force && consumer_id != Some(lock.consumer_id.as_str()) {
                return Ok(ReleaseOutcome::Conflict);
            }
            doc.consumer_lock = None;

            match self
                .store
                .put_if_version(user_id, project_id, doc, versioned.version)
                .await
            {
                Ok(_) => {
                    info!(target: "tbx.lease", user_id, project_id, force, "lease released");
                    return Ok(ReleaseOutcome::Released);
                }
                Err(StoreError::VersionMismatch) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current lock status for a project.
    pub async fn status(&self, user_id: &str, project_id: &str) -> Result<LeaseStatus, LeaseError> {
        let versioned = self.read(user_id, project_id).await?;
        let now = Utc::now().timestamp_millis();
        Ok(match versioned.value.consumer_lock {
            Some(lock) if !lock.is_expired(now) => LeaseStatus {
                locked: true,
                ms_remaining: lock.ms_remaining(now),
                holder: Some(lock),
            },
            _ => LeaseStatus {
                locked: false,
                ms_remaining: 0,
                holder: None,
            },
        })
    }

    /// Merge `runtime` into the current lock, only if `consumer_id` holds it.
    ///
    /// Returns whether anything was written.
    pub async fn set_runtime_info(
        &self,
        user_id: &str,
        project_id: &str,
        consumer_id: &str,
        runtime: Value,
    ) -> Result<bool, LeaseError> {
        loop {
            let versioned = self.read(user_id, project_id).await?;
            let mut doc = versioned.value.clone();

            let Some(lock) = doc.consumer_lock.as_mut() else {
                return Ok(false);
            };
            if lock.consumer_id != consumer_id {
                return Ok(false);
            }
            lock.runtime = Some(merge_runtime(lock.runtime.take(), runtime.clone()));

            match self
                .store
                .put_if_version(user_id, project_id, doc, versioned.version)
                .await
            {
                Ok(_) => return Ok(true),
                Err(StoreError::VersionMismatch) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<crate::Versioned<crate::ProjectDoc>, LeaseError> {
        self.store
            .get(user_id, project_id)
            .await?
            .ok_or_else(|| LeaseError::ProjectNotFound {
                user_id: user_id.to_string(),
                project_id: project_id.to_string(),
            })
    }
}

/// Shallow-merge `incoming` object keys over `existing`.
fn merge_runtime(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;
    use tbx_core::{LEASE_MAX_MS, LEASE_MIN_MS};

    async fn manager() -> LeaseManager {
        let store = Arc::new(MemoryStore::new());
        store.ensure_project("u", "p").await;
        LeaseManager::new(store)
    }

    #[tokio::test]
    async fn acquire_then_conflict() {
        let mgr = manager().await;

        let first = mgr
            .acquire("u", "p", "consumerA", Some(60_000), ConsumerType::Local)
            .await
            .unwrap();
        assert!(matches!(first, AcquireOutcome::Acquired { .. }));

        let second = mgr
            .acquire("u", "p", "consumerB", Some(60_000), ConsumerType::Local)
            .await
            .unwrap();
        match second {
            AcquireOutcome::Conflict {
                holder,
                ms_remaining,
            } => {
                assert_eq!(holder.consumer_id, "consumerA");
                assert!(ms_remaining > 59_000 && ms_remaining <= 60_000);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_acquires_admit_exactly_one() {
        let mgr = manager().await;

        let a = mgr.acquire("u", "p", "cA", Some(30_000), ConsumerType::Local);
        let b = mgr.acquire("u", "p", "cB", Some(30_000), ConsumerType::Local);
        let (ra, rb) = tokio::join!(a, b);

        let wins = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|o| matches!(o, AcquireOutcome::Acquired { .. }))
            .count();
        assert_eq!(wins, 1);

        // Exactly one lock on the document.
        let status = mgr.status("u", "p").await.unwrap();
        assert!(status.locked);
    }

    #[tokio::test]
    async fn same_consumer_refreshes() {
        let mgr = manager().await;
        let AcquireOutcome::Acquired { lock: first } = mgr
            .acquire("u", "p", "c1", Some(10_000), ConsumerType::Local)
            .await
            .unwrap()
        else {
            panic!("expected acquired")
        };

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let AcquireOutcome::Refreshed { lock: second } = mgr
            .acquire("u", "p", "c1", Some(20_000), ConsumerType::Local)
            .await
            .unwrap()
        else {
            panic!("expected refreshed")
        };

        assert_eq!(second.acquired_at, first.acquired_at);
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.lease_ms, 20_000);
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let mgr = manager().await;
        // Minimum lease, then pretend time passed by installing an
        // already-expired lock directly through acquire with min lease and
        // a doctored document.
        mgr.acquire("u", "p", "old", Some(LEASE_MIN_MS), ConsumerType::Local)
            .await
            .unwrap();

        // Force-expire by editing the stored document.
        let store = mgr.store().clone();
        let mut versioned = store.get("u", "p").await.unwrap().unwrap();
        if let Some(lock) = versioned.value.consumer_lock.as_mut() {
            lock.expires_at = 0;
        }
        store
            .put_if_version("u", "p", versioned.value, versioned.version)
            .await
            .unwrap();

        let outcome = mgr
            .acquire("u", "p", "new", Some(10_000), ConsumerType::Cloud)
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired { .. }));
    }

    #[tokio::test]
    async fn lease_bounds_clamp() {
        let mgr = manager().await;
        let AcquireOutcome::Acquired { lock } = mgr
            .acquire("u", "p", "c1", Some(1), ConsumerType::Local)
            .await
            .unwrap()
        else {
            panic!()
        };
        assert_eq!(lock.lease_ms, LEASE_MIN_MS);

        let AcquireOutcome::Refreshed { lock } = mgr
            .acquire("u", "p", "c1", Some(u64::MAX), ConsumerType::Local)
            .await
            .unwrap()
        else {
            panic!()
        };
        assert_eq!(lock.lease_ms, LEASE_MAX_MS);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mgr = manager().await;
        mgr.acquire("u", "p", "c1", None, ConsumerType::Local)
            .await
            .unwrap();

        assert_eq!(
            mgr.release("u", "p", Some("c1"), false).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(
            mgr.release("u", "p", Some("c1"), false).await.unwrap(),
            ReleaseOutcome::NotHeld
        );
    }

    #[tokio::test]
    async fn release_by_stranger_conflicts_unless_forced() {
        let mgr = manager().await;
        mgr.acquire("u", "p", "c1", None, ConsumerType::Local)
            .await
            .unwrap();

        assert_eq!(
            mgr.release("u", "p", Some("intruder"), false).await.unwrap(),
            ReleaseOutcome::Conflict
        );
        assert_eq!(
            mgr.release("u", "p", None, true).await.unwrap(),
            ReleaseOutcome::Released
        );
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let mgr = LeaseManager::new(Arc::new(MemoryStore::new()));
        let err = mgr
            .acquire("ghost", "nope", "c1", None, ConsumerType::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::ProjectNotFound { .. }));
    }

    #[tokio::test]
    async fn runtime_info_only_for_the_holder() {
        let mgr = manager().await;
        mgr.acquire("u", "p", "c1", None, ConsumerType::Local)
            .await
            .unwrap();

        assert!(
            mgr.set_runtime_info("u", "p", "c1", json!({"mode": "local"}))
                .await
                .unwrap()
        );
        assert!(
            !mgr.set_runtime_info("u", "p", "intruder", json!({"mode": "evil"}))
                .await
                .unwrap()
        );

        // Merging keeps earlier keys.
        mgr.set_runtime_info("u", "p", "c1", json!({"containerId": "abc"}))
            .await
            .unwrap();
        let status = mgr.status("u", "p").await.unwrap();
        let runtime = status.holder.unwrap().runtime.unwrap();
        assert_eq!(runtime["mode"], "local");
        assert_eq!(runtime["containerId"], "abc");
    }
}
