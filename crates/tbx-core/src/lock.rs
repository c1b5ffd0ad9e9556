// SPDX-License-Identifier: MIT OR Apache-2.0
//! The consumer lock: a time-bounded exclusive right to serve a project.

use crate::{LEASE_DEFAULT_MS, LEASE_MAX_MS, LEASE_MIN_MS};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where the holding consumer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsumerType {
    /// Containers on the supervisor's host.
    Local,
    /// Cloud-managed job executions.
    Cloud,
}

/// Clamp a requested lease duration into the allowed range.
///
/// `None` yields the default lease.
#[must_use]
pub fn clamp_lease_ms(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(LEASE_DEFAULT_MS)
        .clamp(LEASE_MIN_MS, LEASE_MAX_MS)
}

/// The lock document stored under the project.
///
/// At any wall time at most one unexpired lock exists per project; the
/// store's compare-and-swap is the only thing enforcing that, so every
/// mutation goes through the lease manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLock {
    /// Opaque holder identity.
    pub consumer_id: String,
    /// Where the holder runs.
    pub consumer_type: ConsumerType,
    /// Lease duration in milliseconds.
    pub lease_ms: u64,
    /// When the lock was first acquired (ms since epoch).
    pub acquired_at: i64,
    /// When the lease was last refreshed (ms since epoch).
    pub refreshed_at: i64,
    /// When the lease expires (ms since epoch).
    pub expires_at: i64,
    /// Launch-mode details persisted by the supervisor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Value>,
}

impl ConsumerLock {
    /// Install a fresh lock held by `consumer_id` as of `now` (ms since epoch).
    pub fn install(
        consumer_id: impl Into<String>,
        consumer_type: ConsumerType,
        lease_ms: u64,
        now: i64,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            consumer_type,
            lease_ms,
            acquired_at: now,
            refreshed_at: now,
            expires_at: now + lease_ms as i64,
            runtime: None,
        }
    }

    /// Refresh the lease in place, keeping `acquired_at` and `runtime`.
    pub fn refresh(&mut self, lease_ms: u64, now: i64) {
        self.lease_ms = lease_ms;
        self.refreshed_at = now;
        self.expires_at = now + lease_ms as i64;
    }

    /// Whether the lease has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    /// Milliseconds of lease remaining at `now` (zero when expired).
    #[must_use]
    pub fn ms_remaining(&self, now: i64) -> u64 {
        (self.expires_at - now).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp_lease_ms(Some(1)), LEASE_MIN_MS);
        assert_eq!(clamp_lease_ms(Some(4_999)), LEASE_MIN_MS);
        assert_eq!(clamp_lease_ms(Some(5_000)), 5_000);
        assert_eq!(clamp_lease_ms(Some(3_600_000)), 3_600_000);
        assert_eq!(clamp_lease_ms(Some(9_999_999)), LEASE_MAX_MS);
        assert_eq!(clamp_lease_ms(None), LEASE_DEFAULT_MS);
    }

    #[test]
    fn install_and_expiry() {
        let lock = ConsumerLock::install("c1", ConsumerType::Local, 60_000, 1_000);
        assert_eq!(lock.expires_at, 61_000);
        assert!(!lock.is_expired(60_999));
        assert!(lock.is_expired(61_000));
        assert_eq!(lock.ms_remaining(31_000), 30_000);
        assert_eq!(lock.ms_remaining(70_000), 0);
    }

    #[test]
    fn refresh_extends_without_touching_acquired_at() {
        let mut lock = ConsumerLock::install("c1", ConsumerType::Cloud, 10_000, 1_000);
        lock.runtime = Some(serde_json::json!({"mode": "cloud"}));
        lock.refresh(20_000, 5_000);
        assert_eq!(lock.acquired_at, 1_000);
        assert_eq!(lock.refreshed_at, 5_000);
        assert_eq!(lock.expires_at, 25_000);
        assert!(lock.runtime.is_some());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let lock = ConsumerLock::install("c1", ConsumerType::Local, 5_000, 0);
        let v = serde_json::to_value(&lock).unwrap();
        assert_eq!(v["consumerId"], "c1");
        assert_eq!(v["consumerType"], "LOCAL");
        assert_eq!(v["leaseMs"], 5_000);
        assert!(v.get("runtime").is_none());
    }
}
