// SPDX-License-Identifier: MIT OR Apache-2.0
//! The holder-side refresh loop.

use crate::manager::{AcquireOutcome, LeaseManager};
use rand::Rng;
use std::time::Duration;
use tbx_core::ConsumerType;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Minimum interval between refreshes in production.
pub const REFRESH_FLOOR: Duration = Duration::from_secs(15);

/// Why the refresh loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshExit {
    /// Another consumer holds the lease; this process must surrender.
    Conflict,
    /// Shutdown was requested.
    Shutdown,
}

/// The next refresh delay: ~60% of the lease plus 0–10% jitter, floored.
#[must_use]
pub fn refresh_interval(lease_ms: u64, floor: Duration) -> Duration {
    let base = lease_ms * 60 / 100;
    let jitter = if lease_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=lease_ms / 10)
    };
    Duration::from_millis(base + jitter).max(floor)
}

/// Keep the lease alive until conflict or shutdown.
///
/// `floor` is the minimum interval between refreshes; production callers
/// pass [`REFRESH_FLOOR`]. A store hiccup is logged and retried on the next
/// tick; an observed conflict ends the loop immediately — the caller must
/// stop serving the project.
pub async fn run_refresh_loop(
    manager: &LeaseManager,
    user_id: &str,
    project_id: &str,
    consumer_id: &str,
    lease_ms: u64,
    consumer_type: ConsumerType,
    mut shutdown: watch::Receiver<bool>,
    floor: Duration,
) -> RefreshExit {
    loop {
        let delay = refresh_interval(lease_ms, floor);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return RefreshExit::Shutdown;
                }
                continue;
            }
        }

        match manager
            .acquire(user_id, project_id, consumer_id, Some(lease_ms), consumer_type)
            .await
        {
            Ok(AcquireOutcome::Refreshed { .. } | AcquireOutcome::Acquired { .. }) => {
                debug!(target: "tbx.lease", consumer_id, "lease refresh ok");
            }
            Ok(AcquireOutcome::Conflict { holder, .. }) => {
                warn!(
                    target: "tbx.lease",
                    consumer_id,
                    holder = %holder.consumer_id,
                    "lease lost to another consumer; surrendering"
                );
                return RefreshExit::Conflict;
            }
            Err(e) => {
                warn!(target: "tbx.lease", consumer_id, error = %e, "lease refresh failed; will retry");
            }
        }
    }
}
