// SPDX-License-Identifier: MIT OR Apache-2.0
//! Periodic workspace mirroring against the object store.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tbx_config::MirrorSettings;
use tbx_mirror::{MirrorClient, SyncOptions};
use tracing::{debug, info, warn};

/// Run mirror syncs on a fixed interval until shutdown.
///
/// A re-entrancy flag skips a tick while the previous sync is still
/// running, so slow syncs never overlap. Does nothing when no bucket is
/// configured or the interval is zero (then only `sync_on_start` applies).
pub async fn run_sync_timer(
    settings: MirrorSettings,
    prefix: String,
    work_root: PathBuf,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let Some(bucket) = settings.bucket.clone() else {
        debug!(target: "tbx.executor", "no mirror bucket configured; sync timer idle");
        return;
    };
    let client = MirrorClient::new(
        &settings.base_url,
        bucket,
        None,
        settings.billing_project.clone(),
    );
    let options = SyncOptions {
        prefix,
        enable_upload: settings.enable_upload,
        download_concurrency: settings.download_concurrency,
        upload_concurrency: settings.upload_concurrency,
    };
    let busy = Arc::new(AtomicBool::new(false));

    if settings.sync_on_start {
        run_guarded(&client, &work_root, &options, &busy).await;
    }
    if settings.sync_interval_ms == 0 {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(settings.sync_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // The first tick fires immediately; skip it.

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_guarded(&client, &work_root, &options, &busy).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_guarded(
    client: &MirrorClient,
    work_root: &std::path::Path,
    options: &SyncOptions,
    busy: &Arc<AtomicBool>,
) {
    if busy.swap(true, Ordering::SeqCst) {
        debug!(target: "tbx.executor", "previous sync still running; skipping tick");
        return;
    }
    match tbx_mirror::sync(client, work_root, options).await {
        Ok(report) => {
            info!(
                target: "tbx.executor",
                downloaded = report.downloaded,
                uploaded = report.uploaded,
                conflicts = report.conflicts,
                "mirror sync complete"
            );
        }
        Err(e) => {
            warn!(target: "tbx.executor", error = %e, "mirror sync failed");
        }
    }
    busy.store(false, Ordering::SeqCst);
}
