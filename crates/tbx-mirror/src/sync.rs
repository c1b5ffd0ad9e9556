// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two-way sync pass: list, conditional download, conditional upload.

use crate::client::{MirrorClient, RemoteObject, UploadOutcome};
use crate::manifest::{Manifest, ManifestEntry};
use crate::{MANIFEST_FILE, MirrorError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Knobs for one sync pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Object-name prefix scoping the sync.
    pub prefix: String,
    /// Whether local changes are pushed back to the store.
    pub enable_upload: bool,
    /// Concurrent downloads.
    pub download_concurrency: usize,
    /// Concurrent uploads.
    pub upload_concurrency: usize,
}

/// What one sync pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote objects listed under the prefix.
    pub listed: usize,
    /// Objects downloaded because their generation changed.
    pub downloaded: usize,
    /// Local files uploaded.
    pub uploaded: usize,
    /// Files skipped as already in agreement.
    pub skipped: usize,
    /// Conflicts detected and left alone.
    pub conflicts: usize,
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicUsize,
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
    conflicts: AtomicUsize,
}

/// Run one full sync pass of `work_root` against the store.
///
/// Downloads every listed object whose generation differs from the
/// manifest, then (when enabled) uploads local changes conditionally on the
/// recorded generation. Permission failures and lost generation races count
/// as conflicts; network failures propagate.
pub async fn sync(
    client: &MirrorClient,
    work_root: &Path,
    opts: &SyncOptions,
) -> Result<SyncReport, MirrorError> {
    let remote = client.list(&opts.prefix).await?;
    let listed = remote.len();
    let manifest = Arc::new(Mutex::new(Manifest::load(work_root)?));
    let counters = Arc::new(Counters::default());

    download_pass(client, work_root, opts, &remote, &manifest, &counters).await?;
    if opts.enable_upload {
        upload_pass(client, work_root, opts, &remote, &manifest, &counters).await?;
    }

    manifest.lock().await.save(work_root)?;

    let report = SyncReport {
        listed,
        downloaded: counters.downloaded.load(Ordering::Relaxed),
        uploaded: counters.uploaded.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        conflicts: counters.conflicts.load(Ordering::Relaxed),
    };
    debug!(
        target: "tbx.mirror",
        listed = report.listed,
        downloaded = report.downloaded,
        uploaded = report.uploaded,
        conflicts = report.conflicts,
        "sync pass complete"
    );
    Ok(report)
}

async fn download_pass(
    client: &MirrorClient,
    work_root: &Path,
    opts: &SyncOptions,
    remote: &[RemoteObject],
    manifest: &Arc<Mutex<Manifest>>,
    counters: &Arc<Counters>,
) -> Result<(), MirrorError> {
    let semaphore = Arc::new(Semaphore::new(opts.download_concurrency));
    let mut tasks = Vec::new();

    for object in remote {
        let rel = strip_object_prefix(&object.name, &opts.prefix);
        if rel.is_empty() || object.name.ends_with('/') {
            // Prefix placeholder or directory marker; nothing to write.
            continue;
        }

        let up_to_date = manifest
            .lock()
            .await
            .get(&object.name)
            .is_some_and(|e| e.remote_gen == object.generation);
        if up_to_date {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let dest = tbx_workspace::resolve_within(work_root, &rel)?;
        let client = client.clone();
        let object = object.clone();
        let manifest = Arc::clone(manifest);
        let counters = Arc::clone(counters);
        let semaphore = Arc::clone(&semaphore);

        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            let bytes = client.download(&object.name).await?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &bytes)?;
            let meta = std::fs::metadata(&dest)?;
            manifest.lock().await.insert(
                object.name.clone(),
                ManifestEntry {
                    remote_gen: object.generation.clone(),
                    local_mtime: mtime_ms(&meta),
                    local_size: meta.len(),
                },
            );
            counters.downloaded.fetch_add(1, Ordering::Relaxed);
            Ok::<(), MirrorError>(())
        });
    }

    futures::future::try_join_all(tasks).await?;
    Ok(())
}

async fn upload_pass(
    client: &MirrorClient,
    work_root: &Path,
    opts: &SyncOptions,
    remote: &[RemoteObject],
    manifest: &Arc<Mutex<Manifest>>,
    counters: &Arc<Counters>,
) -> Result<(), MirrorError> {
    let remote_gens: HashMap<&str, &str> = remote
        .iter()
        .map(|o| (o.name.as_str(), o.generation.as_str()))
        .collect();

    // Map each relative path to the remote name history already knows for
    // it. Manifest entries win over the listing, so legacy key variants
    // (double slashes and the like) keep being written where they live.
    let name_by_rel: HashMap<String, String> = {
        let manifest = manifest.lock().await;
        let mut map: HashMap<String, String> = HashMap::new();
        for object in remote {
            let rel = strip_object_prefix(&object.name, &opts.prefix);
            if !rel.is_empty() {
                map.entry(rel).or_insert_with(|| object.name.clone());
            }
        }
        for (name, _) in manifest.iter() {
            let rel = strip_object_prefix(name, &opts.prefix);
            if !rel.is_empty() {
                map.insert(rel, name.clone());
            }
        }
        map
    };

    let semaphore = Arc::new(Semaphore::new(opts.upload_concurrency));
    let mut tasks = Vec::new();

    for entry in WalkDir::new(work_root).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(work_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if rel == MANIFEST_FILE || rel == format!("{MANIFEST_FILE}.tmp") {
            continue;
        }

        let meta = entry.metadata().map_err(|e| std::io::Error::other(e.to_string()))?;
        let mtime = mtime_ms(&meta);
        let size = meta.len();
        let name = name_by_rel
            .get(&rel)
            .cloned()
            .unwrap_or_else(|| format!("{}{rel}", opts.prefix));

        let tracked = manifest.lock().await.get(&name).cloned();
        if let Some(ref e) = tracked {
            if e.local_mtime == mtime && e.local_size == size {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        let remote_gen = remote_gens.get(name.as_str()).map(|g| g.to_string());
        let precondition = match (&tracked, &remote_gen) {
            (Some(e), Some(g)) if *g != e.remote_gen => {
                // Remote moved since we last agreed; last-writer-loses,
                // made explicit.
                counters.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tbx.mirror", object = %name, "upload conflict: remote generation changed");
                continue;
            }
            (Some(e), _) => e.remote_gen.clone(),
            (None, Some(_)) => {
                // Untracked locally but present remotely: first sync and
                // conflict are indistinguishable here, so leave it.
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            (None, None) => "0".to_string(),
        };

        let path = entry.path().to_path_buf();
        let client = client.clone();
        let manifest = Arc::clone(manifest);
        let counters = Arc::clone(counters);
        let semaphore = Arc::clone(&semaphore);

        tasks.push(async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            let bytes = std::fs::read(&path)?;
            match client.upload(&name, bytes, &precondition).await? {
                UploadOutcome::Stored(generation) => {
                    manifest.lock().await.insert(
                        name,
                        ManifestEntry {
                            remote_gen: generation,
                            local_mtime: mtime,
                            local_size: size,
                        },
                    );
                    counters.uploaded.fetch_add(1, Ordering::Relaxed);
                }
                UploadOutcome::PreconditionFailed => {
                    counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                UploadOutcome::PermissionDenied => {
                    warn!(target: "tbx.mirror", object = %name, "upload forbidden; counting as conflict");
                    counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok::<(), MirrorError>(())
        });
    }

    futures::future::try_join_all(tasks).await?;
    Ok(())
}

fn strip_object_prefix(name: &str, prefix: &str) -> String {
    name.strip_prefix(prefix)
        .unwrap_or(name)
        .trim_start_matches('/')
        .to_string()
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_stripping_tolerates_slash_variants() {
        assert_eq!(strip_object_prefix("pre/a.txt", "pre/"), "a.txt");
        assert_eq!(strip_object_prefix("pre//a.txt", "pre/"), "a.txt");
        assert_eq!(strip_object_prefix("pre/a.txt", "pre"), "a.txt");
        assert_eq!(strip_object_prefix("other/a.txt", "pre/"), "other/a.txt");
    }
}
