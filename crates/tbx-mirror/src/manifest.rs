// SPDX-License-Identifier: MIT OR Apache-2.0
//! The local sync manifest: per-object generation tokens and local stats.

use crate::MirrorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Manifest file name, kept in the work root.
pub const MANIFEST_FILE: &str = ".gcs-manifest.json";

/// What the manifest remembers about one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Remote generation token last agreed with the store.
    pub remote_gen: String,
    /// Local file mtime (ms since epoch) at that point.
    pub local_mtime: i64,
    /// Local file size at that point.
    pub local_size: u64,
}

/// Mapping from remote object name to its last-agreed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Load the manifest from `work_root`; a missing file is an empty manifest.
    pub fn load(work_root: &Path) -> Result<Self, MirrorError> {
        let path = work_root.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist atomically: write `<manifest>.tmp`, then rename over the real
    /// file. A crash mid-save leaves the previous manifest intact.
    pub fn save(&self, work_root: &Path) -> Result<(), MirrorError> {
        let path = work_root.join(MANIFEST_FILE);
        let tmp = work_root.join(format!("{MANIFEST_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Look up an object by its remote name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.get(name)
    }

    /// Record the agreed state for an object.
    pub fn insert(&mut self, name: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(name.into(), entry);
    }

    /// Iterate all tracked object names and entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.entries.iter()
    }

    /// Number of tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest tracks nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(dir.path()).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        manifest.insert(
            "prefix/a.txt",
            ManifestEntry {
                remote_gen: "1234".into(),
                local_mtime: 1_700_000_000_000,
                local_size: 5,
            },
        );
        manifest.save(dir.path()).unwrap();

        let back = Manifest::load(dir.path()).unwrap();
        assert_eq!(back, manifest);
        // No temp file left behind.
        assert!(!dir.path().join(format!("{MANIFEST_FILE}.tmp")).exists());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let mut manifest = Manifest::default();
        manifest.insert(
            "o",
            ManifestEntry {
                remote_gen: "9".into(),
                local_mtime: 10,
                local_size: 20,
            },
        );
        let v = serde_json::to_value(&manifest).unwrap();
        assert_eq!(v["o"]["remoteGen"], "9");
        assert_eq!(v["o"]["localMtime"], 10);
        assert_eq!(v["o"]["localSize"], 20);
    }

    #[test]
    fn corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(MirrorError::Manifest(_))
        ));
    }
}
