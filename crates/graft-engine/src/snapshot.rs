//! Snapshot operations for rollback support.
//!
//! A snapshot is a content copy of the files an upgrade may touch, stored
//! under `.graft/.snapshots/<id>/` together with a JSON manifest. The
//! manifest records which files existed (restored by copy + rename),
//! which were missing (deleted on restore), the dependency being
//! upgraded, and its pre-upgrade commit. A snapshot stays in the
//! `in-progress` state until the upgrade commits, so a crash leaves a
//! detectable marker that the next invocation reconciles.

use graft_core::error::{GraftError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "manifest.json";

/// Persisted description of one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    /// Dependency the upgrade targets.
    pub dep_name: String,
    /// Commit the dependency checkout was at before the upgrade.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_commit: Option<String>,
    pub created_at: String,
    /// Relative paths that existed and were copied.
    pub files: Vec<String>,
    /// Relative paths that did not exist; restore deletes them if an
    /// aborted migration created them.
    pub missing: Vec<String>,
    /// "in-progress" until the upgrade commits or rolls back.
    pub state: String,
}

impl SnapshotManifest {
    pub fn is_in_progress(&self) -> bool {
        self.state == "in-progress"
    }
}

/// Manages snapshot creation, restoration, and cleanup for one repository.
pub struct SnapshotManager {
    snapshot_dir: PathBuf,
}

impl SnapshotManager {
    /// Snapshot storage rooted under the dependencies directory, the
    /// known path scanned for interrupted upgrades.
    pub fn new(deps_directory: impl AsRef<Path>) -> Result<Self> {
        Self::with_directory(deps_directory.as_ref().join(".snapshots"))
    }

    pub fn with_directory(snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_dir = snapshot_dir.into();
        fs::create_dir_all(&snapshot_dir)?;
        Ok(Self { snapshot_dir })
    }

    /// Create a snapshot of `paths` (relative to `base_dir`).
    ///
    /// Returns the snapshot id. The manifest is written last, so a
    /// half-created snapshot (no manifest) is ignored by the scanner.
    pub fn create(
        &self,
        dep_name: &str,
        previous_commit: Option<String>,
        paths: &[impl AsRef<Path>],
        base_dir: &Path,
    ) -> Result<String> {
        let id = format!(
            "{}-{}",
            dep_name,
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        );
        let snapshot_path = self.snapshot_dir.join(&id);
        fs::create_dir_all(&snapshot_path)?;

        let mut files = Vec::new();
        let mut missing = Vec::new();

        for path_ref in paths {
            let rel = path_ref.as_ref();
            let full_path = base_dir.join(rel);

            if full_path.exists() {
                let backup = snapshot_path.join(rel);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&full_path, &backup)?;
                files.push(rel.display().to_string());
            } else {
                missing.push(rel.display().to_string());
            }
        }

        let manifest = SnapshotManifest {
            id: id.clone(),
            dep_name: dep_name.to_string(),
            previous_commit,
            created_at: graft_core::utc_timestamp_now(),
            files,
            missing,
            state: "in-progress".to_string(),
        };
        self.write_manifest(&manifest)?;

        log::debug!("created snapshot {id}");
        Ok(id)
    }

    /// Restore every file recorded in the snapshot to `base_dir`.
    ///
    /// Each file is copied to a temp sibling and renamed into place, so a
    /// restore interrupted mid-file never leaves a half-written target.
    /// Paths recorded as missing are deleted if something created them.
    pub fn restore(&self, id: &str, base_dir: &Path) -> Result<()> {
        let manifest = self.read_manifest(id)?;
        let snapshot_path = self.snapshot_dir.join(id);

        for rel in &manifest.files {
            let backup = snapshot_path.join(rel);
            let target = base_dir.join(rel);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let dir = target.parent().filter(|p| !p.as_os_str().is_empty());
            let mut temp =
                tempfile::NamedTempFile::new_in(dir.unwrap_or_else(|| Path::new(".")))?;
            let content = fs::read(&backup)?;
            temp.write_all(&content)?;
            temp.as_file().sync_all()?;
            temp.persist(&target)
                .map_err(|e| GraftError::Snapshot(format!("failed to restore {rel}: {e}")))?;
        }

        for rel in &manifest.missing {
            let target = base_dir.join(rel);
            if target.exists() {
                fs::remove_file(&target)?;
            }
        }

        log::debug!("restored snapshot {id}");
        Ok(())
    }

    /// Delete a snapshot after the upgrade commits or rolls back.
    pub fn delete(&self, id: &str) -> Result<()> {
        let snapshot_path = self.snapshot_dir.join(id);
        if !snapshot_path.exists() {
            return Err(GraftError::Snapshot(format!("snapshot not found: {id}")));
        }
        fs::remove_dir_all(&snapshot_path)?;
        Ok(())
    }

    /// Snapshots left in the `in-progress` state by an interrupted upgrade.
    pub fn interrupted(&self) -> Result<Vec<SnapshotManifest>> {
        let mut found = Vec::new();

        let Ok(entries) = fs::read_dir(&self.snapshot_dir) else {
            return Ok(found);
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.read_manifest(&id) {
                Ok(manifest) if manifest.is_in_progress() => found.push(manifest),
                // A directory without a readable manifest never completed
                // its create(); it holds nothing restorable.
                _ => {}
            }
        }

        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir.join(id).join(MANIFEST_FILE)
    }

    fn read_manifest(&self, id: &str) -> Result<SnapshotManifest> {
        let path = self.manifest_path(id);
        let content = fs::read_to_string(&path)
            .map_err(|e| GraftError::Snapshot(format!("snapshot {id} has no manifest: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| GraftError::Snapshot(format!("snapshot {id} manifest corrupt: {e}")))
    }

    fn write_manifest(&self, manifest: &SnapshotManifest) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest)
            .map_err(|e| GraftError::Snapshot(e.to_string()))?;
        fs::write(self.manifest_path(&manifest.id), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(base: &Path) -> SnapshotManager {
        SnapshotManager::with_directory(base.join(".snapshots")).unwrap()
    }

    #[test]
    fn create_and_restore_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base_dir = temp_dir.path();

        let test_file = base_dir.join("graft.lock");
        fs::write(&test_file, "original content").unwrap();

        let manager = manager(base_dir);
        let id = manager
            .create("meta-kb", None, &["graft.lock"], base_dir)
            .unwrap();

        fs::write(&test_file, "modified content").unwrap();

        manager.restore(&id, base_dir).unwrap();
        assert_eq!(fs::read_to_string(&test_file).unwrap(), "original content");

        manager.delete(&id).unwrap();
    }

    #[test]
    fn restore_deletes_files_that_were_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base_dir = temp_dir.path();

        let manager = manager(base_dir);
        let id = manager
            .create("meta-kb", None, &["created-later.txt"], base_dir)
            .unwrap();

        // A migration creates the file; rollback must remove it so the
        // tree is byte-equal to the pre-upgrade state.
        let created = base_dir.join("created-later.txt");
        fs::write(&created, "new content").unwrap();

        manager.restore(&id, base_dir).unwrap();
        assert!(!created.exists());

        manager.delete(&id).unwrap();
    }

    #[test]
    fn interrupted_snapshots_are_detectable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base_dir = temp_dir.path();
        fs::write(base_dir.join("graft.lock"), "content").unwrap();

        let manager = manager(base_dir);
        let id = manager
            .create("meta-kb", Some("a".repeat(40)), &["graft.lock"], base_dir)
            .unwrap();

        let interrupted = manager.interrupted().unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, id);
        assert_eq!(interrupted[0].dep_name, "meta-kb");
        assert_eq!(interrupted[0].previous_commit, Some("a".repeat(40)));

        manager.delete(&id).unwrap();
        assert!(manager.interrupted().unwrap().is_empty());
    }

    #[test]
    fn manifest_records_previous_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base_dir = temp_dir.path();
        fs::write(base_dir.join("graft.lock"), "content").unwrap();

        let manager = manager(base_dir);
        let id = manager
            .create("dep", Some("b".repeat(40)), &["graft.lock"], base_dir)
            .unwrap();

        let manifest = manager.read_manifest(&id).unwrap();
        assert_eq!(manifest.previous_commit, Some("b".repeat(40)));
        assert!(manifest.is_in_progress());
    }

    #[test]
    fn restore_nonexistent_snapshot_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(temp_dir.path());
        assert!(manager.restore("nope", temp_dir.path()).is_err());
    }

    #[test]
    fn delete_nonexistent_snapshot_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager(temp_dir.path());
        assert!(manager.delete("nope").is_err());
    }
}
