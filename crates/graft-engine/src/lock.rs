//! Lock file parsing and writing.
//!
//! Reading accepts entries in any order; writing always emits
//! dependencies alphabetically with a fixed per-entry field order
//! (source, ref, commit, consumed_at), so emitting a lock file is a pure
//! function of the in-memory map. Writes are atomic: serialize to a
//! sibling temp file, fsync, rename.

use graft_core::domain::{LockEntry, LockFile};
use graft_core::error::{GraftError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Parse graft.lock from a file path.
pub fn parse_lock_file(path: impl AsRef<Path>) -> Result<LockFile> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(GraftError::LockFileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path).map_err(|e| GraftError::Lock {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    parse_lock_file_str(&contents, path.display().to_string())
}

/// Parse graft.lock from a string.
///
/// # Examples
///
/// ```
/// use graft_engine::lock::parse_lock_file_str;
///
/// let yaml = r#"
/// apiVersion: graft/v0
/// dependencies:
///   meta-kb:
///     source: "https://github.com/org/meta-kb.git"
///     ref: "v2.0.0"
///     commit: "abc123def456789012345678901234567890abcd"
///     consumed_at: "2026-01-31T10:30:00Z"
/// "#;
///
/// let lock = parse_lock_file_str(yaml, "graft.lock").unwrap();
/// assert_eq!(lock.dependencies.len(), 1);
/// ```
pub fn parse_lock_file_str(yaml_str: &str, path_for_errors: impl Into<String>) -> Result<LockFile> {
    let path_for_errors = path_for_errors.into();

    let lock: LockFile = serde_yaml::from_str(yaml_str).map_err(|e| GraftError::Lock {
        path: path_for_errors.clone(),
        reason: e.to_string(),
    })?;

    lock.validate().map_err(|e| GraftError::Lock {
        path: path_for_errors,
        reason: e.to_string(),
    })?;

    Ok(lock)
}

/// Write a lock file atomically.
///
/// The content lands in a temp file in the destination directory, is
/// fsynced, then renamed over the target. A failure anywhere before the
/// rename leaves the original file untouched.
pub fn write_lock_file(path: impl AsRef<Path>, lock: &LockFile) -> Result<()> {
    let path = path.as_ref();

    lock.validate()?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let yaml = serialize_lock_file(lock)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(yaml.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| GraftError::Lock {
        path: path.display().to_string(),
        reason: format!("failed to commit lock file: {e}"),
    })?;

    Ok(())
}

/// Serialize a lock file to its canonical YAML form.
pub fn serialize_lock_file(lock: &LockFile) -> Result<String> {
    let ordered = to_ordered_lock(lock);
    serde_yaml::to_string(&ordered).map_err(|e| GraftError::Yaml(e.to_string()))
}

/// Serialization shape with apiVersion first and dependencies in
/// alphabetical key order.
#[derive(Debug, Serialize, Deserialize)]
struct OrderedLockFile {
    #[serde(rename = "apiVersion")]
    api_version: String,
    dependencies: IndexMap<String, LockEntry>,
}

fn to_ordered_lock(lock: &LockFile) -> OrderedLockFile {
    let mut names: Vec<&String> = lock.dependencies.keys().collect();
    names.sort();

    let mut dependencies = IndexMap::new();
    for name in names {
        if let Some(entry) = lock.dependencies.get(name) {
            dependencies.insert(name.clone(), entry.clone());
        }
    }

    OrderedLockFile {
        api_version: lock.api_version.clone(),
        dependencies,
    }
}
