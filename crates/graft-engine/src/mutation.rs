//! Lock-only mutation: `apply`.
//!
//! `apply` records a new consumed ref for one dependency without running
//! migrations or verification and without touching the checkout. It
//! exists for operator-driven workflows; `upgrade` is the normal path,
//! and `sync` moves the checkout afterwards.

use graft_common::git;
use graft_core::domain::{CommitHash, GitRef, GraftConfig, LockEntry, LockFile};
use graft_core::error::{GraftError, Result};
use std::path::Path;

use crate::lock::{parse_lock_file, write_lock_file};

/// Result of applying a dependency version.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    pub name: String,
    pub entry: LockEntry,
}

/// Update the lock entry for one dependency to `target_ref`.
///
/// Requires the dependency to be declared and resolved at least once (its
/// directory must exist). Fetches best-effort, resolves the ref to a
/// commit, and writes the lock atomically. The checkout is unchanged.
pub fn apply_lock(
    config: &GraftConfig,
    lock_path: impl AsRef<Path>,
    dep_name: &str,
    target_ref: &str,
    base_dir: &Path,
    deps_directory: &str,
) -> Result<ApplyResult> {
    let lock_path = lock_path.as_ref();

    let dep_spec =
        config
            .dependencies
            .get(dep_name)
            .ok_or_else(|| GraftError::DependencyNotFound {
                name: dep_name.to_string(),
            })?;

    let dep_path = base_dir.join(deps_directory).join(dep_name);
    if !dep_path.exists() {
        return Err(GraftError::Resolution {
            name: dep_name.to_string(),
            stage: "apply".to_string(),
            reason: format!(
                "dependency not resolved (expected at {})",
                dep_path.display()
            ),
        });
    }

    let target_ref = GitRef::new(target_ref)?;

    // Best effort: local-only repositories have nothing to fetch.
    if let Err(e) = git::fetch(&dep_path) {
        log::warn!("fetch for '{dep_name}' failed, using cached refs: {e}");
    }

    let commit_str = git::resolve_ref(&dep_path, target_ref.as_str()).map_err(|_| {
        GraftError::UnknownRef {
            git_ref: target_ref.as_str().to_string(),
        }
    })?;
    let commit = CommitHash::new(commit_str)?;

    let mut lock = if lock_path.exists() {
        parse_lock_file(lock_path)?
    } else {
        LockFile::new()
    };

    let entry = LockEntry::new(
        dep_spec.git_url.clone(),
        target_ref,
        commit,
        graft_core::utc_timestamp_now(),
    );

    lock.insert(dep_name.to_string(), entry.clone());
    write_lock_file(lock_path, &lock)?;

    log::info!(
        "applied {dep_name} -> {} ({})",
        entry.git_ref,
        entry.commit.short()
    );

    Ok(ApplyResult {
        name: dep_name.to_string(),
        entry,
    })
}
