//! Dependency resolution service.
//!
//! Implements the flat-only resolution model: only direct dependencies
//! declared in graft.yaml are materialized, as git submodules under the
//! dependencies root. Dependencies are processed in alphabetical order;
//! the lock file is written only when every dependency resolved, so a
//! partial failure never moves the lock.

use graft_common::git;
use graft_core::domain::{CommitHash, DependencySpec, GraftConfig, LockEntry, LockFile};
use graft_core::error::{GraftError, Result};
use std::path::{Path, PathBuf};

use crate::lock::write_lock_file;

/// Terminal state of resolving one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// Newly added as a submodule.
    Cloned,
    /// Already present; ref resolved (and checkout moved if needed).
    Resolved,
    Failed,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloned => write!(f, "cloned"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of resolving a single dependency.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub name: String,
    pub status: ResolutionStatus,
    /// Resolved commit, present on success.
    pub commit: Option<CommitHash>,
    pub local_path: Option<PathBuf>,
    /// Non-fatal observation, e.g. a legacy clone warning.
    pub note: Option<String>,
    pub error: Option<String>,
}

impl ResolutionResult {
    pub fn is_success(&self) -> bool {
        self.status != ResolutionStatus::Failed
    }

    fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ResolutionStatus::Failed,
            commit: None,
            local_path: None,
            note: None,
            error: Some(error.into()),
        }
    }
}

fn git_err<'a>(name: &'a str, stage: &'a str) -> impl FnOnce(git::GitError) -> GraftError + 'a {
    move |e| GraftError::Resolution {
        name: name.to_string(),
        stage: stage.to_string(),
        reason: e.to_string(),
    }
}

/// Resolve a single dependency as a git submodule.
///
/// * Existing submodule: update, fetch (best effort), resolve, checkout
///   when HEAD differs.
/// * Existing plain repository (legacy clone): warn and proceed in place.
/// * Missing: add as a submodule at the declared ref.
pub fn resolve_dependency(
    spec: &DependencySpec,
    base_dir: &Path,
    deps_directory: &str,
) -> Result<ResolutionResult> {
    let rel_path = format!("{deps_directory}/{}", spec.name);
    let local_path = base_dir.join(&rel_path);
    let name = spec.name.as_str();

    let mut note = None;
    let mut newly_cloned = false;

    if git::is_submodule(base_dir, &rel_path).map_err(git_err(name, "submodule status"))? {
        git::update_submodule(base_dir, &rel_path).map_err(git_err(name, "submodule update"))?;
        if let Err(e) = git::fetch(&local_path) {
            log::warn!("fetch for '{name}' failed, using cached refs: {e}");
        }
    } else if local_path.exists() {
        if git::is_repository(&local_path) {
            log::warn!(
                "'{name}' at {} is a plain clone, not a submodule; resolving in place",
                local_path.display()
            );
            note = Some("legacy clone (delete and re-resolve to convert to a submodule)".to_string());
            if let Err(e) = git::fetch(&local_path) {
                log::warn!("fetch for '{name}' failed, using cached refs: {e}");
            }
        } else {
            return Err(GraftError::Resolution {
                name: name.to_string(),
                stage: "inspect".to_string(),
                reason: format!(
                    "path exists but is not a git repository: {}",
                    local_path.display()
                ),
            });
        }
    } else {
        git::add_submodule(base_dir, spec.git_url.as_str(), &rel_path, None)
            .map_err(git_err(name, "submodule add"))?;
        newly_cloned = true;
    }

    let resolved = git::resolve_ref(&local_path, spec.git_ref.as_str()).map_err(|_| {
        GraftError::UnknownRef {
            git_ref: spec.git_ref.as_str().to_string(),
        }
    })?;
    let commit = CommitHash::new(resolved)?;

    let head = git::current_commit(&local_path).map_err(git_err(name, "rev-parse"))?;
    if head != commit.as_str() {
        git::checkout(&local_path, commit.as_str()).map_err(git_err(name, "checkout"))?;
    }

    Ok(ResolutionResult {
        name: name.to_string(),
        status: if newly_cloned {
            ResolutionStatus::Cloned
        } else {
            ResolutionStatus::Resolved
        },
        commit: Some(commit),
        local_path: Some(local_path),
        note,
        error: None,
    })
}

/// Resolve all declared dependencies, in alphabetical order.
///
/// Per-dependency failures are recorded and the walk continues.
pub fn resolve_all(
    config: &GraftConfig,
    base_dir: &Path,
    deps_directory: &str,
) -> Vec<ResolutionResult> {
    let mut results = Vec::new();

    for name in config.dependency_names() {
        let spec = &config.dependencies[name];
        let result = match resolve_dependency(spec, base_dir, deps_directory) {
            Ok(res) => res,
            Err(e) => ResolutionResult::failure(name, e.to_string()),
        };
        results.push(result);
    }

    results
}

/// Outcome of a full resolve: per-dependency results plus the lock file,
/// present only when every dependency succeeded.
#[derive(Debug)]
pub struct ResolveOutcome {
    pub results: Vec<ResolutionResult>,
    pub lock: Option<LockFile>,
}

/// Resolve all dependencies and, if all succeeded, write a fresh lock.
///
/// On any failure the existing lock file is left untouched; partial
/// on-disk state under the dependencies root is permitted (retry is safe).
pub fn resolve_and_write_lock(
    config: &GraftConfig,
    lock_path: impl AsRef<Path>,
    base_dir: &Path,
    deps_directory: &str,
) -> Result<ResolveOutcome> {
    let results = resolve_all(config, base_dir, deps_directory);

    if results.iter().any(|r| !r.is_success()) {
        return Ok(ResolveOutcome {
            results,
            lock: None,
        });
    }

    let consumed_at = graft_core::utc_timestamp_now();
    let mut lock = LockFile {
        api_version: config.api_version.clone(),
        dependencies: indexmap::IndexMap::new(),
    };

    for result in &results {
        let spec = &config.dependencies[&result.name];
        let commit = result
            .commit
            .clone()
            .ok_or_else(|| GraftError::Resolution {
                name: result.name.clone(),
                stage: "lock".to_string(),
                reason: "successful resolution is missing a commit".to_string(),
            })?;
        lock.insert(
            result.name.clone(),
            LockEntry::new(
                spec.git_url.clone(),
                spec.git_ref.clone(),
                commit,
                consumed_at.clone(),
            ),
        );
    }

    write_lock_file(lock_path, &lock)?;

    Ok(ResolveOutcome {
        results,
        lock: Some(lock),
    })
}

/// Result of fetching a single dependency.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
}

impl FetchResult {
    fn success(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            error: None,
        }
    }

    fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Fetch a single dependency's remote state.
///
/// Updates remote-tracking refs only: no working-tree change, no lock change.
pub fn fetch_dependency(name: &str, base_dir: &Path, deps_directory: &str) -> FetchResult {
    let local_path = base_dir.join(deps_directory).join(name);

    if !local_path.exists() {
        return FetchResult::failure(name, "not cloned (run 'graft resolve')");
    }
    if !git::is_repository(&local_path) {
        return FetchResult::failure(name, "not a git repository");
    }

    match git::fetch(&local_path) {
        Ok(()) => FetchResult::success(name),
        Err(e) => FetchResult::failure(name, e.to_string()),
    }
}

/// Fetch all declared dependencies, alphabetically; failures don't stop the walk.
pub fn fetch_all(config: &GraftConfig, base_dir: &Path, deps_directory: &str) -> Vec<FetchResult> {
    config
        .dependency_names()
        .into_iter()
        .map(|name| fetch_dependency(name, base_dir, deps_directory))
        .collect()
}

/// Action taken by a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    UpToDate,
    CheckedOut,
    /// Dependency directory does not exist; reported and skipped.
    Missing,
    Failed,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up_to_date"),
            Self::CheckedOut => write!(f, "checked_out"),
            Self::Missing => write!(f, "missing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of syncing a single dependency.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub name: String,
    pub action: SyncAction,
    pub message: String,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        !matches!(self.action, SyncAction::Failed)
    }
}

/// Bring one dependency's checkout into agreement with its lock entry.
///
/// Idempotent: a checkout already at the locked commit performs no write.
pub fn sync_dependency(
    name: &str,
    entry: &LockEntry,
    base_dir: &Path,
    deps_directory: &str,
) -> Result<SyncResult> {
    let rel_path = format!("{deps_directory}/{name}");
    let local_path = base_dir.join(&rel_path);

    let registered =
        git::is_submodule(base_dir, &rel_path).map_err(git_err(name, "submodule status"))?;

    // Initialize a registered-but-empty submodule; never run `submodule
    // update` on an initialized one (it would reset HEAD to the recorded
    // gitlink, making a second sync a write instead of a no-op).
    if !git::is_repository(&local_path) {
        if registered {
            git::update_submodule(base_dir, &rel_path)
                .map_err(git_err(name, "submodule update"))?;
        } else if !local_path.exists() {
            return Ok(SyncResult {
                name: name.to_string(),
                action: SyncAction::Missing,
                message: "not cloned (run 'graft resolve')".to_string(),
            });
        } else {
            return Ok(SyncResult {
                name: name.to_string(),
                action: SyncAction::Failed,
                message: format!(
                    "path exists but is not a git repository: {}",
                    local_path.display()
                ),
            });
        }
    }

    let legacy = !registered;
    if legacy {
        log::warn!("'{name}' is a plain clone, not a submodule; syncing in place");
    }

    let suffix = if legacy {
        " (legacy clone - delete and re-resolve)"
    } else {
        ""
    };

    let current = git::current_commit(&local_path).map_err(git_err(name, "rev-parse"))?;
    if current == entry.commit.as_str() {
        return Ok(SyncResult {
            name: name.to_string(),
            action: SyncAction::UpToDate,
            message: format!("already at {}{suffix}", entry.commit.short()),
        });
    }

    // The locked commit may be absent locally until fetched.
    if git::checkout(&local_path, entry.commit.as_str()).is_err() {
        git::fetch(&local_path).map_err(git_err(name, "fetch"))?;
        git::checkout(&local_path, entry.commit.as_str()).map_err(git_err(name, "checkout"))?;
    }

    Ok(SyncResult {
        name: name.to_string(),
        action: SyncAction::CheckedOut,
        message: format!("checked out {}{suffix}", entry.commit.short()),
    })
}

/// Sync every locked dependency, alphabetically; failures don't stop the walk.
pub fn sync_all(lock: &LockFile, base_dir: &Path, deps_directory: &str) -> Vec<SyncResult> {
    let mut results = Vec::new();

    for name in lock.dependency_names() {
        let entry = &lock.dependencies[name];
        let result = match sync_dependency(name, entry, base_dir, deps_directory) {
            Ok(res) => res,
            Err(e) => SyncResult {
                name: name.to_string(),
                action: SyncAction::Failed,
                message: e.to_string(),
            },
        };
        results.push(result);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::domain::{GitRef, GitUrl};

    #[test]
    fn resolution_result_success_predicate() {
        let result = ResolutionResult {
            name: "test-dep".to_string(),
            status: ResolutionStatus::Cloned,
            commit: Some(CommitHash::new("a".repeat(40)).unwrap()),
            local_path: Some(PathBuf::from(".graft/test-dep")),
            note: None,
            error: None,
        };
        assert!(result.is_success());

        let result = ResolutionResult::failure("test-dep", "connection failed");
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("connection failed"));
    }

    #[test]
    fn fetch_missing_dependency_reports_unresolved() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = fetch_dependency("ghost", temp_dir.path(), ".graft");
        assert!(!result.success);
        assert!(result.error.unwrap().contains("graft resolve"));
    }

    #[test]
    fn sync_missing_dependency_skips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let entry = LockEntry::new(
            GitUrl::new("https://github.com/org/repo.git").unwrap(),
            GitRef::new("main").unwrap(),
            CommitHash::new("a".repeat(40)).unwrap(),
            "2026-01-31T10:30:00Z",
        );

        let result = sync_dependency("ghost", &entry, temp_dir.path(), ".graft").unwrap();
        assert_eq!(result.action, SyncAction::Missing);
    }

    #[test]
    fn sync_path_that_is_not_a_repo_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".graft/broken")).unwrap();

        let entry = LockEntry::new(
            GitUrl::new("https://github.com/org/repo.git").unwrap(),
            GitRef::new("main").unwrap(),
            CommitHash::new("a".repeat(40)).unwrap(),
            "2026-01-31T10:30:00Z",
        );

        let result = sync_dependency("broken", &entry, temp_dir.path(), ".graft").unwrap();
        assert_eq!(result.action, SyncAction::Failed);
    }

    #[test]
    fn statuses_render_stable_names() {
        assert_eq!(ResolutionStatus::Cloned.to_string(), "cloned");
        assert_eq!(ResolutionStatus::Resolved.to_string(), "resolved");
        assert_eq!(ResolutionStatus::Failed.to_string(), "failed");
        assert_eq!(SyncAction::UpToDate.to_string(), "up_to_date");
    }
}
