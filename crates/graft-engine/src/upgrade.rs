//! Atomic dependency upgrade.
//!
//! An upgrade walks a fixed sequence of phases (planning, snapshotting,
//! fetching, resolving, migrating, verifying, committing) with exactly
//! one commit point: the atomic lock-file rename. A failure in any phase
//! after the snapshot restores the working tree, the lock, and the
//! dependency checkout, leaving the repository indistinguishable from its
//! pre-upgrade state. Snapshots survive crashes and are reconciled on the
//! next invocation.

use graft_common::git;
use graft_core::domain::{Change, CommitHash, GitRef, GraftConfig, LockEntry, LockFile};
use graft_core::error::{GraftError, MigrationPhase, Result};
use std::path::{Path, PathBuf};

use crate::command::{execute_command_with, CommandResult};
use crate::config::parse_graft_yaml_str;
use crate::lock::{parse_lock_file, write_lock_file};
use crate::snapshot::SnapshotManager;

/// Phases of the upgrade state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Planning,
    Snapshotting,
    Fetching,
    Resolving,
    Migrating,
    Verifying,
    Committing,
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Snapshotting => "snapshotting",
            Self::Fetching => "fetching",
            Self::Resolving => "resolving",
            Self::Migrating => "migrating",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
        };
        write!(f, "{s}")
    }
}

/// Options controlling an upgrade.
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Skip migration commands. Verification still runs.
    pub skip_migration: bool,
    /// Skip verification commands.
    pub skip_verify: bool,
    /// Proceed even when the consumer working tree is dirty.
    pub force: bool,
    /// Plan and snapshot only; simulate the rest.
    pub dry_run: bool,
    /// Extra paths (relative to the repository root) covered by the
    /// snapshot, for migrations known to touch user files.
    pub snapshot_paths: Vec<String>,
}

/// The computed upgrade: target, prior state, and the ordered changes to apply.
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub name: String,
    /// Ref currently recorded in the lock, when one exists.
    pub from_ref: Option<GitRef>,
    pub to_ref: GitRef,
    pub to_commit: CommitHash,
    /// Commit the checkout was at before the upgrade.
    pub previous_commit: Option<CommitHash>,
    /// Changes between the consumed ref and the target, in declaration order.
    pub changes: Vec<Change>,
}

/// One executed migration or verification step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub change_ref: String,
    pub command_name: String,
    pub result: CommandResult,
}

/// Outcome of a completed (or simulated) upgrade.
#[derive(Debug)]
pub struct UpgradeOutcome {
    pub plan: UpgradePlan,
    pub migrations: Vec<StepResult>,
    pub verifications: Vec<StepResult>,
    /// The committed lock entry; `None` for dry runs.
    pub entry: Option<LockEntry>,
    pub dry_run: bool,
}

/// Restore any snapshots left `in-progress` by an interrupted upgrade.
///
/// Returns the ids of reconciled snapshots. Called automatically at the
/// start of every upgrade; front-ends may also call it on startup.
pub fn reconcile_interrupted(base_dir: &Path, deps_directory: &str) -> Result<Vec<String>> {
    let manager = SnapshotManager::new(base_dir.join(deps_directory))?;
    let mut reconciled = Vec::new();

    for manifest in manager.interrupted()? {
        log::warn!(
            "an interrupted upgrade of '{}' was detected - restoring snapshot {}",
            manifest.dep_name,
            manifest.id
        );
        manager.restore(&manifest.id, base_dir)?;

        if let Some(previous_commit) = &manifest.previous_commit {
            let dep_path = base_dir.join(deps_directory).join(&manifest.dep_name);
            if dep_path.exists() {
                if let Err(e) = git::checkout(&dep_path, previous_commit) {
                    log::warn!(
                        "could not restore checkout of '{}': {e}",
                        manifest.dep_name
                    );
                }
            }
        }

        manager.delete(&manifest.id)?;
        reconciled.push(manifest.id);
    }

    Ok(reconciled)
}

/// Upgrade one dependency to `to_ref`, atomically.
#[allow(clippy::too_many_lines)]
pub fn upgrade_dependency(
    config: &GraftConfig,
    lock_path: impl AsRef<Path>,
    dep_name: &str,
    to_ref: &str,
    base_dir: &Path,
    deps_directory: &str,
    options: &UpgradeOptions,
) -> Result<UpgradeOutcome> {
    let lock_path = lock_path.as_ref();

    // A crash during a previous upgrade must be repaired before anything
    // else reads the lock.
    reconcile_interrupted(base_dir, deps_directory)?;

    // --- Planning ---
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
            stage: UpgradePhase::Planning.to_string(),
            reason: format!(
                "dependency not resolved (expected at {})",
                dep_path.display()
            ),
        });
    }

    // Refuse dirty consumer trees before the snapshot, unless forced.
    if !options.force && git::is_repository(base_dir) {
        let clean = git::working_tree_clean(base_dir).map_err(|e| GraftError::Git {
            op: "status".to_string(),
            exit_code: None,
            stderr_tail: e.to_string(),
        })?;
        if !clean {
            return Err(GraftError::DirtyTree {
                path: base_dir.display().to_string(),
            });
        }
    }

    let to_ref = GitRef::new(to_ref)?;

    let existing_lock = if lock_path.exists() {
        Some(parse_lock_file(lock_path)?)
    } else {
        None
    };
    let from_ref = existing_lock
        .as_ref()
        .and_then(|lock| lock.get(dep_name))
        .map(|entry| entry.git_ref.clone());

    let to_commit_str =
        git::resolve_ref(&dep_path, to_ref.as_str()).map_err(|_| GraftError::UnknownRef {
            git_ref: to_ref.as_str().to_string(),
        })?;
    let to_commit = CommitHash::new(to_commit_str)?;

    // Changes and commands come from the dependency's config as recorded
    // at the target commit: that version declares the transitions being
    // adopted, including ones the consumed version predates.
    let dep_config = match git::show_file(&dep_path, to_commit.as_str(), "graft.yaml") {
        Ok(text) => Some(parse_graft_yaml_str(
            &text,
            &format!("{deps_directory}/{dep_name}/graft.yaml"),
        )?),
        Err(_) => None,
    };

    let previous_commit = git::current_commit(&dep_path)
        .ok()
        .and_then(|c| CommitHash::new(c).ok());

    let changes = dep_config
        .as_ref()
        .map(|cfg| plan_changes(cfg, from_ref.as_ref(), &to_ref))
        .unwrap_or_default();

    let plan = UpgradePlan {
        name: dep_name.to_string(),
        from_ref,
        to_ref: to_ref.clone(),
        to_commit: to_commit.clone(),
        previous_commit: previous_commit.clone(),
        changes,
    };

    log::info!(
        "upgrading {dep_name}: {} -> {} ({} change(s))",
        plan.from_ref
            .as_ref()
            .map_or("<unlocked>", GitRef::as_str),
        plan.to_ref,
        plan.changes.len()
    );

    // --- Snapshotting ---
    let snapshots = SnapshotManager::new(base_dir.join(deps_directory))?;
    let mut paths: Vec<String> = vec![lock_relative_path(lock_path, base_dir)];
    paths.extend(options.snapshot_paths.iter().cloned());
    let snapshot_id = snapshots.create(
        dep_name,
        previous_commit.as_ref().map(|c| c.as_str().to_string()),
        &paths,
        base_dir,
    )?;

    if options.dry_run {
        // Phases 3-7 are simulated; nothing may remain on disk.
        snapshots.delete(&snapshot_id)?;
        return Ok(UpgradeOutcome {
            plan,
            migrations: Vec::new(),
            verifications: Vec::new(),
            entry: None,
            dry_run: true,
        });
    }

    let rollback = |err: GraftError| -> GraftError {
        if let Err(restore_err) = snapshots.restore(&snapshot_id, base_dir) {
            log::error!(
                "rollback restore failed ({restore_err}); snapshot {snapshot_id} kept for manual recovery"
            );
            return err;
        }
        if let Some(previous) = &previous_commit {
            if let Err(e) = git::checkout(&dep_path, previous.as_str()) {
                log::error!("rollback checkout of '{dep_name}' failed: {e}");
            }
        }
        if let Err(e) = snapshots.delete(&snapshot_id) {
            log::warn!("could not delete snapshot {snapshot_id}: {e}");
        }
        err
    };

    // --- Fetching (best effort; cached refs remain usable) ---
    if let Err(e) = git::fetch(&dep_path) {
        log::warn!("fetch for '{dep_name}' failed, using cached refs: {e}");
    }

    // --- Resolving: move the checkout to the target commit ---
    if let Err(e) = git::checkout(&dep_path, to_commit.as_str()) {
        return Err(rollback(GraftError::Git {
            op: "checkout".to_string(),
            exit_code: None,
            stderr_tail: e.to_string(),
        }));
    }

    // --- Migrating ---
    let mut migrations = Vec::new();
    if !options.skip_migration {
        for change in &plan.changes {
            let Some(command_name) = &change.migration else {
                continue;
            };
            match run_step(
                dep_config.as_ref(),
                command_name,
                &dep_path,
                "migration",
            ) {
                Ok(result) if result.success => {
                    migrations.push(StepResult {
                        change_ref: change.git_ref.as_str().to_string(),
                        command_name: command_name.clone(),
                        result,
                    });
                }
                Ok(result) => {
                    return Err(rollback(GraftError::Migration {
                        change_ref: change.git_ref.as_str().to_string(),
                        phase: MigrationPhase::Migrate,
                        command_name: command_name.clone(),
                        exit_code: result.exit_code,
                    }));
                }
                Err(e) => return Err(rollback(e)),
            }
        }
    }

    // --- Verifying ---
    let mut verifications = Vec::new();
    if !options.skip_verify {
        for change in &plan.changes {
            let Some(command_name) = &change.verify else {
                continue;
            };
            match run_step(dep_config.as_ref(), command_name, &dep_path, "verify") {
                Ok(result) if result.success => {
                    verifications.push(StepResult {
                        change_ref: change.git_ref.as_str().to_string(),
                        command_name: command_name.clone(),
                        result,
                    });
                }
                Ok(result) => {
                    return Err(rollback(GraftError::Migration {
                        change_ref: change.git_ref.as_str().to_string(),
                        phase: MigrationPhase::Verify,
                        command_name: command_name.clone(),
                        exit_code: result.exit_code,
                    }));
                }
                Err(e) => return Err(rollback(e)),
            }
        }
    }

    // --- Committing: the single commit point is the lock rename ---
    let entry = LockEntry::new(
        dep_spec.git_url.clone(),
        to_ref,
        to_commit,
        graft_core::utc_timestamp_now(),
    );

    let mut lock = existing_lock.unwrap_or_else(LockFile::new);
    lock.insert(dep_name.to_string(), entry.clone());

    if let Err(e) = write_lock_file(lock_path, &lock) {
        return Err(rollback(e));
    }

    snapshots.delete(&snapshot_id)?;

    Ok(UpgradeOutcome {
        plan,
        migrations,
        verifications,
        entry: Some(entry),
        dry_run: false,
    })
}

/// Changes between the consumed ref and the target, in declaration order.
///
/// The slice starts strictly after the consumed ref's declaration (or at
/// the first declaration when the consumed ref is unknown) and ends at
/// the target inclusive. An undeclared target yields an empty plan; a
/// target declared before the consumed ref (downgrade) does too.
fn plan_changes(
    dep_config: &GraftConfig,
    from_ref: Option<&GitRef>,
    to_ref: &GitRef,
) -> Vec<Change> {
    let declared: Vec<&Change> = dep_config.changes.values().collect();

    let Some(to_idx) = declared
        .iter()
        .position(|c| c.git_ref.as_str() == to_ref.as_str())
    else {
        return Vec::new();
    };

    let start = from_ref
        .and_then(|f| {
            declared
                .iter()
                .position(|c| c.git_ref.as_str() == f.as_str())
        })
        .map_or(0, |i| i + 1);

    if start > to_idx {
        return Vec::new();
    }

    declared[start..=to_idx].iter().map(|c| (*c).clone()).collect()
}

fn run_step(
    dep_config: Option<&GraftConfig>,
    command_name: &str,
    dep_path: &Path,
    role: &str,
) -> Result<CommandResult> {
    let command = dep_config
        .and_then(|cfg| cfg.get_command(command_name))
        .ok_or_else(|| {
            GraftError::CommandExecution(format!("command not found: {command_name}"))
        })?;
    execute_command_with(command, dep_path, &[], role, None)
}

/// Relative path of the lock file under `base_dir`, for snapshot bookkeeping.
fn lock_relative_path(lock_path: &Path, base_dir: &Path) -> String {
    lock_path
        .strip_prefix(base_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from("graft.lock"))
        .display()
        .to_string()
}
