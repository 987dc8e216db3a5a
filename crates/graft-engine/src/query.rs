//! Query service: pure functions over (config, lock).
//!
//! Status, change listing, and change lookup. Only the optional
//! `--check-updates` and `--from`/`--to` paths touch git; everything else
//! reads the two documents.

use graft_common::git;
use graft_core::domain::{Change, ChangeType, Command, CommitHash, GitRef, GraftConfig, LockFile};
use graft_core::error::{GraftError, Result};
use std::path::Path;

/// Status of a single consumed dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub name: String,
    pub source: String,
    pub consumed_ref: String,
    pub consumed_commit: CommitHash,
    pub consumed_at: String,
    /// Remote tip for the consumed ref, filled by `--check-updates`.
    pub latest_commit: Option<CommitHash>,
}

/// Status records for every locked dependency, in alphabetical order.
pub fn status(lock: &LockFile) -> Vec<DependencyStatus> {
    lock.dependency_names()
        .into_iter()
        .map(|name| {
            let entry = &lock.dependencies[name];
            DependencyStatus {
                name: name.to_string(),
                source: entry.source.as_str().to_string(),
                consumed_ref: entry.git_ref.as_str().to_string(),
                consumed_commit: entry.commit.clone(),
                consumed_at: entry.consumed_at.clone(),
                latest_commit: None,
            }
        })
        .collect()
}

/// Status with `latest_commit` resolved from each dependency's remote
/// tracking refs. Assumes a fetch has been performed; resolution failures
/// leave the field empty rather than failing the query.
pub fn status_with_updates(
    lock: &LockFile,
    base_dir: &Path,
    deps_directory: &str,
) -> Vec<DependencyStatus> {
    let mut statuses = status(lock);

    for item in &mut statuses {
        let dep_path = base_dir.join(deps_directory).join(&item.name);
        if !dep_path.exists() {
            continue;
        }
        item.latest_commit = git::resolve_ref(&dep_path, &item.consumed_ref)
            .ok()
            .and_then(|c| CommitHash::new(c).ok());
    }

    statuses
}

/// Filters for a change listing.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    pub change_type: Option<ChangeType>,
    pub breaking_only: bool,
    /// Exclusive lower bound, by first-parent commit order.
    pub from: Option<GitRef>,
    /// Inclusive upper bound; defaults to the checkout's HEAD.
    pub to: Option<GitRef>,
}

/// A change listing, with a note when a requested filter could not be applied.
#[derive(Debug, Clone)]
pub struct ChangeListing {
    pub changes: Vec<Change>,
    pub note: Option<String>,
}

/// List a dependency's declared changes, in declaration order.
///
/// `--from`/`--to` select changes whose refs lie in the half-open
/// interval `(from, to]` of the first-parent walk from the target commit.
/// When the dependency's refs cannot be ordered (no checkout, unknown
/// refs), the declared list is returned unfiltered with a note.
pub fn list_changes(
    dep_config: &GraftConfig,
    filter: &ChangeFilter,
    dep_path: Option<&Path>,
) -> ChangeListing {
    let mut changes: Vec<Change> = dep_config.changes.values().cloned().collect();
    let mut note = None;

    if let Some(change_type) = filter.change_type {
        changes.retain(|c| c.change_type == Some(change_type));
    }
    if filter.breaking_only {
        changes.retain(Change::is_breaking);
    }

    if filter.from.is_some() || filter.to.is_some() {
        match interval_filter(&changes, filter, dep_path) {
            Ok(filtered) => changes = filtered,
            Err(reason) => {
                note = Some(format!(
                    "--from/--to not applied: {reason}; returning the declared list"
                ));
            }
        }
    }

    ChangeListing { changes, note }
}

/// Apply the `(from, to]` first-parent interval. Any failure to order the
/// refs is reported as a string reason so the caller can fall back.
fn interval_filter(
    changes: &[Change],
    filter: &ChangeFilter,
    dep_path: Option<&Path>,
) -> std::result::Result<Vec<Change>, String> {
    let dep_path = dep_path.ok_or_else(|| "dependency checkout unavailable".to_string())?;
    if !git::is_repository(dep_path) {
        return Err(format!("{} is not a git repository", dep_path.display()));
    }

    let to_commit = match &filter.to {
        Some(to) => git::resolve_ref(dep_path, to.as_str())
            .map_err(|_| format!("cannot resolve --to ref '{to}'"))?,
        None => git::current_commit(dep_path).map_err(|e| e.to_string())?,
    };

    let log = git::first_parent_log(dep_path, &to_commit).map_err(|e| e.to_string())?;
    let position = |commit: &str| log.iter().position(|c| c == commit);

    // The lower bound is exclusive: changes at or before `from` drop out.
    let from_index = match &filter.from {
        Some(from) => {
            let from_commit = git::resolve_ref(dep_path, from.as_str())
                .map_err(|_| format!("cannot resolve --from ref '{from}'"))?;
            Some(position(&from_commit).ok_or_else(|| {
                format!("--from ref '{from}' is not in the first-parent history of the target")
            })?)
        }
        None => None,
    };

    let mut filtered = Vec::new();
    for change in changes {
        let Ok(commit) = git::resolve_ref(dep_path, change.git_ref.as_str()) else {
            // Undeclared-in-git refs cannot be ordered at all.
            return Err(format!(
                "change ref '{}' does not resolve in the dependency",
                change.git_ref
            ));
        };
        let Some(index) = position(&commit) else {
            continue; // off the first-parent line: outside the interval
        };
        let after_from = from_index.is_none_or(|f| index < f);
        if after_from {
            filtered.push(change.clone());
        }
    }

    Ok(filtered)
}

/// A change plus its resolved migration and verification commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetails {
    pub change: Change,
    pub migration_command: Option<Command>,
    pub verify_command: Option<Command>,
}

/// Look up a declared change and resolve its commands.
///
/// Command existence is guaranteed by config validation, so a declared
/// change always resolves fully.
pub fn show_change(dep_config: &GraftConfig, ref_name: &str) -> Result<ChangeDetails> {
    let change = dep_config
        .get_change(ref_name)
        .cloned()
        .ok_or_else(|| GraftError::ChangeNotFound {
            git_ref: ref_name.to_string(),
        })?;

    let migration_command = change
        .migration
        .as_ref()
        .and_then(|name| dep_config.get_command(name).cloned());

    let verify_command = change
        .verify
        .as_ref()
        .and_then(|name| dep_config.get_command(name).cloned());

    Ok(ChangeDetails {
        change,
        migration_command,
        verify_command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::domain::{GitUrl, LockEntry};

    fn lock_with(names: &[&str]) -> LockFile {
        let mut lock = LockFile::new();
        for (i, name) in names.iter().enumerate() {
            lock.insert(
                (*name).to_string(),
                LockEntry::new(
                    GitUrl::new(format!("https://github.com/org/{name}.git")).unwrap(),
                    GitRef::new("main").unwrap(),
                    CommitHash::new(
                        char::from(b'a' + u8::try_from(i).unwrap())
                            .to_string()
                            .repeat(40),
                    )
                    .unwrap(),
                    "2026-01-01T10:30:00Z",
                ),
            );
        }
        lock
    }

    fn config_with_changes() -> GraftConfig {
        let mut config = GraftConfig::new("graft/v0").unwrap();

        config.changes.insert(
            "v1.0.0".to_string(),
            Change::new("v1.0.0")
                .unwrap()
                .with_type(ChangeType::Feature)
                .with_description("Initial release"),
        );
        config.changes.insert(
            "v2.0.0".to_string(),
            Change::new("v2.0.0")
                .unwrap()
                .with_type(ChangeType::Breaking)
                .with_description("Breaking API change")
                .with_migration("migrate-v2")
                .with_verify("verify-v2"),
        );
        config.changes.insert(
            "v2.1.0".to_string(),
            Change::new("v2.1.0").unwrap().with_type(ChangeType::Fix),
        );

        config.commands.insert(
            "migrate-v2".to_string(),
            Command::new("migrate-v2", "sh migrate.sh").unwrap(),
        );
        config.commands.insert(
            "verify-v2".to_string(),
            Command::new("verify-v2", "sh verify.sh").unwrap(),
        );

        config
    }

    #[test]
    fn status_is_alphabetical() {
        let lock = lock_with(&["meta-kb", "coding-standards", "api-docs"]);
        let statuses = status(&lock);

        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api-docs", "coding-standards", "meta-kb"]);
        assert!(statuses.iter().all(|s| s.latest_commit.is_none()));
    }

    #[test]
    fn status_carries_lock_fields() {
        let lock = lock_with(&["meta-kb"]);
        let statuses = status(&lock);

        assert_eq!(statuses.len(), 1);
        let s = &statuses[0];
        assert_eq!(s.source, "https://github.com/org/meta-kb.git");
        assert_eq!(s.consumed_ref, "main");
        assert_eq!(s.consumed_at, "2026-01-01T10:30:00Z");
    }

    #[test]
    fn list_changes_returns_declaration_order() {
        let config = config_with_changes();
        let listing = list_changes(&config, &ChangeFilter::default(), None);

        let refs: Vec<&str> = listing
            .changes
            .iter()
            .map(|c| c.git_ref.as_str())
            .collect();
        assert_eq!(refs, vec!["v1.0.0", "v2.0.0", "v2.1.0"]);
        assert!(listing.note.is_none());
    }

    #[test]
    fn list_changes_filters_by_type() {
        let config = config_with_changes();
        let filter = ChangeFilter {
            change_type: Some(ChangeType::Feature),
            ..Default::default()
        };
        let listing = list_changes(&config, &filter, None);

        assert_eq!(listing.changes.len(), 1);
        assert_eq!(listing.changes[0].git_ref.as_str(), "v1.0.0");
    }

    #[test]
    fn list_changes_filters_breaking() {
        let config = config_with_changes();
        let filter = ChangeFilter {
            breaking_only: true,
            ..Default::default()
        };
        let listing = list_changes(&config, &filter, None);

        assert_eq!(listing.changes.len(), 1);
        assert_eq!(listing.changes[0].git_ref.as_str(), "v2.0.0");
        assert!(listing.changes[0].is_breaking());
    }

    #[test]
    fn list_changes_notes_unorderable_interval() {
        let config = config_with_changes();
        let filter = ChangeFilter {
            from: Some(GitRef::new("v1.0.0").unwrap()),
            ..Default::default()
        };

        // No checkout to order refs against: fall back, note the limitation.
        let listing = list_changes(&config, &filter, None);
        assert_eq!(listing.changes.len(), 3);
        assert!(listing.note.unwrap().contains("--from/--to not applied"));
    }

    #[test]
    fn show_change_resolves_commands() {
        let config = config_with_changes();
        let details = show_change(&config, "v2.0.0").unwrap();

        assert_eq!(details.change.git_ref.as_str(), "v2.0.0");
        let migration = details.migration_command.unwrap();
        assert_eq!(migration.name, "migrate-v2");
        assert_eq!(migration.run, "sh migrate.sh");
        assert_eq!(details.verify_command.unwrap().name, "verify-v2");
    }

    #[test]
    fn show_change_without_commands() {
        let config = config_with_changes();
        let details = show_change(&config, "v1.0.0").unwrap();
        assert!(details.migration_command.is_none());
        assert!(details.verify_command.is_none());
    }

    #[test]
    fn show_change_errors_on_undeclared_ref() {
        let config = config_with_changes();
        let result = show_change(&config, "v99.0.0");
        assert!(matches!(result, Err(GraftError::ChangeNotFound { .. })));
    }
}
