//! End-to-end engine tests against real git repositories.
//!
//! Each test builds a dependency remote with tagged versions and a
//! consumer repository that grafts it, then drives resolve / apply /
//! sync / upgrade / validate through the public engine API.

use graft_core::error::{GraftError, MigrationPhase};
use graft_engine::{SnapshotManager, SyncAction, UpgradeOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Once;
use tempfile::TempDir;

static GIT_ENV: Once = Once::new();

/// Newer git blocks file-transport submodules by default; allow it for
/// the test fixtures via the injected-config environment variables.
fn allow_file_submodules() {
    GIT_ENV.call_once(|| {
        std::env::set_var("GIT_CONFIG_COUNT", "1");
        std::env::set_var("GIT_CONFIG_KEY_0", "protocol.file.allow");
        std::env::set_var("GIT_CONFIG_VALUE_0", "always");
    });
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn init_repo(path: &Path) {
    git(path, &["init", "-b", "main"]);
    git(path, &["config", "user.email", "test@example.com"]);
    git(path, &["config", "user.name", "Test User"]);
}

fn commit_all(path: &Path, message: &str) {
    git(path, &["add", "-A"]);
    git(path, &["commit", "-m", message]);
}

/// Build the dependency remote: four tagged versions with a growing
/// change log in its graft.yaml.
///
/// v1.0.0 - initial, no migrations
/// v2.0.0 - breaking, migration creates migrated-v2.txt, verify checks it
/// v3.0.0 - migration exits 7
/// v4.0.0 - migration succeeds, verify exits 3
fn build_dep_remote(root: &Path) -> PathBuf {
    let dep = root.join("dep-remote");
    fs::create_dir_all(&dep).unwrap();
    init_repo(&dep);

    fs::write(dep.join("content.md"), "version one\n").unwrap();
    fs::write(
        dep.join("graft.yaml"),
        r#"apiVersion: graft/v0
changes:
  v1.0.0:
    type: feature
    description: "Initial release"
"#,
    )
    .unwrap();
    commit_all(&dep, "v1");
    git(&dep, &["tag", "v1.0.0"]);

    fs::write(dep.join("content.md"), "version two\n").unwrap();
    fs::write(
        dep.join("graft.yaml"),
        r#"apiVersion: graft/v0
changes:
  v1.0.0:
    type: feature
    description: "Initial release"
  v2.0.0:
    type: breaking
    description: "Renamed the content schema"
    migration: migrate-v2
    verify: verify-v2
commands:
  migrate-v2:
    run: "touch migrated-v2.txt"
  verify-v2:
    run: "test -f migrated-v2.txt"
"#,
    )
    .unwrap();
    commit_all(&dep, "v2");
    git(&dep, &["tag", "v2.0.0"]);

    fs::write(dep.join("content.md"), "version three\n").unwrap();
    fs::write(
        dep.join("graft.yaml"),
        r#"apiVersion: graft/v0
changes:
  v1.0.0:
    type: feature
  v2.0.0:
    type: breaking
    migration: migrate-v2
    verify: verify-v2
  v3.0.0:
    type: breaking
    migration: bad-migrate
commands:
  migrate-v2:
    run: "touch migrated-v2.txt"
  verify-v2:
    run: "test -f migrated-v2.txt"
  bad-migrate:
    run: "exit 7"
"#,
    )
    .unwrap();
    commit_all(&dep, "v3");
    git(&dep, &["tag", "v3.0.0"]);

    fs::write(dep.join("content.md"), "version four\n").unwrap();
    fs::write(
        dep.join("graft.yaml"),
        r#"apiVersion: graft/v0
changes:
  v1.0.0:
    type: feature
  v2.0.0:
    type: breaking
    migration: migrate-v2
    verify: verify-v2
  v3.0.0:
    type: breaking
    migration: bad-migrate
  v4.0.0:
    type: feature
    migration: ok-migrate
    verify: bad-verify
commands:
  migrate-v2:
    run: "touch migrated-v2.txt"
  verify-v2:
    run: "test -f migrated-v2.txt"
  bad-migrate:
    run: "exit 7"
  ok-migrate:
    run: "true"
  bad-verify:
    run: "exit 3"
"#,
    )
    .unwrap();
    commit_all(&dep, "v4");
    git(&dep, &["tag", "v4.0.0"]);

    dep
}

struct Fixture {
    _temp: TempDir,
    consumer: PathBuf,
    dep_remote: PathBuf,
}

impl Fixture {
    /// Consumer repository grafting the dependency at `consumed_ref`,
    /// resolved and committed (so the working tree starts clean).
    fn resolved_at(consumed_ref: &str) -> Self {
        allow_file_submodules();

        let temp = TempDir::new().unwrap();
        let dep_remote = build_dep_remote(temp.path());

        let consumer = temp.path().join("consumer");
        fs::create_dir_all(&consumer).unwrap();
        init_repo(&consumer);
        fs::write(consumer.join("README.md"), "consumer\n").unwrap();
        fs::write(
            consumer.join("graft.yaml"),
            format!(
                "apiVersion: graft/v0\ndeps:\n  dep: \"{}#{consumed_ref}\"\n",
                dep_remote.display()
            ),
        )
        .unwrap();
        commit_all(&consumer, "initial");

        let config = graft_engine::parse_graft_yaml(consumer.join("graft.yaml")).unwrap();
        let outcome = graft_engine::resolve_and_write_lock(
            &config,
            consumer.join("graft.lock"),
            &consumer,
            ".graft",
        )
        .unwrap();
        assert!(outcome.lock.is_some(), "fixture resolve failed: {:?}", outcome.results);

        commit_all(&consumer, "add dependency");

        Self {
            _temp: temp,
            consumer,
            dep_remote,
        }
    }

    fn config(&self) -> graft_core::GraftConfig {
        graft_engine::parse_graft_yaml(self.consumer.join("graft.yaml")).unwrap()
    }

    fn lock_path(&self) -> PathBuf {
        self.consumer.join("graft.lock")
    }

    fn lock_bytes(&self) -> String {
        fs::read_to_string(self.lock_path()).unwrap()
    }

    fn dep_path(&self) -> PathBuf {
        self.consumer.join(".graft/dep")
    }

    fn dep_head(&self) -> String {
        git_stdout(&self.dep_path(), &["rev-parse", "HEAD"])
    }

    fn tag_commit(&self, tag: &str) -> String {
        git_stdout(&self.dep_remote, &["rev-parse", tag])
    }

    fn consumer_clean(&self) -> bool {
        git_stdout(&self.consumer, &["status", "--porcelain"]).is_empty()
    }

    fn upgrade(
        &self,
        to_ref: &str,
        options: &UpgradeOptions,
    ) -> graft_core::Result<graft_engine::UpgradeOutcome> {
        graft_engine::upgrade_dependency(
            &self.config(),
            self.lock_path(),
            "dep",
            to_ref,
            &self.consumer,
            ".graft",
            options,
        )
    }
}

#[test]
fn resolve_creates_submodule_and_lock() {
    let fx = Fixture::resolved_at("v1.0.0");

    // Submodule materialized at the declared ref
    assert!(fx.dep_path().join(".git").exists());
    assert!(fx.consumer.join(".gitmodules").exists());
    assert_eq!(fx.dep_head(), fx.tag_commit("v1.0.0"));

    // Lock entry records source, ref, and the resolved 40-hex commit
    let lock = graft_engine::parse_lock_file(fx.lock_path()).unwrap();
    let entry = lock.get("dep").unwrap();
    assert_eq!(entry.git_ref.as_str(), "v1.0.0");
    assert_eq!(entry.commit.as_str(), fx.tag_commit("v1.0.0"));

    // Integrity passes
    let report = graft_engine::validate_integrity(&lock, &fx.consumer, ".graft");
    assert!(report.passed());
}

#[test]
fn resolve_is_idempotent() {
    let fx = Fixture::resolved_at("v1.0.0");

    let outcome = graft_engine::resolve_and_write_lock(
        &fx.config(),
        fx.lock_path(),
        &fx.consumer,
        ".graft",
    )
    .unwrap();

    assert!(outcome.lock.is_some());
    assert_eq!(fx.dep_head(), fx.tag_commit("v1.0.0"));
}

#[test]
fn resolve_failure_leaves_lock_untouched() {
    let fx = Fixture::resolved_at("v1.0.0");
    let before = fx.lock_bytes();

    // Second dependency pointing nowhere
    fs::write(
        fx.consumer.join("graft.yaml"),
        format!(
            "apiVersion: graft/v0\ndeps:\n  dep: \"{}#v1.0.0\"\n  broken: \"{}/missing#main\"\n",
            fx.dep_remote.display(),
            fx.dep_remote.display()
        ),
    )
    .unwrap();

    let config = graft_engine::parse_graft_yaml(fx.consumer.join("graft.yaml")).unwrap();
    let outcome =
        graft_engine::resolve_and_write_lock(&config, fx.lock_path(), &fx.consumer, ".graft")
            .unwrap();

    assert!(outcome.lock.is_none());
    assert!(outcome.results.iter().any(|r| !r.is_success()));
    assert_eq!(fx.lock_bytes(), before, "failed resolve must not move the lock");
}

#[test]
fn resolve_reports_unknown_ref() {
    allow_file_submodules();

    let temp = TempDir::new().unwrap();
    let dep_remote = build_dep_remote(temp.path());

    let consumer = temp.path().join("consumer");
    fs::create_dir_all(&consumer).unwrap();
    init_repo(&consumer);
    fs::write(
        consumer.join("graft.yaml"),
        format!(
            "apiVersion: graft/v0\ndeps:\n  dep: \"{}#v99.9.9\"\n",
            dep_remote.display()
        ),
    )
    .unwrap();
    commit_all(&consumer, "initial");

    let config = graft_engine::parse_graft_yaml(consumer.join("graft.yaml")).unwrap();
    let outcome = graft_engine::resolve_and_write_lock(
        &config,
        consumer.join("graft.lock"),
        &consumer,
        ".graft",
    )
    .unwrap();

    assert!(outcome.lock.is_none());
    let failed = &outcome.results[0];
    assert!(!failed.is_success());
    assert!(failed.error.as_ref().unwrap().contains("v99.9.9"));
}

#[test]
fn integrity_detects_moved_head() {
    let fx = Fixture::resolved_at("v1.0.0");

    // Move the checkout behind the lock's back
    git(&fx.dep_path(), &["checkout", "--detach", "v2.0.0"]);

    let lock = graft_engine::parse_lock_file(fx.lock_path()).unwrap();
    let report = graft_engine::validate_integrity(&lock, &fx.consumer, ".graft");

    assert!(!report.passed());
    let finding = &report.findings[0];
    assert_eq!(finding.code, "integrity");
    assert!(finding.message.contains("dep: expected"));
    assert!(finding.message.contains("got"));

    let full = graft_engine::ValidationReport {
        reports: vec![report],
    };
    assert_eq!(full.exit_code(), 2);
}

#[test]
fn upgrade_runs_migrations_and_commits_lock() {
    let fx = Fixture::resolved_at("v1.0.0");

    let outcome = fx.upgrade("v2.0.0", &UpgradeOptions::default()).unwrap();

    assert!(!outcome.dry_run);
    assert_eq!(outcome.migrations.len(), 1);
    assert_eq!(outcome.migrations[0].command_name, "migrate-v2");
    assert_eq!(outcome.verifications.len(), 1);

    // Checkout moved, migration ran in the dependency directory
    assert_eq!(fx.dep_head(), fx.tag_commit("v2.0.0"));
    assert!(fx.dep_path().join("migrated-v2.txt").exists());

    // Lock committed
    let lock = graft_engine::parse_lock_file(fx.lock_path()).unwrap();
    let entry = lock.get("dep").unwrap();
    assert_eq!(entry.git_ref.as_str(), "v2.0.0");
    assert_eq!(entry.commit.as_str(), fx.tag_commit("v2.0.0"));

    // Snapshot cleaned up
    let snapshots = SnapshotManager::new(fx.consumer.join(".graft")).unwrap();
    assert!(snapshots.interrupted().unwrap().is_empty());
}

#[test]
fn upgrade_migration_failure_rolls_back() {
    let fx = Fixture::resolved_at("v2.0.0");
    let lock_before = fx.lock_bytes();
    let head_before = fx.dep_head();

    let err = fx.upgrade("v3.0.0", &UpgradeOptions::default()).unwrap_err();

    match err {
        GraftError::Migration {
            change_ref,
            phase,
            command_name,
            exit_code,
        } => {
            assert_eq!(change_ref, "v3.0.0");
            assert_eq!(phase, MigrationPhase::Migrate);
            assert_eq!(command_name, "bad-migrate");
            assert_eq!(exit_code, 7);
        }
        other => panic!("expected Migration error, got: {other:?}"),
    }

    assert_eq!(fx.lock_bytes(), lock_before, "lock must be untouched");
    assert_eq!(fx.dep_head(), head_before, "checkout must be reverted");
    assert!(fx.consumer_clean(), "consumer tree must be restored");
}

#[test]
fn upgrade_verify_failure_rolls_back() {
    let fx = Fixture::resolved_at("v3.0.0");
    let lock_before = fx.lock_bytes();
    let head_before = fx.dep_head();

    let err = fx.upgrade("v4.0.0", &UpgradeOptions::default()).unwrap_err();

    match err {
        GraftError::Migration {
            phase, exit_code, ..
        } => {
            assert_eq!(phase, MigrationPhase::Verify);
            assert_eq!(exit_code, 3);
        }
        other => panic!("expected Migration error, got: {other:?}"),
    }

    assert_eq!(fx.lock_bytes(), lock_before);
    assert_eq!(fx.dep_head(), head_before);
    assert!(fx.consumer_clean());
}

#[test]
fn upgrade_refuses_dirty_tree_without_force() {
    let fx = Fixture::resolved_at("v1.0.0");
    fs::write(fx.consumer.join("README.md"), "dirtied\n").unwrap();

    let err = fx.upgrade("v2.0.0", &UpgradeOptions::default()).unwrap_err();
    assert!(matches!(err, GraftError::DirtyTree { .. }));

    // Refused before the snapshot: nothing to reconcile
    let snapshots = SnapshotManager::new(fx.consumer.join(".graft")).unwrap();
    assert!(snapshots.interrupted().unwrap().is_empty());
    assert_eq!(fx.dep_head(), fx.tag_commit("v1.0.0"));
}

#[test]
fn upgrade_force_overrides_dirty_tree() {
    let fx = Fixture::resolved_at("v1.0.0");
    fs::write(fx.consumer.join("README.md"), "dirtied\n").unwrap();

    let options = UpgradeOptions {
        force: true,
        ..Default::default()
    };
    let outcome = fx.upgrade("v2.0.0", &options).unwrap();
    assert!(outcome.entry.is_some());
    assert_eq!(fx.dep_head(), fx.tag_commit("v2.0.0"));
}

#[test]
fn upgrade_dry_run_changes_nothing() {
    let fx = Fixture::resolved_at("v1.0.0");
    let lock_before = fx.lock_bytes();

    let options = UpgradeOptions {
        dry_run: true,
        ..Default::default()
    };
    let outcome = fx.upgrade("v2.0.0", &options).unwrap();

    assert!(outcome.dry_run);
    assert!(outcome.entry.is_none());

    // The plan names the pending change and target commit
    assert_eq!(outcome.plan.changes.len(), 1);
    assert_eq!(outcome.plan.changes[0].git_ref.as_str(), "v2.0.0");
    assert_eq!(outcome.plan.to_commit.as_str(), fx.tag_commit("v2.0.0"));

    // No lock write, no checkout change, no snapshot residue
    assert_eq!(fx.lock_bytes(), lock_before);
    assert_eq!(fx.dep_head(), fx.tag_commit("v1.0.0"));
    let snapshots = SnapshotManager::new(fx.consumer.join(".graft")).unwrap();
    assert!(snapshots.interrupted().unwrap().is_empty());
}

#[test]
fn upgrade_skip_flags() {
    let fx = Fixture::resolved_at("v1.0.0");

    // Skipping migration makes verify fail: the marker file never appears.
    let options = UpgradeOptions {
        skip_migration: true,
        ..Default::default()
    };
    let err = fx.upgrade("v2.0.0", &options).unwrap_err();
    match err {
        GraftError::Migration { phase, .. } => assert_eq!(phase, MigrationPhase::Verify),
        other => panic!("expected Migration error, got: {other:?}"),
    }

    // Skipping both goes through without running anything.
    let options = UpgradeOptions {
        skip_migration: true,
        skip_verify: true,
        ..Default::default()
    };
    let outcome = fx.upgrade("v2.0.0", &options).unwrap();
    assert!(outcome.migrations.is_empty());
    assert!(outcome.verifications.is_empty());
    assert!(outcome.entry.is_some());
}

#[test]
fn upgrade_unknown_ref_fails_cleanly() {
    let fx = Fixture::resolved_at("v1.0.0");
    let lock_before = fx.lock_bytes();

    let err = fx.upgrade("v99.9.9", &UpgradeOptions::default()).unwrap_err();
    assert!(matches!(err, GraftError::UnknownRef { .. }));
    assert_eq!(fx.lock_bytes(), lock_before);
}

#[test]
fn apply_then_sync_moves_checkout() {
    let fx = Fixture::resolved_at("v1.0.0");

    let result = graft_engine::apply_lock(
        &fx.config(),
        fx.lock_path(),
        "dep",
        "v2.0.0",
        &fx.consumer,
        ".graft",
    )
    .unwrap();

    // Lock moved, checkout untouched
    assert_eq!(result.entry.git_ref.as_str(), "v2.0.0");
    assert_eq!(result.entry.commit.as_str(), fx.tag_commit("v2.0.0"));
    assert_eq!(fx.dep_head(), fx.tag_commit("v1.0.0"));

    let lock = graft_engine::parse_lock_file(fx.lock_path()).unwrap();
    let sync = graft_engine::sync_dependency("dep", lock.get("dep").unwrap(), &fx.consumer, ".graft")
        .unwrap();
    assert_eq!(sync.action, SyncAction::CheckedOut);
    assert_eq!(fx.dep_head(), fx.tag_commit("v2.0.0"));

    // Second sync is a no-op
    let sync = graft_engine::sync_dependency("dep", lock.get("dep").unwrap(), &fx.consumer, ".graft")
        .unwrap();
    assert_eq!(sync.action, SyncAction::UpToDate);
    assert_eq!(fx.dep_head(), fx.tag_commit("v2.0.0"));
}

#[test]
fn fetch_updates_remote_refs() {
    let fx = Fixture::resolved_at("v1.0.0");

    // Advance the remote after the clone
    fs::write(fx.dep_remote.join("content.md"), "version five\n").unwrap();
    commit_all(&fx.dep_remote, "v5");
    git(&fx.dep_remote, &["tag", "v5.0.0"]);

    let result = graft_engine::fetch_dependency("dep", &fx.consumer, ".graft");
    assert!(result.success, "{:?}", result.error);

    // The new tag is now resolvable locally
    let resolved = git_stdout(&fx.dep_path(), &["rev-parse", "v5.0.0"]);
    assert_eq!(resolved, fx.tag_commit("v5.0.0"));
}

#[test]
fn changes_interval_filter_uses_first_parent_order() {
    let fx = Fixture::resolved_at("v4.0.0");

    let dep_config =
        graft_engine::parse_graft_yaml(fx.dep_path().join("graft.yaml")).unwrap();

    let filter = graft_engine::ChangeFilter {
        from: Some(graft_core::GitRef::new("v1.0.0").unwrap()),
        to: Some(graft_core::GitRef::new("v3.0.0").unwrap()),
        ..Default::default()
    };
    let listing = graft_engine::list_changes(&dep_config, &filter, Some(&fx.dep_path()));

    assert!(listing.note.is_none(), "note: {:?}", listing.note);
    let refs: Vec<&str> = listing
        .changes
        .iter()
        .map(|c| c.git_ref.as_str())
        .collect();
    assert_eq!(refs, vec!["v2.0.0", "v3.0.0"]);
}

#[test]
fn interrupted_upgrade_is_reconciled() {
    let fx = Fixture::resolved_at("v1.0.0");
    let lock_before = fx.lock_bytes();
    let head_before = fx.dep_head();

    // Simulate a crash: snapshot exists in-progress, lock was half-moved,
    // checkout was advanced.
    let snapshots = SnapshotManager::new(fx.consumer.join(".graft")).unwrap();
    snapshots
        .create("dep", Some(head_before.clone()), &["graft.lock"], &fx.consumer)
        .unwrap();
    fs::write(fx.lock_path(), "apiVersion: graft/v0\ndependencies: {}\n").unwrap();
    git(&fx.dep_path(), &["checkout", "--detach", "v2.0.0"]);

    let reconciled = graft_engine::reconcile_interrupted(&fx.consumer, ".graft").unwrap();
    assert_eq!(reconciled.len(), 1);

    assert_eq!(fx.lock_bytes(), lock_before, "lock restored from snapshot");
    assert_eq!(fx.dep_head(), head_before, "checkout restored");
    assert!(snapshots.interrupted().unwrap().is_empty());
}

#[test]
fn lock_validation_flags_source_drift() {
    let fx = Fixture::resolved_at("v1.0.0");

    // Repoint the dependency in config only
    fs::write(
        fx.consumer.join("graft.yaml"),
        "apiVersion: graft/v0\ndeps:\n  dep: \"https://example.com/elsewhere.git#v1.0.0\"\n",
    )
    .unwrap();

    let config = graft_engine::parse_graft_yaml(fx.consumer.join("graft.yaml")).unwrap();
    let lock = graft_engine::parse_lock_file(fx.lock_path()).unwrap();

    let report = graft_engine::validate_lock(&config, &lock);
    assert!(!report.passed());
    assert!(report.findings.iter().any(|f| f.code == "source_mismatch"));
}
