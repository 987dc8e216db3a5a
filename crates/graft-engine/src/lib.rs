//! Graft engine: business logic, adapters, and services.
//!
//! This crate implements the service layer for graft: config parsing,
//! lock management, dependency resolution, atomic upgrades, queries, and
//! validation. All side effects flow through the adapters in
//! `graft-common`; the CLI and other front-ends call the operations
//! re-exported here and render their results.

pub mod command;
pub mod config;
pub mod lock;
pub mod management;
pub mod mutation;
pub mod query;
pub mod resolution;
pub mod snapshot;
pub mod upgrade;
pub mod validation;

pub use command::{execute_command, execute_command_by_name, CommandResult};
pub use config::{parse_graft_yaml, parse_graft_yaml_str};
pub use lock::{parse_lock_file, parse_lock_file_str, serialize_lock_file, write_lock_file};
pub use management::{
    add_dependency_to_config, remove_dependency, remove_dependency_from_config,
    remove_dependency_from_lock, remove_submodule, AddResult, RemoveResult,
};
pub use mutation::{apply_lock, ApplyResult};
pub use query::{
    list_changes, show_change, status, status_with_updates, ChangeDetails, ChangeFilter,
    ChangeListing, DependencyStatus,
};
pub use resolution::{
    fetch_all, fetch_dependency, resolve_all, resolve_and_write_lock, resolve_dependency,
    sync_all, sync_dependency, FetchResult, ResolutionResult, ResolutionStatus, ResolveOutcome,
    SyncAction, SyncResult,
};
pub use snapshot::{SnapshotManager, SnapshotManifest};
pub use upgrade::{
    reconcile_interrupted, upgrade_dependency, StepResult, UpgradeOptions, UpgradeOutcome,
    UpgradePhase, UpgradePlan,
};
pub use validation::{
    validate_config, validate_integrity, validate_lock, Finding, ModeReport, Severity,
    ValidationMode, ValidationReport,
};

/// Dependencies root, from `GRAFT_DEPS_DIR` or the `.graft` default.
#[must_use]
pub fn deps_directory() -> String {
    std::env::var("GRAFT_DEPS_DIR").unwrap_or_else(|_| ".graft".to_string())
}
