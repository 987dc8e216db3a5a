//! Error types for Graft.

use thiserror::Error;

/// Phase of an upgrade in which a dependency-defined command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Migrate,
    Verify,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Migrate => write!(f, "migrate"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GraftError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: String, reason: String },

    #[error("config validation error in {path}, field '{field}': {reason}")]
    ConfigValidation {
        path: String,
        field: String,
        reason: String,
    },

    #[error("invalid git URL: {0}")]
    InvalidGitUrl(String),

    #[error("invalid git ref: {0}")]
    InvalidGitRef(String),

    #[error("invalid command name: {0}")]
    InvalidCommandName(String),

    #[error("invalid dependency name: {0}")]
    InvalidDependencyName(String),

    #[error("invalid commit hash: {0}")]
    InvalidCommitHash(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid lock entry: {0}")]
    InvalidLockEntry(String),

    #[error("unsupported API version: {0}")]
    UnsupportedApiVersion(String),

    #[error("lock file not found: {path}")]
    LockFileNotFound { path: String },

    #[error("lock file error in {path}: {reason}")]
    Lock { path: String, reason: String },

    #[error("git {op} failed: {stderr_tail}")]
    Git {
        op: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("resolution of '{name}' failed during {stage}: {reason}")]
    Resolution {
        name: String,
        stage: String,
        reason: String,
    },

    #[error(
        "{phase} command '{command_name}' for change '{change_ref}' exited with code {exit_code}"
    )]
    Migration {
        change_ref: String,
        phase: MigrationPhase,
        command_name: String,
        exit_code: i32,
    },

    #[error(
        "integrity mismatch for '{name}': expected {expected_commit}, observed {observed_commit}"
    )]
    Integrity {
        name: String,
        expected_commit: String,
        observed_commit: String,
    },

    #[error("{op} timed out after {elapsed_ms}ms")]
    Timeout { op: String, elapsed_ms: u64 },

    #[error("dependency not found: {name}")]
    DependencyNotFound { name: String },

    #[error("unknown ref: {git_ref}")]
    UnknownRef { git_ref: String },

    #[error("change not declared: {git_ref}")]
    ChangeNotFound { git_ref: String },

    #[error("working tree is dirty at {path}")]
    DirtyTree { path: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("command execution error: {0}")]
    CommandExecution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(String),
}

impl GraftError {
    /// Stable machine-readable code for JSON output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConfigFileNotFound { .. } => "config_file_not_found",
            Self::ConfigParse { .. } => "config_parse",
            Self::ConfigValidation { .. } => "config_validation",
            Self::InvalidGitUrl(_) => "invalid_git_url",
            Self::InvalidGitRef(_) => "invalid_git_ref",
            Self::InvalidCommandName(_) => "invalid_command_name",
            Self::InvalidDependencyName(_) => "invalid_dependency_name",
            Self::InvalidCommitHash(_) => "invalid_commit_hash",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::InvalidLockEntry(_) => "invalid_lock_entry",
            Self::UnsupportedApiVersion(_) => "unsupported_api_version",
            Self::LockFileNotFound { .. } => "lock_file_not_found",
            Self::Lock { .. } => "lock",
            Self::Git { .. } => "git",
            Self::Resolution { .. } => "resolution",
            Self::Migration { .. } => "migration",
            Self::Integrity { .. } => "integrity",
            Self::Timeout { .. } => "timeout",
            Self::DependencyNotFound { .. } => "dependency_not_found",
            Self::UnknownRef { .. } => "unknown_ref",
            Self::ChangeNotFound { .. } => "change_not_found",
            Self::DirtyTree { .. } => "dirty_tree",
            Self::Snapshot(_) => "snapshot",
            Self::CommandExecution(_) => "command_execution",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
        }
    }

    /// Actionable hint for the user, when one exists.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownRef { .. } => Some("did you forget 'graft fetch'?"),
            Self::ConfigFileNotFound { .. } => {
                Some("create a graft.yaml with an 'apiVersion: graft/v0' line")
            }
            Self::LockFileNotFound { .. } => Some("run 'graft resolve' to create the lock file"),
            Self::DependencyNotFound { .. } => {
                Some("declare the dependency in graft.yaml, then run 'graft resolve'")
            }
            Self::DirtyTree { .. } => {
                Some("commit or stash your changes, or pass --force to upgrade anyway")
            }
            Self::Integrity { .. } => Some("run 'graft sync' to restore the locked commit"),
            Self::ChangeNotFound { .. } => {
                Some("check the dependency's graft.yaml 'changes' section for declared refs")
            }
            _ => None,
        }
    }

    /// Process exit code: 2 for integrity mismatches, 1 for everything else.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Integrity { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = GraftError::UnknownRef {
            git_ref: "v9.9.9".to_string(),
        };
        assert_eq!(err.code(), "unknown_ref");
        assert!(err.hint().unwrap().contains("graft fetch"));
    }

    #[test]
    fn integrity_exits_with_two() {
        let err = GraftError::Integrity {
            name: "meta-kb".to_string(),
            expected_commit: "a".repeat(40),
            observed_commit: "b".repeat(40),
        };
        assert_eq!(err.exit_code(), 2);

        let err = GraftError::Validation("nope".to_string());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn migration_error_names_phase() {
        let err = GraftError::Migration {
            change_ref: "v2.0.0".to_string(),
            phase: MigrationPhase::Verify,
            command_name: "verify-v2".to_string(),
            exit_code: 3,
        };
        assert!(err.to_string().contains("verify"));
        assert!(err.to_string().contains("exited with code 3"));
    }
}
