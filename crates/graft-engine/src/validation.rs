//! Validation service for graft configuration and state.
//!
//! Three orthogonal modes (config, lock, integrity), each producing a
//! full list of findings with no fail-fast. Warnings never change the
//! exit code; integrity mismatches exit 2, other errors 1.

use graft_common::git;
use graft_core::domain::{GraftConfig, LockFile};
use std::path::Path;

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Stable machine code for JSON output.
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    /// Actionable next step for the user.
    pub suggestion: Option<String>,
}

impl Finding {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            suggestion: None,
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
            suggestion: None,
        }
    }

    #[must_use]
    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// The validation mode a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Config,
    Lock,
    Integrity,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Lock => write!(f, "lock"),
            Self::Integrity => write!(f, "integrity"),
        }
    }
}

/// Findings for one mode.
#[derive(Debug, Clone)]
pub struct ModeReport {
    pub mode: ValidationMode,
    pub findings: Vec<Finding>,
}

impl ModeReport {
    pub fn passed(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| f.severity == Severity::Error)
    }
}

/// Accumulated findings across the requested modes.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub reports: Vec<ModeReport>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.reports.iter().all(ModeReport::passed)
    }

    /// 0 all pass; 2 when integrity errors exist; 1 for other errors.
    /// Warnings never change the exit code.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            return 0;
        }
        let integrity_failed = self
            .reports
            .iter()
            .any(|r| r.mode == ValidationMode::Integrity && !r.passed());
        if integrity_failed {
            2
        } else {
            1
        }
    }
}

/// Validate the configuration: schema invariants plus the business rule
/// that at least one dependency is declared.
pub fn validate_config(config: &GraftConfig) -> ModeReport {
    let mut findings = Vec::new();

    if config.dependencies.is_empty() {
        findings.push(
            Finding::error("no_dependencies", "no dependencies declared")
                .suggest("add a dependency under 'dependencies' in graft.yaml"),
        );
    }

    // Cross-field invariants are enforced at parse time; re-run them so a
    // hand-constructed config is reported rather than trusted.
    if let Err(e) = config.validate() {
        findings.push(Finding::error(e.code(), e.to_string()));
    }

    ModeReport {
        mode: ValidationMode::Config,
        findings,
    }
}

/// Validate the lock against the config: API version agreement, entry
/// membership, and source equality.
pub fn validate_lock(config: &GraftConfig, lock: &LockFile) -> ModeReport {
    let mut findings = Vec::new();

    if config.api_version != lock.api_version {
        findings.push(
            Finding::error(
                "api_version_mismatch",
                format!(
                    "lock apiVersion '{}' does not match config '{}'",
                    lock.api_version, config.api_version
                ),
            )
            .suggest("re-run 'graft resolve' to regenerate the lock"),
        );
    }

    for name in lock.dependency_names() {
        let entry = &lock.dependencies[name];
        match config.get_dependency(name) {
            None => {
                // Extra entries are tolerated: a dependency removed from
                // the config leaves a stale lock line behind.
                findings.push(
                    Finding::warning(
                        "extra_lock_entry",
                        format!("lock entry '{name}' has no matching dependency in graft.yaml"),
                    )
                    .suggest(format!("run 'graft remove {name}' or re-declare it")),
                );
            }
            Some(spec) => {
                if spec.git_url != entry.source {
                    findings.push(
                        Finding::error(
                            "source_mismatch",
                            format!(
                                "'{name}': lock source '{}' does not match config URL '{}'",
                                entry.source, spec.git_url
                            ),
                        )
                        .suggest("re-run 'graft resolve' after changing a dependency URL"),
                    );
                }
            }
        }
    }

    for name in config.dependency_names() {
        if lock.get(name).is_none() {
            findings.push(
                Finding::warning(
                    "unlocked_dependency",
                    format!("dependency '{name}' is declared but not locked"),
                )
                .suggest("run 'graft resolve'"),
            );
        }
    }

    ModeReport {
        mode: ValidationMode::Lock,
        findings,
    }
}

/// Validate working-tree integrity: every locked dependency exists, is a
/// git repository, and sits at its recorded commit.
pub fn validate_integrity(lock: &LockFile, base_dir: &Path, deps_directory: &str) -> ModeReport {
    let mut findings = Vec::new();

    for name in lock.dependency_names() {
        let entry = &lock.dependencies[name];
        let dep_path = base_dir.join(deps_directory).join(name);

        if !dep_path.exists() {
            findings.push(
                Finding::error(
                    "missing_dependency",
                    format!("'{name}' not found under {deps_directory}/"),
                )
                .suggest("run 'graft sync' to restore it"),
            );
            continue;
        }

        if !git::is_repository(&dep_path) {
            findings.push(
                Finding::error(
                    "not_a_repository",
                    format!("'{name}' exists but is not a git repository"),
                )
                .suggest(format!("delete {deps_directory}/{name} and re-run 'graft resolve'")),
            );
            continue;
        }

        match git::current_commit(&dep_path) {
            Ok(observed) if observed == entry.commit.as_str() => {}
            Ok(observed) => {
                findings.push(
                    Finding::error(
                        "integrity",
                        format!(
                            "{name}: expected {}… got {}…",
                            entry.commit.short(),
                            &observed[..7.min(observed.len())]
                        ),
                    )
                    .suggest("run 'graft sync' to restore the locked commit"),
                );
            }
            Err(e) => {
                findings.push(
                    Finding::error("integrity", format!("{name}: cannot read HEAD: {e}"))
                        .suggest("check the dependency checkout manually"),
                );
            }
        }
    }

    ModeReport {
        mode: ValidationMode::Integrity,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::domain::{CommitHash, DependencySpec, GitRef, GitUrl, LockEntry};

    fn spec(name: &str, url: &str) -> DependencySpec {
        DependencySpec::new(
            name,
            GitUrl::new(url).unwrap(),
            GitRef::new("main").unwrap(),
        )
        .unwrap()
    }

    fn entry(url: &str) -> LockEntry {
        LockEntry::new(
            GitUrl::new(url).unwrap(),
            GitRef::new("main").unwrap(),
            CommitHash::new("0123456789abcdef0123456789abcdef01234567").unwrap(),
            "2026-01-01T00:00:00Z",
        )
    }

    #[test]
    fn config_without_dependencies_fails() {
        let config = GraftConfig::new("graft/v0").unwrap();
        let report = validate_config(&config);

        assert!(!report.passed());
        assert_eq!(report.findings[0].code, "no_dependencies");
        assert!(report.findings[0].suggestion.is_some());
    }

    #[test]
    fn config_with_dependency_passes() {
        let mut config = GraftConfig::new("graft/v0").unwrap();
        config.dependencies.insert(
            "meta-kb".to_string(),
            spec("meta-kb", "https://github.com/org/meta-kb.git"),
        );

        assert!(validate_config(&config).passed());
    }

    #[test]
    fn lock_extra_entry_is_warning_not_error() {
        let mut config = GraftConfig::new("graft/v0").unwrap();
        config.dependencies.insert(
            "meta-kb".to_string(),
            spec("meta-kb", "https://github.com/org/meta-kb.git"),
        );

        let mut lock = LockFile::new();
        lock.insert("meta-kb".to_string(), entry("https://github.com/org/meta-kb.git"));
        lock.insert("stale".to_string(), entry("https://github.com/org/stale.git"));

        let report = validate_lock(&config, &lock);
        assert!(report.passed(), "extra entry must not fail validation");
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == "extra_lock_entry" && f.severity == Severity::Warning));
    }

    #[test]
    fn lock_source_mismatch_is_error() {
        let mut config = GraftConfig::new("graft/v0").unwrap();
        config.dependencies.insert(
            "meta-kb".to_string(),
            spec("meta-kb", "https://github.com/org/new-location.git"),
        );

        let mut lock = LockFile::new();
        lock.insert("meta-kb".to_string(), entry("https://github.com/org/meta-kb.git"));

        let report = validate_lock(&config, &lock);
        assert!(!report.passed());
        assert!(report.findings.iter().any(|f| f.code == "source_mismatch"));
    }

    #[test]
    fn lock_api_version_mismatch_is_error() {
        let config = GraftConfig::new("graft/v1").unwrap();
        let lock = LockFile::new();

        let report = validate_lock(&config, &lock);
        assert!(!report.passed());
        assert!(report
            .findings
            .iter()
            .any(|f| f.code == "api_version_mismatch"));
    }

    #[test]
    fn integrity_missing_dependency_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut lock = LockFile::new();
        lock.insert("ghost".to_string(), entry("https://github.com/org/ghost.git"));

        let report = validate_integrity(&lock, temp_dir.path(), ".graft");
        assert!(!report.passed());
        assert_eq!(report.findings[0].code, "missing_dependency");
    }

    #[test]
    fn integrity_non_repo_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".graft/not-repo")).unwrap();

        let mut lock = LockFile::new();
        lock.insert("not-repo".to_string(), entry("https://github.com/org/x.git"));

        let report = validate_integrity(&lock, temp_dir.path(), ".graft");
        assert!(!report.passed());
        assert_eq!(report.findings[0].code, "not_a_repository");
    }

    #[test]
    fn exit_codes_follow_contract() {
        let passing = ValidationReport {
            reports: vec![ModeReport {
                mode: ValidationMode::Config,
                findings: vec![Finding::warning("w", "just a warning")],
            }],
        };
        assert_eq!(passing.exit_code(), 0, "warnings never change the exit code");

        let config_failed = ValidationReport {
            reports: vec![ModeReport {
                mode: ValidationMode::Config,
                findings: vec![Finding::error("no_dependencies", "none")],
            }],
        };
        assert_eq!(config_failed.exit_code(), 1);

        let integrity_failed = ValidationReport {
            reports: vec![
                ModeReport {
                    mode: ValidationMode::Config,
                    findings: vec![Finding::error("no_dependencies", "none")],
                },
                ModeReport {
                    mode: ValidationMode::Integrity,
                    findings: vec![Finding::error("integrity", "mismatch")],
                },
            ],
        };
        assert_eq!(integrity_failed.exit_code(), 2);
    }
}
