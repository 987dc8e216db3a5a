//! Domain types for Graft.
//!
//! Every type validates at construction; a value that exists is a value
//! that satisfies its invariants.

use crate::error::{GraftError, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A validated git reference (branch, tag, or commit SHA).
///
/// Enforces the syntactic subset of `git check-ref-format` that matters
/// for refs arriving from config, lock, or CLI input: no whitespace or
/// control characters, no `..`, no `@{`, no leading or doubled slashes,
/// no trailing `.lock` or `.`, and none of git's reserved metacharacters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitRef(String);

impl GitRef {
    pub fn new(ref_str: impl Into<String>) -> Result<Self> {
        let ref_str = ref_str.into();
        if ref_str.is_empty() {
            return Err(GraftError::InvalidGitRef(
                "git ref cannot be empty".to_string(),
            ));
        }
        if ref_str.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot contain whitespace or control characters"
            )));
        }
        if ref_str.contains("..") {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot contain '..'"
            )));
        }
        if ref_str.contains("@{") {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot contain '@{{'"
            )));
        }
        if ref_str.starts_with('/') || ref_str.ends_with('/') {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot start or end with '/'"
            )));
        }
        if ref_str.contains("//") {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot contain '//'"
            )));
        }
        if ref_str.ends_with(".lock") || ref_str.ends_with('.') {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' cannot end with '.lock' or '.'"
            )));
        }
        if ref_str
            .chars()
            .any(|c| matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
        {
            return Err(GraftError::InvalidGitRef(format!(
                "git ref '{ref_str}' contains a character reserved by git"
            )));
        }
        Ok(Self(ref_str))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GitRef {
    type Error = GraftError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<GitRef> for String {
    fn from(git_ref: GitRef) -> Self {
        git_ref.0
    }
}

impl std::fmt::Display for GitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated git repository URL.
/// Supports ssh://, https://, http://, file://, and SCP-style URLs (git@host:path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitUrl(String);

impl GitUrl {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.is_empty() {
            return Err(GraftError::InvalidGitUrl(
                "git URL cannot be empty".to_string(),
            ));
        }

        let normalized = Self::normalize_git_url(&url);

        if let Some(scheme_end) = normalized.find("://") {
            let scheme = &normalized[..scheme_end];
            if !matches!(scheme, "ssh" | "https" | "http" | "file" | "git") {
                return Err(GraftError::InvalidGitUrl(format!(
                    "invalid URL scheme: {scheme}. Supported: ssh, https, http, file, git"
                )));
            }
        }

        Ok(Self(normalized))
    }

    /// Normalize git URL to a format that git understands.
    /// Handles SCP-style URLs (git@host:path) and mixed format (ssh://git@host:path).
    fn normalize_git_url(url: &str) -> String {
        // SCP-style pattern: user@host:path (no scheme)
        let scp_pattern = Regex::new(r"^([^@]+)@([^:]+):(.+)$").unwrap();

        if !url.contains("://") {
            if let Some(captures) = scp_pattern.captures(url) {
                let user = &captures[1];
                let host = &captures[2];
                let path = &captures[3];
                // A path starting with "//" would be a URL with a port, not SCP syntax
                if !path.starts_with("//") {
                    return format!("ssh://{user}@{host}/{path}");
                }
            }
        }

        // Mixed format: ssh://user@host:path (scheme with colon-separated path)
        let mixed_pattern = Regex::new(r"^(ssh|git)://([^@]+)@([^:/]+):(.+)$").unwrap();
        if let Some(captures) = mixed_pattern.captures(url) {
            let scheme = &captures[1];
            let user = &captures[2];
            let host = &captures[3];
            let path = &captures[4];
            if !path.starts_with("//") && !path.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                return format!("{scheme}://{user}@{host}/{path}");
            }
        }

        url.to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for GitUrl {
    type Error = GraftError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<GitUrl> for String {
    fn from(url: GitUrl) -> Self {
        url.0
    }
}

impl std::fmt::Display for GitUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated git commit hash (40-character lowercase SHA-1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();

        if hash.len() != 40 {
            return Err(GraftError::InvalidCommitHash(format!(
                "commit hash must be 40 characters, got {}",
                hash.len()
            )));
        }

        if !hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(GraftError::InvalidCommitHash(
                "commit hash must be lowercase hexadecimal (0-9, a-f)".to_string(),
            ));
        }

        Ok(Self(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl TryFrom<String> for CommitHash {
    type Error = GraftError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CommitHash> for String {
    fn from(hash: CommitHash) -> Self {
        hash.0
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dependency specification from graft.yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub git_url: GitUrl,
    pub git_ref: GitRef,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>, git_url: GitUrl, git_ref: GitRef) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(GraftError::InvalidDependencyName(
                "dependency name cannot be empty".to_string(),
            ));
        }
        if name.len() > 100 {
            return Err(GraftError::InvalidDependencyName(format!(
                "dependency name too long: {} chars",
                name.len()
            )));
        }
        let name_pattern = Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap();
        if !name_pattern.is_match(&name) {
            return Err(GraftError::InvalidDependencyName(format!(
                "invalid dependency name: {name}. Must start with a letter and contain only letters, digits, '-', '_'."
            )));
        }

        Ok(Self {
            name,
            git_url,
            git_ref,
        })
    }
}

/// Kind of a declared change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Breaking,
    Feature,
    Fix,
    Refactor,
    Docs,
}

impl std::str::FromStr for ChangeType {
    type Err = GraftError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "breaking" => Ok(Self::Breaking),
            "feature" => Ok(Self::Feature),
            "fix" => Ok(Self::Fix),
            "refactor" => Ok(Self::Refactor),
            "docs" => Ok(Self::Docs),
            other => Err(GraftError::Validation(format!(
                "invalid change type: {other}. Must be one of: breaking, feature, fix, refactor, docs"
            ))),
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Breaking => "breaking",
            Self::Feature => "feature",
            Self::Fix => "fix",
            Self::Refactor => "refactor",
            Self::Docs => "docs",
        };
        write!(f, "{s}")
    }
}

/// A semantic change in a dependency, identified by a git ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub git_ref: GitRef,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_yaml::Value>,
}

impl Change {
    pub fn new(git_ref: impl Into<String>) -> Result<Self> {
        Ok(Self {
            git_ref: GitRef::new(git_ref)?,
            change_type: None,
            description: None,
            migration: None,
            verify: None,
            metadata: HashMap::new(),
        })
    }

    #[must_use]
    pub fn with_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = Some(change_type);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_migration(mut self, migration: impl Into<String>) -> Self {
        self.migration = Some(migration.into());
        self
    }

    #[must_use]
    pub fn with_verify(mut self, verify: impl Into<String>) -> Self {
        self.verify = Some(verify.into());
        self
    }

    pub fn needs_migration(&self) -> bool {
        self.migration.is_some()
    }

    pub fn needs_verification(&self) -> bool {
        self.verify.is_some()
    }

    pub fn is_breaking(&self) -> bool {
        self.change_type == Some(ChangeType::Breaking)
    }

    fn validate(&self) -> Result<()> {
        if let Some(desc) = &self.description {
            if desc.len() > 200 {
                return Err(GraftError::Validation(format!(
                    "change description too long: {} chars (max 200)",
                    desc.len()
                )));
            }
        }

        if let Some(migration) = &self.migration {
            if migration.trim().is_empty() {
                return Err(GraftError::Validation(
                    "migration command name cannot be only whitespace".to_string(),
                ));
            }
        }

        if let Some(verify) = &self.verify {
            if verify.trim().is_empty() {
                return Err(GraftError::Validation(
                    "verify command name cannot be only whitespace".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// An executable command defined in a graft.yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(skip)]
    pub name: String,
    pub run: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

impl Command {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let run = run.into();

        if name.trim().is_empty() {
            return Err(GraftError::InvalidCommandName(
                "command name cannot be empty".to_string(),
            ));
        }
        if name.len() > 100 {
            return Err(GraftError::InvalidCommandName(format!(
                "command name too long: {} chars (max 100)",
                name.len()
            )));
        }
        if name.contains(':') {
            return Err(GraftError::InvalidCommandName(format!(
                "command name '{name}' cannot contain ':' (reserved separator). Use '{}' instead.",
                name.replace(':', "-")
            )));
        }

        if run.trim().is_empty() {
            return Err(GraftError::Validation(format!(
                "command '{name}': 'run' field is required and cannot be empty"
            )));
        }

        Ok(Self {
            name,
            run,
            description: None,
            working_dir: None,
            env: None,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn has_env_vars(&self) -> bool {
        self.env.as_ref().is_some_and(|e| !e.is_empty())
    }

    fn validate(&self) -> Result<()> {
        if let Some(desc) = &self.description {
            if desc.len() > 500 {
                return Err(GraftError::Validation(format!(
                    "command '{}': description too long: {} chars (max 500)",
                    self.name,
                    desc.len()
                )));
            }
        }

        if let Some(working_dir) = &self.working_dir {
            if working_dir.trim().is_empty() {
                return Err(GraftError::Validation(format!(
                    "command '{}': working_dir cannot be only whitespace",
                    self.name
                )));
            }
            if working_dir.starts_with('/')
                || (working_dir.len() > 1 && working_dir.chars().nth(1) == Some(':'))
            {
                return Err(GraftError::Validation(format!(
                    "command '{}': working_dir must be relative, not absolute",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Optional metadata section from graft.yaml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

/// Complete graft.yaml configuration.
///
/// Changes and commands keep their declaration order; an upgrade executes
/// migrations in exactly the order the dependency declared them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraftConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, DependencySpec>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub changes: IndexMap<String, Change>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub commands: IndexMap<String, Command>,
}

impl GraftConfig {
    pub fn new(api_version: impl Into<String>) -> Result<Self> {
        let api_version = api_version.into();

        if api_version.is_empty() {
            return Err(GraftError::Validation(
                "API version cannot be empty".to_string(),
            ));
        }
        if !api_version.starts_with("graft/") {
            return Err(GraftError::Validation(format!(
                "invalid API version: {api_version}. Must start with 'graft/'"
            )));
        }

        Ok(Self {
            api_version,
            metadata: None,
            dependencies: IndexMap::new(),
            changes: IndexMap::new(),
            commands: IndexMap::new(),
        })
    }

    /// Validate cross-field constraints (e.g., migration commands must exist).
    pub fn validate(&self) -> Result<()> {
        for (ref_name, change) in &self.changes {
            change.validate()?;

            if let Some(migration) = &change.migration {
                if !self.commands.contains_key(migration) {
                    return Err(GraftError::ConfigValidation {
                        path: "graft.yaml".to_string(),
                        field: format!("changes.{ref_name}.migration"),
                        reason: format!(
                            "migration command '{migration}' not found in commands section"
                        ),
                    });
                }
            }

            if let Some(verify) = &change.verify {
                if !self.commands.contains_key(verify) {
                    return Err(GraftError::ConfigValidation {
                        path: "graft.yaml".to_string(),
                        field: format!("changes.{ref_name}.verify"),
                        reason: format!("verify command '{verify}' not found in commands section"),
                    });
                }
            }
        }

        for command in self.commands.values() {
            command.validate()?;
        }

        Ok(())
    }

    /// Dependency names in alphabetical order, the canonical processing order.
    pub fn dependency_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn get_dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.get(name)
    }

    pub fn get_change(&self, ref_name: &str) -> Option<&Change> {
        self.changes.get(ref_name)
    }

    pub fn get_command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn breaking_changes(&self) -> Vec<&Change> {
        self.changes.values().filter(|c| c.is_breaking()).collect()
    }
}

/// A lock file entry tracking consumed dependency state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Git URL or path to dependency repository
    pub source: GitUrl,
    /// Consumed git ref (tag, branch, or commit)
    #[serde(rename = "ref")]
    pub git_ref: GitRef,
    /// Full commit hash (40-char SHA-1)
    pub commit: CommitHash,
    /// RFC-3339 UTC timestamp when the version was consumed
    pub consumed_at: String,
}

impl LockEntry {
    #[must_use]
    pub fn new(
        source: GitUrl,
        git_ref: GitRef,
        commit: CommitHash,
        consumed_at: impl Into<String>,
    ) -> Self {
        Self {
            source,
            git_ref,
            commit,
            consumed_at: consumed_at.into(),
        }
    }

    /// Validate that `consumed_at` parses as RFC-3339.
    pub fn validate(&self) -> Result<()> {
        chrono::DateTime::parse_from_rfc3339(&self.consumed_at).map_err(|e| {
            GraftError::InvalidTimestamp(format!(
                "consumed_at '{}' is not RFC-3339: {e}",
                self.consumed_at
            ))
        })?;
        Ok(())
    }
}

/// The graft.lock file structure.
///
/// Tracks exact state of consumed direct dependencies for reproducibility.
/// Two lock files that differ only in entry order compare equal; the
/// writer always emits entries alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockFile {
    /// API version (e.g., "graft/v0")
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Map of dependency name to lock entry
    #[serde(default)]
    pub dependencies: IndexMap<String, LockEntry>,
}

impl LockFile {
    pub const SUPPORTED_API_VERSION: &'static str = "graft/v0";

    #[must_use]
    pub fn new() -> Self {
        Self {
            api_version: Self::SUPPORTED_API_VERSION.to_string(),
            dependencies: IndexMap::new(),
        }
    }

    /// Validate the lock file structure.
    pub fn validate(&self) -> Result<()> {
        if self.api_version != Self::SUPPORTED_API_VERSION {
            return Err(GraftError::UnsupportedApiVersion(self.api_version.clone()));
        }

        for (name, entry) in &self.dependencies {
            entry
                .validate()
                .map_err(|e| GraftError::InvalidLockEntry(format!("dependency '{name}': {e}")))?;
        }

        Ok(())
    }

    /// Get a lock entry by dependency name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LockEntry> {
        self.dependencies.get(name)
    }

    /// Insert or update a lock entry.
    pub fn insert(&mut self, name: String, entry: LockEntry) {
        self.dependencies.insert(name, entry);
    }

    /// Remove a lock entry by name.
    pub fn remove(&mut self, name: &str) -> Option<LockEntry> {
        self.dependencies.shift_remove(name)
    }

    /// Entry names in alphabetical order.
    pub fn dependency_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dependencies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for LockFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as an RFC-3339 UTC timestamp with second precision, the
/// format written to `consumed_at`.
#[must_use]
pub fn utc_timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
