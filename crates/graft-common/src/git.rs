//! Git adapter: a narrow interface around the local git binary.
//!
//! Every operation shells out through the unified process contract with a
//! bounded timeout. Status queries default to 5 seconds (override with
//! `GRAFT_GIT_TIMEOUT_MS`); network operations get a longer allowance.
//! Non-zero exits surface as structured errors carrying the operation,
//! exit code, and a stderr tail.

use crate::process::{run_to_completion, CompletedProcess, ProcessConfig, ProcessError};
use std::path::Path;
use std::time::Duration;

const DEFAULT_GIT_TIMEOUT_MS: u64 = 5_000;
const NETWORK_TIMEOUT_SECS: u64 = 300;

/// Error type for git operations.
#[derive(thiserror::Error, Debug)]
pub enum GitError {
    #[error("git {op} failed: {stderr_tail}")]
    CommandFailed {
        op: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("git {op} timed out after {elapsed_ms}ms")]
    Timeout { op: String, elapsed_ms: u64 },

    #[error("process execution error: {0}")]
    Process(ProcessError),
}

impl GitError {
    /// Last few stderr lines, enough to diagnose without flooding output.
    fn tail(stderr: &str) -> String {
        let lines: Vec<&str> = stderr.lines().collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join("\n")
    }
}

/// Timeout for git status queries, from `GRAFT_GIT_TIMEOUT_MS` or the
/// 5-second default.
#[must_use]
pub fn git_timeout() -> Duration {
    let ms = std::env::var("GRAFT_GIT_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_GIT_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Run a git command in `repo` with the status-query timeout.
fn run_git(repo: &Path, op: &str, command: String) -> Result<CompletedProcess, GitError> {
    run_git_with_timeout(repo, op, command, git_timeout())
}

fn run_git_with_timeout(
    repo: &Path,
    op: &str,
    command: String,
    timeout: Duration,
) -> Result<CompletedProcess, GitError> {
    log::trace!("git::{op}: {command} (in {})", repo.display());
    let config = ProcessConfig::new(command, repo).with_timeout(timeout);
    match run_to_completion(&config) {
        Ok(output) => Ok(output),
        Err(ProcessError::Timeout { elapsed_ms, .. }) => Err(GitError::Timeout {
            op: op.to_string(),
            elapsed_ms,
        }),
        Err(e) => Err(GitError::Process(e)),
    }
}

/// Convert a non-zero exit into a structured failure.
fn expect_success(op: &str, output: CompletedProcess) -> Result<CompletedProcess, GitError> {
    if output.success {
        Ok(output)
    } else {
        Err(GitError::CommandFailed {
            op: op.to_string(),
            exit_code: Some(output.exit_code),
            stderr_tail: GitError::tail(&output.stderr),
        })
    }
}

/// Check if a path is a git repository.
///
/// A `.git` directory or file (for submodules and worktrees) counts.
pub fn is_repository(path: impl AsRef<Path>) -> bool {
    path.as_ref().join(".git").exists()
}

/// Check whether `name` is a registered submodule of the repository at `path`.
pub fn is_submodule(path: impl AsRef<Path>, name: &str) -> Result<bool, GitError> {
    let path = path.as_ref();
    let output = run_git(
        path,
        "submodule status",
        format!("git submodule status -- '{name}'"),
    )?;
    Ok(output.success && !output.stdout.trim().is_empty())
}

/// Add a submodule at `<path>/<name>` pointing to `url`, optionally
/// checked out at `git_ref`. Already-registered submodules are not an
/// error; the call degrades to an update.
pub fn add_submodule(
    path: impl AsRef<Path>,
    url: &str,
    name: &str,
    git_ref: Option<&str>,
) -> Result<(), GitError> {
    let path = path.as_ref();

    if is_submodule(path, name)? {
        update_submodule(path, name)?;
    } else {
        let output = run_git_with_timeout(
            path,
            "submodule add",
            format!("git submodule add '{url}' '{name}'"),
            Duration::from_secs(NETWORK_TIMEOUT_SECS),
        )?;
        expect_success("submodule add", output)?;
    }

    if let Some(git_ref) = git_ref {
        let submodule_path = path.join(name);
        let commit = resolve_ref(&submodule_path, git_ref)?;
        checkout(&submodule_path, &commit)?;
    }

    Ok(())
}

/// Ensure a submodule is initialized and checked out at its recorded commit.
pub fn update_submodule(path: impl AsRef<Path>, name: &str) -> Result<(), GitError> {
    let path = path.as_ref();
    let output = run_git_with_timeout(
        path,
        "submodule update",
        format!("git submodule update --init -- '{name}'"),
        Duration::from_secs(NETWORK_TIMEOUT_SECS),
    )?;
    expect_success("submodule update", output)?;
    Ok(())
}

/// Fetch refs from the remote. Best-effort by contract: repositories with
/// no remote succeed as a no-op; callers treat network failures as
/// recoverable.
pub fn fetch(repo: impl AsRef<Path>) -> Result<(), GitError> {
    let repo = repo.as_ref();
    let output = run_git_with_timeout(
        repo,
        "fetch",
        "git fetch --all --tags".to_string(),
        Duration::from_secs(NETWORK_TIMEOUT_SECS),
    )?;
    expect_success("fetch", output)?;
    Ok(())
}

/// Resolve a git ref to a full commit hash.
///
/// Tries `origin/<ref>` first so branch refs pick up remote updates, then
/// falls back to the local ref. Annotated tags are peeled to the commit.
pub fn resolve_ref(repo: impl AsRef<Path>, git_ref: &str) -> Result<String, GitError> {
    let repo = repo.as_ref();

    let candidates = [format!("origin/{git_ref}"), git_ref.to_string()];
    for candidate in &candidates {
        let output = run_git(
            repo,
            "rev-parse",
            format!("git rev-parse --verify '{candidate}^{{commit}}'"),
        )?;
        if output.success {
            return Ok(output.stdout.trim().to_string());
        }
    }

    Err(GitError::CommandFailed {
        op: "rev-parse".to_string(),
        exit_code: None,
        stderr_tail: format!("could not resolve ref: {git_ref}"),
    })
}

/// Get the current HEAD commit hash.
pub fn current_commit(repo: impl AsRef<Path>) -> Result<String, GitError> {
    let repo = repo.as_ref();
    let output = run_git(repo, "rev-parse HEAD", "git rev-parse HEAD".to_string())?;
    let output = expect_success("rev-parse HEAD", output)?;
    Ok(output.stdout.trim().to_string())
}

/// Check whether the working tree and index are clean.
pub fn working_tree_clean(repo: impl AsRef<Path>) -> Result<bool, GitError> {
    let repo = repo.as_ref();
    let output = run_git(repo, "status", "git status --porcelain".to_string())?;
    let output = expect_success("status", output)?;
    Ok(output.stdout.trim().is_empty())
}

/// Detach HEAD at `commit`. Fails if the checkout would overwrite local
/// modifications.
pub fn checkout(repo: impl AsRef<Path>, commit: &str) -> Result<(), GitError> {
    let repo = repo.as_ref();
    let output = run_git(
        repo,
        "checkout",
        format!("git checkout --detach '{commit}'"),
    )?;
    expect_success("checkout", output)?;
    Ok(())
}

/// Contents of `file` as recorded at `commit`, without moving the checkout.
pub fn show_file(
    repo: impl AsRef<Path>,
    commit: &str,
    file: &str,
) -> Result<String, GitError> {
    let repo = repo.as_ref();
    let output = run_git(repo, "show", format!("git show '{commit}:{file}'"))?;
    let output = expect_success("show", output)?;
    Ok(output.stdout)
}

/// First-parent commit walk starting at `commit`, newest first.
///
/// This is the total order used to decide whether one change ref lies
/// between two others.
pub fn first_parent_log(repo: impl AsRef<Path>, commit: &str) -> Result<Vec<String>, GitError> {
    let repo = repo.as_ref();
    let output = run_git(
        repo,
        "rev-list",
        format!("git rev-list --first-parent '{commit}'"),
    )?;
    let output = expect_success("rev-list", output)?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('['))
        .map(ToString::to_string)
        .collect())
}

/// Create a detached worktree at `path` checked out at `commit`.
pub fn create_worktree(
    repo: impl AsRef<Path>,
    path: impl AsRef<Path>,
    commit: &str,
) -> Result<(), GitError> {
    let repo = repo.as_ref();
    let path = path.as_ref();
    let output = run_git(
        repo,
        "worktree add",
        format!("git worktree add --detach '{}' '{commit}'", path.display()),
    )?;
    expect_success("worktree add", output)?;
    Ok(())
}

/// Remove a worktree cleanly. Fails on stale locks or local modifications.
pub fn remove_worktree(repo: impl AsRef<Path>, path: impl AsRef<Path>) -> Result<(), GitError> {
    let repo = repo.as_ref();
    let path = path.as_ref();
    let output = run_git(
        repo,
        "worktree remove",
        format!("git worktree remove '{}'", path.display()),
    )?;
    expect_success("worktree remove", output)?;
    Ok(())
}
