//! Command execution support.
//!
//! Migrations, verifications, and user-invoked commands all execute
//! through this one path: `sh -c` semantics, inherited environment with
//! `Command.env` overrides applied last, working directory resolved
//! relative to the base directory, and registration in the process
//! registry for the lifetime of the child.

use graft_core::domain::{Command, GraftConfig};
use graft_core::error::{GraftError, Result};
use graft_common::process::{run_to_completion, ProcessConfig, ProcessError};
use std::path::Path;
use std::time::Duration;

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code from the command
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Whether output exceeded the ring buffer and earlier lines were dropped
    pub truncated: bool,
}

/// Execute a dependency-defined command.
///
/// # Arguments
///
/// * `command` - Command definition from graft.yaml
/// * `base_dir` - Base directory for execution (typically the dependency directory)
/// * `args` - Additional command-line arguments appended to `run`
pub fn execute_command(
    command: &Command,
    base_dir: &Path,
    args: &[String],
) -> Result<CommandResult> {
    execute_command_with(command, base_dir, args, "user", None)
}

/// Execute a command with an explicit registry role and optional timeout.
pub fn execute_command_with(
    command: &Command,
    base_dir: &Path,
    args: &[String],
    role: &str,
    timeout: Option<Duration>,
) -> Result<CommandResult> {
    let mut full_command = vec![command.run.clone()];
    full_command.extend(args.iter().cloned());
    let shell_cmd = full_command.join(" ");

    let working_dir = command
        .working_dir
        .as_ref()
        .map_or_else(|| base_dir.to_path_buf(), |dir| base_dir.join(dir));

    let mut config = ProcessConfig::new(shell_cmd, working_dir).with_role(role);
    if let Some(env) = &command.env {
        config = config.with_env(env.clone());
    }
    if let Some(timeout) = timeout {
        config = config.with_timeout(timeout);
    }

    log::debug!("executing command '{}' in {}", command.name, base_dir.display());

    let output = run_to_completion(&config).map_err(|e| match e {
        ProcessError::Timeout { op, elapsed_ms } => GraftError::Timeout { op, elapsed_ms },
        other => GraftError::CommandExecution(other.to_string()),
    })?;

    Ok(CommandResult {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        success: output.success,
        truncated: output.truncated,
    })
}

/// Execute a command by name from the config's command registry.
pub fn execute_command_by_name(
    config: &GraftConfig,
    command_name: &str,
    base_dir: &Path,
    args: &[String],
) -> Result<CommandResult> {
    let command = config.commands.get(command_name).ok_or_else(|| {
        GraftError::CommandExecution(format!("command not found: {command_name}"))
    })?;

    execute_command(command, base_dir, args)
}
