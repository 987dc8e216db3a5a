//! Graft CLI: git-native dependency and change manager.
//!
//! A thin rendering layer: every subcommand maps onto one engine
//! operation and formats its result as text or JSON. Exit codes: 0
//! success, 1 general failure, 2 integrity mismatch.

use anyhow::Context;
use clap::{Parser, Subcommand};
use graft_core::error::GraftError;
use graft_engine::{
    deps_directory, ChangeFilter, Severity, UpgradeOptions, ValidationReport,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE: &str = "graft.yaml";
const LOCK_FILE: &str = "graft.lock";

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Git-native dependency and change-propagation engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve declared dependencies and write the lock file
    Resolve,

    /// Show consumed state of dependencies
    Status {
        /// Optional dependency name
        dep_name: Option<String>,

        /// Also resolve each dependency's remote tip
        #[arg(long)]
        check_updates: bool,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// List changes declared by a dependency
    Changes {
        dep_name: String,

        /// Filter by change type (breaking, feature, fix, refactor, docs)
        #[arg(long = "type")]
        change_type: Option<String>,

        /// Only breaking changes
        #[arg(long)]
        breaking: bool,

        /// Exclusive lower bound ref
        #[arg(long)]
        from: Option<String>,

        /// Inclusive upper bound ref
        #[arg(long)]
        to: Option<String>,
    },

    /// Show one change with its resolved commands (dep@ref)
    Show {
        /// Change spec in the form <dep>@<ref>
        spec: String,
    },

    /// Update remote-tracking refs for one or all dependencies
    Fetch { dep_name: Option<String> },

    /// Bring checkouts into agreement with the lock
    Sync { dep_name: Option<String> },

    /// Update the lock entry for a dependency without running migrations
    Apply {
        dep_name: String,

        /// Target ref
        #[arg(long)]
        to: String,
    },

    /// Atomically upgrade a dependency, running migrations and verification
    Upgrade {
        dep_name: String,

        /// Target ref
        #[arg(long)]
        to: String,

        /// Plan and report without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Skip migration commands (verification still runs)
        #[arg(long)]
        skip_migration: bool,

        /// Skip verification commands
        #[arg(long)]
        skip_verify: bool,

        /// Proceed even when the working tree is dirty
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration, lock, and working-tree integrity
    Validate {
        /// Only validate graft.yaml
        #[arg(long)]
        config: bool,

        /// Only validate graft.lock
        #[arg(long)]
        lock: bool,

        /// Only validate checkout integrity
        #[arg(long)]
        integrity: bool,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Add a dependency to graft.yaml
    Add {
        name: String,
        source: String,

        /// Git ref to track
        #[arg(long, default_value = "main")]
        git_ref: String,
    },

    /// Remove a dependency from config, lock, and working tree
    Remove {
        name: String,

        /// Leave the checked-out files in place
        #[arg(long)]
        keep_files: bool,
    },

    /// Run a command defined in graft.yaml
    Run {
        command: String,

        /// Arguments appended to the command line
        args: Vec<String>,
    },

    /// List commands currently running under graft
    Ps,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<GraftError>()
                .map_or(1, |graft_err| {
                    if let Some(hint) = graft_err.hint() {
                        eprintln!("hint: {hint}");
                    }
                    graft_err.exit_code()
                });
            std::process::exit(code);
        }
    }
}

#[allow(clippy::too_many_lines)]
fn run(command: Commands) -> anyhow::Result<i32> {
    let base_dir = std::env::current_dir().context("cannot determine working directory")?;
    let deps_dir = deps_directory();

    match command {
        Commands::Resolve => resolve_command(&base_dir, &deps_dir),
        Commands::Status {
            dep_name,
            check_updates,
            format,
        } => status_command(&base_dir, &deps_dir, dep_name.as_deref(), check_updates, &format),
        Commands::Changes {
            dep_name,
            change_type,
            breaking,
            from,
            to,
        } => changes_command(&base_dir, &deps_dir, &dep_name, change_type, breaking, from, to),
        Commands::Show { spec } => show_command(&base_dir, &deps_dir, &spec),
        Commands::Fetch { dep_name } => fetch_command(&base_dir, &deps_dir, dep_name.as_deref()),
        Commands::Sync { dep_name } => sync_command(&base_dir, &deps_dir, dep_name.as_deref()),
        Commands::Apply { dep_name, to } => apply_command(&base_dir, &deps_dir, &dep_name, &to),
        Commands::Upgrade {
            dep_name,
            to,
            dry_run,
            skip_migration,
            skip_verify,
            force,
        } => upgrade_command(
            &base_dir,
            &deps_dir,
            &dep_name,
            &to,
            &UpgradeOptions {
                skip_migration,
                skip_verify,
                force,
                dry_run,
                snapshot_paths: Vec::new(),
            },
        ),
        Commands::Validate {
            config,
            lock,
            integrity,
            format,
        } => validate_command(&base_dir, &deps_dir, config, lock, integrity, &format),
        Commands::Add {
            name,
            source,
            git_ref,
        } => {
            let result =
                graft_engine::add_dependency_to_config(base_dir.join(CONFIG_FILE), &name, &source, &git_ref)?;
            println!("Added {} ({}#{})", result.name, result.source, result.git_ref);
            println!("Run 'graft resolve' to clone it.");
            Ok(0)
        }
        Commands::Remove { name, keep_files } => {
            let result = graft_engine::remove_dependency(
                base_dir.join(CONFIG_FILE),
                base_dir.join(LOCK_FILE),
                &base_dir,
                &deps_dir,
                &name,
                keep_files,
            )?;
            if result.removed_submodule {
                println!("Removed {} (submodule deleted)", result.name);
            } else if result.kept_files {
                println!("Removed {} (files kept on disk)", result.name);
            } else {
                println!("Removed {}", result.name);
            }
            Ok(0)
        }
        Commands::Run { command, args } => run_command(&base_dir, &command, &args),
        Commands::Ps => {
            let records = graft_common::registry::list();
            if records.is_empty() {
                println!("No graft commands running.");
            } else {
                for record in records {
                    println!(
                        "{:>8}  {:<10} {}  started {}",
                        record.pid, record.role, record.repo, record.started_at
                    );
                }
            }
            Ok(0)
        }
    }
}

fn load_config(base_dir: &Path) -> anyhow::Result<graft_core::GraftConfig> {
    graft_engine::parse_graft_yaml(base_dir.join(CONFIG_FILE)).map_err(Into::into)
}

fn dep_config_path(base_dir: &Path, deps_dir: &str, dep_name: &str) -> PathBuf {
    base_dir.join(deps_dir).join(dep_name).join(CONFIG_FILE)
}

/// Load a dependency's own graft.yaml, requiring it to be resolved first.
fn load_dep_config(
    base_dir: &Path,
    deps_dir: &str,
    dep_name: &str,
) -> anyhow::Result<graft_core::GraftConfig> {
    let dep_path = base_dir.join(deps_dir).join(dep_name);
    if !dep_path.exists() {
        anyhow::bail!("dependency '{dep_name}' is not resolved; run 'graft resolve' first");
    }
    let config_path = dep_config_path(base_dir, deps_dir, dep_name);
    if !config_path.exists() {
        // A graft without a config declares no changes.
        return graft_core::GraftConfig::new("graft/v0").map_err(Into::into);
    }
    graft_engine::parse_graft_yaml(config_path).map_err(Into::into)
}

fn resolve_command(base_dir: &Path, deps_dir: &str) -> anyhow::Result<i32> {
    let config = load_config(base_dir)?;
    let outcome = graft_engine::resolve_and_write_lock(
        &config,
        base_dir.join(LOCK_FILE),
        base_dir,
        deps_dir,
    )?;

    for result in &outcome.results {
        match (&result.error, &result.note) {
            (Some(error), _) => println!("✗ {}: {error}", result.name),
            (None, Some(note)) => println!("⚠ {} ({}): {note}", result.name, result.status),
            (None, None) => {
                let commit = result
                    .commit
                    .as_ref()
                    .map_or_else(String::new, |c| format!(" at {}", c.short()));
                println!("✓ {} ({}{commit})", result.name, result.status);
            }
        }
    }

    if outcome.lock.is_some() {
        println!("Wrote {LOCK_FILE}");
        Ok(0)
    } else {
        eprintln!("Lock file not written: one or more dependencies failed to resolve.");
        Ok(1)
    }
}

fn status_command(
    base_dir: &Path,
    deps_dir: &str,
    dep_name: Option<&str>,
    check_updates: bool,
    format: &str,
) -> anyhow::Result<i32> {
    validate_format(format)?;

    let lock_path = base_dir.join(LOCK_FILE);
    if !lock_path.exists() {
        if format == "json" {
            println!("{}", serde_json::json!({ "dependencies": {} }));
        } else {
            eprintln!("No dependencies found in {LOCK_FILE}");
            eprintln!();
            eprintln!("Run 'graft resolve' to resolve dependencies first.");
        }
        return Ok(0);
    }

    let lock = graft_engine::parse_lock_file(&lock_path)?;
    let mut statuses = if check_updates {
        graft_engine::status_with_updates(&lock, base_dir, deps_dir)
    } else {
        graft_engine::status(&lock)
    };

    if let Some(name) = dep_name {
        statuses.retain(|s| s.name == name);
        if statuses.is_empty() {
            anyhow::bail!(GraftError::DependencyNotFound {
                name: name.to_string()
            });
        }
    }

    if format == "json" {
        let mut deps_map = serde_json::Map::new();
        for s in &statuses {
            let mut obj = serde_json::json!({
                "source": s.source,
                "consumed_ref": s.consumed_ref,
                "consumed_commit": s.consumed_commit.as_str(),
                "consumed_at": s.consumed_at,
            });
            if let Some(latest) = &s.latest_commit {
                obj["latest_commit"] = serde_json::json!(latest.as_str());
            }
            deps_map.insert(s.name.clone(), obj);
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "dependencies": deps_map }))?
        );
    } else {
        println!("Dependencies:");
        for s in &statuses {
            let update = match &s.latest_commit {
                Some(latest) if latest != &s.consumed_commit => {
                    format!(" [update available: {}]", latest.short())
                }
                Some(_) => " [up to date]".to_string(),
                None => String::new(),
            };
            println!(
                "  {}: {} (commit: {}, consumed: {}){update}",
                s.name,
                s.consumed_ref,
                s.consumed_commit.short(),
                s.consumed_at
            );
        }
    }

    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn changes_command(
    base_dir: &Path,
    deps_dir: &str,
    dep_name: &str,
    change_type: Option<String>,
    breaking: bool,
    from: Option<String>,
    to: Option<String>,
) -> anyhow::Result<i32> {
    let dep_config = load_dep_config(base_dir, deps_dir, dep_name)?;

    let filter = ChangeFilter {
        change_type: change_type
            .as_deref()
            .map(graft_core::ChangeType::from_str)
            .transpose()?,
        breaking_only: breaking,
        from: from.map(graft_core::GitRef::new).transpose()?,
        to: to.map(graft_core::GitRef::new).transpose()?,
    };

    let dep_path = base_dir.join(deps_dir).join(dep_name);
    let listing = graft_engine::list_changes(&dep_config, &filter, Some(&dep_path));

    if let Some(note) = &listing.note {
        eprintln!("note: {note}");
    }

    if listing.changes.is_empty() {
        println!("No changes declared by '{dep_name}' match the filters.");
        return Ok(0);
    }

    for change in &listing.changes {
        let kind = change
            .change_type
            .map_or_else(String::new, |t| format!(" [{t}]"));
        let description = change
            .description
            .as_deref()
            .map_or_else(String::new, |d| format!(" - {d}"));
        println!("{}{kind}{description}", change.git_ref);
        if let Some(migration) = &change.migration {
            println!("    migration: {migration}");
        }
        if let Some(verify) = &change.verify {
            println!("    verify: {verify}");
        }
    }

    Ok(0)
}

fn show_command(base_dir: &Path, deps_dir: &str, spec: &str) -> anyhow::Result<i32> {
    let (dep_name, ref_name) = spec
        .split_once('@')
        .context("change spec must be in the form <dep>@<ref>")?;

    let dep_config = load_dep_config(base_dir, deps_dir, dep_name)?;
    let details = graft_engine::show_change(&dep_config, ref_name)?;

    println!("{dep_name}@{}", details.change.git_ref);
    if let Some(kind) = details.change.change_type {
        println!("  type: {kind}");
    }
    if let Some(description) = &details.change.description {
        println!("  description: {description}");
    }
    for (label, command) in [
        ("migration", &details.migration_command),
        ("verify", &details.verify_command),
    ] {
        if let Some(command) = command {
            println!("  {label}: {}", command.name);
            println!("    run: {}", command.run);
            if let Some(dir) = &command.working_dir {
                println!("    working_dir: {dir}");
            }
            if let Some(env) = &command.env {
                for (k, v) in env {
                    println!("    env: {k}={v}");
                }
            }
        }
    }

    Ok(0)
}

fn fetch_command(base_dir: &Path, deps_dir: &str, dep_name: Option<&str>) -> anyhow::Result<i32> {
    let config = load_config(base_dir)?;

    let results = match dep_name {
        Some(name) => {
            if !config.has_dependency(name) {
                anyhow::bail!(GraftError::DependencyNotFound {
                    name: name.to_string()
                });
            }
            vec![graft_engine::fetch_dependency(name, base_dir, deps_dir)]
        }
        None => graft_engine::fetch_all(&config, base_dir, deps_dir),
    };

    let mut succeeded = 0;
    for result in &results {
        if result.success {
            succeeded += 1;
            println!("✓ {}", result.name);
        } else {
            println!(
                "✗ {}: {}",
                result.name,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    // Partial failures are reported; success if anything fetched.
    Ok(i32::from(succeeded == 0 && !results.is_empty()))
}

fn sync_command(base_dir: &Path, deps_dir: &str, dep_name: Option<&str>) -> anyhow::Result<i32> {
    let lock = graft_engine::parse_lock_file(base_dir.join(LOCK_FILE))?;

    let results = match dep_name {
        Some(name) => {
            let entry = lock.get(name).ok_or_else(|| GraftError::DependencyNotFound {
                name: name.to_string(),
            })?;
            vec![graft_engine::sync_dependency(name, entry, base_dir, deps_dir)?]
        }
        None => graft_engine::sync_all(&lock, base_dir, deps_dir),
    };

    let mut failed = false;
    for result in &results {
        let marker = match result.action {
            graft_engine::SyncAction::Failed => {
                failed = true;
                "✗"
            }
            graft_engine::SyncAction::Missing => "⚠",
            _ => "✓",
        };
        println!("{marker} {} ({}): {}", result.name, result.action, result.message);
    }

    Ok(i32::from(failed))
}

fn apply_command(base_dir: &Path, deps_dir: &str, dep_name: &str, to: &str) -> anyhow::Result<i32> {
    let config = load_config(base_dir)?;
    let result = graft_engine::apply_lock(
        &config,
        base_dir.join(LOCK_FILE),
        dep_name,
        to,
        base_dir,
        deps_dir,
    )?;

    println!(
        "Applied {}: {} ({})",
        result.name,
        result.entry.git_ref,
        result.entry.commit.short()
    );
    println!("The checkout is unchanged; run 'graft sync {dep_name}' to move it.");
    Ok(0)
}

fn upgrade_command(
    base_dir: &Path,
    deps_dir: &str,
    dep_name: &str,
    to: &str,
    options: &UpgradeOptions,
) -> anyhow::Result<i32> {
    let config = load_config(base_dir)?;
    let outcome = graft_engine::upgrade_dependency(
        &config,
        base_dir.join(LOCK_FILE),
        dep_name,
        to,
        base_dir,
        deps_dir,
        options,
    )?;

    let plan = &outcome.plan;
    let from = plan
        .from_ref
        .as_ref()
        .map_or("<unlocked>", graft_core::GitRef::as_str);

    if outcome.dry_run {
        println!("Dry run: {dep_name} {from} -> {} ({})", plan.to_ref, plan.to_commit.short());
        if plan.changes.is_empty() {
            println!("No declared changes in range.");
        }
        for change in &plan.changes {
            let kind = change
                .change_type
                .map_or_else(String::new, |t| format!(" [{t}]"));
            println!("  {}{kind}", change.git_ref);
            if let Some(migration) = &change.migration {
                println!("    would run migration: {migration}");
            }
            if let Some(verify) = &change.verify {
                println!("    would run verify: {verify}");
            }
        }
        println!("No changes written.");
        return Ok(0);
    }

    for step in &outcome.migrations {
        println!("✓ migration {} ({})", step.command_name, step.change_ref);
    }
    for step in &outcome.verifications {
        println!("✓ verify {} ({})", step.command_name, step.change_ref);
    }
    println!(
        "Upgraded {dep_name}: {from} -> {} ({})",
        plan.to_ref,
        plan.to_commit.short()
    );
    Ok(0)
}

fn validate_command(
    base_dir: &Path,
    deps_dir: &str,
    config_only: bool,
    lock_only: bool,
    integrity_only: bool,
    format: &str,
) -> anyhow::Result<i32> {
    validate_format(format)?;

    // No mode flags means all modes.
    let all = !(config_only || lock_only || integrity_only);

    let mut report = ValidationReport::default();

    let config = load_config(base_dir)?;
    if all || config_only {
        report.reports.push(graft_engine::validate_config(&config));
    }

    if all || lock_only || integrity_only {
        let lock_path = base_dir.join(LOCK_FILE);
        if lock_path.exists() {
            let lock = graft_engine::parse_lock_file(&lock_path)?;
            if all || lock_only {
                report
                    .reports
                    .push(graft_engine::validate_lock(&config, &lock));
            }
            if all || integrity_only {
                report
                    .reports
                    .push(graft_engine::validate_integrity(&lock, base_dir, deps_dir));
            }
        } else if lock_only || integrity_only {
            anyhow::bail!(GraftError::LockFileNotFound {
                path: lock_path.display().to_string()
            });
        }
    }

    if format == "json" {
        let modes: Vec<serde_json::Value> = report
            .reports
            .iter()
            .map(|mode_report| {
                let findings: Vec<serde_json::Value> = mode_report
                    .findings
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "code": f.code,
                            "severity": match f.severity {
                                Severity::Error => "error",
                                Severity::Warning => "warning",
                            },
                            "message": f.message,
                            "suggestion": f.suggestion,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "mode": mode_report.mode.to_string(),
                    "passed": mode_report.passed(),
                    "findings": findings,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "passed": report.passed(),
                "exit_code": report.exit_code(),
                "modes": modes,
            }))?
        );
    } else {
        for mode_report in &report.reports {
            if mode_report.findings.is_empty() {
                println!("✓ {} OK", mode_report.mode);
                continue;
            }
            for finding in &mode_report.findings {
                let marker = match finding.severity {
                    Severity::Error => "✗",
                    Severity::Warning => "⚠",
                };
                println!("{marker} [{}] {}", mode_report.mode, finding.message);
                if let Some(suggestion) = &finding.suggestion {
                    println!("    suggestion: {suggestion}");
                }
            }
        }
    }

    Ok(report.exit_code())
}

fn run_command(base_dir: &Path, command_name: &str, args: &[String]) -> anyhow::Result<i32> {
    let config = load_config(base_dir)?;
    let result = graft_engine::execute_command_by_name(&config, command_name, base_dir, args)?;

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(result.exit_code)
}

fn validate_format(format: &str) -> anyhow::Result<()> {
    if format == "text" || format == "json" {
        Ok(())
    } else {
        anyhow::bail!("invalid format '{format}'. Must be 'text' or 'json'")
    }
}
