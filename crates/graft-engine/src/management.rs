//! Dependency management operations (add, remove).
//!
//! These edit graft.yaml through a YAML value round-trip so unrelated
//! structure and comments-adjacent layout survive, rather than
//! re-serializing a parsed `GraftConfig`.

use graft_common::git;
use graft_core::{DependencySpec, GitRef, GitUrl, GraftError, Result};
use std::fs;
use std::path::Path;

use crate::lock::{parse_lock_file, write_lock_file};

/// Add a dependency to graft.yaml.
///
/// Validates the pieces, refuses duplicates, and writes the `url#ref`
/// shorthand under `deps`. Does NOT resolve the dependency; run
/// `resolve` afterwards to clone it.
pub fn add_dependency_to_config(
    config_path: impl AsRef<Path>,
    name: impl Into<String>,
    source: impl Into<String>,
    git_ref: impl Into<String>,
) -> Result<AddResult> {
    let config_path = config_path.as_ref();
    let name = name.into();
    let source = source.into();
    let git_ref = git_ref.into();

    let content = fs::read_to_string(config_path).map_err(|e| GraftError::ConfigParse {
        path: config_path.display().to_string(),
        reason: format!("failed to read file: {e}"),
    })?;

    let mut yaml_data: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| GraftError::ConfigParse {
            path: config_path.display().to_string(),
            reason: format!("invalid YAML: {e}"),
        })?;

    // Validation happens through the domain constructors.
    let git_url = GitUrl::new(&source)?;
    let git_ref_parsed = GitRef::new(&git_ref)?;
    let spec = DependencySpec::new(&name, git_url, git_ref_parsed)?;

    let mapping = yaml_data
        .as_mapping_mut()
        .ok_or_else(|| GraftError::ConfigParse {
            path: config_path.display().to_string(),
            reason: "config root must be a mapping".to_string(),
        })?;

    // Refuse names already present in either dependency section.
    for section in ["deps", "dependencies"] {
        if let Some(existing) = mapping
            .get(serde_yaml::Value::String(section.to_string()))
            .and_then(serde_yaml::Value::as_mapping)
        {
            if existing.contains_key(serde_yaml::Value::String(name.clone())) {
                return Err(GraftError::Validation(format!(
                    "dependency '{name}' already exists in config"
                )));
            }
        }
    }

    let deps_section = mapping
        .entry(serde_yaml::Value::String("deps".to_string()))
        .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));

    let deps_mapping = deps_section
        .as_mapping_mut()
        .ok_or_else(|| GraftError::ConfigParse {
            path: config_path.display().to_string(),
            reason: "deps must be a mapping".to_string(),
        })?;

    deps_mapping.insert(
        serde_yaml::Value::String(name.clone()),
        serde_yaml::Value::String(format!("{source}#{git_ref}")),
    );

    let new_content =
        serde_yaml::to_string(&yaml_data).map_err(|e| GraftError::Yaml(e.to_string()))?;
    fs::write(config_path, new_content)?;

    Ok(AddResult {
        name,
        source: spec.git_url.as_str().to_string(),
        git_ref,
    })
}

/// Remove a dependency from graft.yaml.
///
/// Removes the declaration only; lock entries and submodules have their
/// own removal steps below.
pub fn remove_dependency_from_config(
    config_path: impl AsRef<Path>,
    name: impl Into<String>,
) -> Result<()> {
    let config_path = config_path.as_ref();
    let name = name.into();

    let content = fs::read_to_string(config_path).map_err(|e| GraftError::ConfigParse {
        path: config_path.display().to_string(),
        reason: format!("failed to read file: {e}"),
    })?;

    let mut yaml_data: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| GraftError::ConfigParse {
            path: config_path.display().to_string(),
            reason: format!("invalid YAML: {e}"),
        })?;

    let mapping = yaml_data
        .as_mapping_mut()
        .ok_or_else(|| GraftError::ConfigParse {
            path: config_path.display().to_string(),
            reason: "config root must be a mapping".to_string(),
        })?;

    let dep_key = serde_yaml::Value::String(name.clone());
    let mut removed = false;

    for section in ["deps", "dependencies"] {
        if let Some(section_mapping) = mapping
            .get_mut(serde_yaml::Value::String(section.to_string()))
            .and_then(serde_yaml::Value::as_mapping_mut)
        {
            if section_mapping.remove(&dep_key).is_some() {
                removed = true;
            }
        }
    }

    if !removed {
        return Err(GraftError::DependencyNotFound { name });
    }

    let new_content =
        serde_yaml::to_string(&yaml_data).map_err(|e| GraftError::Yaml(e.to_string()))?;
    fs::write(config_path, new_content)?;

    Ok(())
}

/// Remove a dependency from graft.lock.
///
/// Silently succeeds if the lock doesn't exist or doesn't contain the name.
pub fn remove_dependency_from_lock(
    lock_path: impl AsRef<Path>,
    name: impl Into<String>,
) -> Result<()> {
    let lock_path = lock_path.as_ref();
    let name = name.into();

    if !lock_path.exists() {
        return Ok(());
    }

    let mut lock_file = parse_lock_file(lock_path)?;
    lock_file.remove(&name);
    write_lock_file(lock_path, &lock_file)?;

    Ok(())
}

/// Remove a git submodule: deinit, then `git rm`.
pub fn remove_submodule(base_dir: &Path, rel_path: &str) -> Result<()> {
    let run = |op: &str, command: String| -> Result<()> {
        let config = graft_common::ProcessConfig::new(command, base_dir);
        let output = graft_common::run_to_completion(&config)
            .map_err(|e| GraftError::CommandExecution(e.to_string()))?;
        if output.success {
            Ok(())
        } else {
            Err(GraftError::Git {
                op: op.to_string(),
                exit_code: Some(output.exit_code),
                stderr_tail: output.stderr,
            })
        }
    };

    run(
        "submodule deinit",
        format!("git submodule deinit -f '{rel_path}'"),
    )?;
    run("rm", format!("git rm -f '{rel_path}'"))?;

    Ok(())
}

/// Remove a dependency everywhere: config, lock, and (optionally) the
/// submodule itself.
pub fn remove_dependency(
    config_path: impl AsRef<Path>,
    lock_path: impl AsRef<Path>,
    base_dir: &Path,
    deps_directory: &str,
    name: &str,
    keep_files: bool,
) -> Result<RemoveResult> {
    remove_dependency_from_config(config_path, name)?;
    remove_dependency_from_lock(lock_path, name)?;

    let rel_path = format!("{deps_directory}/{name}");
    let removed_submodule = if keep_files {
        false
    } else {
        let is_submodule = git::is_submodule(base_dir, &rel_path).unwrap_or(false);
        if is_submodule {
            remove_submodule(base_dir, &rel_path)?;
            true
        } else {
            false
        }
    };

    Ok(RemoveResult {
        name: name.to_string(),
        removed_submodule,
        kept_files: keep_files,
    })
}

#[derive(Debug)]
pub struct AddResult {
    pub name: String,
    pub source: String,
    pub git_ref: String,
}

#[derive(Debug)]
pub struct RemoveResult {
    pub name: String,
    pub removed_submodule: bool,
    pub kept_files: bool,
}
