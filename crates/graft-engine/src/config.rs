//! Configuration parsing for graft.yaml files.
//!
//! The document is walked explicitly as a YAML mapping rather than
//! derived, so every failure names the field path that caused it and no
//! partial config ever escapes.

use graft_core::{
    Change, ChangeType, Command, DependencySpec, GitRef, GitUrl, GraftConfig, GraftError, Metadata,
    Result,
};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Parse a graft.yaml file from a path.
pub fn parse_graft_yaml(path: impl AsRef<Path>) -> Result<GraftConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(GraftError::ConfigFileNotFound {
            path: path.display().to_string(),
        });
    }

    let content = fs::read_to_string(path).map_err(|e| GraftError::ConfigParse {
        path: path.display().to_string(),
        reason: format!("failed to read file: {e}"),
    })?;

    parse_graft_yaml_str(&content, &path.display().to_string())
}

/// Parse graft.yaml from a string.
#[allow(clippy::too_many_lines)]
pub fn parse_graft_yaml_str(content: &str, path: &str) -> Result<GraftConfig> {
    let data: Value = serde_yaml::from_str(content).map_err(|e| GraftError::ConfigParse {
        path: path.to_string(),
        reason: format!("invalid YAML syntax: {e}"),
    })?;

    let obj = data
        .as_mapping()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "root".to_string(),
            reason: "configuration must be a YAML mapping".to_string(),
        })?;

    // apiVersion is required
    let api_version = obj
        .get(Value::String("apiVersion".to_string()))
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "apiVersion".to_string(),
            reason: "missing required field".to_string(),
        })?
        .as_str()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "apiVersion".to_string(),
            reason: "must be a string".to_string(),
        })?;

    let mut config = GraftConfig::new(api_version)?;

    if let Some(metadata_value) = obj.get(Value::String("metadata".to_string())) {
        let metadata: Metadata = serde_yaml::from_value(metadata_value.clone()).map_err(|e| {
            GraftError::ConfigValidation {
                path: path.to_string(),
                field: "metadata".to_string(),
                reason: format!("invalid metadata: {e}"),
            }
        })?;
        config.metadata = Some(metadata);
    }

    if let Some(commands_value) = obj.get(Value::String("commands".to_string())) {
        parse_commands(commands_value, path, &mut config)?;
    }

    if let Some(changes_value) = obj.get(Value::String("changes".to_string())) {
        parse_changes(changes_value, path, &mut config)?;
    }

    // Dependencies may appear under "deps" (legacy shorthand) or
    // "dependencies" (modern). Both accept "url#ref" strings; the modern
    // section also accepts {url, ref} mappings.
    if let Some(deps_value) = obj.get(Value::String("deps".to_string())) {
        parse_legacy_deps(deps_value, path, &mut config)?;
    }

    if let Some(dependencies_value) = obj.get(Value::String("dependencies".to_string())) {
        parse_modern_deps(dependencies_value, path, &mut config)?;
    }

    config.validate()?;

    Ok(config)
}

fn parse_commands(commands_value: &Value, path: &str, config: &mut GraftConfig) -> Result<()> {
    let commands_map = commands_value
        .as_mapping()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "commands".to_string(),
            reason: "must be a mapping of command_name: {...}".to_string(),
        })?;

    for (cmd_name, cmd_data) in commands_map {
        let name = cmd_name
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: "commands".to_string(),
                reason: "command name must be a string".to_string(),
            })?;

        let cmd_obj = cmd_data
            .as_mapping()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: format!("commands.{name}"),
                reason: "command must be a mapping with a 'run' field".to_string(),
            })?;

        let run = cmd_obj
            .get(Value::String("run".to_string()))
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: format!("commands.{name}"),
                reason: "command must have a 'run' field".to_string(),
            })?
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: format!("commands.{name}.run"),
                reason: "'run' must be a string".to_string(),
            })?;

        let mut command = Command::new(name, run)?;

        if let Some(desc) = cmd_obj
            .get(Value::String("description".to_string()))
            .and_then(Value::as_str)
        {
            command.description = Some(desc.to_string());
        }

        if let Some(wd) = cmd_obj
            .get(Value::String("working_dir".to_string()))
            .and_then(Value::as_str)
        {
            command.working_dir = Some(wd.to_string());
        }

        if let Some(env_map) = cmd_obj
            .get(Value::String("env".to_string()))
            .and_then(Value::as_mapping)
        {
            let mut env = HashMap::new();
            for (k, v) in env_map {
                if let (Some(key), Some(val)) = (k.as_str(), v.as_str()) {
                    env.insert(key.to_string(), val.to_string());
                }
            }
            command.env = Some(env);
        }

        config.commands.insert(name.to_string(), command);
    }

    Ok(())
}

fn parse_changes(changes_value: &Value, path: &str, config: &mut GraftConfig) -> Result<()> {
    let changes_map = changes_value
        .as_mapping()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "changes".to_string(),
            reason: "must be a mapping of ref: {...}".to_string(),
        })?;

    for (ref_name_value, change_data) in changes_map {
        let ref_name = ref_name_value
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: "changes".to_string(),
                reason: "change ref must be a string".to_string(),
            })?;

        let mut change = Change::new(ref_name)?;

        // Null bodies are allowed: a change can be declared by ref alone
        if let Some(change_obj) = change_data.as_mapping() {
            if let Some(type_str) = change_obj
                .get(Value::String("type".to_string()))
                .and_then(Value::as_str)
            {
                let change_type = ChangeType::from_str(type_str).map_err(|e| {
                    GraftError::ConfigValidation {
                        path: path.to_string(),
                        field: format!("changes.{ref_name}.type"),
                        reason: e.to_string(),
                    }
                })?;
                change.change_type = Some(change_type);
            }

            if let Some(desc) = change_obj
                .get(Value::String("description".to_string()))
                .and_then(Value::as_str)
            {
                change.description = Some(desc.to_string());
            }

            if let Some(migration) = change_obj
                .get(Value::String("migration".to_string()))
                .and_then(Value::as_str)
            {
                change.migration = Some(migration.to_string());
            }

            if let Some(verify) = change_obj
                .get(Value::String("verify".to_string()))
                .and_then(Value::as_str)
            {
                change.verify = Some(verify.to_string());
            }

            // Extra fields ride along as metadata
            for (k, v) in change_obj {
                if let Some(key) = k.as_str() {
                    if !matches!(key, "type" | "description" | "migration" | "verify") {
                        change.metadata.insert(key.to_string(), v.clone());
                    }
                }
            }
        }

        config.changes.insert(ref_name.to_string(), change);
    }

    Ok(())
}

fn parse_legacy_deps(deps_value: &Value, path: &str, config: &mut GraftConfig) -> Result<()> {
    let deps_map = deps_value
        .as_mapping()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "deps".to_string(),
            reason: "must be a mapping of dependency_name: url#ref".to_string(),
        })?;

    for (name_value, url_ref_value) in deps_map {
        let name = name_value
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: "deps".to_string(),
                reason: "dependency name must be a string".to_string(),
            })?;

        let url_ref = url_ref_value
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: format!("deps.{name}"),
                reason: "dependency must be a string in format 'url#ref'".to_string(),
            })?;

        let (git_url, git_ref) = split_url_ref(url_ref, path, &format!("deps.{name}"))?;
        insert_dependency(config, path, name, git_url, git_ref)?;
    }

    Ok(())
}

fn parse_modern_deps(dependencies_value: &Value, path: &str, config: &mut GraftConfig) -> Result<()> {
    let deps_map = dependencies_value
        .as_mapping()
        .ok_or_else(|| GraftError::ConfigValidation {
            path: path.to_string(),
            field: "dependencies".to_string(),
            reason: "must be a mapping".to_string(),
        })?;

    for (name_value, dep_data) in deps_map {
        let name = name_value
            .as_str()
            .ok_or_else(|| GraftError::ConfigValidation {
                path: path.to_string(),
                field: "dependencies".to_string(),
                reason: "dependency name must be a string".to_string(),
            })?;

        let (git_url, git_ref) = if let Some(url_ref_str) = dep_data.as_str() {
            split_url_ref(url_ref_str, path, &format!("dependencies.{name}"))?
        } else if let Some(dep_obj) = dep_data.as_mapping() {
            // Mapping form: {url, ref}. "source" accepted as a legacy alias.
            let url = dep_obj
                .get(Value::String("url".to_string()))
                .or_else(|| dep_obj.get(Value::String("source".to_string())))
                .ok_or_else(|| GraftError::ConfigValidation {
                    path: path.to_string(),
                    field: format!("dependencies.{name}"),
                    reason: "dependency must have a 'url' field".to_string(),
                })?
                .as_str()
                .ok_or_else(|| GraftError::ConfigValidation {
                    path: path.to_string(),
                    field: format!("dependencies.{name}.url"),
                    reason: "'url' must be a string".to_string(),
                })?;

            let ref_str = dep_obj
                .get(Value::String("ref".to_string()))
                .and_then(Value::as_str)
                .unwrap_or("main");

            (url.to_string(), ref_str.to_string())
        } else {
            return Err(GraftError::ConfigValidation {
                path: path.to_string(),
                field: format!("dependencies.{name}"),
                reason: "dependency must be a string or a mapping".to_string(),
            });
        };

        insert_dependency(config, path, name, git_url, git_ref)?;
    }

    Ok(())
}

/// Split "url#ref" on the last '#', so URLs containing '#' still parse.
fn split_url_ref(url_ref: &str, path: &str, field: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = url_ref.rsplitn(2, '#').collect();
    if parts.len() != 2 {
        return Err(GraftError::ConfigValidation {
            path: path.to_string(),
            field: field.to_string(),
            reason: format!("must use format 'url#ref', got: {url_ref}"),
        });
    }
    Ok((parts[1].to_string(), parts[0].to_string()))
}

fn insert_dependency(
    config: &mut GraftConfig,
    path: &str,
    name: &str,
    git_url: String,
    git_ref: String,
) -> Result<()> {
    if config.dependencies.contains_key(name) {
        return Err(GraftError::ConfigValidation {
            path: path.to_string(),
            field: format!("dependencies.{name}"),
            reason: "dependency declared more than once".to_string(),
        });
    }

    let spec = DependencySpec::new(name, GitUrl::new(git_url)?, GitRef::new(git_ref)?)?;
    config.dependencies.insert(name.to_string(), spec);
    Ok(())
}
