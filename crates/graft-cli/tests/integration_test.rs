//! CLI integration tests: drive the built binary end to end.

use std::path::Path;
use std::process::{Command, Output};

fn graft(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_graft"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run graft binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn status_without_lock_suggests_resolve() {
    let temp = tempfile::tempdir().unwrap();
    let output = graft(temp.path(), &["status"]);

    assert!(output.status.success());
    assert!(stderr(&output).contains("graft resolve"));
}

#[test]
fn status_json_without_lock_is_empty_object() {
    let temp = tempfile::tempdir().unwrap();
    let output = graft(temp.path(), &["status", "--format", "json"]);

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert!(parsed["dependencies"].as_object().unwrap().is_empty());
}

#[test]
fn status_rejects_unknown_format() {
    let temp = tempfile::tempdir().unwrap();
    let output = graft(temp.path(), &["status", "--format", "xml"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("invalid format"));
}

#[test]
fn validate_without_config_exits_one_with_hint() {
    let temp = tempfile::tempdir().unwrap();
    let output = graft(temp.path(), &["validate"]);

    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("config file not found"));
    assert!(err.contains("hint:"));
}

#[test]
fn validate_reports_missing_dependencies() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("graft.yaml"), "apiVersion: graft/v0\n").unwrap();

    let output = graft(temp.path(), &["validate", "--config"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("no dependencies declared"));
}

#[test]
fn validate_json_is_machine_readable() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(temp.path().join("graft.yaml"), "apiVersion: graft/v0\n").unwrap();

    let output = graft(temp.path(), &["validate", "--config", "--format", "json"]);

    assert_eq!(output.status.code(), Some(1));
    let parsed: serde_json::Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert_eq!(parsed["passed"], serde_json::json!(false));
    assert_eq!(parsed["modes"][0]["mode"], serde_json::json!("config"));
    assert_eq!(
        parsed["modes"][0]["findings"][0]["code"],
        serde_json::json!("no_dependencies")
    );
}

#[test]
fn show_requires_dep_at_ref_form() {
    let temp = tempfile::tempdir().unwrap();
    let output = graft(temp.path(), &["show", "just-a-name"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("<dep>@<ref>"));
}

#[test]
fn changes_for_unresolved_dependency_fails() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(
        temp.path().join("graft.yaml"),
        "apiVersion: graft/v0\ndeps:\n  dep: \"https://example.com/repo.git#main\"\n",
    )
    .unwrap();

    let output = graft(temp.path(), &["changes", "dep"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("graft resolve"));
}

#[test]
fn run_executes_declared_command() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(
        temp.path().join("graft.yaml"),
        "apiVersion: graft/v0\ncommands:\n  hello:\n    run: \"echo hello from graft\"\n",
    )
    .unwrap();

    let output = graft(temp.path(), &["run", "hello"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("hello from graft"));
}

#[test]
fn run_propagates_command_exit_code() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::write(
        temp.path().join("graft.yaml"),
        "apiVersion: graft/v0\ncommands:\n  fail:\n    run: \"exit 4\"\n",
    )
    .unwrap();

    let output = graft(temp.path(), &["run", "fail"]);
    assert_eq!(output.status.code(), Some(4));
}
