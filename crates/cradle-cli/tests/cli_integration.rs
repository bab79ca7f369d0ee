//! CLI subprocess integration tests.
//!
//! These tests invoke the `cradle` binary as a subprocess against a
//! throwaway installation tree and verify exit codes, stdout content, and
//! JSON output. Environments are created with the mock tooling so no
//! interpreter is needed.

use cradle_runtime::mock::mock_site_packages_rel;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn cradle(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cradle"));
    cmd.arg("--root")
        .arg(root)
        .args(["--tooling", "mock", "--yes"])
        // Never pick up the developer's own configuration.
        .env("CRADLE_CONFIG", root.join("no-such-config.toml"))
        .env_remove("CRADLE_LOG");
    cmd
}

fn run(root: &Path, args: &[&str]) -> Output {
    cradle(root).args(args).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        stderr(output)
    );
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("invalid JSON ({e}): {}", stdout(output)))
}

/// A standalone release tree with one environment and one custom node.
fn seed_installation(root: &Path) {
    let app = root.join("ComfyUI");
    fs::create_dir_all(app.join("custom_nodes/impact-pack")).unwrap();
    fs::write(app.join("custom_nodes/impact-pack/__init__.py"), "").unwrap();
    fs::write(app.join("main.py"), "print('hi')").unwrap();

    let site = root.join("standalone-env").join(mock_site_packages_rel());
    fs::create_dir_all(site.join("numpy")).unwrap();
    fs::write(site.join("numpy/__init__.py"), "# numpy").unwrap();
    fs::write(site.join("six.py"), "# six").unwrap();
    fs::create_dir_all(root.join("standalone-env/bin")).unwrap();
    fs::write(root.join("standalone-env/bin/python3"), "#!/bin/sh\n").unwrap();

    fs::create_dir_all(root.join("envs/default").join(mock_site_packages_rel())).unwrap();
    fs::write(
        root.join("manifest.json"),
        r#"{"release_tag":"v0.3.9","variant":"linux-x64-cu128","python_version":"3.12.9","installed_at":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();
}

fn initialized() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    seed_installation(dir.path());
    let out = run(dir.path(), &["init"]);
    assert!(out.status.success(), "init failed: {}", stderr(&out));
    dir
}

#[test]
fn cli_version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(dir.path(), &["--version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("cradle"));
}

#[test]
fn cli_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(dir.path(), &["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for cmd in ["init", "env", "snapshot", "nodes", "update", "launch", "doctor"] {
        assert!(text.contains(cmd), "help must list '{cmd}': {text}");
    }
}

#[test]
fn commands_before_init_explain_what_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(dir.path(), &["status"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("cradle init"));
}

#[test]
fn init_requires_application_directory() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(dir.path(), &["init"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join(".cradle/installation.json").exists());
}

#[test]
fn init_adopts_existing_state() {
    let dir = tempfile::tempdir().unwrap();
    seed_installation(dir.path());
    let record = json(&run(dir.path(), &["--json", "init", "--id", "main"]));
    assert_eq!(record["id"], "main");
    assert_eq!(record["source"]["kind"], "standalone");
    assert_eq!(record["release_tag"], "v0.3.9");
    assert_eq!(record["env_methods"]["default"], "adopted");
    assert_eq!(record["active_env"], "default");

    // A second init without --force leaves the record alone.
    let again = run(dir.path(), &["init"]);
    assert_eq!(again.status.code(), Some(1));
    assert!(stderr(&again).contains("--force"));
}

#[test]
fn env_lifecycle() {
    let dir = initialized();
    let root = dir.path();

    let out = run(root, &["env", "create", "cpu"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let site = root.join("envs/cpu").join(mock_site_packages_rel());
    assert!(site.join("numpy/__init__.py").is_file());
    assert!(site.join("six.py").is_file());

    let list = json(&run(root, &["--json", "env", "list"]));
    let names: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["cpu", "default"]);
    let cpu = &list[0];
    assert_eq!(cpu["method"], "copy");
    assert_eq!(cpu["active"], false);

    let out = run(root, &["env", "activate", "cpu"]);
    assert!(out.status.success(), "{}", stderr(&out));
    let status = json(&run(root, &["--json", "status"]));
    assert_eq!(status["installation"]["active_env"], "cpu");

    // The active environment cannot be deleted.
    let out = run(root, &["env", "delete", "cpu"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(root.join("envs/cpu").is_dir());

    run(root, &["env", "activate", "default"]);
    let out = run(root, &["env", "delete", "cpu"]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(!root.join("envs/cpu").exists());
    let status = json(&run(root, &["--json", "status"]));
    assert!(status["installation"]["env_methods"].get("cpu").is_none());
}

#[test]
fn duplicate_environment_is_rejected() {
    let dir = initialized();
    let out = run(dir.path(), &["env", "create", "default"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("already exists"));
}

#[test]
fn snapshot_diff_and_restore_round() {
    let dir = initialized();
    let root = dir.path();

    let summary = json(&run(root, &["--json", "snapshot", "save", "baseline"]));
    let filename = summary["filename"].as_str().unwrap().to_owned();
    assert_eq!(summary["node_count"], 1);
    assert_eq!(summary["env_name"], "default");

    let status = json(&run(root, &["--json", "status"]));
    assert_eq!(
        status["installation"]["node_snapshots"]["default"][0],
        filename.as_str()
    );

    let listed = json(&run(root, &["--json", "snapshot", "list"]));
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Disable the node behind the tool's back.
    let nodes = root.join("ComfyUI/custom_nodes");
    fs::create_dir_all(nodes.join(".disabled")).unwrap();
    fs::rename(nodes.join("impact-pack"), nodes.join(".disabled/impact-pack")).unwrap();

    let delta = json(&run(root, &["--json", "nodes", "diff", &filename]));
    assert_eq!(delta["changed"].as_array().unwrap().len(), 1);
    assert_eq!(delta["changed"][0]["id"], "impact-pack");
    assert_eq!(delta["changed"][0]["deltas"][0]["field"], "enabled");
    assert_eq!(delta["changed"][0]["deltas"][0]["from"], true);
    assert_eq!(delta["changed"][0]["deltas"][0]["to"], false);

    let restored = json(&run(root, &["--json", "nodes", "restore", &filename]));
    assert_eq!(restored["report"]["enabled"][0], "impact-pack");
    assert!(nodes.join("impact-pack/__init__.py").is_file());

    let delta = json(&run(root, &["--json", "nodes", "diff", &filename]));
    assert!(delta["changed"].as_array().unwrap().is_empty());
    assert!(delta["added"].as_array().unwrap().is_empty());
    assert!(delta["removed"].as_array().unwrap().is_empty());
}

#[test]
fn snapshot_delete_forgets_record() {
    let dir = initialized();
    let root = dir.path();
    let summary = json(&run(root, &["--json", "snapshot", "save", "tmp"]));
    let filename = summary["filename"].as_str().unwrap().to_owned();

    let out = run(root, &["snapshot", "delete", &filename]);
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(!root.join("snapshots").join(&filename).exists());
    let status = json(&run(root, &["--json", "status"]));
    let recorded = &status["installation"]["node_snapshots"]["default"];
    assert!(recorded.is_null() || recorded.as_array().unwrap().is_empty());
}

#[test]
fn unknown_snapshot_fails() {
    let dir = initialized();
    let out = run(dir.path(), &["nodes", "diff", "19700101T000000-nope-00000000.json"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("snapshot not found"));
}

#[test]
fn standalone_update_needs_release() {
    let dir = initialized();
    let out = run(dir.path(), &["update"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("release descriptor"));
    // The tree is untouched.
    assert_eq!(
        fs::read_to_string(dir.path().join("ComfyUI/main.py")).unwrap(),
        "print('hi')"
    );
}

#[test]
fn invalid_release_file_is_rejected() {
    let dir = initialized();
    let release = dir.path().join("release.json");
    fs::write(&release, "{not json").unwrap();
    let out = cradle(dir.path())
        .args(["update", "--release"])
        .arg(&release)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("invalid release descriptor"));
}

#[test]
fn launch_uses_active_environment() {
    let dir = initialized();
    let cmd = json(&run(dir.path(), &["--json", "launch"]));
    assert_eq!(cmd["kind"], "process");
    assert_eq!(cmd["args"][0], "main.py");
    let program = cmd["program"].as_str().unwrap();
    assert!(program.contains("envs"), "{program}");
    assert!(cmd["cwd"].as_str().unwrap().ends_with("ComfyUI"));
}

#[test]
fn remote_installation_only_launches() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let out = run(
        root,
        &["init", "--source", "remote", "--url", "http://10.0.0.5:8188"],
    );
    assert!(out.status.success(), "{}", stderr(&out));

    let out = run(root, &["launch"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("http://10.0.0.5:8188"));

    let out = run(root, &["env", "create", "cpu"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("do not support"));
}

#[test]
fn remote_init_requires_url() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(dir.path(), &["init", "--source", "cloud"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("--url"));
}

#[test]
fn invalid_config_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "[copy]\nbatch_size = 0\n").unwrap();
    let out = cradle(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("config error"));
}

#[test]
fn doctor_json_reports_checks() {
    let dir = initialized();
    let out = run(dir.path(), &["--json", "doctor"]);
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = report["checks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    for expected in ["prereqs", "application", "manifest", "registry", "wal_clean"] {
        assert!(names.contains(&expected), "missing check {expected}: {names:?}");
    }
    assert!(report["healthy"].is_boolean());
}

#[test]
fn completions_generate_for_bash() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(dir.path(), &["completions", "bash"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("cradle"));
}

#[test]
fn man_pages_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let man = dir.path().join("man");
    let out = cradle(dir.path())
        .arg("man-pages")
        .arg(&man)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", stderr(&out));
    assert!(man.join("cradle.1").is_file());
    assert!(man.join("cradle-update.1").is_file());
}
