//! CLI subprocess integration tests.
//!
//! These invoke the `sprig` binary as a subprocess and check exit codes,
//! stdout content and JSON output shape. Nothing here needs root or network.

use std::path::Path;
use std::process::{Command, Output};

fn sprig_bin(cwd: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sprig"));
    cmd.current_dir(cwd);
    // Skip the host prerequisite gate; nothing here reaches the sandbox.
    cmd.env("SPRIG_SKIP_PREREQS", "1");
    cmd.env_remove("SPRIG_LOG");
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path()).arg("--version").output().unwrap();
    assert!(output.status.success(), "sprig --version must exit 0");
    assert!(stdout(&output).contains("sprig"));
}

#[test]
fn cli_help_lists_commands_but_not_child() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    for cmd in ["run", "pull", "doctor", "completions", "man-pages"] {
        assert!(out.contains(cmd), "help must list '{cmd}': {out}");
    }
    assert!(!out.contains("__child__"), "sandbox entry point must stay hidden");
}

#[test]
fn cli_run_help_shows_flags() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path())
        .args(["run", "--help"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let out = stdout(&output);
    for flag in ["--vars", "--dry-run", "--tags", "--output"] {
        assert!(out.contains(flag), "run help must mention {flag}: {out}");
    }
}

#[test]
fn cli_completions_bash() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("sprig"));
}

#[test]
fn cli_man_pages_skip_hidden_commands() {
    let dir = tempfile::tempdir().unwrap();
    let man = dir.path().join("man");
    let output = sprig_bin(dir.path())
        .arg("man-pages")
        .arg(&man)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(man.join("sprig.1").is_file());
    assert!(man.join("sprig-run.1").is_file());
    assert!(man.join("sprig-doctor.1").is_file());
    assert!(!man.join("sprig-__child__.1").exists());
}

#[test]
fn cli_doctor_json_shape() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path())
        .args(["doctor", "--json"])
        .output()
        .unwrap();
    // Exit status depends on the host (root, sshd); the report shape does not.
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(report["healthy"].is_boolean());
    let checks = report["checks"].as_array().unwrap();
    let names: Vec<&str> = checks.iter().filter_map(|c| c["name"].as_str()).collect();
    assert!(names.contains(&"run_prereqs"));
    assert!(names.contains(&"image"));
    assert!(names.contains(&"state_dir"));
    assert!(!dir.path().join(".sprig").exists(), "doctor must not create state");
}

#[test]
fn cli_rejects_invalid_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sprig.toml"), "imagee = \"typo\"\n").unwrap();
    let output = sprig_bin(dir.path()).arg("doctor").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error: config:"), "{}", stderr(&output));
}

#[test]
fn cli_explicit_config_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path())
        .args(["--config", "missing.toml", "doctor"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error: config:"));
}

#[test]
fn cli_run_rejects_nested_vars() {
    let dir = tempfile::tempdir().unwrap();
    let vars = dir.path().join("vars.toml");
    std::fs::write(&vars, "[nested]\nkey = 1\n").unwrap();
    let output = sprig_bin(dir.path())
        .arg("run")
        .arg("--vars")
        .arg(&vars)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("error: config:"), "{err}");
    assert!(!dir.path().join(".sprig").exists(), "bad vars must fail before staging");
}

#[test]
fn cli_run_rejects_unknown_output_mode() {
    let dir = tempfile::tempdir().unwrap();
    let output = sprig_bin(dir.path())
        .args(["run", "--output", "fancy"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("fancy"));
}
