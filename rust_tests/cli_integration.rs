//! CLI Integration Tests
//!
//! Drive the self-test binary the way a user would:
//! - flag parsing, --help and --version
//! - listing and pattern selection
//! - JSON and JUnit output, settings file

use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use wait_timeout::ChildExt;

const SELFTEST: &str = env!("CARGO_BIN_EXE_isorun-selftest");
const TIMEOUT: Duration = Duration::from_secs(60);

/// Run the self-test binary with a clean environment and no settings file
fn isorun(args: &[&str]) -> Output {
    isorun_in(args, &[])
}

fn isorun_in(args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(SELFTEST);
    command
        .args(args)
        .env("NO_COLOR", "1")
        .env("ISORUN_CONFIG", "/nonexistent/isorun.toml")
        .env_remove("ISORUN_FORMAT")
        .env_remove("ISORUN_JUNIT_XML")
        .env_remove("ISORUN_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn().expect("failed to start self-test binary");
    match child.wait_timeout(TIMEOUT).unwrap() {
        Some(_) => child.wait_with_output().unwrap(),
        None => {
            let _ = child.kill();
            panic!("isorun {:?} did not finish within {:?}", args, TIMEOUT);
        }
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_version_flag() {
    for flag in ["-v", "--version"] {
        let output = isorun(&[flag]);
        assert!(output.status.success());
        assert!(stdout(&output).contains("isorun 0.1.0"));
    }
}

#[test]
fn test_help_lists_flags() {
    let output = isorun(&["-h"]);
    assert!(output.status.success());

    let help = stdout(&output);
    for flag in [
        "--list",
        "--debug",
        "--color",
        "--no-color",
        "--rerun",
        "--no-rerun",
        "--timeout",
        "--no-timeout",
        "--pid",
        "--format",
        "--junit-xml",
        "--config",
    ] {
        assert!(help.contains(flag), "help is missing {}", flag);
    }
}

#[test]
fn test_usage_errors() {
    let output = isorun(&["--bogus"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--bogus"));

    let output = isorun(&["--debug"]);
    assert!(!output.status.success());
}

#[test]
fn test_list() {
    let output = isorun(&["--list", "math"]);
    assert!(output.status.success());

    let text = stderr(&output);
    assert!(text.contains("Test suites:\n"));
    assert!(text.contains("math: 1 tests\n"));
    assert!(text.contains("trace: 6 tests\n"));
    assert!(text.contains("Total: 15 tests.\n"));
    // Nothing ran
    assert!(!text.contains("Testing suite"));
}

#[test]
fn test_full_self_test_passes() {
    let output = isorun(&[]);
    let text = stderr(&output);
    assert!(output.status.success(), "{}", text);
    assert!(text.contains("Total: Passed 15/15 tests."));
    assert!(text.contains("Suite barrier: Passed 1/1 tests."));
    assert!(text.contains("✓ Success: lockstep rounds (parallel 8)"));
    assert!(!text.contains("\x1b["));
}

#[test]
fn test_pattern_selects_suite() {
    let output = isorun(&["math"]);
    let text = stderr(&output);
    assert!(output.status.success(), "{}", text);
    assert!(text.contains("Suite math: Passed 1/1 tests."));
    assert!(text.contains("Total: Passed 1/1 tests."));
    assert!(!text.contains("Testing suite trace"));

    let output = isorun(&["isolation:*mutation*"]);
    assert!(stderr(&output).contains("Total: Passed 2/2 tests."));
}

#[test]
fn test_color_flag_forces_color() {
    let output = isorun(&["-c", "math"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("\x1b["));
}

#[test]
fn test_pid_flag_prints_process_ids() {
    let output = isorun(&["--pid", "math"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("    Process id: "));
}

#[test]
fn test_invalid_pattern_is_fatal() {
    let output = isorun(&["math:["]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Fatal error: Failed to match pattern"));
}

#[test]
fn test_debug_without_match_is_fatal() {
    let output = isorun(&["--debug", "nosuch"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Fatal error: No test found for pattern: nosuch."));
}

#[test]
fn test_json_format() {
    let output = isorun(&["--format", "json", "math", "scope"]);
    assert!(output.status.success());

    let events: Vec<serde_json::Value> = stdout(&output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line is one JSON event"))
        .collect();

    assert_eq!(events[0]["event"], "run_start");
    assert_eq!(events[0]["suites"], 2);

    let finished: Vec<_> = events
        .iter()
        .filter(|e| e["event"] == "test_finished")
        .collect();
    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|e| e["status"] == "pass"));
    assert_eq!(finished[0]["suite"], "math");
    assert_eq!(finished[0]["test"], "add");

    let last = events.last().unwrap();
    assert_eq!(last["event"], "run_finished");
    assert_eq!(last["total"], 3);
    assert_eq!(last["failed"], 0);
}

#[test]
fn test_junit_report() {
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.xml");

    let output = isorun(&["--junit-xml", report.to_str().unwrap(), "math", "hooks"]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("JUnit report written to"));

    let xml = fs::read_to_string(&report).unwrap();
    assert!(xml.contains("<testsuites"));
    assert!(xml.contains(r#"tests="3""#));
    assert!(xml.contains(r#"failures="0""#));
    assert!(xml.contains(r#"<testcase name="add" classname="math""#));
    assert!(!xml.contains("<failure"));
}

fn write_settings(dir: &Path, contents: &str) -> String {
    let path = dir.join("isorun.toml");
    fs::write(&path, contents).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_settings_file_applies_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(dir.path(), "[options]\ncolor = true\npid = true\n");

    let output = isorun(&["--config", &path, "math"]);
    assert!(output.status.success());
    let text = stderr(&output);
    assert!(text.contains("\x1b["));
    assert!(text.contains("Process id: "));

    // Flags win over the file
    let output = isorun(&["--config", &path, "--no-color", "--no-pid", "math"]);
    let text = stderr(&output);
    assert!(!text.contains("\x1b["));
    assert!(!text.contains("Process id: "));
}

#[test]
fn test_settings_file_from_env_var() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(dir.path(), "[options]\npid = true\n");

    let output = isorun_in(&["math"], &[("ISORUN_CONFIG", &path)]);
    assert!(output.status.success());
    assert!(stderr(&output).contains("Process id: "));
}

#[test]
fn test_malformed_settings_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write_settings(dir.path(), "[options\n");

    let output = isorun(&["--config", &path, "math"]);
    assert!(output.status.success());
    let text = stderr(&output);
    assert!(text.contains("[config] Failed to parse"));
    assert!(text.contains("Total: Passed 1/1 tests."));
}
