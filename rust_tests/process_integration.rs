//! Execution engine and debug workflow against real child processes

use isorun::debugger::{debug_unit, DebugOutcome};
use isorun::process::{self, execute, kill_process, ExecOptions, Failure, Launch, Outcome, Unit};
use isorun::{verify_eq, Output, Registry, Suite, TestSpec};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            Suite::new("proc")
                .it("pass", |_| {})
                .it("assert", |t| verify_eq!(t, 2 * 2, 5))
                .it("exit", |_| std::process::exit(7))
                .it("abort", |_| std::process::abort())
                .case(
                    TestSpec::it("hang").with_timeout(Duration::from_millis(50)),
                    |_| loop {
                        thread::sleep(Duration::from_millis(10));
                    },
                )
                .parallel("barrier", 4, |t| {
                    let first = t.synchronize();
                    let second = t.synchronize();
                    verify_eq!(t, second, first + 1);
                }),
        )
        .unwrap();
    registry
}

fn sink() -> (NamedTempFile, Output) {
    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    (file, output)
}

fn outcome_of(registry: &Registry, test: &str, options: ExecOptions) -> Outcome {
    let suite = registry.suite("proc").unwrap();
    let test = suite.tests().iter().find(|t| t.name == test).unwrap();
    let (_file, output) = sink();
    execute(&Unit::new(suite, test), &output, options).outcome
}

fn is_gone(pid: Pid) -> bool {
    kill(pid, None) == Err(Errno::ESRCH)
}

#[test]
fn test_execute_classifies_outcomes() {
    let registry = registry();
    let options = ExecOptions::default();

    assert_eq!(outcome_of(&registry, "pass", options), Outcome::Passed);
    assert_eq!(
        outcome_of(&registry, "assert", options),
        Outcome::Failed(Failure::AssertionFailed)
    );
    assert_eq!(
        outcome_of(&registry, "exit", options),
        Outcome::Failed(Failure::ExitCode(7))
    );
    assert_eq!(
        outcome_of(&registry, "abort", options),
        Outcome::Failed(Failure::Signaled(Signal::SIGABRT))
    );
    assert_eq!(
        outcome_of(&registry, "barrier (parallel 4)", options),
        Outcome::Passed
    );
}

#[test]
fn test_timeout_kills_and_reaps() {
    let registry = registry();
    let suite = registry.suite("proc").unwrap();
    let test = suite.tests().iter().find(|t| t.name == "hang").unwrap();
    let (file, output) = sink();

    let start = Instant::now();
    let attempt = execute(
        &Unit::new(suite, test),
        &output,
        ExecOptions {
            print_pid: true,
            ..ExecOptions::default()
        },
    );

    assert_eq!(
        attempt.outcome,
        Outcome::Failed(Failure::TimedOut(Duration::from_millis(50)))
    );
    assert!(start.elapsed() < Duration::from_secs(2));

    let pid = attempt.pid.unwrap();
    assert!(is_gone(pid));

    let text = fs::read_to_string(file.path()).unwrap();
    assert!(text.contains(&format!("    Process id: {}\n", pid)));
}

#[test]
fn test_kill_suspended_process() {
    let registry = registry();
    let suite = registry.suite("proc").unwrap();
    let test = &suite.tests()[0];
    let (file, output) = sink();

    let pid = process::spawn(&Unit::new(suite, test), &output, Launch::Suspended).unwrap();
    kill_process(pid, &output).unwrap();
    assert!(is_gone(pid));

    // Killing again fails at the first step and says so
    assert_eq!(kill_process(pid, &output), Err(Errno::ESRCH));
    let text = fs::read_to_string(file.path()).unwrap();
    assert!(text.contains("    Failed to continue process ("));
}

#[test]
fn test_run_unit_in_process() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    static HOOKS: AtomicUsize = AtomicUsize::new(0);

    let mut registry = Registry::new();
    registry
        .register(
            Suite::new("inline")
                .before_each(|_| {
                    HOOKS.fetch_add(1, Ordering::SeqCst);
                })
                .after_each(|_| {
                    HOOKS.fetch_add(1, Ordering::SeqCst);
                })
                .parallel("count", 3, |t| {
                    RUNS.fetch_add(1, Ordering::SeqCst);
                    t.synchronize();
                    verify_eq!(t, RUNS.load(Ordering::SeqCst), 3);
                }),
        )
        .unwrap();

    let suite = registry.suite("inline").unwrap();
    let (_file, output) = sink();
    process::run_unit(suite, &suite.tests()[0], &output);

    assert_eq!(RUNS.load(Ordering::SeqCst), 3);
    assert_eq!(HOOKS.load(Ordering::SeqCst), 2);
}

/// Poll the output file until the debug workflow printed the child's pid
fn wait_for_pid(path: &Path) -> Pid {
    let marker = "(pid ";
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = fs::read_to_string(path).unwrap();
        if let Some(start) = text.rfind(marker) {
            let rest = &text[start + marker.len()..];
            if let Some(end) = rest.find(')') {
                return Pid::from_raw(rest[..end].parse().unwrap());
            }
        }
        assert!(Instant::now() < deadline, "debug process never announced its pid");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wait until `pid` has stopped itself, so a SIGCONT cannot arrive before its SIGSTOP
fn wait_until_stopped(pid: Pid) {
    let stat = format!("/proc/{}/stat", pid);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let text = fs::read_to_string(&stat).unwrap();
        // The state follows the parenthesized command name
        let state = text.rsplit(')').next().unwrap().trim_start().chars().next();
        if state == Some('T') {
            return;
        }
        assert!(Instant::now() < deadline, "process {} never stopped", pid);
        thread::sleep(Duration::from_millis(5));
    }
}

// Both sessions live in one test: the second one interrupts this very process
#[test]
fn test_debug_sessions() {
    let registry = registry();
    let suite = registry.suite("proc").unwrap();
    let test = &suite.tests()[0];

    // A "debugger" continues the stopped child
    let (file, output) = sink();
    let path = file.path().to_path_buf();
    let attacher = thread::spawn(move || {
        let pid = wait_for_pid(&path);
        wait_until_stopped(pid);
        kill(pid, Signal::SIGCONT).unwrap();
        pid
    });
    let outcome = debug_unit(&Unit::new(suite, test), &output);
    let pid = attacher.join().unwrap();
    assert_eq!(outcome, DebugOutcome::Exited(Outcome::Passed));
    assert!(outcome.should_restart());
    assert!(is_gone(pid));

    // ctrl-c while waiting
    let (file, output) = sink();
    let path = file.path().to_path_buf();
    let interrupter = thread::spawn(move || {
        let pid = wait_for_pid(&path);
        kill(Pid::this(), Signal::SIGINT).unwrap();
        pid
    });
    let outcome = debug_unit(&Unit::new(suite, test), &output);
    let pid = interrupter.join().unwrap();
    assert_eq!(outcome, DebugOutcome::Aborted);
    assert!(!outcome.should_restart());
    assert!(is_gone(pid));

    let text = fs::read_to_string(file.path()).unwrap();
    assert!(text.contains("    Waiting for debugger to attach, press ctrl-c to abort... (pid "));
    assert!(text.contains("\r    Waiting aborted by user.\n"));
}
