//! End-to-end runs of in-process registries.
//!
//! Output goes to a temp file: forked test processes share its descriptor, so
//! failure reports printed by a child are visible to the test afterwards.

use isorun::pattern::Filter;
use isorun::process::{ExecOptions, Failure, Outcome};
use isorun::reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use isorun::trace::EINVAL;
use isorun::{fail_test, failure, verify, verify_eq, verify_err, verify_ok};
use isorun::{Fallible, Output, Registry, RunOptions, RunSummary, Runner, Suite, Test, TestSpec};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};

/// Records what the runner reported, shared with the test through an `Rc`
#[derive(Clone, Default)]
struct Recorder {
    finished: Rc<RefCell<Vec<(String, String, Outcome)>>>,
    suites: Rc<RefCell<Vec<(String, usize, usize)>>>,
}

impl Recorder {
    fn outcomes(&self) -> Vec<(String, String, Outcome)> {
        self.finished.borrow().clone()
    }

    fn outcome_of(&self, test: &str) -> Outcome {
        self.finished
            .borrow()
            .iter()
            .find(|(_, name, _)| name == test)
            .map(|(_, _, outcome)| outcome.clone())
            .unwrap_or_else(|| panic!("test {} was not reported", test))
    }
}

impl Reporter for Recorder {
    fn on_run_start(&mut self, _suites: usize) {}

    fn on_suite_start(&mut self, _suite: &str) {}

    fn on_test_start(&mut self, _suite: &str, _test: &Test) {}

    fn on_test_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome, _elapsed: Duration) {
        self.finished
            .borrow_mut()
            .push((suite.to_string(), test.name.clone(), outcome.clone()));
    }

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize) {
        self.suites
            .borrow_mut()
            .push((suite.to_string(), passed, total));
    }

    fn on_run_finished(&mut self, _passed: usize, _total: usize, _elapsed: Duration) {}

    fn on_error(&mut self, _message: &str) {}
}

struct Run {
    summary: RunSummary,
    recorder: Recorder,
    text: String,
}

fn run_with(registry: &Registry, patterns: &[&str], options: RunOptions) -> Run {
    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    let filter = Filter::new(patterns).unwrap();
    let recorder = Recorder::default();

    let summary = {
        let mut reporter = MultiReporter::new(vec![
            Box::new(HumanReporter::new(&output)),
            Box::new(recorder.clone()),
        ]);
        Runner::new(registry, &filter, &output, options)
            .run(&mut reporter)
            .unwrap()
    };

    Run {
        summary,
        recorder,
        text: fs::read_to_string(file.path()).unwrap(),
    }
}

fn run(registry: &Registry) -> Run {
    run_with(registry, &[], RunOptions::default())
}

fn single(suite: Suite) -> Registry {
    let mut registry = Registry::new();
    registry.register(suite).unwrap();
    registry
}

#[test]
fn test_passing_suite_end_to_end() {
    let registry = single(Suite::new("math").it("add", |t| verify_eq!(t, 1 + 1, 2)));

    let run = run(&registry);

    assert!(run.summary.success());
    assert_eq!(run.summary.tests, 1);
    assert_eq!(run.summary.passed, 1);
    assert!(run.text.contains("Testing suite math:"));
    assert!(run.text.contains("? Testing: add"));
    assert!(run.text.contains("✓ Success: add ("));
    assert!(run.text.contains("Suite math: Passed 1/1 tests."));
    assert!(run.text.contains("Total: Passed 1/1 tests."));
}

#[test]
fn test_failing_assertion_end_to_end() {
    let registry = single(Suite::new("math").it("add", |t| verify_eq!(t, 1 + 1, 3)));

    let run = run(&registry);

    assert!(!run.summary.success());
    assert_eq!(run.summary.failed(), 1);
    assert_eq!(
        run.recorder.outcome_of("add"),
        Outcome::Failed(Failure::AssertionFailed)
    );
    assert!(run
        .text
        .contains("    (eq) Expected 1 + 1 to equal 3 (3), but got 2.\n"));
    assert!(run.text.contains("    in rust_tests/runner_integration.rs:"));
    assert!(run.text.contains("✕ Failure: add ("));
    assert!(run.text.contains("Suite math: Passed 0/1 tests."));
    // Exit status 255 gets no "exited with code" line
    assert!(!run.text.contains("exited with code"));
}

#[test]
fn test_exit_code_and_signal_classified() {
    let registry = single(
        Suite::new("exits")
            .it("clean", |_| {})
            .it("seven", |_| std::process::exit(7))
            .it("abort", |_| std::process::abort()),
    );

    let run = run(&registry);

    assert_eq!(run.recorder.outcome_of("clean"), Outcome::Passed);
    assert_eq!(
        run.recorder.outcome_of("seven"),
        Outcome::Failed(Failure::ExitCode(7))
    );
    assert!(matches!(
        run.recorder.outcome_of("abort"),
        Outcome::Failed(Failure::Signaled(nix::sys::signal::Signal::SIGABRT))
    ));
    assert!(run.text.contains("    Process exited with code 7.\n"));
    assert!(run.text.contains("Process terminated by signal 6 (SIGABRT)."));
    assert_eq!(run.summary.passed, 1);
}

#[test]
fn test_timeout_kills_hanging_test() {
    let registry = single(Suite::new("slow").case(
        TestSpec::it("hang").with_timeout(Duration::from_millis(50)),
        |_| loop {
            thread::sleep(Duration::from_millis(10));
        },
    ));

    let run = run(&registry);

    assert_eq!(
        run.recorder.outcome_of("hang"),
        Outcome::Failed(Failure::TimedOut(Duration::from_millis(50)))
    );
    assert!(run.text.contains("Process timed out after 0.05s."));
    assert!(run.summary.elapsed < Duration::from_secs(2));
}

#[test]
fn test_timeout_not_enforced_when_disabled() {
    let registry = single(Suite::new("slow").case(
        TestSpec::it("late").with_timeout(Duration::from_millis(20)),
        |_| thread::sleep(Duration::from_millis(100)),
    ));

    let options = RunOptions {
        exec: ExecOptions {
            enforce_timeout: false,
            ..ExecOptions::default()
        },
        ..RunOptions::default()
    };
    let run = run_with(&registry, &[], options);

    assert!(run.summary.success());
}

fn filter_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            Suite::new("math")
                .it("add", |_| {})
                .it("sub", |_| {})
                .it("mul", |_| {}),
        )
        .unwrap();
    registry
        .register(Suite::new("strings").it("concat", |_| {}))
        .unwrap();
    registry
}

#[test]
fn test_patterns_select_tests() {
    let registry = filter_registry();

    let run = run_with(&registry, &["math:s*"], RunOptions::default());
    let names: Vec<String> = run.recorder.outcomes().into_iter().map(|(_, t, _)| t).collect();
    assert_eq!(names, vec!["sub"]);
    assert_eq!(run.summary.suites, 1);
    assert!(!run.text.contains("strings"));

    let run = run_with(&registry, &["strings", "math:[am]*"], RunOptions::default());
    let names: Vec<(String, String)> = run
        .recorder
        .outcomes()
        .into_iter()
        .map(|(s, t, _)| (s, t))
        .collect();
    assert_eq!(
        names,
        vec![
            ("math".to_string(), "add".to_string()),
            ("math".to_string(), "mul".to_string()),
            ("strings".to_string(), "concat".to_string()),
        ]
    );
}

#[test]
fn test_suite_pattern_is_exact() {
    let registry = filter_registry();

    let run = run_with(&registry, &["mat"], RunOptions::default());
    assert_eq!(run.summary.suites, 0);
    assert_eq!(run.summary.tests, 0);
    assert!(run.summary.success());
}

#[test]
fn test_registration_order_preserved() {
    let registry = filter_registry();

    let run = run(&registry);
    let names: Vec<String> = run.recorder.outcomes().into_iter().map(|(_, t, _)| t).collect();
    assert_eq!(names, vec!["add", "sub", "mul", "concat"]);
    assert_eq!(
        *run.recorder.suites.borrow(),
        vec![("math".to_string(), 3, 3), ("strings".to_string(), 1, 1)]
    );
    assert!(run.text.contains("Total: Passed 4/4 tests."));
}

#[test]
fn test_panic_is_a_failure() {
    let registry = single(Suite::new("panics").it("boom", |_| panic!("boom")));

    let run = run(&registry);

    assert_eq!(
        run.recorder.outcome_of("boom"),
        Outcome::Failed(Failure::AssertionFailed)
    );
    assert!(run.text.contains("    Panicked: boom.\n"));
    assert!(run.text.contains("    in rust_tests/runner_integration.rs:"));
}

#[test]
fn test_parallel_failure_on_one_thread() {
    let registry = single(Suite::new("threads").parallel("one gives up", 4, |t| {
        t.synchronize();
        if t.thread_index() == 2 {
            fail_test!(t, "thread {} gave up", t.thread_index());
        }
        t.synchronize();
    }));

    let run = run(&registry);

    assert_eq!(
        run.recorder.outcome_of("one gives up (parallel 4)"),
        Outcome::Failed(Failure::AssertionFailed)
    );
    assert!(run.text.contains("    thread 2 gave up.\n"));
}

#[test]
fn test_parallel_threads_meet_at_barrier() {
    static ARRIVED: AtomicUsize = AtomicUsize::new(0);

    let registry = single(Suite::new("threads").parallel("rounds", 6, |t| {
        for round in 1..=3 {
            ARRIVED.fetch_add(1, Ordering::SeqCst);
            t.synchronize();
            verify_eq!(t, ARRIVED.load(Ordering::SeqCst), round * 6);
            t.synchronize();
        }
    }));

    let run = run(&registry);
    assert!(run.summary.success(), "{}", run.text);
}

#[test]
fn test_hooks_wrap_every_test() {
    static BEFORE: AtomicUsize = AtomicUsize::new(0);

    let registry = single(
        Suite::new("hooks")
            .before_each(|_| {
                BEFORE.fetch_add(1, Ordering::SeqCst);
            })
            .after_each(|t| {
                if t.test().name == "breaks teardown" {
                    fail_test!(t, "teardown failed");
                }
            })
            .it("sees setup", |t| verify_eq!(t, BEFORE.load(Ordering::SeqCst), 1))
            .it("sees fresh setup", |t| verify_eq!(t, BEFORE.load(Ordering::SeqCst), 1))
            .it("breaks teardown", |_| {}),
    );

    let run = run(&registry);

    assert_eq!(run.recorder.outcome_of("sees setup"), Outcome::Passed);
    assert_eq!(run.recorder.outcome_of("sees fresh setup"), Outcome::Passed);
    assert_eq!(
        run.recorder.outcome_of("breaks teardown"),
        Outcome::Failed(Failure::AssertionFailed)
    );
    assert!(run.text.contains("    teardown failed.\n"));
    // Hooks ran in the children only
    assert_eq!(BEFORE.load(Ordering::SeqCst), 0);
}

#[test]
fn test_child_state_does_not_leak() {
    static TOUCHED: AtomicUsize = AtomicUsize::new(0);

    let registry = single(Suite::new("isolation").it("mutate", |t| {
        TOUCHED.store(99, Ordering::SeqCst);
        verify!(t, TOUCHED.load(Ordering::SeqCst) == 99);
    }));

    let run = run(&registry);
    assert!(run.summary.success());
    assert_eq!(TOUCHED.load(Ordering::SeqCst), 0);
}

fn lookup(key: &str) -> Fallible<u32> {
    if key != "answer" {
        failure!(EINVAL, "unknown key {}", key);
    }
    Ok(42)
}

#[test]
fn test_verify_ok_prints_trace() {
    let registry = single(Suite::new("trace").it("lookup", |t| {
        let value = verify_ok!(t, lookup("question"));
        verify_eq!(t, value, 42);
    }));

    let run = run(&registry);

    assert!(!run.summary.success());
    assert!(run
        .text
        .contains(&format!("    (result) Expected success of lookup(\"question\"), but got {}.", EINVAL)));
    assert!(run.text.contains("    at rust_tests/runner_integration.rs:"));
    assert!(run.text.contains("in runner_integration::lookup: unknown key question"));
}

#[test]
fn test_verify_err_consumes_expected_failure() {
    let registry = single(Suite::new("trace").it("expected then unexpected", |t| {
        verify_err!(t, lookup("expected"), EINVAL);
        verify_ok!(t, lookup("unexpected"));
    }));

    let run = run(&registry);

    assert!(!run.summary.success());
    assert!(run.text.contains("in runner_integration::lookup: unknown key unexpected"));
    assert!(!run.text.contains("unknown key expected"));
}

/// What the stand-in debugger does with the nth announced test process
#[derive(Debug, Clone, Copy)]
enum Attach {
    /// Let the stopped process run
    Continue,
    /// Press ctrl-c in the orchestrator
    Interrupt,
}

const ATTACH_DEADLINE: Duration = Duration::from_secs(10);

/// Pid of the `n`th "(pid N)" announcement in the output file, waiting for it
fn announced_pid(path: &Path, n: usize) -> Pid {
    let marker = "(pid ";
    let deadline = Instant::now() + ATTACH_DEADLINE;
    loop {
        let text = fs::read_to_string(path).unwrap();
        if let Some((start, _)) = text.match_indices(marker).nth(n) {
            let rest = &text[start + marker.len()..];
            if let Some(end) = rest.find(')') {
                return Pid::from_raw(rest[..end].parse().unwrap());
            }
        }
        assert!(Instant::now() < deadline, "no debug process #{} announced", n);
        thread::sleep(Duration::from_millis(5));
    }
}

fn wait_until_stopped(pid: Pid) {
    let stat = format!("/proc/{}/stat", pid);
    let deadline = Instant::now() + ATTACH_DEADLINE;
    loop {
        let text = fs::read_to_string(&stat).unwrap();
        let state = text.rsplit(')').next().unwrap().trim_start().chars().next();
        if state == Some('T') {
            return;
        }
        assert!(Instant::now() < deadline, "process {} never stopped", pid);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Play `script` against the debug processes announced in `path`, one action each
fn attach(path: PathBuf, script: Vec<Attach>) -> thread::JoinHandle<Vec<Pid>> {
    thread::spawn(move || {
        let mut pids = Vec::new();
        for (n, action) in script.into_iter().enumerate() {
            let pid = announced_pid(&path, n);
            wait_until_stopped(pid);
            match action {
                Attach::Continue => kill(pid, Signal::SIGCONT).unwrap(),
                Attach::Interrupt => kill(Pid::this(), Signal::SIGINT).unwrap(),
            }
            pids.push(pid);
        }
        pids
    })
}

fn is_gone(pid: Pid) -> bool {
    kill(pid, None) == Err(Errno::ESRCH)
}

fn rerun_options() -> RunOptions {
    RunOptions {
        rerun: true,
        ..RunOptions::default()
    }
}

// Every session here swaps the process-wide SIGINT action, so they run in sequence
#[test]
fn test_debug_workflow_sessions() {
    rerun_stops_once_debugged_run_passes();
    rerun_restarts_until_aborted();
    debug_mode_loops_until_aborted();
}

fn rerun_stops_once_debugged_run_passes() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("attempted");
    let registry = single(Suite::new("rerun").it("once", move |t| {
        if !marker.exists() {
            fs::write(&marker, b"").unwrap();
            fail_test!(t, "first attempt");
        }
    }));

    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    let filter = Filter::default();
    let debugger = attach(file.path().to_path_buf(), vec![Attach::Continue]);

    let summary = Runner::new(&registry, &filter, &output, rerun_options())
        .run(&mut HumanReporter::new(&output))
        .unwrap();
    let pids = debugger.join().unwrap();
    let text = fs::read_to_string(file.path()).unwrap();

    assert_eq!(text.matches("Waiting for debugger to attach").count(), 1, "{}", text);
    assert!(text.contains("    first attempt.\n"));
    assert!(text.contains("> Running: once\n"));
    assert!(!text.contains("Restarting test."));
    // The first attempt decides the result
    assert!(text.contains("✕ Failure: once ("));
    assert_eq!((summary.tests, summary.passed), (1, 0));
    assert!(pids.iter().all(|&pid| is_gone(pid)));
}

fn rerun_restarts_until_aborted() {
    let registry = single(
        Suite::new("stubborn")
            .it("always fails", |t| fail_test!(t, "still broken"))
            .it("after", |_| {}),
    );

    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    let filter = Filter::default();
    let debugger = attach(
        file.path().to_path_buf(),
        vec![Attach::Continue, Attach::Interrupt],
    );

    let summary = Runner::new(&registry, &filter, &output, rerun_options())
        .run(&mut HumanReporter::new(&output))
        .unwrap();
    let pids = debugger.join().unwrap();
    let text = fs::read_to_string(file.path()).unwrap();

    assert_eq!(text.matches("Waiting for debugger to attach").count(), 2, "{}", text);
    assert_eq!(text.matches("Test process exited. Restarting test.").count(), 1);
    assert!(text.contains("\r    Waiting aborted by user.\n"));
    assert!(text.contains("✕ Failure: always fails ("));
    // The run moved on after the abort
    assert!(text.contains("✓ Success: after ("));
    assert_eq!((summary.tests, summary.passed), (2, 1));
    assert!(!summary.interrupted);
    assert!(pids.iter().all(|&pid| is_gone(pid)));
}

fn debug_mode_loops_until_aborted() {
    let registry = filter_registry();
    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    let filter = Filter::default();
    let debugger = attach(
        file.path().to_path_buf(),
        vec![Attach::Continue, Attach::Continue, Attach::Interrupt],
    );

    Runner::new(&registry, &filter, &output, RunOptions::default())
        .debug("math:s*", &mut HumanReporter::new(&output))
        .unwrap();
    let pids = debugger.join().unwrap();
    let text = fs::read_to_string(file.path()).unwrap();

    // A passing debugged run restarts too, only ctrl-c ends the loop
    assert_eq!(text.matches("> Running: sub\n").count(), 3, "{}", text);
    assert_eq!(text.matches("Test process exited. Restarting test.").count(), 2);
    assert!(text.contains("\r    Waiting aborted by user.\n"));
    assert!(!text.contains("add"));
    assert_eq!(pids.len(), 3);
    assert!(pids.iter().all(|&pid| is_gone(pid)));
}

#[test]
fn test_json_reporter_end_to_end() {
    let registry = filter_registry();
    let file = NamedTempFile::new().unwrap();
    let output = Output::new(Box::new(file.reopen().unwrap()), false);
    let filter = Filter::default();
    let mut reporter = JsonReporter::new(Vec::new());

    let summary = Runner::new(&registry, &filter, &output, RunOptions::default())
        .run(&mut reporter)
        .unwrap();
    assert!(summary.success());

    let text = String::from_utf8(reporter.into_inner()).unwrap();
    let events: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(events.first().unwrap()["event"], "run_start");
    assert_eq!(events.last().unwrap()["event"], "run_finished");
    assert_eq!(events.last().unwrap()["passed"], 4);
    let finished = events
        .iter()
        .filter(|e| e["event"] == "test_finished")
        .count();
    assert_eq!(finished, 4);
}
