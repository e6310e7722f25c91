//! Reporter Module: Trait-based output for Human (CLI) and Machine (JSON) formats
//!
//! ## Architecture
//!
//! - `Reporter` trait defines the event callbacks the runner emits
//! - `HumanReporter` renders progress lines to the shared [`Output`] sink
//! - `JsonReporter` outputs NDJSON to stdout (for `--format json`)
//! - `MultiReporter` broadcasts to several reporters
//!
//! ## Stdout Purity
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout. Test
//! processes, failure reports and debugger prompts all write to the
//! [`Output`] sink, which is stderr unless the caller chose otherwise.

use crate::output::{format_elapsed, style, Output, INDENT};
use crate::process::Outcome;
use crate::registry::Test;
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;

/// Machine-readable events for JSON output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent<'a> {
    RunStart {
        suites: usize,
    },
    SuiteStart {
        suite: &'a str,
    },
    TestStart {
        suite: &'a str,
        test: &'a str,
        id: u64,
    },
    TestFinished {
        suite: &'a str,
        test: &'a str,
        id: u64,
        status: &'a str, // "pass", "fail"
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SuiteFinished {
        suite: &'a str,
        passed: usize,
        total: usize,
    },
    RunFinished {
        passed: usize,
        failed: usize,
        total: usize,
        duration_ms: u64,
    },
    /// Fatal errors and interrupted runs
    Error {
        message: &'a str,
    },
}

/// Reporter trait for output abstraction
pub trait Reporter {
    /// Called at start of test run with the number of enabled suites
    fn on_run_start(&mut self, suites: usize);

    fn on_suite_start(&mut self, suite: &str);

    /// Called when a test begins execution
    fn on_test_start(&mut self, suite: &str, test: &Test);

    /// Called once the first attempt of a test is classified, before any rerun
    fn on_attempt_finished(&mut self, _suite: &str, _test: &Test, _outcome: &Outcome) {}

    /// Called before each debug-attach attempt of a test
    fn on_test_debug(&mut self, _suite: &str, _test: &Test) {}

    /// Called when a test completes; `outcome` is the first attempt's
    fn on_test_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome, elapsed: Duration);

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize);

    /// Called at end of test run
    fn on_run_finished(&mut self, passed: usize, total: usize, elapsed: Duration);

    /// Called on fatal error or when the run is interrupted
    fn on_error(&mut self, message: &str);
}

/// Human Reporter - renders readable progress to the output sink
pub struct HumanReporter<'a> {
    output: &'a Output,
}

impl<'a> HumanReporter<'a> {
    pub fn new(output: &'a Output) -> Self {
        Self { output }
    }

    fn unit_line(&self, mark: &str, label: &str, color: &'static str, test: &Test) -> io::Result<()> {
        let mut out = self.output.lock();
        let mark = out.paint(style::BOLD, out.paint(color, mark));
        let label = out.paint(color, label);
        let name = out.paint(style::DESC, &test.name);
        writeln!(out, "{} {}: {}", mark, label, name)?;
        out.flush()
    }
}

impl Reporter for HumanReporter<'_> {
    fn on_run_start(&mut self, _suites: usize) {}

    fn on_suite_start(&mut self, suite: &str) {
        let mut out = self.output.lock();
        let header = out.paint(style::BOLD, format!("Testing suite {}", suite));
        let _ = writeln!(out, "\n{}:", header);
        let _ = out.flush();
    }

    fn on_test_start(&mut self, _suite: &str, test: &Test) {
        let _ = self.unit_line("?", "Testing", style::MAYBE, test);
    }

    fn on_attempt_finished(&mut self, _suite: &str, _test: &Test, outcome: &Outcome) {
        if let Some(message) = outcome.message() {
            self.output.print(format_args!("{}{}\n", INDENT, message));
        }
    }

    fn on_test_debug(&mut self, _suite: &str, test: &Test) {
        let _ = self.unit_line(">", "Running", style::FAIL, test);
    }

    fn on_test_finished(&mut self, _suite: &str, test: &Test, outcome: &Outcome, elapsed: Duration) {
        let (mark, label, color) = if outcome.is_success() {
            ("✓", "Success", style::SUCCESS)
        } else {
            ("✕", "Failure", style::FAIL)
        };

        let mut out = self.output.lock();
        let mark = out.paint(style::BOLD, out.paint(color, mark));
        let label = out.paint(color, label);
        let name = out.paint(style::DESC, &test.name);
        let _ = writeln!(out, "{} {}: {} {}", mark, label, name, format_elapsed(elapsed));
        let _ = out.flush();
    }

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize) {
        let mut out = self.output.lock();
        let line = out.paint(
            style::BOLD,
            format!("Suite {}: Passed {}/{} tests.", suite, passed, total),
        );
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }

    fn on_run_finished(&mut self, passed: usize, total: usize, elapsed: Duration) {
        let mut out = self.output.lock();
        let line = out.paint(
            style::BOLD,
            format!("Total: Passed {}/{} tests.", passed, total),
        );
        let _ = writeln!(out, "\n{} {}", line, format_elapsed(elapsed));
        let _ = out.flush();
    }

    fn on_error(&mut self, message: &str) {
        let mut out = self.output.lock();
        let message = out.paint(style::FAIL, message);
        let _ = writeln!(out, "\n{}", message);
        let _ = out.flush();
    }
}

/// JSON Reporter - outputs NDJSON to stdout
pub struct JsonReporter<W: Write = io::Stdout> {
    writer: W,
}

impl JsonReporter {
    pub fn stdout() -> Self {
        Self {
            writer: io::stdout(),
        }
    }
}

impl<W: Write> JsonReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(&mut self, event: &MachineEvent<'_>) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let _ = writeln!(self.writer, "{}", line);
                let _ = self.writer.flush();
            }
            Err(e) => tracing::error!("failed to serialize event: {}", e),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn on_run_start(&mut self, suites: usize) {
        self.emit(&MachineEvent::RunStart { suites });
    }

    fn on_suite_start(&mut self, suite: &str) {
        self.emit(&MachineEvent::SuiteStart { suite });
    }

    fn on_test_start(&mut self, suite: &str, test: &Test) {
        self.emit(&MachineEvent::TestStart {
            suite,
            test: &test.name,
            id: test.id.0,
        });
    }

    fn on_test_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome, elapsed: Duration) {
        self.emit(&MachineEvent::TestFinished {
            suite,
            test: &test.name,
            id: test.id.0,
            status: if outcome.is_success() { "pass" } else { "fail" },
            duration_ms: millis(elapsed),
            message: outcome.message(),
        });
    }

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize) {
        self.emit(&MachineEvent::SuiteFinished {
            suite,
            passed,
            total,
        });
    }

    fn on_run_finished(&mut self, passed: usize, total: usize, elapsed: Duration) {
        self.emit(&MachineEvent::RunFinished {
            passed,
            failed: total - passed,
            total,
            duration_ms: millis(elapsed),
        });
    }

    fn on_error(&mut self, message: &str) {
        self.emit(&MachineEvent::Error { message });
    }
}

// =============================================================================
// MultiReporter
// =============================================================================

/// MultiReporter - broadcasts events to multiple reporters
pub struct MultiReporter<'a> {
    reporters: Vec<Box<dyn Reporter + 'a>>,
}

impl<'a> MultiReporter<'a> {
    pub fn new(reporters: Vec<Box<dyn Reporter + 'a>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter<'_> {
    fn on_run_start(&mut self, suites: usize) {
        for r in &mut self.reporters {
            r.on_run_start(suites);
        }
    }

    fn on_suite_start(&mut self, suite: &str) {
        for r in &mut self.reporters {
            r.on_suite_start(suite);
        }
    }

    fn on_test_start(&mut self, suite: &str, test: &Test) {
        for r in &mut self.reporters {
            r.on_test_start(suite, test);
        }
    }

    fn on_attempt_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome) {
        for r in &mut self.reporters {
            r.on_attempt_finished(suite, test, outcome);
        }
    }

    fn on_test_debug(&mut self, suite: &str, test: &Test) {
        for r in &mut self.reporters {
            r.on_test_debug(suite, test);
        }
    }

    fn on_test_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome, elapsed: Duration) {
        for r in &mut self.reporters {
            r.on_test_finished(suite, test, outcome, elapsed);
        }
    }

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize) {
        for r in &mut self.reporters {
            r.on_suite_finished(suite, passed, total);
        }
    }

    fn on_run_finished(&mut self, passed: usize, total: usize, elapsed: Duration) {
        for r in &mut self.reporters {
            r.on_run_finished(passed, total, elapsed);
        }
    }

    fn on_error(&mut self, message: &str) {
        for r in &mut self.reporters {
            r.on_error(message);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Capture;
    use crate::process::Failure;
    use crate::registry::TestId;
    use pretty_assertions::assert_eq;

    fn test_named(name: &str) -> Test {
        Test {
            id: TestId(3),
            index: 0,
            name: name.to_string(),
            threads: 1,
            timeout: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_json_event_serialization() {
        let event = MachineEvent::TestFinished {
            suite: "math",
            test: "add",
            id: 0,
            status: "pass",
            duration_ms: 42,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"test_finished\""));
        assert!(json.contains("\"test\":\"add\""));
        assert!(json.contains("\"status\":\"pass\""));
        assert!(!json.contains("message")); // skip_serializing_if = None
    }

    #[test]
    fn test_json_reporter_writes_one_line_per_event() {
        let mut reporter = JsonReporter::new(Vec::new());
        let test = test_named("add");
        reporter.on_run_start(1);
        reporter.on_test_finished(
            "math",
            &test,
            &Outcome::Failed(Failure::ExitCode(7)),
            Duration::from_millis(5),
        );
        reporter.on_run_finished(0, 1, Duration::from_millis(6));

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["status"], "fail");
        assert_eq!(lines[1]["message"], "Process exited with code 7.");
        assert_eq!(lines[2]["failed"], 1);
    }

    #[test]
    fn test_human_reporter_lines() {
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), false);
        let mut reporter = HumanReporter::new(&output);
        let test = test_named("add");

        reporter.on_suite_start("math");
        reporter.on_test_start("math", &test);
        reporter.on_attempt_finished("math", &test, &Outcome::Failed(Failure::ExitCode(7)));
        reporter.on_test_debug("math", &test);
        reporter.on_suite_finished("math", 0, 1);

        assert_eq!(
            capture.contents(),
            "\nTesting suite math:\n\
             ? Testing: add\n    \
             Process exited with code 7.\n\
             > Running: add\n\
             Suite math: Passed 0/1 tests.\n"
        );
    }

    #[test]
    fn test_human_reporter_result_lines() {
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), false);
        let mut reporter = HumanReporter::new(&output);
        let test = test_named("add");

        reporter.on_test_finished("math", &test, &Outcome::Passed, Duration::from_micros(1500));
        reporter.on_test_finished(
            "math",
            &test,
            &Outcome::Failed(Failure::AssertionFailed),
            Duration::from_millis(2500),
        );
        reporter.on_run_finished(1, 2, Duration::from_micros(250));

        assert_eq!(
            capture.contents(),
            "✓ Success: add (1.50ms)\n\
             ✕ Failure: add (2.50s)\n\
             \nTotal: Passed 1/2 tests. (250.00µs)\n"
        );
    }

    #[test]
    fn test_assertion_failure_prints_no_detail() {
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), false);
        let mut reporter = HumanReporter::new(&output);

        reporter.on_attempt_finished(
            "math",
            &test_named("add"),
            &Outcome::Failed(Failure::AssertionFailed),
        );
        assert_eq!(capture.contents(), "");
    }

    #[test]
    fn test_human_reporter_colors() {
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), true);
        HumanReporter::new(&output).on_test_start("math", &test_named("add"));

        let text = capture.contents();
        assert!(text.contains("\x1b[1m\x1b[35m?\x1b[0m\x1b[0m"));
        assert!(text.contains("\x1b[33madd\x1b[0m"));
    }

    #[test]
    fn test_multi_reporter_broadcasts() {
        let first = Capture::new();
        let second = Capture::new();
        let out_a = Output::new(Box::new(first.clone()), false);
        let out_b = Output::new(Box::new(second.clone()), false);

        let mut multi = MultiReporter::new(vec![
            Box::new(HumanReporter::new(&out_a)),
            Box::new(HumanReporter::new(&out_b)),
        ]);
        multi.on_suite_start("math");

        assert_eq!(first.contents(), second.contents());
        assert!(first.contents().contains("Testing suite math"));
    }
}
