//! JUnit XML Reporter for CI Integration
//!
//! Generates JUnit-compatible XML reports for Jenkins, GitLab CI, and GitHub
//! Actions. Each harness suite becomes one `<testsuite>` element.

use crate::error::{HarnessError, HarnessResult};
use crate::output::{Output, INDENT};
use crate::process::Outcome;
use crate::registry::Test;
use crate::reporter::Reporter;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Strip ANSI color codes and NUL bytes, neither is valid in XML text
fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI sequences end with a letter
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            result.push(c);
        }
    }
    result
}

// =============================================================================
// XML Schema Structs (JUnit Format)
// =============================================================================

#[derive(Serialize)]
#[serde(rename = "testsuites")]
struct TestSuites {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testsuite")]
    suites: Vec<SuiteElement>,
    #[serde(rename = "system-err", skip_serializing_if = "Option::is_none")]
    system_err: Option<String>,
}

#[derive(Serialize)]
struct SuiteElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testcase")]
    cases: Vec<CaseElement>,
}

#[derive(Serialize)]
struct CaseElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@classname")]
    classname: String,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureElement>,
}

#[derive(Serialize)]
struct FailureElement {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    body: String,
}

// =============================================================================
// JunitReporter
// =============================================================================

/// Reporter that buffers results and writes JUnit XML on completion
pub struct JunitReporter<'a> {
    output_path: PathBuf,
    output: &'a Output,
    suites: Vec<SuiteElement>,
    suite_start: Instant,
    error_message: Option<String>,
}

impl<'a> JunitReporter<'a> {
    pub fn new(path: PathBuf, output: &'a Output) -> Self {
        Self {
            output_path: path,
            output,
            suites: Vec::new(),
            suite_start: Instant::now(),
            error_message: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.output_path
    }

    fn render(&mut self, passed: usize, total: usize, elapsed: Duration) -> HarnessResult<String> {
        let root = TestSuites {
            name: "isorun".to_string(),
            tests: total,
            failures: total - passed,
            time: elapsed.as_secs_f64(),
            suites: std::mem::take(&mut self.suites),
            system_err: self.error_message.take(),
        };

        let xml = quick_xml::se::to_string(&root).map_err(|e| {
            HarnessError::Report {
                path: self.output_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }
        })?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n", xml))
    }

    fn write(&self, document: &str) -> HarnessResult<()> {
        let report_error = |source| HarnessError::Report {
            path: self.output_path.clone(),
            source,
        };

        let file = File::create(&self.output_path).map_err(report_error)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(document.as_bytes()).map_err(report_error)?;
        writer.flush().map_err(report_error)
    }
}

impl Reporter for JunitReporter<'_> {
    fn on_run_start(&mut self, _suites: usize) {
        self.suites.clear();
        self.error_message = None;
    }

    fn on_suite_start(&mut self, suite: &str) {
        self.suite_start = Instant::now();
        self.suites.push(SuiteElement {
            name: suite.to_string(),
            tests: 0,
            failures: 0,
            errors: 0,
            time: 0.0,
            cases: Vec::new(),
        });
    }

    fn on_test_start(&mut self, _suite: &str, _test: &Test) {
        // JUnit has no start event, results are buffered
    }

    fn on_test_finished(&mut self, suite: &str, test: &Test, outcome: &Outcome, elapsed: Duration) {
        let failure = outcome.failure().map(|failure| FailureElement {
            message: "Test failed".to_string(),
            body: strip_ansi_codes(&failure.to_string()),
        });

        let case = CaseElement {
            name: test.name.clone(),
            classname: suite.to_string(),
            time: elapsed.as_secs_f64(),
            failure,
        };

        match self.suites.last_mut() {
            Some(element) if element.name == suite => element.cases.push(case),
            _ => tracing::warn!(suite, test = %test.name, "test finished outside of its suite"),
        }
    }

    fn on_suite_finished(&mut self, suite: &str, passed: usize, total: usize) {
        if let Some(element) = self.suites.last_mut().filter(|e| e.name == suite) {
            element.tests = total;
            element.failures = total - passed;
            element.time = self.suite_start.elapsed().as_secs_f64();
        }
    }

    fn on_run_finished(&mut self, passed: usize, total: usize, elapsed: Duration) {
        let result = self
            .render(passed, total, elapsed)
            .and_then(|document| self.write(&document));

        match result {
            Ok(()) => self.output.print(format_args!(
                "JUnit report written to {}\n",
                self.output_path.display()
            )),
            Err(e) => self.output.print(format_args!("{}{}.\n", INDENT, e)),
        }
    }

    fn on_error(&mut self, message: &str) {
        self.error_message = Some(message.to_string());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Capture;
    use crate::process::Failure;
    use crate::registry::TestId;

    fn test_named(name: &str) -> Test {
        Test {
            id: TestId(0),
            index: 0,
            name: name.to_string(),
            threads: 1,
            timeout: Duration::from_secs(2),
        }
    }

    fn sink() -> Output {
        Output::new(Box::new(Capture::new()), false)
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[31mRed text\x1b[0m"), "Red text");
        assert_eq!(strip_ansi_codes("plain text"), "plain text");
        assert_eq!(strip_ansi_codes("\x1b[1;31;40mColored\x1b[0m normal"), "Colored normal");
        assert_eq!(strip_ansi_codes("text\0with\0nulls"), "textwithnulls");
    }

    #[test]
    fn test_cases_grouped_by_suite() {
        let output = sink();
        let mut reporter = JunitReporter::new(PathBuf::from("/tmp/unused.xml"), &output);

        reporter.on_run_start(2);
        reporter.on_suite_start("math");
        reporter.on_test_finished("math", &test_named("add"), &Outcome::Passed, Duration::from_millis(3));
        reporter.on_suite_finished("math", 1, 1);
        reporter.on_suite_start("io");
        reporter.on_test_finished(
            "io",
            &test_named("read"),
            &Outcome::Failed(Failure::ExitCode(7)),
            Duration::from_millis(1500),
        );
        reporter.on_suite_finished("io", 0, 1);

        assert_eq!(reporter.suites.len(), 2);
        assert_eq!(reporter.suites[0].cases[0].classname, "math");
        assert!(reporter.suites[0].cases[0].failure.is_none());

        let io = &reporter.suites[1];
        assert_eq!(io.failures, 1);
        assert!((io.cases[0].time - 1.5).abs() < 0.001);
        assert_eq!(
            io.cases[0].failure.as_ref().unwrap().body,
            "Process exited with code 7."
        );
    }

    #[test]
    fn test_run_finished_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        let output = sink();
        let mut reporter = JunitReporter::new(path.clone(), &output);

        reporter.on_run_start(1);
        reporter.on_suite_start("math");
        reporter.on_test_finished(
            "math",
            &test_named("add"),
            &Outcome::Failed(Failure::AssertionFailed),
            Duration::from_millis(1),
        );
        reporter.on_suite_finished("math", 0, 1);
        reporter.on_run_finished(0, 1, Duration::from_millis(2));

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<testsuite name=\"math\""));
        assert!(xml.contains("<testcase name=\"add\" classname=\"math\""));
        assert!(xml.contains("<failure message=\"Test failed\">Assertion failed.</failure>"));
        assert!(!xml.contains("system-err"));
    }

    #[test]
    fn test_run_start_clears_state() {
        let output = sink();
        let mut reporter = JunitReporter::new(PathBuf::from("/tmp/unused.xml"), &output);
        reporter.on_suite_start("math");
        reporter.on_error("interrupted");

        reporter.on_run_start(0);
        assert!(reporter.suites.is_empty());
        assert!(reporter.error_message.is_none());
    }
}
