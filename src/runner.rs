//! Run orchestrator
//!
//! Walks the registry in registration order, runs every enabled test in its
//! own process one at a time, and accumulates per-suite and global counts.
//! Failed tests can be handed to the debug-attach workflow before the run
//! moves on.

use crate::debugger::{self, DebugOutcome};
use crate::error::{HarnessError, HarnessResult};
use crate::output::{style, Output, INDENT};
use crate::pattern::{Filter, Pattern};
use crate::process::{self, ExecOptions, Failure, Outcome, Unit};
use crate::registry::{RegisteredSuite, Registry, Test};
use crate::reporter::Reporter;
use crate::signals;
use std::io::Write;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Offer the debug-attach workflow for every failed test
    pub rerun: bool,
    pub exec: ExecOptions,
}

/// Totals of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub suites: usize,
    pub tests: usize,
    pub passed: usize,
    /// Shutdown was requested before every enabled test ran
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.tests - self.passed
    }

    /// True only if every test that ran passed and none were skipped by a shutdown
    pub fn success(&self) -> bool {
        self.passed == self.tests && !self.interrupted
    }
}

struct SuiteTally {
    passed: usize,
    total: usize,
    interrupted: bool,
}

pub struct Runner<'a> {
    registry: &'a Registry,
    filter: &'a Filter,
    output: &'a Output,
    options: RunOptions,
}

impl<'a> Runner<'a> {
    pub fn new(registry: &'a Registry, filter: &'a Filter, output: &'a Output, options: RunOptions) -> Self {
        Self {
            registry,
            filter,
            output,
            options,
        }
    }

    fn enabled_suites(&self) -> impl Iterator<Item = &'a RegisteredSuite> + 'a {
        let filter = self.filter;
        self.registry
            .suites()
            .iter()
            .filter(move |suite| filter.is_suite_enabled(suite.name()))
    }

    fn enabled_tests(&self, suite: &'a RegisteredSuite) -> HarnessResult<Vec<&'a Test>> {
        let mut tests = Vec::with_capacity(suite.tests().len());
        for test in suite.tests() {
            if self.filter.is_test_enabled(suite.name(), &test.name)? {
                tests.push(test);
            }
        }
        Ok(tests)
    }

    /// Run every enabled test and report progress to `reporter`
    pub fn run(&self, reporter: &mut dyn Reporter) -> HarnessResult<RunSummary> {
        let start = Instant::now();
        let suites: Vec<&RegisteredSuite> = self.enabled_suites().collect();
        let mut summary = RunSummary::default();

        tracing::debug!(suites = suites.len(), options = ?self.options, "starting run");
        reporter.on_run_start(suites.len());

        for suite in suites {
            let tests = self.enabled_tests(suite)?;
            let tally = self.run_suite(suite, &tests, reporter);

            summary.suites += 1;
            summary.tests += tally.total;
            summary.passed += tally.passed;

            if tally.interrupted {
                summary.interrupted = true;
                reporter.on_error("Run interrupted, remaining tests were not run.");
                break;
            }
        }

        summary.elapsed = start.elapsed();
        reporter.on_run_finished(summary.passed, summary.tests, summary.elapsed);
        Ok(summary)
    }

    fn run_suite(&self, suite: &RegisteredSuite, tests: &[&Test], reporter: &mut dyn Reporter) -> SuiteTally {
        let mut tally = SuiteTally {
            passed: 0,
            total: 0,
            interrupted: false,
        };

        reporter.on_suite_start(suite.name());

        for test in tests {
            if signals::shutdown_requested() {
                tally.interrupted = true;
                break;
            }

            tally.total += 1;
            if self.run_test(suite, test, reporter).is_success() {
                tally.passed += 1;
            }
        }

        reporter.on_suite_finished(suite.name(), tally.passed, tally.total);
        tally
    }

    fn run_test(&self, suite: &RegisteredSuite, test: &Test, reporter: &mut dyn Reporter) -> Outcome {
        let unit = Unit::new(suite, test);
        reporter.on_test_start(suite.name(), test);

        let attempt = process::execute(&unit, self.output, self.options.exec);
        reporter.on_attempt_finished(suite.name(), test, &attempt.outcome);

        let rerun = match attempt.outcome.failure() {
            None | Some(Failure::Interrupted) => false,
            Some(_) => self.options.rerun,
        };
        if rerun {
            self.rerun(&unit, reporter);
        }

        reporter.on_test_finished(suite.name(), test, &attempt.outcome, unit.elapsed());
        attempt.outcome
    }

    /// Offer the debug-attach workflow until the user gives up or a debugged run passes
    fn rerun(&self, unit: &Unit<'_>, reporter: &mut dyn Reporter) {
        while !signals::shutdown_requested() {
            reporter.on_test_debug(unit.suite.name(), unit.test);

            match debugger::debug_unit(unit, self.output) {
                DebugOutcome::Exited(outcome) if outcome.is_success() => return,
                outcome if outcome.should_restart() => {
                    self.output
                        .print(format_args!("{}Test process exited. Restarting test.\n", INDENT));
                }
                _ => return,
            }
        }
    }

    /// First (suite, test) in registration order matched by `pattern`
    pub fn find(&self, pattern: &Pattern) -> HarnessResult<Option<(&'a RegisteredSuite, &'a Test)>> {
        for suite in self.registry.suites() {
            if !pattern.matches_suite(suite.name()) {
                continue;
            }
            for test in suite.tests() {
                if pattern.matches_test(&test.name)? {
                    return Ok(Some((suite, test)));
                }
            }
        }
        Ok(None)
    }

    /// Run the first test matching `raw` under the debug-attach workflow
    /// until the user aborts
    pub fn debug(&self, raw: &str, reporter: &mut dyn Reporter) -> HarnessResult<()> {
        let pattern = Pattern::parse(raw)?;
        let (suite, test) = self
            .find(&pattern)?
            .ok_or_else(|| HarnessError::NoMatchingTest(raw.to_string()))?;

        let unit = Unit::new(suite, test);
        loop {
            reporter.on_test_debug(suite.name(), test);

            let outcome = debugger::debug_unit(&unit, self.output);
            if !outcome.should_restart() {
                tracing::debug!(?outcome, "debug session ended");
                return Ok(());
            }
            self.output
                .print(format_args!("{}Test process exited. Restarting test.\n", INDENT));
        }
    }

    /// Print every registered suite with its test count
    pub fn list(&self) {
        let mut out = self.output.lock();
        let header = out.paint(style::BOLD, "Test suites:");
        let _ = writeln!(out, "\n{}", header);

        for suite in self.registry.suites() {
            let name = out.paint(style::DESC, format!("{}:", suite.name()));
            let _ = writeln!(out, "{} {} tests", name, suite.tests().len());
        }

        let total = out.paint(
            style::BOLD,
            format!("Total: {} tests.", self.registry.test_count()),
        );
        let _ = writeln!(out, "\n{}", total);
        let _ = out.flush();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TestContext;
    use crate::output::Capture;
    use crate::registry::Suite;
    use pretty_assertions::assert_eq;

    fn noop(_: &TestContext<'_>) {}

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Suite::new("math").it("add", noop).it("sub", noop))
            .unwrap();
        registry
            .register(Suite::new("strings").it("concat", noop))
            .unwrap();
        registry
    }

    #[test]
    fn test_list_output() {
        let registry = registry();
        let filter = Filter::new::<&str>(&[]).unwrap();
        let capture = Capture::new();
        let output = Output::new(Box::new(capture.clone()), false);

        Runner::new(&registry, &filter, &output, RunOptions::default()).list();

        assert_eq!(
            capture.contents(),
            "\nTest suites:\nmath: 2 tests\nstrings: 1 tests\n\nTotal: 3 tests.\n"
        );
    }

    #[test]
    fn test_find_first_match_in_registration_order() {
        let registry = registry();
        let filter = Filter::new::<&str>(&[]).unwrap();
        let output = Output::new(Box::new(Capture::new()), false);
        let runner = Runner::new(&registry, &filter, &output, RunOptions::default());

        let (suite, test) = runner
            .find(&Pattern::parse("math:*").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(suite.name(), "math");
        assert_eq!(test.name, "add");

        let (_, test) = runner
            .find(&Pattern::parse("math:s?b").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(test.name, "sub");

        assert!(runner
            .find(&Pattern::parse("nope").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_debug_without_match_is_fatal() {
        let registry = registry();
        let filter = Filter::new::<&str>(&[]).unwrap();
        let output = Output::new(Box::new(Capture::new()), false);
        let runner = Runner::new(&registry, &filter, &output, RunOptions::default());
        let mut reporter = crate::reporter::HumanReporter::new(&output);

        let err = runner.debug("math:mul", &mut reporter).unwrap_err();
        assert!(matches!(err, HarnessError::NoMatchingTest(p) if p == "math:mul"));
    }

    #[test]
    fn test_summary_success() {
        let mut summary = RunSummary {
            suites: 1,
            tests: 2,
            passed: 2,
            ..RunSummary::default()
        };
        assert!(summary.success());
        assert_eq!(summary.failed(), 0);

        summary.interrupted = true;
        assert!(!summary.success());

        summary.interrupted = false;
        summary.passed = 1;
        assert!(!summary.success());
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_empty_run_succeeds() {
        let registry = Registry::new();
        let filter = Filter::new::<&str>(&[]).unwrap();
        let output = Output::new(Box::new(Capture::new()), false);
        let mut reporter = crate::reporter::HumanReporter::new(&output);

        let summary = Runner::new(&registry, &filter, &output, RunOptions::default())
            .run(&mut reporter)
            .unwrap();
        assert_eq!(summary.tests, 0);
        assert!(summary.success());
    }
}
