//! Suite registry
//!
//! Suites are registered explicitly by the test program before the run starts.
//! Registration asks a suite for its test descriptors exactly once and assigns
//! each test an id from a counter shared by every suite in the registry.

use crate::context::TestContext;
use crate::error::{HarnessError, HarnessResult};
use std::fmt;
use std::time::Duration;

/// Timeout for tests that do not set their own
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Test descriptor emitted by a suite
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub name: String,
    pub threads: u16,
    pub timeout: Duration,
}

impl TestSpec {
    pub fn it(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: 1,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// A test run by `threads` threads at once; the thread count becomes part of its name
    pub fn parallel(name: impl Into<String>, threads: u16) -> Self {
        Self {
            name: format!("{} (parallel {})", name.into(), threads),
            threads,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_threads(mut self, threads: u16) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(pub u64);

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered test. Immutable once the registry hands it out.
#[derive(Debug, Clone)]
pub struct Test {
    pub id: TestId,
    /// Position within the owning suite, in registration order
    pub index: usize,
    pub name: String,
    pub threads: u16,
    pub timeout: Duration,
}

/// A group of tests sharing before/after hooks.
///
/// `tests` describes the suite and is called once at registration;
/// `execute` runs one of those tests inside its isolated process. With more
/// than one thread, `execute` is called concurrently from every thread.
pub trait TestSuite: Send + Sync {
    fn name(&self) -> &str;

    fn tests(&self) -> Vec<TestSpec>;

    fn execute(&self, test: &Test, ctx: &TestContext<'_>);

    fn before_each(&self, _ctx: &TestContext<'_>) {}

    fn after_each(&self, _ctx: &TestContext<'_>) {}
}

type Body = Box<dyn Fn(&TestContext<'_>) + Send + Sync>;

/// Closure-backed [`TestSuite`]
///
/// ```ignore
/// let suite = Suite::new("math")
///     .it("add", |t| verify_eq!(t, 1 + 1, 2))
///     .parallel("counter", 4, |t| { t.synchronize(); });
/// ```
pub struct Suite {
    name: String,
    cases: Vec<(TestSpec, Body)>,
    before_each: Option<Body>,
    after_each: Option<Body>,
}

impl Suite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cases: Vec::new(),
            before_each: None,
            after_each: None,
        }
    }

    pub fn case<F>(mut self, spec: TestSpec, body: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        self.cases.push((spec, Box::new(body)));
        self
    }

    pub fn it<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        self.case(TestSpec::it(name), body)
    }

    pub fn test<F>(self, name: impl Into<String>, timeout: Duration, threads: u16, body: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        let spec = TestSpec::it(name)
            .with_timeout(timeout)
            .with_threads(threads);
        self.case(spec, body)
    }

    pub fn parallel<F>(self, name: impl Into<String>, threads: u16, body: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        self.case(TestSpec::parallel(name, threads), body)
    }

    pub fn before_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        self.before_each = Some(Box::new(hook));
        self
    }

    pub fn after_each<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestContext<'_>) + Send + Sync + 'static,
    {
        self.after_each = Some(Box::new(hook));
        self
    }
}

impl TestSuite for Suite {
    fn name(&self) -> &str {
        &self.name
    }

    fn tests(&self) -> Vec<TestSpec> {
        self.cases.iter().map(|(spec, _)| spec.clone()).collect()
    }

    fn execute(&self, test: &Test, ctx: &TestContext<'_>) {
        if let Some((_, body)) = self.cases.get(test.index) {
            body(ctx);
        }
    }

    fn before_each(&self, ctx: &TestContext<'_>) {
        if let Some(hook) = &self.before_each {
            hook(ctx);
        }
    }

    fn after_each(&self, ctx: &TestContext<'_>) {
        if let Some(hook) = &self.after_each {
            hook(ctx);
        }
    }
}

pub struct RegisteredSuite {
    name: String,
    tests: Vec<Test>,
    suite: Box<dyn TestSuite>,
}

impl RegisteredSuite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    pub fn suite(&self) -> &dyn TestSuite {
        self.suite.as_ref()
    }
}

impl fmt::Debug for RegisteredSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSuite")
            .field("name", &self.name)
            .field("tests", &self.tests)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    suites: Vec<RegisteredSuite>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite and enumerate its tests.
    ///
    /// Fails on a duplicate suite name or a test that asks for zero threads;
    /// both are mistakes in the test program, not runtime conditions.
    pub fn register<S: TestSuite + 'static>(&mut self, suite: S) -> HarnessResult<()> {
        let name = suite.name().to_string();
        if self.suites.iter().any(|s| s.name == name) {
            return Err(HarnessError::DuplicateSuite(name));
        }

        let specs = suite.tests();
        if let Some(spec) = specs.iter().find(|spec| spec.threads == 0) {
            return Err(HarnessError::InvalidThreadCount {
                suite: name,
                test: spec.name.clone(),
            });
        }

        let tests = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let id = TestId(self.next_id);
                self.next_id += 1;
                Test {
                    id,
                    index,
                    name: spec.name,
                    threads: spec.threads,
                    timeout: spec.timeout,
                }
            })
            .collect::<Vec<_>>();

        tracing::debug!(suite = %name, tests = tests.len(), "registered suite");

        self.suites.push(RegisteredSuite {
            name,
            tests,
            suite: Box::new(suite),
        });
        Ok(())
    }

    /// Suites in registration order
    pub fn suites(&self) -> &[RegisteredSuite] {
        &self.suites
    }

    pub fn suite(&self, name: &str) -> Option<&RegisteredSuite> {
        self.suites.iter().find(|s| s.name == name)
    }

    pub fn test_count(&self) -> usize {
        self.suites.iter().map(|s| s.tests.len()).sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &TestContext<'_>) {}

    #[test]
    fn test_register_assigns_global_ids() {
        let mut registry = Registry::new();
        registry
            .register(Suite::new("a").it("one", noop).it("two", noop))
            .unwrap();
        registry
            .register(Suite::new("b").it("three", noop))
            .unwrap();

        let ids: Vec<u64> = registry
            .suites()
            .iter()
            .flat_map(|s| s.tests().iter().map(|t| t.id.0))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(registry.test_count(), 3);
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut registry = Registry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Suite::new(name).it("t", noop)).unwrap();
        }

        let names: Vec<&str> = registry.suites().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);

        let tests = registry.suite("alpha").unwrap().tests();
        assert_eq!(tests[0].index, 0);
        assert_eq!(tests[0].name, "t");
    }

    #[test]
    fn test_duplicate_suite_rejected() {
        let mut registry = Registry::new();
        registry.register(Suite::new("math")).unwrap();
        let err = registry.register(Suite::new("math")).unwrap_err();
        assert!(matches!(err, HarnessError::DuplicateSuite(name) if name == "math"));
        assert_eq!(registry.suites().len(), 1);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut registry = Registry::new();
        let suite = Suite::new("bad").case(TestSpec::it("none").with_threads(0), noop);
        assert!(matches!(
            registry.register(suite),
            Err(HarnessError::InvalidThreadCount { .. })
        ));
        assert!(registry.suites().is_empty());
    }

    #[test]
    fn test_spec_constructors() {
        let spec = TestSpec::it("basic");
        assert_eq!(spec.threads, 1);
        assert_eq!(spec.timeout, DEFAULT_TIMEOUT);

        let spec = TestSpec::parallel("counter", 4);
        assert_eq!(spec.name, "counter (parallel 4)");
        assert_eq!(spec.threads, 4);

        let suite = Suite::new("s").test("slow", Duration::from_secs(5), 2, noop);
        let spec = &suite.tests()[0];
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert_eq!(spec.threads, 2);
    }

    #[test]
    fn test_tests_enumerated_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Counting;
        impl TestSuite for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            fn tests(&self) -> Vec<TestSpec> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                vec![TestSpec::it("only")]
            }
            fn execute(&self, _test: &Test, _ctx: &TestContext<'_>) {}
        }

        let mut registry = Registry::new();
        registry.register(Counting).unwrap();
        let _ = registry.suites();
        let _ = registry.test_count();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
