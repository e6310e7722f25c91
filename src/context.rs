//! Per-thread test context
//!
//! Created inside the test process for every thread that runs a test body and
//! passed explicitly into the body and the suite hooks.

use crate::barrier::Barrier;
use crate::output::Output;
use crate::registry::Test;

pub struct TestContext<'a> {
    suite: &'a str,
    test: &'a Test,
    thread_index: u16,
    barrier: &'a Barrier,
    output: &'a Output,
}

impl<'a> TestContext<'a> {
    pub fn new(
        suite: &'a str,
        test: &'a Test,
        thread_index: u16,
        barrier: &'a Barrier,
        output: &'a Output,
    ) -> Self {
        Self {
            suite,
            test,
            thread_index,
            barrier,
            output,
        }
    }

    pub fn suite_name(&self) -> &str {
        self.suite
    }

    pub fn test(&self) -> &Test {
        self.test
    }

    /// Index of the calling thread, `0..thread_count()`
    pub fn thread_index(&self) -> u16 {
        self.thread_index
    }

    pub fn thread_count(&self) -> u16 {
        self.barrier.threads()
    }

    /// Wait until every thread of this test reached the same point
    pub fn synchronize(&self) -> u64 {
        self.barrier.enter()
    }

    pub fn output(&self) -> &Output {
        self.output
    }
}
