//! Fatal harness errors
//!
//! Everything here is a configuration or programming error: the entry point
//! reports it and exits. Test failures are never represented as errors, see
//! [`crate::process::Outcome`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Suite {0} is registered twice")]
    DuplicateSuite(String),

    #[error("Test {test} in suite {suite} requests zero threads")]
    InvalidThreadCount { suite: String, test: String },

    #[error("Failed to match pattern: {0}")]
    InvalidPattern(String),

    #[error("No test found for pattern: {0}")]
    NoMatchingTest(String),

    #[error("Failed to write report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type HarnessResult<T> = Result<T, HarnessError>;
