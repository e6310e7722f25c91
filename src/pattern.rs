//! Suite/test filter patterns
//!
//! A pattern is `suite[:glob]`. The part before the first `:` must equal the
//! suite name exactly. The optional part after it is a shell glob (`*`, `?`,
//! bracket classes) matched against test names with `fnmatch(3)`; without it,
//! every test of the suite matches.

use crate::error::{HarnessError, HarnessResult};
use std::ffi::CString;

#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    suite_len: usize,
    test_glob: Option<CString>,
}

impl Pattern {
    /// Parse and validate a pattern. A malformed glob is an error, not a non-match.
    pub fn parse(raw: &str) -> HarnessResult<Self> {
        let (suite, glob) = split(raw);

        let test_glob = match glob {
            Some(glob) => {
                validate_glob(glob).map_err(|_| HarnessError::InvalidPattern(raw.to_string()))?;
                let glob = CString::new(glob)
                    .map_err(|_| HarnessError::InvalidPattern(raw.to_string()))?;
                Some(glob)
            }
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            suite_len: suite.len(),
            test_glob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn suite(&self) -> &str {
        &self.raw[..self.suite_len]
    }

    pub fn matches_suite(&self, suite_name: &str) -> bool {
        self.suite() == suite_name
    }

    pub fn matches_test(&self, test_name: &str) -> HarnessResult<bool> {
        match &self.test_glob {
            None => Ok(true),
            Some(glob) => fnmatch(glob, test_name)
                .map_err(|_| HarnessError::InvalidPattern(self.raw.clone())),
        }
    }
}

/// Exact match of the pattern's suite part against `suite_name`
pub fn matches_suite(pattern: &str, suite_name: &str) -> bool {
    split(pattern).0 == suite_name
}

/// Glob match of the pattern's test part against `test_name`; no glob matches everything
pub fn matches_test(pattern: &str, test_name: &str) -> HarnessResult<bool> {
    Pattern::parse(pattern)?.matches_test(test_name)
}

fn split(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once(':') {
        Some((suite, glob)) => (suite, Some(glob)),
        None => (raw, None),
    }
}

/// `fnmatch(3)` accepts unterminated bracket expressions and trailing escapes
/// silently; reject them so a typo is reported instead of matching nothing.
fn validate_glob(glob: &str) -> Result<(), ()> {
    let bytes = glob.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 >= bytes.len() {
                    return Err(());
                }
                i += 2;
            }
            b'[' => {
                i = bracket_end(bytes, i + 1).ok_or(())? + 1;
            }
            _ => i += 1,
        }
    }

    Ok(())
}

/// Index of the `]` closing a bracket expression whose body starts at `start`
fn bracket_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    if matches!(bytes.get(i), Some(b'!') | Some(b'^')) {
        i += 1;
    }
    // A leading ']' is a literal member
    if bytes.get(i) == Some(&b']') {
        i += 1;
    }

    while i < bytes.len() {
        match bytes[i] {
            b']' => return Some(i),
            b'[' if bytes.get(i + 1) == Some(&b':') => {
                let rest = &bytes[i + 2..];
                let close = rest.windows(2).position(|w| w == b":]")?;
                i += 2 + close + 2;
            }
            b'\\' => i += 2,
            _ => i += 1,
        }
    }

    None
}

fn fnmatch(glob: &CString, name: &str) -> Result<bool, ()> {
    let Ok(name) = CString::new(name) else {
        // Names with interior NULs can never match a C glob
        return Ok(false);
    };

    // SAFETY: both pointers are valid NUL-terminated strings for the duration of the call
    let ret = unsafe { libc::fnmatch(glob.as_ptr(), name.as_ptr(), 0) };
    match ret {
        0 => Ok(true),
        libc::FNM_NOMATCH => Ok(false),
        _ => Err(()),
    }
}

/// The active pattern set. Empty means everything is enabled.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    patterns: Vec<Pattern>,
}

impl Filter {
    pub fn new<S: AsRef<str>>(raw: &[S]) -> HarnessResult<Self> {
        let patterns = raw
            .iter()
            .map(|p| Pattern::parse(p.as_ref()))
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn is_suite_enabled(&self, suite_name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches_suite(suite_name))
    }

    pub fn is_test_enabled(&self, suite_name: &str, test_name: &str) -> HarnessResult<bool> {
        if self.patterns.is_empty() {
            return Ok(true);
        }

        for pattern in self.patterns.iter().filter(|p| p.matches_suite(suite_name)) {
            if pattern.matches_test(test_name)? {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
