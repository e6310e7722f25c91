//! Assertions for test bodies
//!
//! A failed assertion takes the output lock, prints what went wrong and where,
//! and ends the test process with [`EXIT_ASSERTION`]. The lock is never
//! released: the process is gone before anyone else could print.

use crate::context::TestContext;
use crate::output::INDENT;
use crate::trace;
use std::fmt;
use std::io::Write;

/// Exit status reserved for "an assertion failed"; the orchestrator prints nothing extra for it
pub const EXIT_ASSERTION: i32 = 255;

#[doc(hidden)]
pub fn fail(
    ctx: &TestContext<'_>,
    file: &'static str,
    line: u32,
    message: fmt::Arguments<'_>,
    explanation: Option<fmt::Arguments<'_>>,
) -> ! {
    report(ctx, file, line, message, explanation, false)
}

/// Like [`fail`], followed by the calling thread's error trace
#[doc(hidden)]
pub fn fail_with_trace(
    ctx: &TestContext<'_>,
    file: &'static str,
    line: u32,
    message: fmt::Arguments<'_>,
    explanation: Option<fmt::Arguments<'_>>,
) -> ! {
    report(ctx, file, line, message, explanation, true)
}

fn report(
    ctx: &TestContext<'_>,
    file: &'static str,
    line: u32,
    message: fmt::Arguments<'_>,
    explanation: Option<fmt::Arguments<'_>>,
    with_trace: bool,
) -> ! {
    let mut out = ctx.output().lock();

    let _ = write!(out, "{}{}", INDENT, message);
    if let Some(explanation) = explanation {
        let _ = write!(out, ": {}", explanation);
    }
    let _ = writeln!(out, ".");

    if with_trace {
        for frame in trace::frames() {
            let _ = writeln!(out, "{}{}", INDENT, frame);
        }
    }

    let _ = writeln!(out, "{}in {}:{}", INDENT, file, line);
    let _ = out.flush();

    tracing::debug!(file, line, "assertion failed, exiting test process");
    std::process::exit(EXIT_ASSERTION);
}

/// Fail unless `cond` holds
#[macro_export]
macro_rules! verify {
    ($ctx:expr, $cond:expr $(,)?) => {
        if !($cond) {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!("Assertion failed: {}", stringify!($cond)),
                None,
            );
        }
    };
    ($ctx:expr, $cond:expr, $($expl:tt)+) => {
        if !($cond) {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!("Assertion failed: {}", stringify!($cond)),
                Some(format_args!($($expl)+)),
            );
        }
    };
}

/// Fail unless `actual == expected`
#[macro_export]
macro_rules! verify_eq {
    ($ctx:expr, $actual:expr, $expected:expr $(,)?) => {
        match (&$actual, &$expected) {
            (actual, expected) => {
                if !(*actual == *expected) {
                    $crate::assert::fail(
                        $ctx,
                        file!(),
                        line!(),
                        format_args!(
                            "(eq) Expected {} to equal {} ({:?}), but got {:?}",
                            stringify!($actual),
                            stringify!($expected),
                            expected,
                            actual
                        ),
                        None,
                    );
                }
            }
        }
    };
    ($ctx:expr, $actual:expr, $expected:expr, $($expl:tt)+) => {
        match (&$actual, &$expected) {
            (actual, expected) => {
                if !(*actual == *expected) {
                    $crate::assert::fail(
                        $ctx,
                        file!(),
                        line!(),
                        format_args!(
                            "(eq) Expected {} to equal {} ({:?}), but got {:?}",
                            stringify!($actual),
                            stringify!($expected),
                            expected,
                            actual
                        ),
                        Some(format_args!($($expl)+)),
                    );
                }
            }
        }
    };
}

/// Fail if `actual == unexpected`
#[macro_export]
macro_rules! verify_ne {
    ($ctx:expr, $actual:expr, $unexpected:expr $(,)?) => {
        match (&$actual, &$unexpected) {
            (actual, unexpected) => {
                if *actual == *unexpected {
                    $crate::assert::fail(
                        $ctx,
                        file!(),
                        line!(),
                        format_args!(
                            "(ne) Expected {} to not equal {} ({:?})",
                            stringify!($actual),
                            stringify!($unexpected),
                            actual
                        ),
                        None,
                    );
                }
            }
        }
    };
    ($ctx:expr, $actual:expr, $unexpected:expr, $($expl:tt)+) => {
        match (&$actual, &$unexpected) {
            (actual, unexpected) => {
                if *actual == *unexpected {
                    $crate::assert::fail(
                        $ctx,
                        file!(),
                        line!(),
                        format_args!(
                            "(ne) Expected {} to not equal {} ({:?})",
                            stringify!($actual),
                            stringify!($unexpected),
                            actual
                        ),
                        Some(format_args!($($expl)+)),
                    );
                }
            }
        }
    };
}

/// Unwrap a successful result; on failure print the error trace and fail
#[macro_export]
macro_rules! verify_ok {
    ($ctx:expr, $expr:expr $(,)?) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(_) => $crate::assert::fail_with_trace(
                $ctx,
                file!(),
                line!(),
                format_args!(
                    "(result) Expected success of {}, but got {}",
                    stringify!($expr),
                    $crate::trace::last_code()
                ),
                None,
            ),
        }
    };
    ($ctx:expr, $expr:expr, $($expl:tt)+) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(_) => $crate::assert::fail_with_trace(
                $ctx,
                file!(),
                line!(),
                format_args!(
                    "(result) Expected success of {}, but got {}",
                    stringify!($expr),
                    $crate::trace::last_code()
                ),
                Some(format_args!($($expl)+)),
            ),
        }
    };
}

/// Fail unless `expr` fails with error code `code`.
///
/// The expected failure is consumed: the error trace is cleared once it matched.
#[macro_export]
macro_rules! verify_err {
    ($ctx:expr, $expr:expr, $code:expr $(,)?) => {{
        if ($expr).is_ok() {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!("(result) Expected failure of {}", stringify!($expr)),
                None,
            );
        }

        let code = $crate::trace::last_code();
        if code != $code {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!(
                    "(result) Expected error code of {} to be equal to {}, but got {}",
                    stringify!($expr),
                    $code,
                    code
                ),
                None,
            );
        }
        $crate::trace::clear();
    }};
    ($ctx:expr, $expr:expr, $code:expr, $($expl:tt)+) => {{
        if ($expr).is_ok() {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!("(result) Expected failure of {}", stringify!($expr)),
                Some(format_args!($($expl)+)),
            );
        }

        let code = $crate::trace::last_code();
        if code != $code {
            $crate::assert::fail(
                $ctx,
                file!(),
                line!(),
                format_args!(
                    "(result) Expected error code of {} to be equal to {}, but got {}",
                    stringify!($expr),
                    $code,
                    code
                ),
                Some(format_args!($($expl)+)),
            );
        }
        $crate::trace::clear();
    }};
}

/// Fail unconditionally
#[macro_export]
macro_rules! fail_test {
    ($ctx:expr, $($fmt:tt)+) => {
        $crate::assert::fail($ctx, file!(), line!(), format_args!($($fmt)+), None)
    };
}
