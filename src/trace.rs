//! Thread-local error trace
//!
//! Fallible library and test code reports a failure by pushing an
//! [`ErrorFrame`] and returning [`Failed`]. Callers either recover (inspect
//! the trace, then [`clear`] it) or propagate by pushing another frame on top.
//! Assertions such as `verify_ok!` print the whole trace when they fire.
//!
//! The trace holds at most [`TRACE_CAPACITY`] frames. Pushing past capacity
//! still updates [`last_code`] but records nothing: older frames stay intact
//! and the trace simply stops growing.
//!
//! State lives in a `thread_local!`, so threads never observe each other's
//! frames and no locking is needed.

use std::cell::RefCell;
use std::fmt::{self, Write as _};

/// Maximum number of frames recorded per thread
pub const TRACE_CAPACITY: usize = 32;

/// Size of each frame's message buffer in bytes
pub const MESSAGE_CAPACITY: usize = 128;

pub const EINVAL: i32 = libc::EINVAL;
pub const ENOMEM: i32 = libc::ENOMEM;

/// Failure indicator returned by fallible operations. The details live in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failed;

impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation failed with code {}", last_code())
    }
}

impl std::error::Error for Failed {}

pub type Fallible<T = ()> = Result<T, Failed>;

/// Fixed-size message storage. Writes past the end are dropped, never reallocated.
#[derive(Clone, Copy)]
struct MessageBuf {
    bytes: [u8; MESSAGE_CAPACITY],
    len: usize,
}

impl MessageBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; MESSAGE_CAPACITY],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        // Writes only ever stop on a char boundary
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }
}

impl fmt::Write for MessageBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MESSAGE_CAPACITY - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }

        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if take < s.len() {
            // Stop the formatter early, the buffer is full
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// One reported failure
#[derive(Clone)]
pub struct ErrorFrame {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
    pub code: i32,
    message: MessageBuf,
}

impl ErrorFrame {
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl fmt::Debug for ErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorFrame")
            .field("file", &self.file)
            .field("function", &self.function)
            .field("line", &self.line)
            .field("code", &self.code)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for ErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {}:{} in {}: {}",
            self.file,
            self.line,
            self.function,
            self.message()
        )
    }
}

struct Trace {
    frames: Vec<ErrorFrame>,
    /// Frames reported since the last clear, including those past capacity
    reported: usize,
    code: i32,
}

impl Trace {
    fn new() -> Self {
        Self {
            frames: Vec::with_capacity(TRACE_CAPACITY),
            reported: 0,
            code: 0,
        }
    }
}

thread_local! {
    static TRACE: RefCell<Trace> = RefCell::new(Trace::new());
}

/// Report a failure on the current thread.
///
/// # Panics
///
/// Panics if `code` is zero; zero means "no error" and cannot be reported.
pub fn push(file: &'static str, function: &'static str, line: u32, code: i32) {
    assert_ne!(code, 0, "error code 0 reported at {}:{}", file, line);

    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        trace.code = code;
        trace.reported += 1;

        if trace.frames.len() >= TRACE_CAPACITY {
            return;
        }

        trace.frames.push(ErrorFrame {
            file,
            function,
            line,
            code,
            message: MessageBuf::new(),
        });
    });
}

/// Append formatted text to the most recently reported frame.
///
/// Text that does not fit is dropped. Messages for frames reported past
/// capacity are dropped entirely so they never land on an older frame.
pub fn append_message(args: fmt::Arguments<'_>) {
    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        debug_assert!(trace.reported > 0, "append_message without a reported error");

        if trace.reported != trace.frames.len() {
            return;
        }

        if let Some(frame) = trace.frames.last_mut() {
            let _ = frame.message.write_fmt(args);
        }
    });
}

/// Code of the most recent report, or 0 when nothing was reported since the last [`clear`]
pub fn last_code() -> i32 {
    TRACE.with(|trace| trace.borrow().code)
}

/// Number of recorded frames (never more than [`TRACE_CAPACITY`])
pub fn length() -> usize {
    TRACE.with(|trace| trace.borrow().frames.len())
}

/// Copy of the `n`th recorded frame, oldest first
pub fn nth(n: usize) -> Option<ErrorFrame> {
    TRACE.with(|trace| trace.borrow().frames.get(n).cloned())
}

/// Copy of all recorded frames, oldest first
pub fn frames() -> Vec<ErrorFrame> {
    TRACE.with(|trace| trace.borrow().frames.clone())
}

/// Forget every frame and reset the code, after a caller recovered locally
pub fn clear() {
    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        trace.frames.clear();
        trace.reported = 0;
        trace.code = 0;
    });
}

/// Path of the enclosing function, resolved at compile time
#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let mut name = type_name_of(f);
        name = name.strip_suffix("::f").unwrap_or(name);
        while let Some(outer) = name.strip_suffix("::{{closure}}") {
            name = outer;
        }
        name
    }};
}

/// Report a failure with `code` and return [`Failed`](crate::trace::Failed).
///
/// ```ignore
/// fn open(limit: usize) -> Fallible<usize> {
///     if limit > 8 {
///         failure!(ENOMEM, "limit {} too large", limit);
///     }
///     Ok(limit)
/// }
/// ```
#[macro_export]
macro_rules! failure {
    ($code:expr) => {{
        $crate::trace::push(file!(), $crate::function_name!(), line!(), $code);
        return ::core::result::Result::Err($crate::trace::Failed);
    }};
    ($code:expr, $($fmt:tt)+) => {{
        $crate::trace::push(file!(), $crate::function_name!(), line!(), $code);
        $crate::trace::append_message(format_args!($($fmt)+));
        return ::core::result::Result::Err($crate::trace::Failed);
    }};
}

/// Fail with `EINVAL` unless `cond` holds
#[macro_export]
macro_rules! ensure {
    ($cond:expr $(,)?) => {
        if !($cond) {
            $crate::failure!($crate::trace::EINVAL, "ensure {}", stringify!($cond));
        }
    };
    ($cond:expr, $($fmt:tt)+) => {
        if !($cond) {
            $crate::trace::push(file!(), $crate::function_name!(), line!(), $crate::trace::EINVAL);
            $crate::trace::append_message(format_args!("ensure {}: ", stringify!($cond)));
            $crate::trace::append_message(format_args!($($fmt)+));
            return ::core::result::Result::Err($crate::trace::Failed);
        }
    };
}

/// Unwrap a [`Fallible`](crate::trace::Fallible), or propagate its failure with a new frame
#[macro_export]
macro_rules! attempt {
    ($expr:expr $(,)?) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(_) => {
                $crate::failure!($crate::trace::last_code(), "try {}", stringify!($expr));
            }
        }
    };
    ($expr:expr, $($fmt:tt)+) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(_) => {
                $crate::trace::push(file!(), $crate::function_name!(), line!(), $crate::trace::last_code());
                $crate::trace::append_message(format_args!("try {}: ", stringify!($expr)));
                $crate::trace::append_message(format_args!($($fmt)+));
                return ::core::result::Result::Err($crate::trace::Failed);
            }
        }
    };
}

/// Run `$body` when `$expr` failed, then clear the trace. Evaluates to `Some(value)` on success.
///
/// Inside the body, `forward!` re-fails with the current code instead of recovering.
#[macro_export]
macro_rules! handle {
    ($expr:expr, |$code:ident| $body:block) => {
        match $expr {
            ::core::result::Result::Ok(value) => ::core::option::Option::Some(value),
            ::core::result::Result::Err(_) => {
                let $code = $crate::trace::last_code();
                $body
                $crate::trace::clear();
                ::core::option::Option::None
            }
        }
    };
}

/// Propagate the pending failure from inside a `handle!` body
#[macro_export]
macro_rules! forward {
    ($($fmt:tt)+) => {{
        $crate::failure!($crate::trace::last_code(), "handler for: {}", format_args!($($fmt)+));
    }};
}

/// Append `", <expr> = <value>"` to the current frame
#[macro_export]
macro_rules! with_value {
    ($expr:expr) => {
        $crate::trace::append_message(format_args!(", {} = {:?}", stringify!($expr), $expr))
    };
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn parse_positive(value: i64) -> Fallible<u64> {
        crate::ensure!(value > 0);
        Ok(value as u64)
    }

    fn reserve(size: usize) -> Fallible<usize> {
        if size > 64 {
            crate::failure!(ENOMEM, "no memory for buffer");
        }
        Ok(size)
    }

    fn load(value: i64) -> Fallible<u64> {
        let parsed = crate::attempt!(parse_positive(value));
        Ok(parsed * 2)
    }

    #[test]
    fn test_push_records_frame() {
        clear();
        push("lib.rs", "lib::open", 10, 5);
        append_message(format_args!("opening {}", "db"));

        assert_eq!(length(), 1);
        assert_eq!(last_code(), 5);

        let frame = nth(0).unwrap();
        assert_eq!(frame.file, "lib.rs");
        assert_eq!(frame.function, "lib::open");
        assert_eq!(frame.line, 10);
        assert_eq!(frame.code, 5);
        assert_eq!(frame.message(), "opening db");
        clear();
    }

    #[test]
    fn test_message_appends_to_latest_frame() {
        clear();
        push("a.rs", "a", 1, 1);
        push("b.rs", "b", 2, 2);
        append_message(format_args!("first"));
        append_message(format_args!(", second"));

        assert_eq!(nth(0).unwrap().message(), "");
        assert_eq!(nth(1).unwrap().message(), "first, second");
        clear();
    }

    #[test]
    fn test_message_stops_at_capacity() {
        clear();
        push("a.rs", "a", 1, 1);
        let long = "x".repeat(MESSAGE_CAPACITY + 40);
        append_message(format_args!("{}", long));
        append_message(format_args!("more"));

        let frame = nth(0).unwrap();
        assert_eq!(frame.message().len(), MESSAGE_CAPACITY);
        assert!(frame.message().chars().all(|c| c == 'x'));
        clear();
    }

    #[test]
    fn test_message_truncates_on_char_boundary() {
        clear();
        push("a.rs", "a", 1, 1);
        let filler = "a".repeat(MESSAGE_CAPACITY - 1);
        append_message(format_args!("{}é", filler));

        let frame = nth(0).unwrap();
        assert_eq!(frame.message(), filler);
        clear();
    }

    #[test]
    fn test_overflow_keeps_last_code() {
        clear();
        for code in 1..=40 {
            push("a.rs", "a", code as u32, code);
        }

        assert_eq!(length(), TRACE_CAPACITY);
        assert_eq!(last_code(), 40);
        assert_eq!(nth(0).unwrap().code, 1);
        assert_eq!(nth(TRACE_CAPACITY - 1).unwrap().code, 32);
        assert!(nth(TRACE_CAPACITY).is_none());
        clear();
    }

    #[test]
    fn test_overflow_message_does_not_touch_older_frame() {
        clear();
        for code in 1..=33 {
            push("a.rs", "a", 1, code);
        }
        append_message(format_args!("lost"));

        assert_eq!(nth(TRACE_CAPACITY - 1).unwrap().message(), "");
        clear();
    }

    #[test]
    fn test_clear_resets_state() {
        push("a.rs", "a", 1, 3);
        clear();
        assert_eq!(length(), 0);
        assert_eq!(last_code(), 0);
        assert!(nth(0).is_none());
    }

    #[test]
    #[should_panic(expected = "error code 0")]
    fn test_push_zero_code_panics() {
        push("a.rs", "a", 1, 0);
    }

    #[test]
    fn test_threads_do_not_share_trace() {
        clear();
        push("main.rs", "main", 1, 9);

        let seen = thread::spawn(|| {
            let before = (length(), last_code());
            push("worker.rs", "worker", 2, 4);
            (before, length(), nth(0).map(|f| f.file))
        })
        .join()
        .unwrap();

        assert_eq!(seen, ((0, 0), 1, Some("worker.rs")));
        assert_eq!(length(), 1);
        assert_eq!(nth(0).unwrap().file, "main.rs");
        assert_eq!(last_code(), 9);
        clear();
    }

    #[test]
    fn test_failure_macro_records_location() {
        clear();
        assert_eq!(reserve(128), Err(Failed));

        let frame = nth(0).unwrap();
        assert_eq!(frame.code, ENOMEM);
        assert!(frame.file.ends_with("trace.rs"));
        assert!(frame.function.ends_with("reserve"), "{}", frame.function);
        assert_eq!(frame.message(), "no memory for buffer");
        clear();
    }

    #[test]
    fn test_attempt_stacks_frames() {
        clear();
        assert_eq!(load(-1), Err(Failed));

        assert_eq!(length(), 2);
        assert_eq!(last_code(), EINVAL);
        assert_eq!(nth(0).unwrap().message(), "ensure value > 0");
        assert_eq!(nth(1).unwrap().message(), "try parse_positive(value)");
        assert!(nth(1).unwrap().function.ends_with("load"));
        clear();
    }

    #[test]
    fn test_attempt_passes_value_through() {
        clear();
        assert_eq!(load(4), Ok(8));
        assert_eq!(length(), 0);
    }

    #[test]
    fn test_handle_recovers_and_clears() {
        clear();
        let mut seen = 0;
        let value = crate::handle!(reserve(1000), |code| {
            seen = code;
        });

        assert_eq!(value, None);
        assert_eq!(seen, ENOMEM);
        assert_eq!(last_code(), 0);
        assert_eq!(length(), 0);
    }

    #[test]
    fn test_forward_from_handler() {
        fn wrapped() -> Fallible<usize> {
            let value = crate::handle!(reserve(1000), |_code| {
                crate::forward!("reserve(1000)");
            });
            Ok(value.unwrap_or_default())
        }

        clear();
        assert_eq!(wrapped(), Err(Failed));
        assert_eq!(length(), 2);
        assert_eq!(nth(1).unwrap().message(), "handler for: reserve(1000)");
        assert_eq!(last_code(), ENOMEM);
        clear();
    }

    #[test]
    fn test_with_value_appends_context() {
        fn check(limit: usize) -> Fallible {
            let size = 99;
            if size > limit {
                push(file!(), crate::function_name!(), line!(), EINVAL);
                append_message(format_args!("size over limit"));
                crate::with_value!(size);
                crate::with_value!(limit);
                return Err(Failed);
            }
            Ok(())
        }

        clear();
        assert!(check(10).is_err());
        assert_eq!(nth(0).unwrap().message(), "size over limit, size = 99, limit = 10");
        clear();
    }

    #[test]
    fn test_frame_display() {
        clear();
        push("net.rs", "net::connect", 42, 7);
        append_message(format_args!("refused"));
        assert_eq!(
            nth(0).unwrap().to_string(),
            "at net.rs:42 in net::connect: refused"
        );
        clear();
    }
}
