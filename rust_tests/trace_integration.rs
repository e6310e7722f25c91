//! Error trace behavior as seen from a test program crate

use isorun::scope::{defer, errdefer};
use isorun::trace::{self, EINVAL, ENOMEM, MESSAGE_CAPACITY, TRACE_CAPACITY};
use isorun::{attempt, ensure, failure, handle, Fallible};
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::thread;

fn allocate(size: usize) -> Fallible<Vec<u8>> {
    if size > 1024 {
        failure!(ENOMEM, "size {} over limit", size);
    }
    Ok(vec![0; size])
}

fn allocate_twice(size: usize) -> Fallible<usize> {
    let first = attempt!(allocate(size));
    let second = attempt!(allocate(size * 2));
    Ok(first.len() + second.len())
}

#[test]
fn test_frames_from_another_crate() {
    trace::clear();
    assert!(allocate_twice(600).is_err());

    assert_eq!(trace::length(), 2);
    assert_eq!(trace::last_code(), ENOMEM);

    let origin = trace::nth(0).unwrap();
    assert_eq!(origin.file, "rust_tests/trace_integration.rs");
    assert_eq!(origin.function, "trace_integration::allocate");
    assert_eq!(origin.code, ENOMEM);
    assert_eq!(origin.message(), "size 1200 over limit");

    let caller = trace::nth(1).unwrap();
    assert_eq!(caller.function, "trace_integration::allocate_twice");
    assert_eq!(caller.message(), "try allocate(size * 2)");
    assert!(caller
        .to_string()
        .starts_with("at rust_tests/trace_integration.rs:"));

    assert!(trace::nth(2).is_none());
    trace::clear();
}

#[test]
fn test_capacity_keeps_oldest_frames() {
    trace::clear();
    for code in 1..=40 {
        trace::push(file!(), "overflow", code as u32, code);
    }

    assert_eq!(trace::length(), TRACE_CAPACITY);
    assert_eq!(trace::last_code(), 40);
    assert_eq!(trace::nth(0).unwrap().code, 1);
    assert_eq!(trace::nth(TRACE_CAPACITY - 1).unwrap().code, TRACE_CAPACITY as i32);

    // Messages for dropped frames must not land on the last kept one
    trace::append_message(format_args!("dropped"));
    assert_eq!(trace::nth(TRACE_CAPACITY - 1).unwrap().message(), "");

    trace::clear();
    assert_eq!(trace::length(), 0);
    assert_eq!(trace::last_code(), 0);
}

#[test]
fn test_long_messages_truncated() {
    trace::clear();
    trace::push(file!(), "long", line!(), EINVAL);
    trace::append_message(format_args!("{}", "x".repeat(200)));
    trace::append_message(format_args!("more"));

    let frame = trace::nth(0).unwrap();
    assert_eq!(frame.message().len(), MESSAGE_CAPACITY);
    assert!(frame.message().bytes().all(|b| b == b'x'));
    trace::clear();
}

#[test]
fn test_truncation_respects_char_boundaries() {
    trace::clear();
    trace::push(file!(), "wide", line!(), EINVAL);
    trace::append_message(format_args!("{}", "é".repeat(100)));

    let frame = trace::nth(0).unwrap();
    assert!(frame.message().len() <= MESSAGE_CAPACITY);
    assert_eq!(frame.message().chars().count(), MESSAGE_CAPACITY / 2);
    trace::clear();
}

#[test]
fn test_threads_have_separate_traces() {
    trace::clear();
    trace::push(file!(), "main", line!(), EINVAL);

    let handles: Vec<_> = (1..=4)
        .map(|n| {
            thread::spawn(move || {
                assert_eq!(trace::length(), 0);
                for _ in 0..n {
                    trace::push(file!(), "worker", line!(), ENOMEM);
                }
                (trace::length(), trace::last_code())
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), (n + 1, ENOMEM));
    }

    assert_eq!(trace::length(), 1);
    assert_eq!(trace::last_code(), EINVAL);
    trace::clear();
}

#[test]
fn test_handle_clears_after_recovery() {
    trace::clear();
    let code = Cell::new(0);

    let value = handle!(allocate(4096), |c| {
        code.set(c);
    });
    assert!(value.is_none());
    assert_eq!(code.get(), ENOMEM);
    assert_eq!(trace::length(), 0);

    let value = handle!(allocate(16), |c| {
        panic!("recovery ran for code {}", c);
    });
    assert_eq!(value.map(|v| v.len()), Some(16));
}

fn checked(flag: bool) -> Fallible {
    ensure!(flag);
    Ok(())
}

#[test]
fn test_ensure_reports_condition() {
    trace::clear();
    assert!(checked(false).is_err());
    assert_eq!(trace::last_code(), EINVAL);
    assert_eq!(trace::nth(0).unwrap().message(), "ensure flag");
    trace::clear();

    assert!(checked(true).is_ok());
    assert_eq!(trace::length(), 0);
}

fn open_pair(fail_second: bool, opened: &Cell<u32>, closed: &Cell<u32>) -> Fallible<u32> {
    opened.set(opened.get() + 1);
    let _first = errdefer(|| closed.set(closed.get() + 1));
    let _always = defer(|| closed.set(closed.get() + 10));
    attempt!(checked(!fail_second));
    opened.set(opened.get() + 1);
    Ok(opened.get())
}

#[test]
fn test_cleanup_guards() {
    trace::clear();
    let opened = Cell::new(0);
    let closed = Cell::new(0);

    assert!(open_pair(false, &opened, &closed).is_ok());
    assert_eq!(opened.get(), 2);
    assert_eq!(closed.get(), 10);

    assert!(open_pair(true, &opened, &closed).is_err());
    assert_eq!(opened.get(), 3);
    assert_eq!(closed.get(), 21);
    trace::clear();
}

#[test]
fn test_cancelled_guard_does_not_run() {
    let hits = Cell::new(0);
    let guard = defer(|| hits.set(1));
    guard.cancel();
    assert_eq!(hits.get(), 0);
}
