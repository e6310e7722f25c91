//! Self-test program: the harness running its own checks in isolated processes

use isorun::scope::{defer, errdefer};
use isorun::trace::{self, EINVAL};
use isorun::{attempt, ensure, failure, handle, verify, verify_eq, verify_err, verify_ok, with_value};
use isorun::{Fallible, Suite};
use std::cell::Cell;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn parse_port(text: &str) -> Fallible<u16> {
    ensure!(!text.is_empty());
    match text.parse::<u16>() {
        Ok(port) => Ok(port),
        Err(_) => {
            failure!(EINVAL, "not a port: {}", text);
        }
    }
}

fn connect(text: &str) -> Fallible<u16> {
    let port = attempt!(parse_port(text));
    Ok(port)
}

fn checked_div(a: i32, b: i32) -> Fallible<i32> {
    if b == 0 {
        trace::push(file!(), isorun::function_name!(), line!(), EINVAL);
        with_value!(a);
        return Err(isorun::Failed);
    }
    Ok(a / b)
}

fn reserve(released: &Cell<bool>, fail: bool) -> Fallible {
    let _undo = errdefer(|| released.set(true));
    ensure!(!fail);
    Ok(())
}

fn math() -> Suite {
    Suite::new("math").it("add", |t| verify_eq!(t, 1 + 1, 2))
}

fn errors() -> Suite {
    Suite::new("trace")
        .it("records frames", |t| {
            verify!(t, connect("").is_err());
            verify_eq!(t, trace::length(), 2);
            verify_eq!(t, trace::last_code(), EINVAL);

            let first = trace::nth(0);
            verify!(t, first.is_some_and(|f| f.message() == "ensure !text.is_empty()"));
            let second = trace::nth(1);
            verify!(t, second.is_some_and(|f| f.message() == "try parse_port(text)"));

            trace::clear();
            verify_eq!(t, trace::length(), 0);
            verify_eq!(t, trace::last_code(), 0);
        })
        .it("verify_ok yields the value", |t| {
            let port = verify_ok!(t, connect("8080"));
            verify_eq!(t, port, 8080);
        })
        .it("verify_err checks the code", |t| {
            verify_err!(t, connect("http"), EINVAL);
            verify_eq!(t, trace::length(), 0);
            verify_err!(t, checked_div(1, 0), EINVAL, "dividing by zero");
            verify_eq!(t, trace::last_code(), 0);
        })
        .it("handle recovers locally", |t| {
            let seen = Cell::new(0);
            let result = handle!(connect("http"), |code| {
                seen.set(code);
            });
            verify!(t, result.is_none());
            verify_eq!(t, seen.get(), EINVAL);
            verify_eq!(t, trace::length(), 0);
        })
        .it("with_value annotates the frame", |t| {
            verify!(t, checked_div(7, 0).is_err());
            let frame = trace::nth(0);
            verify!(t, frame.is_some_and(|f| f.message() == ", a = 7"));
            trace::clear();
        })
        .parallel("threads keep their own trace", 4, |t| {
            for _ in 0..=t.thread_index() {
                let _ = connect("");
            }
            t.synchronize();
            verify_eq!(t, trace::length(), 2 * (t.thread_index() as usize + 1));
        })
}

fn barrier() -> Suite {
    static ARRIVED: AtomicUsize = AtomicUsize::new(0);

    Suite::new("barrier").parallel("lockstep rounds", 8, |t| {
        for round in 1..=5 {
            ARRIVED.fetch_add(1, Ordering::SeqCst);
            t.synchronize();
            verify_eq!(t, ARRIVED.load(Ordering::SeqCst), round * t.thread_count() as usize);
            t.synchronize();
        }
    })
}

fn hooks() -> Suite {
    static PREPARED: AtomicBool = AtomicBool::new(false);

    Suite::new("hooks")
        .before_each(|_| PREPARED.store(true, Ordering::SeqCst))
        .after_each(|t| verify!(t, PREPARED.load(Ordering::SeqCst)))
        .it("before_each ran first", |t| verify!(t, PREPARED.load(Ordering::SeqCst)))
        .parallel("hooks run once per test", 2, |t| {
            verify!(t, PREPARED.load(Ordering::SeqCst));
        })
}

fn isolation() -> Suite {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    Suite::new("isolation")
        .it("first mutation", |t| {
            verify_eq!(t, COUNTER.fetch_add(1, Ordering::SeqCst), 0);
        })
        .it("second mutation sees a fresh copy", |t| {
            verify_eq!(t, COUNTER.fetch_add(1, Ordering::SeqCst), 0);
        })
        .test("finishes within its timeout", Duration::from_millis(500), 1, |t| {
            thread::sleep(Duration::from_millis(10));
            verify!(t, COUNTER.load(Ordering::SeqCst) == 0);
        })
}

fn cleanup() -> Suite {
    Suite::new("scope")
        .it("defer runs at scope end", |t| {
            let hits = Cell::new(0);
            {
                let _guard = defer(|| hits.set(hits.get() + 1));
                verify_eq!(t, hits.get(), 0);
            }
            verify_eq!(t, hits.get(), 1);
        })
        .it("errdefer runs only on failure", |t| {
            let released = Cell::new(false);
            verify!(t, reserve(&released, false).is_ok());
            verify!(t, !released.get());

            verify!(t, reserve(&released, true).is_err());
            verify!(t, released.get());
            trace::clear();
        })
}

fn main() -> ExitCode {
    isorun::main_with(|registry| {
        registry.register(math())?;
        registry.register(errors())?;
        registry.register(barrier())?;
        registry.register(hooks())?;
        registry.register(isolation())?;
        registry.register(cleanup())?;
        Ok(())
    })
}
