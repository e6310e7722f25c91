//! Process execution engine
//!
//! Every test attempt runs in a forked copy of the whole program:
//!
//! 1. **Spawned**: the child runs the suite's before-each hook, the test body
//!    (on one thread, or on `threads` scoped threads sharing a [`Barrier`]),
//!    the after-each hook, and exits 0. A failed assertion or a panic exits
//!    early with [`EXIT_ASSERTION`].
//! 2. **Polling**: the parent checks the child with `waitpid(WNOHANG)` every
//!    [`POLL_INTERVAL`] and kills it once the test's timeout has elapsed.
//! 3. **Completed / TimedOut / WaitError**: the final status is classified
//!    into an [`Outcome`].
//!
//! A crash, hang or corrupted global in one test can never reach the
//! orchestrator or any later test.

use crate::assert::EXIT_ASSERTION;
use crate::barrier::Barrier;
use crate::context::TestContext;
use crate::lifecycle::ChildGuard;
use crate::output::{Output, INDENT};
use crate::registry::{RegisteredSuite, Test};
use crate::signals;
use nix::errno::Errno;
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

/// Interval between two non-blocking status checks of a test process
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Why a test attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The child already printed the failed assertion
    AssertionFailed,
    ExitCode(i32),
    Signaled(Signal),
    TimedOut(Duration),
    WaitError(Errno),
    SpawnError(Errno),
    Abnormal(String),
    /// Shutdown was requested while the test was running
    Interrupted,
}

impl Failure {
    /// Line to print after the test's own output, if any
    pub fn message(&self) -> Option<String> {
        match self {
            Failure::AssertionFailed => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::AssertionFailed => write!(f, "Assertion failed."),
            Failure::ExitCode(code) => write!(f, "Process exited with code {}.", code),
            Failure::Signaled(signal) => write!(
                f,
                "Process terminated by signal {} ({}).",
                *signal as i32,
                signal.as_str()
            ),
            Failure::TimedOut(timeout) => {
                write!(f, "Process timed out after {:.2}s.", timeout.as_secs_f64())
            }
            Failure::WaitError(errno) => write!(f, "Waiting for process failed ({}).", errno.desc()),
            Failure::SpawnError(errno) => write!(f, "Failed to spawn process ({}).", errno.desc()),
            Failure::Abnormal(status) => write!(f, "Process ended abnormally ({}).", status),
            Failure::Interrupted => write!(f, "Process stopped, run interrupted."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed(failure) => Some(failure),
        }
    }

    pub fn message(&self) -> Option<String> {
        self.failure().and_then(Failure::message)
    }
}

/// Map a reaped child's status to an outcome
pub fn classify(status: WaitStatus) -> Outcome {
    match status {
        WaitStatus::Exited(_, 0) => Outcome::Passed,
        WaitStatus::Exited(_, EXIT_ASSERTION) => Outcome::Failed(Failure::AssertionFailed),
        WaitStatus::Exited(_, code) => Outcome::Failed(Failure::ExitCode(code)),
        WaitStatus::Signaled(_, signal, _) => Outcome::Failed(Failure::Signaled(signal)),
        other => Outcome::Failed(Failure::Abnormal(format!("{:?}", other))),
    }
}

/// One (suite, test) execution attempt
#[derive(Clone, Copy)]
pub struct Unit<'a> {
    pub suite: &'a RegisteredSuite,
    pub test: &'a Test,
    pub start: Instant,
}

impl<'a> Unit<'a> {
    pub fn new(suite: &'a RegisteredSuite, test: &'a Test) -> Self {
        Self {
            suite,
            test,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Start running the test immediately
    Run,
    /// Stop the child with SIGSTOP before any test code runs
    Suspended,
}

/// Per-attempt switches of the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Kill the test process once its timeout elapsed
    pub enforce_timeout: bool,
    /// Print the test process id right after spawning
    pub print_pid: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            enforce_timeout: true,
            print_pid: false,
        }
    }
}

/// Result of [`execute`]
#[derive(Debug)]
pub struct Attempt {
    /// `None` when the child could not be forked
    pub pid: Option<Pid>,
    pub outcome: Outcome,
}

/// Fork a test process for `unit`. Only the parent returns.
pub fn spawn(unit: &Unit<'_>, output: &Output, launch: Launch) -> Result<Pid, Errno> {
    // Anything still buffered would be written twice
    output.flush();
    let _ = std::io::stdout().flush();

    // SAFETY: the orchestrator is single threaded while it forks, and the
    // child only runs test code before leaving through process::exit
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            tracing::debug!(pid = child.as_raw(), test = %unit.test.name, ?launch, "spawned test process");
            Ok(child)
        }
        ForkResult::Child => child_main(unit, output, launch),
    }
}

fn child_main(unit: &Unit<'_>, output: &Output, launch: Launch) -> ! {
    signals::restore_default_dispositions();

    if launch == Launch::Suspended {
        let _ = raise(Signal::SIGSTOP);
    }

    install_panic_capture();
    run_unit(unit.suite, unit.test, output);

    output.flush();
    std::process::exit(0);
}

/// Body of a test process: hooks around the test, on the requested number of threads
pub fn run_unit(suite: &RegisteredSuite, test: &Test, output: &Output) {
    let barrier = Barrier::new(test.threads);
    let hooks = TestContext::new(suite.name(), test, 0, &barrier, output);

    guarded(&hooks, || suite.suite().before_each(&hooks));

    if test.threads == 1 {
        guarded(&hooks, || suite.suite().execute(test, &hooks));
    } else {
        run_threads(suite, test, &barrier, output);
    }

    guarded(&hooks, || suite.suite().after_each(&hooks));
}

fn run_threads(suite: &RegisteredSuite, test: &Test, barrier: &Barrier, output: &Output) {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(test.threads as usize);

        for index in 0..test.threads {
            let spawned = thread::Builder::new()
                .name(format!("{}#{}", test.name, index))
                .spawn_scoped(scope, move || {
                    let ctx = TestContext::new(suite.name(), test, index, barrier, output);
                    guarded(&ctx, || suite.suite().execute(test, &ctx));
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    output.print(format_args!("{}Failed to create thread ({}).\n", INDENT, e));
                    std::process::exit(EXIT_ASSERTION);
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                output.print(format_args!("{}Failed to join thread.\n", INDENT));
                std::process::exit(EXIT_ASSERTION);
            }
        }
    });
}

thread_local! {
    /// Message and location of the last panic on this thread
    static PANIC_SITE: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

/// Replace the default panic output with a capture that [`guarded`] reports
fn install_panic_capture() {
    panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let message = payload_message(info.payload());
        PANIC_SITE.with(|site| *site.borrow_mut() = Some((message, location)));
    }));
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `f`, turning a panic into a reported assertion failure
fn guarded<F: FnOnce()>(ctx: &TestContext<'_>, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_ok() {
        return;
    }

    let (message, location) = PANIC_SITE
        .with(|site| site.borrow_mut().take())
        .unwrap_or_else(|| ("panic".to_string(), "<unknown>".to_string()));

    let mut out = ctx.output().lock();
    let _ = writeln!(out, "{}Panicked: {}.", INDENT, message);
    let _ = writeln!(out, "{}in {}", INDENT, location);
    let _ = out.flush();
    std::process::exit(EXIT_ASSERTION);
}

/// Run `unit` in a fresh process and wait for its outcome
pub fn execute(unit: &Unit<'_>, output: &Output, options: ExecOptions) -> Attempt {
    let pid = match spawn(unit, output, Launch::Run) {
        Ok(pid) => pid,
        Err(errno) => {
            return Attempt {
                pid: None,
                outcome: Outcome::Failed(Failure::SpawnError(errno)),
            }
        }
    };

    let guard = ChildGuard::new(pid);
    if options.print_pid {
        output.print(format_args!("{}Process id: {}\n", INDENT, pid));
    }
    let outcome = poll(pid, unit, output, options.enforce_timeout);
    release(guard, &outcome);

    Attempt {
        pid: Some(pid),
        outcome,
    }
}

fn poll(pid: Pid, unit: &Unit<'_>, output: &Output, enforce_timeout: bool) -> Outcome {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if enforce_timeout && unit.elapsed() > unit.test.timeout {
                    tracing::debug!(pid = pid.as_raw(), "test timed out");
                    let _ = kill_process(pid, output);
                    return Outcome::Failed(Failure::TimedOut(unit.test.timeout));
                }

                if signals::shutdown_requested() {
                    let _ = kill_process(pid, output);
                    return Outcome::Failed(Failure::Interrupted);
                }

                thread::sleep(POLL_INTERVAL);
            }
            Ok(status) => {
                tracing::debug!(pid = pid.as_raw(), ?status, "test process finished");
                return classify_polled(status, signals::shutdown_requested());
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Outcome::Failed(Failure::WaitError(errno)),
        }
    }
}

/// [`classify`] for a status seen while a run is in progress.
///
/// Ctrl-c in a terminal reaches the whole foreground process group, so the
/// test process usually dies from the same SIGINT that requested shutdown.
fn classify_polled(status: WaitStatus, shutdown: bool) -> Outcome {
    match status {
        WaitStatus::Signaled(_, Signal::SIGINT, _) if shutdown => Outcome::Failed(Failure::Interrupted),
        status => classify(status),
    }
}

/// Drop the kill guard of a polled child. A failed wait never reaped it, so
/// the guard kills and reaps it before the next test starts.
fn release(guard: ChildGuard, outcome: &Outcome) {
    match outcome {
        Outcome::Failed(Failure::WaitError(errno)) => {
            tracing::debug!(pid = ?guard.pid(), %errno, "wait failed, killing test process");
            drop(guard);
        }
        _ => guard.disarm(),
    }
}

/// Terminate a child whether or not it is stopped: continue, kill, reap.
///
/// Each failed step is reported and ends the attempt; the run goes on either way.
pub fn kill_process(pid: Pid, output: &Output) -> Result<(), Errno> {
    if let Err(errno) = kill(pid, Signal::SIGCONT) {
        output.print(format_args!(
            "{}Failed to continue process ({}).\n",
            INDENT,
            errno.desc()
        ));
        return Err(errno);
    }

    if let Err(errno) = kill(pid, Signal::SIGKILL) {
        output.print(format_args!("{}Failed to kill process ({}).\n", INDENT, errno.desc()));
        return Err(errno);
    }

    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                tracing::debug!(pid = pid.as_raw(), ?status, "reaped killed process");
                return Ok(());
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                output.print(format_args!(
                    "{}Waiting for terminated process failed ({}).\n",
                    INDENT,
                    errno.desc()
                ));
                return Err(errno);
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_raw(4242)
    }

    #[test]
    fn test_classify_exit_zero_passes() {
        assert_eq!(classify(WaitStatus::Exited(pid(), 0)), Outcome::Passed);
    }

    #[test]
    fn test_classify_assertion_exit_has_no_message() {
        let outcome = classify(WaitStatus::Exited(pid(), EXIT_ASSERTION));
        assert_eq!(outcome, Outcome::Failed(Failure::AssertionFailed));
        assert_eq!(outcome.message(), None);
    }

    #[test]
    fn test_classify_other_exit_code() {
        let outcome = classify(WaitStatus::Exited(pid(), 7));
        assert_eq!(outcome, Outcome::Failed(Failure::ExitCode(7)));
        assert_eq!(
            outcome.message().as_deref(),
            Some("Process exited with code 7.")
        );
    }

    #[test]
    fn test_classify_signal() {
        let outcome = classify(WaitStatus::Signaled(pid(), Signal::SIGABRT, true));
        assert_eq!(outcome, Outcome::Failed(Failure::Signaled(Signal::SIGABRT)));
        assert_eq!(
            outcome.message().as_deref(),
            Some("Process terminated by signal 6 (SIGABRT).")
        );
    }

    #[test]
    fn test_classify_unexpected_status() {
        let outcome = classify(WaitStatus::Stopped(pid(), Signal::SIGSTOP));
        assert!(matches!(outcome, Outcome::Failed(Failure::Abnormal(_))));
    }

    #[test]
    fn test_sigint_during_shutdown_is_interruption() {
        let status = WaitStatus::Signaled(pid(), Signal::SIGINT, false);
        assert_eq!(
            classify_polled(status, true),
            Outcome::Failed(Failure::Interrupted)
        );
        assert_eq!(
            classify_polled(status, false),
            Outcome::Failed(Failure::Signaled(Signal::SIGINT))
        );

        let status = WaitStatus::Signaled(pid(), Signal::SIGTERM, false);
        assert_eq!(
            classify_polled(status, true),
            Outcome::Failed(Failure::Signaled(Signal::SIGTERM))
        );
        assert_eq!(
            classify_polled(WaitStatus::Exited(pid(), 0), true),
            Outcome::Passed
        );
    }

    fn sleeper() -> Pid {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_release_after_wait_error_kills_child() {
        let pid = sleeper();
        release(
            ChildGuard::new(pid),
            &Outcome::Failed(Failure::WaitError(Errno::EINVAL)),
        );
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_release_after_reaped_outcome_disarms() {
        let pid = sleeper();
        release(ChildGuard::new(pid), &Outcome::Failed(Failure::ExitCode(1)));
        assert_eq!(kill(pid, None), Ok(()));

        // Clean up through a guard of our own
        drop(ChildGuard::new(pid));
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            Failure::TimedOut(Duration::from_millis(50)).to_string(),
            "Process timed out after 0.05s."
        );
        assert!(Failure::WaitError(Errno::ECHILD)
            .to_string()
            .starts_with("Waiting for process failed ("));
        assert!(Failure::SpawnError(Errno::EAGAIN)
            .to_string()
            .starts_with("Failed to spawn process ("));
    }

    #[test]
    fn test_payload_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(payload_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(payload_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(payload_message(payload.as_ref()), "non-string panic payload");
    }
}
