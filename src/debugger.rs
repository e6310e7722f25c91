//! Debugger attach workflow
//!
//! Spawns a test process that stops itself with SIGSTOP before any test code
//! runs, prints its pid, and waits for a debugger to attach and continue it.
//!
//! ## Waiting
//!
//! While waiting, SIGINT only sets an abort flag. The loop polls the child
//! every [`POLL_INTERVAL`] and ends on the first of: the child exited, the
//! user pressed ctrl-c (the child is killed), or waiting failed.

use crate::lifecycle::ChildGuard;
use crate::output::{Output, INDENT};
use crate::process::{self, classify, kill_process, Launch, Outcome, Unit, POLL_INTERVAL};
use crate::signals::AbortHandlerGuard;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::thread;

/// How a debug session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugOutcome {
    /// The test process ran to completion
    Exited(Outcome),
    /// The user pressed ctrl-c; the test process was killed
    Aborted,
    WaitFailed(Errno),
    SpawnFailed(Errno),
}

impl DebugOutcome {
    /// Whether a debug loop should offer another attempt
    pub fn should_restart(&self) -> bool {
        matches!(self, DebugOutcome::Exited(_))
    }
}

/// Run `unit` once under the debug-attach workflow
pub fn debug_unit(unit: &Unit<'_>, output: &Output) -> DebugOutcome {
    // Installed before the fork so a ctrl-c during spawn is not lost
    let handler = match AbortHandlerGuard::install() {
        Ok(handler) => handler,
        Err(errno) => {
            output.print(format_args!(
                "{}Failed to install interrupt handler ({}).\n",
                INDENT,
                errno.desc()
            ));
            return DebugOutcome::WaitFailed(errno);
        }
    };

    let pid = match process::spawn(unit, output, Launch::Suspended) {
        Ok(pid) => pid,
        Err(errno) => {
            output.print(format_args!(
                "{}Failed to spawn process ({}).\n",
                INDENT,
                errno.desc()
            ));
            return DebugOutcome::SpawnFailed(errno);
        }
    };
    let guard = ChildGuard::new(pid);

    output.print(format_args!(
        "{}Waiting for debugger to attach, press ctrl-c to abort... (pid {})\n",
        INDENT, pid
    ));

    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(status) => {
                guard.disarm();
                let outcome = classify(status);
                tracing::debug!(pid = pid.as_raw(), ?outcome, "debugged process exited");
                if let Some(message) = outcome.message() {
                    output.print(format_args!("{}{}\n", INDENT, message));
                }
                return DebugOutcome::Exited(outcome);
            }
            Err(errno) => {
                output.print(format_args!(
                    "{}Waiting for debug process failed ({}).\n",
                    INDENT,
                    errno.desc()
                ));
                // The guard kills the child on the way out
                return DebugOutcome::WaitFailed(errno);
            }
        }

        if handler.aborted() {
            // On failure kill_process has reported it and the guard gets one more try
            if kill_process(pid, output).is_ok() {
                guard.disarm();
            }
            output.print(format_args!("\r{}Waiting aborted by user.\n", INDENT));
            return DebugOutcome::Aborted;
        }

        thread::sleep(POLL_INTERVAL);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exits_restart() {
        assert!(DebugOutcome::Exited(Outcome::Passed).should_restart());
        assert!(!DebugOutcome::Aborted.should_restart());
        assert!(!DebugOutcome::WaitFailed(Errno::ECHILD).should_restart());
        assert!(!DebugOutcome::SpawnFailed(Errno::EAGAIN).should_restart());
    }
}
