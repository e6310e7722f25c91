//! Cleanup of live test processes
//!
//! The orchestrator owns at most one test process at a time. [`ChildGuard`]
//! makes sure that process does not outlive an unwinding orchestrator.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

/// Kills and reaps a child on drop unless disarmed first.
///
/// Disarm once the child has been reaped through the normal path.
#[must_use = "dropping the guard immediately kills the child"]
#[derive(Debug)]
pub struct ChildGuard {
    pid: Option<Pid>,
}

impl ChildGuard {
    pub fn new(pid: Pid) -> Self {
        Self { pid: Some(pid) }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The child was reaped, nothing left to clean up
    pub fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            tracing::debug!(pid = pid.as_raw(), "killing orphaned test process");
            // A stopped child still dies from SIGKILL
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::process::Command;

    #[test]
    fn test_drop_kills_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        drop(ChildGuard::new(pid));

        // Reaped by the guard, so the pid no longer names our child
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }

    #[test]
    fn test_disarm_leaves_child_alone() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let guard = ChildGuard::new(pid);
        assert_eq!(guard.pid(), Some(pid));
        guard.disarm();

        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
