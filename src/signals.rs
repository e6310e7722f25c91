//! Signal handling
//!
//! Two independent mechanisms:
//!
//! - **Shutdown**: SIGINT/SIGTERM set a flag the orchestrator checks before
//!   every test. A second SIGINT or SIGTERM while the flag is already set
//!   exits immediately with status 1.
//! - **Debug abort**: while a test process waits for a debugger, SIGINT is
//!   temporarily rerouted to a handler that only sets [`AbortHandlerGuard::aborted`].
//!
//! Test processes reset both signals to their default action right after fork.

use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Route SIGINT and SIGTERM to the shutdown flag
pub fn install_shutdown_handlers() -> io::Result<()> {
    let requested = shutdown_flag();
    for sig in [SIGINT, SIGTERM] {
        // Registered first so the signal that sets the flag does not also exit
        flag::register_conditional_shutdown(sig, 1, Arc::clone(requested))?;
        flag::register(sig, Arc::clone(requested))?;
    }
    tracing::debug!("installed shutdown handlers");
    Ok(())
}

/// Check if shutdown was requested (called before every test)
#[inline]
pub fn shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::SeqCst)
}

/// Put SIGINT and SIGTERM back to their default action (test processes only)
pub(crate) fn restore_default_dispositions() {
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: SigDfl installs no handler code
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
}

static DEBUG_ABORT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_debug_interrupt(_: libc::c_int) {
    DEBUG_ABORT.store(true, Ordering::SeqCst);
}

/// SIGINT handler for the debug-attach wait, restored on drop.
///
/// Only one can be active at a time; installing clears the abort flag.
pub struct AbortHandlerGuard {
    previous: SigAction,
}

impl AbortHandlerGuard {
    pub fn install() -> nix::Result<Self> {
        DEBUG_ABORT.store(false, Ordering::SeqCst);

        // No SA_RESTART: a blocked waitpid returns EINTR and the loop rechecks the flag
        let action = SigAction::new(
            SigHandler::Handler(on_debug_interrupt),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic
        let previous = unsafe { sigaction(Signal::SIGINT, &action) }?;
        Ok(Self { previous })
    }

    pub fn aborted(&self) -> bool {
        DEBUG_ABORT.load(Ordering::SeqCst)
    }
}

impl Drop for AbortHandlerGuard {
    fn drop(&mut self) {
        // SAFETY: reinstalls whatever was there before install()
        let _ = unsafe { sigaction(Signal::SIGINT, &self.previous) };
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn test_abort_guard_catches_sigint_and_restores() {
        let guard = AbortHandlerGuard::install().unwrap();
        assert!(!guard.aborted());

        raise(Signal::SIGINT).unwrap();
        assert!(guard.aborted());
        drop(guard);

        // The handler that was in place before install() is back
        let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let current = unsafe { sigaction(Signal::SIGINT, &probe) }.unwrap();
        assert_eq!(current.handler(), SigHandler::SigDfl);
    }

    #[test]
    fn test_shutdown_flag_starts_clear() {
        // Nothing in this test binary requests a shutdown
        assert!(!shutdown_requested());
    }
}
