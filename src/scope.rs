//! Scoped cleanup guards
//!
//! `defer` releases a resource on every exit path. `errdefer` only releases it
//! when the scope is leaving with a pending failure on this thread's error
//! trace, so a successfully built resource can be handed to the caller.

use crate::trace;

/// Runs its action when dropped
#[must_use = "the action runs as soon as the guard is dropped"]
pub struct Defer<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    /// Drop the guard without running the action
    pub fn cancel(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

pub fn defer<F: FnOnce()>(action: F) -> Defer<F> {
    Defer {
        action: Some(action),
    }
}

/// Runs its action when dropped while the thread's error code is non-zero
#[must_use = "the action runs as soon as the guard is dropped"]
pub struct ErrDefer<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ErrDefer<F> {
    pub fn cancel(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for ErrDefer<F> {
    fn drop(&mut self) {
        if trace::last_code() == 0 {
            return;
        }
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

pub fn errdefer<F: FnOnce()>(action: F) -> ErrDefer<F> {
    ErrDefer {
        action: Some(action),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Fallible, EINVAL};
    use std::cell::{Cell, RefCell};

    fn build(fail: bool, released: &Cell<bool>) -> Fallible<u32> {
        let _guard = errdefer(|| released.set(true));
        if fail {
            crate::failure!(EINVAL, "build failed");
        }
        Ok(7)
    }

    #[test]
    fn test_defer_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_defer_runs_in_reverse_order() {
        let order = RefCell::new(Vec::new());
        {
            let _first = defer(|| order.borrow_mut().push(1));
            let _second = defer(|| order.borrow_mut().push(2));
        }
        assert_eq!(*order.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_defer_cancel() {
        let ran = Cell::new(false);
        let guard = defer(|| ran.set(true));
        guard.cancel();
        assert!(!ran.get());
    }

    #[test]
    fn test_errdefer_skipped_on_success() {
        trace::clear();
        let released = Cell::new(false);
        assert_eq!(build(false, &released), Ok(7));
        assert!(!released.get());
    }

    #[test]
    fn test_errdefer_runs_on_failure() {
        trace::clear();
        let released = Cell::new(false);
        assert!(build(true, &released).is_err());
        assert!(released.get());
        trace::clear();
    }

    #[test]
    fn test_errdefer_cancel() {
        trace::clear();
        trace::push("a.rs", "a", 1, EINVAL);
        let ran = Cell::new(false);
        errdefer(|| ran.set(true)).cancel();
        assert!(!ran.get());
        trace::clear();
    }
}
