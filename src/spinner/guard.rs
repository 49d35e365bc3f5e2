//! Protection against reentrant calls.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Refuses to run a function while a previous call through the same guard is
/// still active.
///
/// The flag is released when the call returns, fails or panics, so the guard
/// can be used again afterwards.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::spinner::ReentryGuard;
/// use testkit_reactor::Error;
///
/// let guard = ReentryGuard::new();
/// let nested = guard.call(|| guard.call(|| Ok(())));
/// assert!(matches!(nested, Err(Error::Reentry)));
/// assert_eq!(guard.call(|| Ok(5)).unwrap(), 5);
/// ```
#[derive(Debug, Default)]
pub struct ReentryGuard {
    running: AtomicBool,
}

impl ReentryGuard {
    /// Create a guard that is not running.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    /// Returns `true` while a call is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs `f` unless a call is already active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentry`] if a call is already active, otherwise
    /// whatever `f` returns.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        let _entered = self.enter()?;
        f()
    }

    /// Marks the guard as running until the returned token is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentry`] if a call is already active.
    pub fn enter(&self) -> Result<Entered<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Reentry)?;
        Ok(Entered { guard: self })
    }
}

/// Token returned by [`ReentryGuard::enter`].
#[derive(Debug)]
#[must_use = "the guard is released when the token is dropped"]
pub struct Entered<'a> {
    guard: &'a ReentryGuard,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    #[test]
    fn test_not_reentrant() {
        let guard = ReentryGuard::new();
        let mut calls = Vec::new();
        let result = guard.call(|| {
            calls.push(1);
            guard.call(|| {
                calls.push(2);
                Ok(())
            })
        });
        assert!(matches!(result, Err(Error::Reentry)));
        assert_eq!(calls, vec![1]);
    }

    #[test]
    fn test_repeated_inner_calls_each_raise() {
        let guard = ReentryGuard::new();
        let mut depth = 0;
        let mut errors = 0;
        let outer = guard.call(|| {
            depth += 1;
            for _ in 0..3 {
                if let Err(Error::Reentry) = guard.call(|| Ok(())) {
                    errors += 1;
                }
            }
            Ok(depth)
        });
        assert_eq!(outer.unwrap(), 1);
        assert_eq!(errors, 3);
    }

    #[test]
    fn test_mutual_recursion_through_two_guards() {
        use std::cell::RefCell;

        struct Pair {
            f: ReentryGuard,
            g: ReentryGuard,
            calls: RefCell<Vec<&'static str>>,
        }

        fn f(pair: &Pair) -> Result<()> {
            pair.f.call(|| {
                pair.calls.borrow_mut().push("f");
                g(pair)
            })
        }

        fn g(pair: &Pair) -> Result<()> {
            pair.g.call(|| {
                pair.calls.borrow_mut().push("g");
                f(pair)
            })
        }

        let pair = Pair {
            f: ReentryGuard::new(),
            g: ReentryGuard::new(),
            calls: RefCell::new(Vec::new()),
        };
        assert!(matches!(f(&pair), Err(Error::Reentry)));
        assert_eq!(*pair.calls.borrow(), ["f", "g"]);
        assert!(!pair.f.is_running() && !pair.g.is_running());
    }

    #[test]
    fn test_reusable_after_error() {
        let guard = ReentryGuard::new();
        let failed: Result<()> = guard.call(|| Err(Error::NoResult));
        assert!(matches!(failed, Err(Error::NoResult)));
        assert!(!guard.is_running());
        assert_eq!(guard.call(|| Ok("again")).unwrap(), "again");
    }

    #[test]
    fn test_reusable_after_panic() {
        let guard = ReentryGuard::new();
        let caught = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = guard.call(|| panic!("inside guarded call"));
        }));
        assert!(caught.is_err());
        assert!(!guard.is_running());
        assert!(guard.call(|| Ok(())).is_ok());
    }

    #[test]
    fn test_concurrent_call_from_other_thread() {
        let guard = Arc::new(ReentryGuard::new());
        let other = Arc::clone(&guard);
        let result = guard.call(|| {
            let handle = std::thread::spawn(move || other.call(|| Ok(())));
            Ok(handle.join().unwrap())
        });
        assert!(matches!(result, Ok(Err(Error::Reentry))));
    }
}
