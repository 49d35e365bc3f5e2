//! Trapping failures that nobody observed.
//!
//! A deferred that fires with a failure and is dropped without any callback
//! ever being attached reports that failure to the innermost [`FailureSink`]
//! installed on the current thread. Sinks are installed for a scope and the
//! previous one is restored when the scope ends, on every exit path.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Failure;

thread_local! {
    static CURRENT_SINK: RefCell<Option<FailureSink>> = const { RefCell::new(None) };
}

/// A failure that reached the end of its deferred's life unobserved.
#[derive(Clone, Debug)]
pub struct UnhandledFailure {
    /// The failure nobody handled.
    pub failure: Failure,
    /// Debug description of the deferred it came from.
    pub origin: String,
}

impl fmt::Display for UnhandledFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unhandled error in {}: {}", self.origin, self.failure)
    }
}

/// Collects unhandled failures while installed.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::deferred::{Deferred, Failure, FailureSink};
///
/// let sink = FailureSink::new();
/// {
///     let _guard = sink.install();
///     let _ = Deferred::<()>::fail(Failure::assertion("lost"));
/// }
/// assert_eq!(sink.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct FailureSink {
    failures: Arc<Mutex<Vec<UnhandledFailure>>>,
}

impl FailureSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs this sink on the current thread until the guard is dropped.
    #[must_use = "the sink is uninstalled when the guard is dropped"]
    pub fn install(&self) -> SinkGuard {
        let previous = CURRENT_SINK.with(|slot| slot.borrow_mut().replace(self.clone()));
        SinkGuard { previous }
    }

    /// Records a failure.
    pub fn record(&self, failure: UnhandledFailure) {
        self.failures.lock().push(failure);
    }

    /// Number of failures recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything recorded, in order.
    #[must_use]
    pub fn take(&self) -> Vec<UnhandledFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

impl fmt::Debug for FailureSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureSink")
            .field("recorded", &self.len())
            .finish()
    }
}

/// Restores the previously installed sink when dropped.
#[derive(Debug)]
pub struct SinkGuard {
    previous: Option<FailureSink>,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The slot may already be gone during thread teardown.
        let _ = CURRENT_SINK.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Reports a failure to the sink installed on this thread.
///
/// With no sink installed the failure is logged.
pub(crate) fn report(failure: UnhandledFailure) {
    let sink = CURRENT_SINK
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten();
    match sink {
        Some(sink) => sink.record(failure),
        None => tracing::error!(
            origin = %failure.origin,
            failure = %failure.failure,
            "unhandled error in deferred"
        ),
    }
}

/// Runs `thunk`, collecting every unhandled failure reported while it runs.
///
/// The previous sink is restored on return and while unwinding, so a panic in
/// `thunk` propagates with the thread left as it was.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::deferred::{trap_unhandled_failures, Deferred, Failure};
///
/// let (value, failures) = trap_unhandled_failures(|| {
///     drop(Deferred::<()>::fail(Failure::assertion("nobody looked")));
///     7
/// });
/// assert_eq!(value, 7);
/// assert_eq!(failures.len(), 1);
/// ```
pub fn trap_unhandled_failures<F, R>(thunk: F) -> (R, Vec<UnhandledFailure>)
where
    F: FnOnce() -> R,
{
    let sink = FailureSink::new();
    let result = {
        let _guard = sink.install();
        thunk()
    };
    (result, sink.take())
}
