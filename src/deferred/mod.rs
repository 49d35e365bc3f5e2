//! Pending computations.
//!
//! A [`Deferred`] is a value that becomes available later, exactly once, as
//! either a success or a [`Failure`]. Interested parties attach callbacks; the
//! event loop (or whoever owns the computation) fires it.
//!
//! # Example
//!
//! ```rust
//! use testkit_reactor::deferred::{extract_result, Deferred};
//!
//! let d = Deferred::new();
//! assert!(extract_result(&d).is_err()); // not fired yet
//!
//! d.callback(42).unwrap();
//! assert_eq!(extract_result(&d).unwrap(), 42);
//! ```

mod failure;
mod trap;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

pub use failure::{AssertionFailed, Failure, Panicked, SkipTest};
pub use trap::{trap_unhandled_failures, FailureSink, SinkGuard, UnhandledFailure};
pub(crate) use trap::report as report_unhandled;

use crate::error::{Error, Result};

/// Unique identifier for a deferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeferredId(u64);

impl DeferredId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deferred({})", self.0)
    }
}

type Outcome<T> = std::result::Result<T, Failure>;
type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Fired(Arc<Outcome<T>>),
}

struct Inner<T> {
    id: DeferredId,
    state: Mutex<State<T>>,
    /// Set once anything that can see a failure has been attached.
    observed: AtomicBool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.observed.load(Ordering::Acquire) {
            return;
        }
        if let State::Fired(outcome) = &*self.state.get_mut() {
            if let Err(failure) = &**outcome {
                trap::report(UnhandledFailure {
                    failure: failure.clone(),
                    origin: self.id.to_string(),
                });
            }
        }
    }
}

/// A computation that resolves later, once.
///
/// Cloning a `Deferred` gives another handle to the same computation.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Deferred<T> {
    /// Creates a deferred that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    /// Creates a deferred that has already succeeded with `value`.
    #[must_use]
    pub fn succeed(value: T) -> Self {
        Self::with_state(State::Fired(Arc::new(Ok(value))))
    }

    /// Creates a deferred that has already failed.
    #[must_use]
    pub fn fail(failure: impl Into<Failure>) -> Self {
        Self::with_state(State::Fired(Arc::new(Err(failure.into()))))
    }

    fn with_state(state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: DeferredId::new(),
                state: Mutex::new(state),
                observed: AtomicBool::new(false),
            }),
        }
    }

    /// This deferred's identifier.
    #[must_use]
    pub fn id(&self) -> DeferredId {
        self.inner.id
    }

    /// Fires the deferred with a success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFired`] if the deferred has already fired.
    pub fn callback(&self, value: T) -> Result<()> {
        self.resolve(Ok(value))
    }

    /// Fires the deferred with a failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFired`] if the deferred has already fired.
    pub fn errback(&self, failure: impl Into<Failure>) -> Result<()> {
        self.resolve(Err(failure.into()))
    }

    /// Fires the deferred with either outcome, then runs the attached callbacks
    /// in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyFired`] if the deferred has already fired.
    pub fn resolve(&self, outcome: Outcome<T>) -> Result<()> {
        let outcome = Arc::new(outcome);
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Fired(_) => return Err(Error::AlreadyFired(self.id().to_string())),
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Fired(Arc::clone(&outcome));
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
        Ok(())
    }

    /// Attaches a callback that sees either outcome.
    ///
    /// Runs immediately if the deferred has already fired.
    pub fn add_both<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.inner.observed.store(true, Ordering::Release);
        self.attach(Box::new(f));
        self
    }

    /// Attaches a success callback and a failure callback.
    pub fn add_callbacks<F, G>(&self, on_success: F, on_failure: G) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
        G: FnOnce(&Failure) + Send + 'static,
    {
        self.add_both(move |outcome| match outcome {
            Ok(value) => on_success(value),
            Err(failure) => on_failure(failure),
        })
    }

    /// Attaches a success-only callback.
    ///
    /// This does not count as handling a failure: a deferred that fails with
    /// only success callbacks attached is still reported as unhandled.
    pub fn add_callback<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.attach(Box::new(move |outcome| {
            if let Ok(value) = outcome {
                f(value);
            }
        }));
        self
    }

    /// Attaches a failure-only callback.
    pub fn add_errback<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Failure) + Send + 'static,
    {
        self.add_both(move |outcome| {
            if let Err(failure) = outcome {
                f(failure);
            }
        })
    }

    fn attach(&self, callback: Callback<T>) {
        let fired = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                State::Fired(outcome) => Arc::clone(outcome),
            }
        };
        callback(&fired);
    }

    /// Returns the outcome if the deferred has fired, without attaching anything.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Fired(outcome) => Some(Arc::clone(outcome)),
        }
    }

    /// Returns `true` once the deferred has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Fired(_))
    }

    /// Returns `true` while the deferred has not fired.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.is_fired()
    }

    /// Marks any failure as handled without attaching a callback.
    pub(crate) fn mark_observed(&self) {
        self.inner.observed.store(true, Ordering::Release);
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Chains a computation onto this deferred.
    ///
    /// `f` receives the outcome once this deferred fires; whatever it returns
    /// (a value, a failure or another deferred) fires the returned deferred.
    ///
    /// # Example
    ///
    /// ```rust
    /// use testkit_reactor::deferred::{extract_result, Deferred, Failure};
    ///
    /// let d = Deferred::new();
    /// let doubled = d.then(|r: Result<i32, Failure>| r.map(|v| v * 2));
    /// d.callback(21).unwrap();
    /// assert_eq!(extract_result(&doubled).unwrap(), 42);
    /// ```
    pub fn then<U, F, R>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> R + Send + 'static,
        R: IntoDeferred<U>,
    {
        let chained = Deferred::new();
        let target = chained.clone();
        self.add_both(move |outcome| {
            let next = f(outcome.clone()).into_deferred();
            next.add_both(move |outcome| {
                // `target` is private to this chain and fires only here.
                let _ = target.resolve(outcome.clone());
            });
        });
        chained
    }

    /// Returns a future that resolves with this deferred's outcome.
    ///
    /// Useful inside tasks spawned on a [`Reactor`](crate::reactor::Reactor).
    #[must_use]
    pub fn wait(&self) -> Wait<T> {
        Wait {
            deferred: self.clone(),
            waker: None,
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fired = matches!(&*self.inner.state.lock(), State::Fired(_));
        f.debug_struct("Deferred")
            .field("id", &self.inner.id.0)
            .field("fired", &fired)
            .finish()
    }
}

/// Future returned by [`Deferred::wait`].
pub struct Wait<T> {
    deferred: Deferred<T>,
    waker: Option<Arc<Mutex<Waker>>>,
}

impl<T: Clone + Send + Sync + 'static> Future for Wait<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.deferred.peek() {
            self.deferred.mark_observed();
            return Poll::Ready((*outcome).clone());
        }
        if let Some(waker) = &self.waker {
            waker.lock().clone_from(cx.waker());
        } else {
            let waker = Arc::new(Mutex::new(cx.waker().clone()));
            let slot = Arc::clone(&waker);
            self.waker = Some(waker);
            self.deferred.add_both(move |_| slot.lock().wake_by_ref());
        }
        Poll::Pending
    }
}

/// Conversion into a [`Deferred`].
///
/// A deferred passes through unchanged; a `Result` becomes a deferred that has
/// already fired. This is what lets a callable return either an immediate value
/// or a pending computation.
pub trait IntoDeferred<T> {
    /// Performs the conversion.
    fn into_deferred(self) -> Deferred<T>;
}

impl<T: Send + Sync + 'static> IntoDeferred<T> for Deferred<T> {
    fn into_deferred(self) -> Deferred<T> {
        self
    }
}

impl<T: Send + Sync + 'static> IntoDeferred<T> for Outcome<T> {
    fn into_deferred(self) -> Deferred<T> {
        match self {
            Ok(value) => Deferred::succeed(value),
            Err(failure) => Deferred::fail(failure),
        }
    }
}

/// Extracts the result from a fired deferred.
///
/// Never waits: an API that returns deferreds for compatibility but is in fact
/// synchronous can hand its results back in the usual form this way.
///
/// # Errors
///
/// - [`Error::DeferredNotFired`] if `deferred` has not fired
/// - the deferred's own failure, re-raised, if it failed
pub fn extract_result<T>(deferred: &Deferred<T>) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
{
    deferred.mark_observed();
    match deferred.peek() {
        None => Err(Error::DeferredNotFired(deferred.id().to_string())),
        Some(outcome) => match &*outcome {
            Ok(value) => Ok(value.clone()),
            Err(failure) => Err(Error::from(failure.clone())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_not_fired() {
        let d = Deferred::<i32>::new();
        assert!(matches!(extract_result(&d), Err(Error::DeferredNotFired(_))));
    }

    #[test]
    fn test_extract_success() {
        let d = Deferred::succeed("marker");
        assert_eq!(extract_result(&d).unwrap(), "marker");
    }

    #[test]
    fn test_extract_failure() {
        let d = Deferred::<()>::fail(Failure::assertion("1/0"));
        let err = extract_result(&d).unwrap_err();
        assert!(err.failure().unwrap().is::<AssertionFailed>());
    }

    #[test]
    fn test_extract_failure_reraises_crate_error() {
        let d = Deferred::<()>::fail(Error::Reentry);
        assert!(matches!(extract_result(&d), Err(Error::Reentry)));
    }

    #[test]
    fn test_fires_exactly_once() {
        let d = Deferred::new();
        d.callback(1).unwrap();
        assert!(matches!(d.callback(2), Err(Error::AlreadyFired(_))));
        assert!(d.errback(Failure::assertion("late")).is_err());
        assert_eq!(extract_result(&d).unwrap(), 1);
    }

    #[test]
    fn test_callbacks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let d = Deferred::new();
        for i in 0..3 {
            let log = Arc::clone(&log);
            d.add_callback(move |v: &i32| log.lock().push(v + i));
        }
        assert!(log.lock().is_empty());
        d.callback(10).unwrap();
        assert_eq!(*log.lock(), vec![10, 11, 12]);
    }

    #[test]
    fn test_callback_added_after_fire_runs_immediately() {
        let d = Deferred::succeed(5);
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        d.add_callbacks(move |v| *slot.lock() = Some(*v), |_| {});
        assert_eq!(*seen.lock(), Some(5));
    }

    #[test]
    fn test_callback_can_touch_its_own_deferred() {
        let d = Deferred::new();
        let inner = d.clone();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        d.add_both(move |_| *slot.lock() = Some(extract_result(&inner).unwrap()));
        d.callback(3).unwrap();
        assert_eq!(*seen.lock(), Some(3));
    }

    #[test]
    fn test_success_only_callback_does_not_handle_failure() {
        let ((), failures) = trap_unhandled_failures(|| {
            let d = Deferred::<i32>::new();
            d.add_callback(|_| {});
            d.errback(Failure::assertion("passed through")).unwrap();
        });
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_unhandled_reported_once_for_clones() {
        let ((), failures) = trap_unhandled_failures(|| {
            let d = Deferred::<()>::fail(Failure::assertion("x"));
            let clone = d.clone();
            drop(d);
            drop(clone);
        });
        assert_eq!(failures.len(), 1);
        assert!(failures[0].origin.starts_with("Deferred("));
    }

    #[test]
    fn test_pending_deferred_is_not_unhandled() {
        let ((), failures) = trap_unhandled_failures(|| drop(Deferred::<()>::new()));
        assert!(failures.is_empty());
    }

    #[test]
    fn test_then_chains_into_deferred() {
        let first = Deferred::new();
        let second = Deferred::new();
        let inner = second.clone();
        let chained = first.then(move |r: Outcome<i32>| {
            assert_eq!(r.unwrap(), 1);
            inner
        });
        first.callback(1).unwrap();
        assert!(chained.is_pending());
        second.callback("done").unwrap();
        assert_eq!(extract_result(&chained).unwrap(), "done");
    }

    #[test]
    fn test_then_propagates_failure() {
        let d = Deferred::<i32>::fail(Failure::assertion("bad"));
        let chained = d.then(|r| r.map(|v| v + 1));
        let err = extract_result(&chained).unwrap_err();
        assert!(err.failure().unwrap().is_assertion());
    }

    #[test]
    fn test_into_deferred() {
        let ok: Outcome<i32> = Ok(1);
        assert_eq!(extract_result(&ok.into_deferred()).unwrap(), 1);

        let err: Outcome<i32> = Err(Failure::assertion("no"));
        assert!(extract_result(&err.into_deferred()).is_err());

        let pending = Deferred::<i32>::new();
        assert_eq!(pending.clone().into_deferred().id(), pending.id());
    }

    #[test]
    fn test_wait_future_resolves() {
        let d = Deferred::new();
        let mut wait = Box::pin(d.wait());
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(wait.as_mut().poll(&mut cx).is_pending());
        d.callback(9).unwrap();
        match wait.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 9),
            other => panic!("unexpected poll result: {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_debug_shows_state() {
        let d = Deferred::<()>::new();
        assert!(format!("{d:?}").contains("fired: false"));
    }
}
