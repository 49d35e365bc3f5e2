//! Failure values carried by deferreds.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

type DynError = dyn StdError + Send + Sync + 'static;

/// A captured error, shared between every observer of a deferred.
///
/// `Failure` keeps the original error value so observers can recover it with
/// [`downcast_ref`](Failure::downcast_ref), along with the name of its type and
/// a backtrace when backtraces are enabled.
///
/// Like `anyhow::Error`, `Failure` does not itself implement
/// [`std::error::Error`]; any error converts into it with `?`.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::deferred::{AssertionFailed, Failure};
///
/// let failure = Failure::new(AssertionFailed::new("1 != 2"));
/// assert!(failure.is::<AssertionFailed>());
/// assert_eq!(failure.message(), "assertion failed: 1 != 2");
/// ```
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureInner>,
}

struct FailureInner {
    error: Box<DynError>,
    type_name: &'static str,
    backtrace: Backtrace,
}

impl Failure {
    /// Wraps an error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FailureInner {
                error: Box::new(error),
                type_name: std::any::type_name::<E>(),
                backtrace: Backtrace::capture(),
            }),
        }
    }

    /// Builds a failure from a panic payload caught with `catch_unwind`.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new(Panicked { message })
    }

    /// A failure that asks the sequencer to skip the test.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::new(SkipTest {
            reason: reason.into(),
        })
    }

    /// A failure reported as an assertion failure rather than an error.
    #[must_use]
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(AssertionFailed::new(message))
    }

    /// Returns `true` if the wrapped error is of type `E`.
    #[must_use]
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.inner.error.is::<E>()
    }

    /// Returns the wrapped error if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.error.downcast_ref::<E>()
    }

    /// The wrapped error.
    #[must_use]
    pub fn error(&self) -> &DynError {
        &*self.inner.error
    }

    /// The name of the original error type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> String {
        self.inner.error.to_string()
    }

    /// The skip reason, if this failure is a [`SkipTest`].
    #[must_use]
    pub fn skip_reason(&self) -> Option<&str> {
        self.downcast_ref::<SkipTest>().map(|s| s.reason.as_str())
    }

    /// Whether this failure counts as a failed assertion.
    ///
    /// Panics count too: in Rust, `assert!` reports failure by panicking.
    #[must_use]
    pub fn is_assertion(&self) -> bool {
        self.is::<AssertionFailed>() || self.is::<Panicked>()
    }

    /// Returns `true` if two handles share the same underlying failure.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Renders the failure the way it appears in a `traceback` detail.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.type_name(), self.message());
        let mut source = self.inner.error.source();
        while let Some(cause) = source {
            out.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        if self.inner.backtrace.status() == BacktraceStatus::Captured {
            out.push_str(&format!("\n\n{}", self.inner.backtrace));
        }
        out
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.error, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("type", &self.inner.type_name)
            .field("message", &self.message())
            .finish_non_exhaustive()
    }
}

/// Raised from a phase to skip the test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("skipped: {reason}")]
pub struct SkipTest {
    /// Why the test was skipped.
    pub reason: String,
}

/// The dedicated assertion-failure kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("assertion failed: {message}")]
pub struct AssertionFailed {
    /// What did not hold.
    pub message: String,
}

impl AssertionFailed {
    /// Create an assertion failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A panic caught while running user code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("panicked: {message}")]
pub struct Panicked {
    /// The panic message.
    pub message: String,
}
