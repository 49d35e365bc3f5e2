//! Error definitions
//!
//! This module provides the error type shared by the bridge, the event loop and
//! the phase sequencer. Every variant is a distinct kind: callers can tell
//! "it failed" ([`Error::Failed`]) from "it never finished" ([`Error::Timeout`],
//! [`Error::NoResult`]) from misuse of the API ([`Error::Reentry`],
//! [`Error::StaleJunk`], [`Error::DeferredNotFired`], [`Error::AlreadyFired`]).

use std::time::Duration;

use thiserror::Error;

use crate::deferred::Failure;
use crate::spinner::Junk;

/// Main error type for testkit-reactor
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A non-reentrant operation was entered while it was already running.
    #[error("function called while already running")]
    Reentry,

    /// The spinner still holds junk from a previous run.
    #[error("there was junk in the spinner from a previous run: {}", Junk::describe_all(.0))]
    StaleJunk(Vec<Junk>),

    /// The awaited computation did not resolve within its budget.
    #[error("{name} took longer than {timeout:?} to run")]
    Timeout {
        /// What was being run.
        name: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// The run ended before the computation resolved, usually because of an interrupt.
    #[error("no result from the reactor, it was probably interrupted")]
    NoResult,

    /// A result was extracted from a deferred that has not fired.
    #[error("{0} has not fired yet")]
    DeferredNotFired(String),

    /// A deferred was fired twice.
    #[error("{0} has already been fired")]
    AlreadyFired(String),

    /// The computation itself failed.
    #[error("{0}")]
    Failed(Failure),
}

impl Error {
    /// Create a timeout error.
    #[must_use]
    pub fn timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            name: name.into(),
            timeout,
        }
    }

    /// Returns the failure carried by [`Error::Failed`].
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns `true` for the kinds that mean "the computation never finished".
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NoResult)
    }
}

impl From<Failure> for Error {
    /// Re-raises a failure. A failure that wraps one of our own errors comes
    /// back as that error, so a nested `Reentry` stays a `Reentry`.
    fn from(failure: Failure) -> Self {
        match failure.downcast_ref::<Error>() {
            Some(inner) => inner.clone(),
            None => Self::Failed(failure),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::AssertionFailed;

    #[test]
    fn test_timeout_message_names_budget() {
        let err = Error::timeout("set_up", Duration::from_millis(5));
        assert_eq!(err.to_string(), "set_up took longer than 5ms to run");
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_failure_round_trips_crate_errors() {
        let failure = Failure::new(Error::Reentry);
        assert!(matches!(Error::from(failure), Error::Reentry));
    }

    #[test]
    fn test_failure_keeps_foreign_errors() {
        let failure = Failure::new(AssertionFailed::new("boom"));
        let err = Error::from(failure);
        let inner = err.failure().unwrap();
        assert!(inner.is::<AssertionFailed>());
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_stale_junk_lists_junk() {
        let err = Error::StaleJunk(vec![]);
        assert_eq!(
            err.to_string(),
            "there was junk in the spinner from a previous run: []"
        );
    }
}
