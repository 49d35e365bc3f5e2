// Allow must_use_candidate since accessors are mostly used in assertions
#![allow(clippy::must_use_candidate)]

//! A result that records every call, for asserting on in tests.
//!
//! # Example
//!
//! ```rust
//! use testkit_reactor::result::{RecordingResult, TestResult};
//! use testkit_reactor::runtest::Details;
//!
//! let mut result = RecordingResult::new();
//! result.start_test("t");
//! result.add_success("t", &Details::new());
//! result.stop_test("t");
//!
//! assert_eq!(result.event_names(), ["start_test", "add_success", "stop_test"]);
//! assert!(result.was_successful());
//! ```

use super::TestResult;
use crate::deferred::Failure;
use crate::runtest::Details;

/// One call made on a [`RecordingResult`].
#[derive(Clone, Debug)]
pub enum Event {
    /// `start_test` was called.
    StartTest(String),
    /// `stop_test` was called.
    StopTest(String),
    /// `add_success` was called.
    Success {
        /// The test.
        test: String,
        /// Details passed with the call.
        details: Details,
    },
    /// `add_failure` was called.
    Failure {
        /// The test.
        test: String,
        /// The assertion failure.
        failure: Failure,
        /// Details passed with the call.
        details: Details,
    },
    /// `add_error` was called.
    Error {
        /// The test.
        test: String,
        /// The error.
        failure: Failure,
        /// Details passed with the call.
        details: Details,
    },
    /// `add_skip` was called.
    Skip {
        /// The test.
        test: String,
        /// Why it was skipped.
        reason: String,
        /// Details passed with the call.
        details: Details,
    },
}

impl Event {
    /// The name of the method that produced this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartTest(_) => "start_test",
            Self::StopTest(_) => "stop_test",
            Self::Success { .. } => "add_success",
            Self::Failure { .. } => "add_failure",
            Self::Error { .. } => "add_error",
            Self::Skip { .. } => "add_skip",
        }
    }

    /// Details carried by an outcome event.
    pub fn details(&self) -> Option<&Details> {
        match self {
            Self::StartTest(_) | Self::StopTest(_) => None,
            Self::Success { details, .. }
            | Self::Failure { details, .. }
            | Self::Error { details, .. }
            | Self::Skip { details, .. } => Some(details),
        }
    }
}

/// Records every call in order.
#[derive(Debug, Default)]
pub struct RecordingResult {
    events: Vec<Event>,
}

impl RecordingResult {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Method names of everything recorded so far.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(Event::name).collect()
    }

    /// The most recent outcome event.
    pub fn last_outcome(&self) -> Option<&Event> {
        self.events.iter().rev().find(|e| e.details().is_some())
    }

    /// Returns `true` if no failure or error has been recorded.
    pub fn was_successful(&self) -> bool {
        !self
            .events
            .iter()
            .any(|e| matches!(e, Event::Failure { .. } | Event::Error { .. }))
    }

    /// Forget everything recorded.
    pub fn reset(&mut self) {
        self.events.clear();
    }
}

impl TestResult for RecordingResult {
    fn start_test(&mut self, test: &str) {
        self.events.push(Event::StartTest(test.to_string()));
    }

    fn stop_test(&mut self, test: &str) {
        self.events.push(Event::StopTest(test.to_string()));
    }

    fn add_success(&mut self, test: &str, details: &Details) {
        self.events.push(Event::Success {
            test: test.to_string(),
            details: details.clone(),
        });
    }

    fn add_failure(&mut self, test: &str, failure: &Failure, details: &Details) {
        self.events.push(Event::Failure {
            test: test.to_string(),
            failure: failure.clone(),
            details: details.clone(),
        });
    }

    fn add_error(&mut self, test: &str, failure: &Failure, details: &Details) {
        self.events.push(Event::Error {
            test: test.to_string(),
            failure: failure.clone(),
            details: details.clone(),
        });
    }

    fn add_skip(&mut self, test: &str, reason: &str, details: &Details) {
        self.events.push(Event::Skip {
            test: test.to_string(),
            reason: reason.to_string(),
            details: details.clone(),
        });
    }
}
