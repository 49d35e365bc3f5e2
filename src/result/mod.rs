//! Where test outcomes are reported.
//!
//! A [`TestResult`] receives one `start_test`/`stop_test` pair per test and,
//! between them, exactly one of `add_success`, `add_failure`, `add_error` or
//! `add_skip`.

mod recording;

pub use recording::{Event, RecordingResult};

use crate::deferred::Failure;
use crate::runtest::Details;

/// Receives test outcomes.
pub trait TestResult {
    /// A test is about to run.
    fn start_test(&mut self, test: &str);

    /// A test has finished; nothing more will be reported for it.
    fn stop_test(&mut self, test: &str);

    /// The test passed.
    fn add_success(&mut self, test: &str, details: &Details);

    /// The test failed an assertion.
    fn add_failure(&mut self, test: &str, failure: &Failure, details: &Details);

    /// The test raised an error.
    fn add_error(&mut self, test: &str, failure: &Failure, details: &Details);

    /// The test was skipped.
    fn add_skip(&mut self, test: &str, reason: &str, details: &Details);
}

impl<R: TestResult + ?Sized> TestResult for &mut R {
    fn start_test(&mut self, test: &str) {
        (**self).start_test(test);
    }

    fn stop_test(&mut self, test: &str) {
        (**self).stop_test(test);
    }

    fn add_success(&mut self, test: &str, details: &Details) {
        (**self).add_success(test, details);
    }

    fn add_failure(&mut self, test: &str, failure: &Failure, details: &Details) {
        (**self).add_failure(test, failure, details);
    }

    fn add_error(&mut self, test: &str, failure: &Failure, details: &Details) {
        (**self).add_error(test, failure, details);
    }

    fn add_skip(&mut self, test: &str, reason: &str, details: &Details) {
        (**self).add_skip(test, reason, details);
    }
}
