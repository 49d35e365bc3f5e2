//! Running the phases of one test and reporting the outcome.
//!
//! [`RunTest`] runs set up, the body, cleanups and tear down in order,
//! collects every fault along the way and reports exactly one outcome to a
//! [`TestResult`], bracketed by `start_test` and `stop_test`.
//!
//! - A failed set up skips the body and tear down. Cleanups still run.
//! - A skip in set up skips the body. Tear down and cleanups still run.
//! - A failed or skipped body still runs tear down and cleanups.
//! - Each failing cleanup is recorded and the remaining cleanups still run.
//! - An interrupt stops the remaining phases; `stop_test` is still reported
//!   before [`Error::NoResult`] is returned.
//!
//! # Example
//!
//! ```rust
//! use testkit_reactor::prelude::*;
//!
//! let run_test = RunTest::new(Spinner::new(Reactor::new()));
//! let test = TestPhases::new("test_fails")
//!     .body(|| Err(Failure::assertion("1 != 2")));
//!
//! let mut result = RecordingResult::new();
//! let outcome = run_test.run(test, &mut result).unwrap();
//! assert!(matches!(outcome, Outcome::Failure(_)));
//! assert_eq!(result.event_names(), ["start_test", "add_failure", "stop_test"]);
//! ```

mod details;
mod phases;
mod runner;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub use details::Details;
pub use phases::{Cleanups, CleanupOrder, Phase, TestPhases};
pub use runner::{PhaseRunner, SpinningRunner, SynchronousRunner};

use crate::deferred::{trap_unhandled_failures, Failure, UnhandledFailure};
use crate::error::{Error as CrateError, Result};
use crate::result::TestResult;
use crate::spinner::{Junk, Spinner};

/// What to do when the reactor is left unclean after a phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JunkPolicy {
    /// Error the test.
    #[default]
    Fail,
    /// Only attach an `unclean-reactor` detail.
    Report,
}

/// What to do with unhandled failures trapped during a phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnhandledPolicy {
    /// Error the test.
    #[default]
    Fail,
    /// Only attach an `unhandled-error-in-deferred` detail.
    Report,
}

/// Configuration for [`RunTest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunTestConfig {
    /// How long each phase may take.
    pub timeout: Duration,
    /// Handling of leftover reactor state.
    pub junk_policy: JunkPolicy,
    /// Handling of unhandled failures.
    pub unhandled_policy: UnhandledPolicy,
}

impl Default for RunTestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            junk_policy: JunkPolicy::default(),
            unhandled_policy: UnhandledPolicy::default(),
        }
    }
}

impl RunTestConfig {
    /// Create a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-phase timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the junk policy.
    #[must_use]
    pub fn with_junk_policy(mut self, policy: JunkPolicy) -> Self {
        self.junk_policy = policy;
        self
    }

    /// Set the unhandled failure policy.
    #[must_use]
    pub fn with_unhandled_policy(mut self, policy: UnhandledPolicy) -> Self {
        self.unhandled_policy = policy;
        self
    }
}

/// The single outcome reported for a test.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Every phase passed.
    Success,
    /// An assertion failed.
    Failure(Failure),
    /// Something other than an assertion went wrong.
    Error(Failure),
    /// The test asked to be skipped.
    Skip(String),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(failure) => write!(f, "failure: {failure}"),
            Self::Error(failure) => write!(f, "error: {failure}"),
            Self::Skip(reason) => write!(f, "skip: {reason}"),
        }
    }
}

/// Raised into a test when failures went unhandled during one of its phases.
#[derive(Error, Debug, Clone)]
#[error("unhandled error in deferred: {}", .0.join("; "))]
pub struct UnhandledErrorInDeferred(pub Vec<String>);

/// Raised into a test when a phase left the reactor unclean.
#[derive(Error, Debug, Clone)]
#[error(
    "the reactor still holds state after the test; close all connections, \
     stop all threads and cancel all delayed calls: {}",
    Junk::describe_all(.0)
)]
pub struct UncleanReactor(pub Vec<Junk>);

/// Faults collected while the phases run.
#[derive(Default)]
struct Faults {
    errors: Vec<Failure>,
    failures: Vec<Failure>,
    skip: Option<String>,
    details: Details,
}

impl Faults {
    fn record(&mut self, test: &str, phase: &str, failure: Failure) {
        if let Some(reason) = failure.skip_reason() {
            tracing::debug!(test, phase, reason, "test skipped");
            self.skip.get_or_insert_with(|| reason.to_string());
            return;
        }
        tracing::debug!(test, phase, %failure, "phase failed");
        self.details
            .add_unique("traceback", format!("in {phase}:\n{}", failure.render()));
        if failure.is_assertion() {
            self.failures.push(failure);
        } else {
            self.errors.push(failure);
        }
    }

    fn outcome(&self) -> Outcome {
        if let Some(error) = self.errors.first() {
            Outcome::Error(error.clone())
        } else if let Some(failure) = self.failures.first() {
            Outcome::Failure(failure.clone())
        } else if let Some(reason) = &self.skip {
            Outcome::Skip(reason.clone())
        } else {
            Outcome::Success
        }
    }
}

/// How a phase ended, once its fault (if any) is recorded.
enum PhaseEnd {
    Passed,
    Skipped,
    Faulted,
}

/// Runs the phases of a test and reports the outcome.
#[derive(Debug)]
pub struct RunTest<P = SpinningRunner> {
    runner: P,
    config: RunTestConfig,
}

impl RunTest<SpinningRunner> {
    /// Runs phases through `spinner` with the default configuration.
    #[must_use]
    pub fn new(spinner: Spinner) -> Self {
        Self::with_config(spinner, RunTestConfig::default())
    }

    /// Runs phases through `spinner` with the given configuration.
    #[must_use]
    pub fn with_config(spinner: Spinner, config: RunTestConfig) -> Self {
        Self::with_runner(SpinningRunner::new(spinner), config)
    }
}

impl RunTest<SynchronousRunner> {
    /// Runs phases without a reactor; every phase must finish straight away.
    #[must_use]
    pub fn synchronous() -> Self {
        Self::with_runner(SynchronousRunner, RunTestConfig::default())
    }
}

impl<P: PhaseRunner> RunTest<P> {
    /// Runs phases through `runner`.
    #[must_use]
    pub fn with_runner(runner: P, config: RunTestConfig) -> Self {
        Self { runner, config }
    }

    /// The phase runner.
    #[must_use]
    pub fn runner(&self) -> &P {
        &self.runner
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &RunTestConfig {
        &self.config
    }

    /// Runs `test`, reporting to `result`, and returns the reported outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoResult`](crate::Error::NoResult) if a phase was
    /// interrupted. The interruption is reported to `result` as an error and
    /// `stop_test` is called before returning.
    pub fn run(&self, test: TestPhases, result: &mut dyn TestResult) -> Result<Outcome> {
        let TestPhases {
            id,
            set_up,
            body,
            tear_down,
            cleanups,
            cleanup_order,
            details,
        } = test;

        result.start_test(&id);
        tracing::debug!(test = %id, "test started");
        let mut faults = Faults {
            details,
            ..Faults::default()
        };

        let ran = self.run_phases(
            &id,
            &mut faults,
            set_up,
            body,
            tear_down,
            &cleanups,
            cleanup_order,
        );
        if let Err(err) = ran {
            tracing::warn!(test = %id, error = %err, "test interrupted");
            result.add_error(&id, &Failure::new(err.clone()), &faults.details);
            result.stop_test(&id);
            return Err(err);
        }

        let outcome = faults.outcome();
        match &outcome {
            Outcome::Success => result.add_success(&id, &faults.details),
            Outcome::Failure(failure) => result.add_failure(&id, failure, &faults.details),
            Outcome::Error(failure) => result.add_error(&id, failure, &faults.details),
            Outcome::Skip(reason) => result.add_skip(&id, reason, &faults.details),
        }
        result.stop_test(&id);
        tracing::debug!(test = %id, %outcome, "test finished");
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phases(
        &self,
        test: &str,
        faults: &mut Faults,
        set_up: Option<Phase>,
        body: Option<Phase>,
        tear_down: Option<Phase>,
        cleanups: &Cleanups,
        order: CleanupOrder,
    ) -> Result<()> {
        match self.run_optional(test, faults, set_up)? {
            PhaseEnd::Faulted => return self.run_cleanups(test, faults, cleanups),
            // A skip in set up skips the body only.
            PhaseEnd::Skipped => {}
            PhaseEnd::Passed => {
                self.run_optional(test, faults, body)?;
            }
        }
        match order {
            CleanupOrder::BeforeTearDown => {
                self.run_cleanups(test, faults, cleanups)?;
                self.run_optional(test, faults, tear_down)?;
            }
            CleanupOrder::AfterTearDown => {
                self.run_optional(test, faults, tear_down)?;
                self.run_cleanups(test, faults, cleanups)?;
            }
        }
        Ok(())
    }

    fn run_cleanups(&self, test: &str, faults: &mut Faults, cleanups: &Cleanups) -> Result<()> {
        while let Some(cleanup) = cleanups.pop() {
            self.run_phase(test, faults, cleanup)?;
        }
        Ok(())
    }

    fn run_optional(
        &self,
        test: &str,
        faults: &mut Faults,
        phase: Option<Phase>,
    ) -> Result<PhaseEnd> {
        match phase {
            Some(phase) => self.run_phase(test, faults, phase),
            None => Ok(PhaseEnd::Passed),
        }
    }

    /// Runs one phase with unhandled failures trapped, then checks the reactor.
    fn run_phase(&self, test: &str, faults: &mut Faults, phase: Phase) -> Result<PhaseEnd> {
        let name = phase.name().to_string();
        tracing::trace!(test, phase = %name, "running phase");
        let (ran, unhandled) =
            trap_unhandled_failures(|| self.runner.run_phase(phase, self.config.timeout));
        let junk = self.runner.take_junk();

        let mut end = PhaseEnd::Passed;
        match ran {
            Ok(()) => {}
            Err(CrateError::NoResult) => {
                // Still reported with the interruption itself.
                if !unhandled.is_empty() {
                    faults
                        .details
                        .add_unique("unhandled-error-in-deferred", render_unhandled(&unhandled));
                }
                if !junk.is_empty() {
                    faults
                        .details
                        .add_unique("unclean-reactor", Junk::describe_all(&junk));
                }
                return Err(CrateError::NoResult);
            }
            Err(CrateError::Failed(failure)) => {
                end = if failure.skip_reason().is_some() {
                    PhaseEnd::Skipped
                } else {
                    PhaseEnd::Faulted
                };
                faults.record(test, &name, failure);
            }
            Err(other) => {
                faults.record(test, &name, Failure::new(other));
                end = PhaseEnd::Faulted;
            }
        }

        if !unhandled.is_empty() {
            faults
                .details
                .add_unique("unhandled-error-in-deferred", render_unhandled(&unhandled));
            if self.config.unhandled_policy == UnhandledPolicy::Fail {
                let messages = unhandled.iter().map(ToString::to_string).collect();
                faults.record(test, &name, Failure::new(UnhandledErrorInDeferred(messages)));
                end = PhaseEnd::Faulted;
            }
        }

        if !junk.is_empty() {
            faults
                .details
                .add_unique("unclean-reactor", Junk::describe_all(&junk));
            if self.config.junk_policy == JunkPolicy::Fail {
                faults.record(test, &name, Failure::new(UncleanReactor(junk)));
                end = PhaseEnd::Faulted;
            }
        }
        Ok(end)
    }
}

fn render_unhandled(unhandled: &[UnhandledFailure]) -> String {
    unhandled
        .iter()
        .map(|u| format!("{}:\n{}", u.origin, u.failure.render()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Deferred;
    use crate::result::{Event, RecordingResult};

    fn run(test: TestPhases) -> (Outcome, RecordingResult) {
        let mut result = RecordingResult::new();
        let outcome = RunTest::synchronous().run(test, &mut result).unwrap();
        (outcome, result)
    }

    #[test]
    fn test_success() {
        let (outcome, result) = run(TestPhases::new("t").body(|| Ok(())));
        assert!(outcome.is_success());
        assert_eq!(result.event_names(), ["start_test", "add_success", "stop_test"]);
    }

    #[test]
    fn test_error_beats_failure() {
        let test = TestPhases::new("t")
            .body(|| Err(Failure::assertion("first")))
            .tear_down(|| Err(Failure::new(std::fmt::Error)));
        let (outcome, result) = run(test);
        assert!(matches!(outcome, Outcome::Error(ref f) if f.is::<std::fmt::Error>()));
        let details = result.last_outcome().and_then(Event::details).unwrap();
        assert!(details.contains("traceback"));
        assert!(details.contains("traceback-1"));
    }

    #[test]
    fn test_set_up_failure_skips_body_and_tear_down() {
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (body_log, tear_log, clean_log) = (log.clone(), log.clone(), log.clone());
        let test = TestPhases::new("t")
            .set_up(|| Err(Failure::assertion("no fixture")))
            .body(move || {
                body_log.lock().push("body");
                Ok(())
            })
            .tear_down(move || {
                tear_log.lock().push("tear_down");
                Ok(())
            })
            .cleanup(move || {
                clean_log.lock().push("cleanup");
                Ok(())
            });
        let (outcome, _) = run(test);
        assert!(matches!(outcome, Outcome::Failure(_)));
        assert_eq!(*log.lock(), vec!["cleanup"]);
    }

    #[test]
    fn test_skip_in_body() {
        let test = TestPhases::new("t").body(|| Err(Failure::skip("not today")));
        let (outcome, result) = run(test);
        assert!(matches!(outcome, Outcome::Skip(ref reason) if reason == "not today"));
        assert_eq!(result.event_names(), ["start_test", "add_skip", "stop_test"]);
    }

    #[test]
    fn test_unhandled_failure_errors_test() {
        let test = TestPhases::new("t").body(|| {
            drop(Deferred::<()>::fail(Failure::assertion("dropped")));
            Ok(())
        });
        let (outcome, result) = run(test);
        assert!(matches!(outcome, Outcome::Error(ref f) if f.is::<UnhandledErrorInDeferred>()));
        let details = result.last_outcome().and_then(Event::details).unwrap();
        assert!(details.contains("unhandled-error-in-deferred"));
    }

    #[test]
    fn test_unhandled_failure_reported_only() {
        let run_test = RunTest::with_runner(
            SynchronousRunner,
            RunTestConfig::new().with_unhandled_policy(UnhandledPolicy::Report),
        );
        let test = TestPhases::new("t").body(|| {
            drop(Deferred::<()>::fail(Failure::assertion("dropped")));
            Ok(())
        });
        let mut result = RecordingResult::new();
        let outcome = run_test.run(test, &mut result).unwrap();
        assert!(outcome.is_success());
        let details = result.last_outcome().and_then(Event::details).unwrap();
        assert!(details
            .get("unhandled-error-in-deferred")
            .unwrap()
            .contains("dropped"));
    }

    #[test]
    fn test_initial_details_are_reported() {
        let test = TestPhases::new("t").detail("log", "hello").body(|| Ok(()));
        let (_, result) = run(test);
        let details = result.last_outcome().and_then(Event::details).unwrap();
        assert_eq!(details.get("log"), Some("hello"));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Success.to_string(), "success");
        assert_eq!(Outcome::Skip("later".into()).to_string(), "skip: later");
    }
}
