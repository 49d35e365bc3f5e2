//! How a single phase is driven to completion.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use super::Phase;
use crate::deferred::{extract_result, Deferred, Failure};
use crate::error::{Error, Result};
use crate::spinner::{Junk, Spinner};

/// Drives a phase to completion.
pub trait PhaseRunner {
    /// Runs `phase`, waiting at most `timeout` for it to finish.
    ///
    /// # Errors
    ///
    /// Returns the phase's own failure, or an [`Error`] describing why it did
    /// not finish. [`Error::NoResult`] means the run was interrupted.
    fn run_phase(&self, phase: Phase, timeout: Duration) -> Result<()>;

    /// Returns and forgets whatever the last phase left behind.
    fn take_junk(&self) -> Vec<Junk>;
}

/// Runs each phase on a reactor through a [`Spinner`].
#[derive(Debug)]
pub struct SpinningRunner {
    spinner: Spinner,
}

impl SpinningRunner {
    /// Create a runner around `spinner`.
    #[must_use]
    pub fn new(spinner: Spinner) -> Self {
        Self { spinner }
    }

    /// The spinner phases run through.
    #[must_use]
    pub fn spinner(&self) -> &Spinner {
        &self.spinner
    }
}

impl PhaseRunner for SpinningRunner {
    fn run_phase(&self, phase: Phase, timeout: Duration) -> Result<()> {
        let name = phase.name().to_string();
        match self.spinner.run(timeout, move || phase.start()) {
            Err(Error::Timeout { timeout, .. }) => Err(Error::timeout(name, timeout)),
            other => other,
        }
    }

    fn take_junk(&self) -> Vec<Junk> {
        self.spinner.clear_junk()
    }
}

/// Runs phases that finish straight away, without a reactor.
///
/// A phase that returns a deferred that has not fired is an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct SynchronousRunner;

impl PhaseRunner for SynchronousRunner {
    fn run_phase(&self, phase: Phase, _timeout: Duration) -> Result<()> {
        let deferred = match catch_unwind(AssertUnwindSafe(|| phase.start())) {
            Ok(deferred) => deferred,
            Err(payload) => Deferred::fail(Failure::from_panic(payload)),
        };
        extract_result(&deferred)
    }

    fn take_junk(&self) -> Vec<Junk> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::spinner::SpinnerConfig;

    fn spinning() -> SpinningRunner {
        SpinningRunner::new(Spinner::with_config(
            Reactor::new(),
            SpinnerConfig::new().with_signal_handling(false),
        ))
    }

    #[test]
    fn test_synchronous_fired() {
        let phase = Phase::new("body", || Ok(()));
        assert!(SynchronousRunner.run_phase(phase, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_synchronous_not_fired() {
        let phase = Phase::new("body", Deferred::new);
        let err = SynchronousRunner
            .run_phase(phase, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::DeferredNotFired(_)));
    }

    #[test]
    fn test_synchronous_panic() {
        let phase = Phase::new("body", || -> Deferred<()> { panic!("sync panic") });
        let err = SynchronousRunner
            .run_phase(phase, Duration::ZERO)
            .unwrap_err();
        assert!(err.failure().unwrap().is_assertion());
    }

    #[test]
    fn test_spinning_timeout_names_phase() {
        let runner = spinning();
        let phase = Phase::new("set_up", Deferred::new);
        let err = runner
            .run_phase(phase, Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(err.to_string(), "set_up took longer than 5ms to run");
    }

    #[test]
    fn test_spinning_take_junk_clears() {
        let runner = spinning();
        let reactor = runner.spinner().reactor().clone();
        let phase = Phase::new("body", move || {
            reactor.call_later(Duration::from_secs(60), || {});
            Ok(())
        });
        runner.run_phase(phase, Duration::from_secs(1)).unwrap();
        assert_eq!(runner.take_junk().len(), 1);
        assert!(runner.take_junk().is_empty());
    }
}
