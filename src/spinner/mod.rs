//! Running the reactor from synchronous code.
//!
//! A [`Spinner`] blocks the calling thread on a [`Reactor`] until a deferred
//! fires, a timeout passes or the run is interrupted. After every run it
//! cleans up whatever the reactor is still holding and keeps a record of it
//! as [`Junk`]; the next run refuses to start until that record is cleared.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use testkit_reactor::prelude::*;
//!
//! let reactor = Reactor::new();
//! let spinner = Spinner::new(reactor.clone());
//!
//! let value = spinner
//!     .run(Duration::from_secs(1), || {
//!         let d = Deferred::new();
//!         let fire = d.clone();
//!         reactor.call_later(Duration::from_millis(5), move || {
//!             fire.callback("done").unwrap();
//!         });
//!         d
//!     })
//!     .unwrap();
//! assert_eq!(value, "done");
//! assert!(spinner.get_junk().is_empty());
//! ```

mod guard;
mod interrupt;
mod junk;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub use guard::{Entered, ReentryGuard};
pub use interrupt::Interrupter;
pub use junk::Junk;

use crate::deferred::{Deferred, Failure, IntoDeferred};
use crate::error::{Error, Result};
use crate::reactor::Reactor;

/// Configuration for a [`Spinner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpinnerConfig {
    /// Install a SIGINT handler for the duration of each run (unix only).
    pub handle_signals: bool,
}

impl Default for SpinnerConfig {
    fn default() -> Self {
        Self {
            handle_signals: true,
        }
    }
}

impl SpinnerConfig {
    /// Create a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the SIGINT handler.
    #[must_use]
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

/// How a run ended, decided by whichever happened first.
enum Finish<T> {
    Resolved(std::result::Result<T, Failure>),
    TimedOut,
}

/// Drives a [`Reactor`] until a computation finishes.
///
/// One run at a time: a run started while another is active, from a callback
/// or from another thread, fails with [`Error::Reentry`].
pub struct Spinner {
    reactor: Reactor,
    config: SpinnerConfig,
    guard: ReentryGuard,
    junk: Mutex<Vec<Junk>>,
    interrupter: Interrupter,
}

impl Spinner {
    /// Creates a spinner with the default configuration.
    #[must_use]
    pub fn new(reactor: Reactor) -> Self {
        Self::with_config(reactor, SpinnerConfig::default())
    }

    /// Creates a spinner with the given configuration.
    #[must_use]
    pub fn with_config(reactor: Reactor, config: SpinnerConfig) -> Self {
        let interrupter = Interrupter {
            flag: Arc::new(AtomicBool::new(false)),
            reactor: reactor.clone(),
        };
        Self {
            reactor,
            config,
            guard: ReentryGuard::new(),
            junk: Mutex::new(Vec::new()),
            interrupter,
        }
    }

    /// The reactor this spinner drives.
    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// A trigger that interrupts the run in progress.
    #[must_use]
    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Runs `f` on the reactor and waits for its result.
    ///
    /// `f` is called once the loop has started. If it returns a pending
    /// deferred the loop runs until that deferred fires or `timeout` passes;
    /// a plain result stops the loop straight away. Either way, whatever the
    /// reactor still holds afterwards is cleaned up and recorded as junk.
    ///
    /// # Errors
    ///
    /// - [`Error::StaleJunk`] if junk from a previous run has not been cleared
    /// - [`Error::Reentry`] if a run is already active
    /// - [`Error::Timeout`] if `f`'s result did not arrive within `timeout`
    /// - [`Error::NoResult`] if the run was interrupted
    /// - the failure `f` produced, re-raised
    pub fn run<F, R, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> R,
        R: IntoDeferred<T>,
        T: Clone + Send + Sync + 'static,
    {
        let stale = self.get_junk();
        if !stale.is_empty() {
            return Err(Error::StaleJunk(stale));
        }
        self.guard.call(|| self.spin(timeout, f))
    }

    fn spin<F, R, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> R,
        R: IntoDeferred<T>,
        T: Clone + Send + Sync + 'static,
    {
        let name = std::any::type_name::<F>();
        self.interrupter.reset();
        let _signals: Option<interrupt::SignalGuard> = if self.config.handle_signals {
            interrupt::install()
        } else {
            None
        };
        let generation = interrupt::generation();
        let interrupted = || self.interrupter.is_set() || interrupt::generation() != generation;

        let finish: Arc<Mutex<Option<Finish<T>>>> = Arc::new(Mutex::new(None));
        let mut timeout_call = None;
        tracing::debug!(function = name, ?timeout, "spinner run started");

        let loop_result = self.reactor.run_until(
            || {
                let slot = Arc::clone(&finish);
                let stopper = self.reactor.clone();
                timeout_call = Some(self.reactor.call_later(timeout, move || {
                    slot.lock().get_or_insert(Finish::TimedOut);
                    stopper.stop();
                }));

                let deferred = match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(result) => result.into_deferred(),
                    Err(payload) => Deferred::fail(Failure::from_panic(payload)),
                };
                let slot = Arc::clone(&finish);
                let stopper = self.reactor.clone();
                deferred.add_both(move |outcome| {
                    slot.lock()
                        .get_or_insert_with(|| Finish::Resolved(outcome.clone()));
                    stopper.stop();
                });
            },
            &interrupted,
        );
        // Nothing ran if the loop was already running elsewhere.
        loop_result?;
        let was_interrupted = interrupted();

        if let Some(call) = timeout_call {
            call.cancel();
        }
        let junk = self.clean();
        if !junk.is_empty() {
            *self.junk.lock() = junk;
        }

        if was_interrupted {
            tracing::warn!(function = name, "spinner run interrupted");
            return Err(Error::NoResult);
        }
        let finish = finish.lock().take();
        match finish {
            Some(Finish::Resolved(Ok(value))) => Ok(value),
            Some(Finish::Resolved(Err(failure))) => Err(Error::from(failure)),
            Some(Finish::TimedOut) => {
                tracing::warn!(function = name, ?timeout, "spinner run timed out");
                Err(Error::timeout(name, timeout))
            }
            None => Err(Error::NoResult),
        }
    }

    /// Cleans up everything the reactor still holds and returns it.
    ///
    /// Worker threads get the reactor's grace period to finish; unfinished
    /// tasks, delayed calls and queued calls are dropped; selectables are
    /// deregistered. The returned list is not recorded: [`run`](Spinner::run)
    /// does that with the result of its own clean.
    pub fn clean(&self) -> Vec<Junk> {
        let mut junk: Vec<Junk> = self
            .reactor
            .stop_threads()
            .into_iter()
            .map(Junk::Thread)
            .collect();
        // Dropping tasks cancels the delayed calls their sleeps were waiting on.
        junk.extend(self.reactor.abort_tasks().into_iter().map(Junk::Task));
        for call in self.reactor.delayed_calls() {
            call.cancel();
            junk.push(Junk::DelayedCall(call.info()));
        }
        junk.extend(
            self.reactor
                .discard_pending_calls()
                .into_iter()
                .map(Junk::PendingCall),
        );
        junk.extend(self.reactor.remove_all().into_iter().map(Junk::Selectable));

        if !junk.is_empty() {
            tracing::warn!(
                count = junk.len(),
                junk = %Junk::describe_all(&junk),
                "reactor left unclean"
            );
        }
        junk
    }

    /// The junk recorded by the last run.
    #[must_use]
    pub fn get_junk(&self) -> Vec<Junk> {
        self.junk.lock().clone()
    }

    /// Empties the junk record, returning what it held.
    pub fn clear_junk(&self) -> Vec<Junk> {
        std::mem::take(&mut *self.junk.lock())
    }
}

impl std::fmt::Debug for Spinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spinner")
            .field("running", &self.guard.is_running())
            .field("junk", &self.junk.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{trap_unhandled_failures, AssertionFailed};

    fn spinner() -> Spinner {
        Spinner::with_config(
            Reactor::new(),
            SpinnerConfig::new().with_signal_handling(false),
        )
    }

    #[test]
    fn test_plain_value() {
        let spinner = spinner();
        let value = spinner
            .run(Duration::from_secs(1), || Ok::<_, Failure>("marker"))
            .unwrap();
        assert_eq!(value, "marker");
        assert!(spinner.get_junk().is_empty());
    }

    #[test]
    fn test_fired_deferred() {
        let spinner = spinner();
        let value = spinner
            .run(Duration::from_secs(1), || Deferred::succeed(7))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_failure_is_reraised() {
        let spinner = spinner();
        let err = spinner
            .run(Duration::from_secs(1), || {
                Deferred::<()>::fail(AssertionFailed::new("1 != 2"))
            })
            .unwrap_err();
        let failure = err.failure().unwrap();
        assert!(failure.is::<AssertionFailed>());
        assert_eq!(failure.message(), "assertion failed: 1 != 2");
    }

    #[test]
    fn test_panic_in_function_becomes_failure() {
        let spinner = spinner();
        let err = spinner
            .run(Duration::from_secs(1), || -> Deferred<()> {
                panic!("exploded")
            })
            .unwrap_err();
        assert!(err.failure().unwrap().message().contains("exploded"));
        assert!(!spinner.guard.is_running());
    }

    #[test]
    fn test_timeout() {
        let spinner = spinner();
        let err = spinner
            .run(Duration::from_millis(10), Deferred::<()>::new)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout, .. } if timeout == Duration::from_millis(10)));
        // The timeout's own delayed call is not junk.
        assert!(spinner.get_junk().is_empty());
    }

    #[test]
    fn test_unbounded_timeout() {
        let spinner = spinner();
        let reactor = spinner.reactor().clone();
        let value = spinner
            .run(Duration::MAX, || Ok::<_, Failure>(1))
            .unwrap();
        assert_eq!(value, 1);

        let value = spinner
            .run(Duration::MAX, || {
                let d = Deferred::new();
                let fire = d.clone();
                reactor.call_later(Duration::from_millis(5), move || {
                    fire.callback(2).unwrap();
                });
                d
            })
            .unwrap();
        assert_eq!(value, 2);
        assert!(spinner.get_junk().is_empty());
    }

    #[test]
    fn test_nested_run_is_reentry() {
        let spinner = spinner();
        let err = spinner
            .run(Duration::from_secs(1), || {
                spinner.run(Duration::from_secs(1), || Ok::<_, Failure>(()))
                    .map_err(Failure::new)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Reentry));
    }

    #[test]
    fn test_junk_recorded_and_cleared() {
        let spinner = spinner();
        let reactor = spinner.reactor().clone();
        let call = spinner
            .run(Duration::from_secs(1), || {
                Ok::<_, Failure>(reactor.call_later(Duration::from_secs(100), || {}))
            })
            .unwrap();
        assert!(!call.is_active());

        let junk = spinner.get_junk();
        assert_eq!(junk.len(), 1);
        assert!(matches!(&junk[0], Junk::DelayedCall(info) if info.id == call.id()));

        let err = spinner
            .run(Duration::from_secs(1), || Ok::<_, Failure>(()))
            .unwrap_err();
        assert!(matches!(err, Error::StaleJunk(ref stale) if *stale == junk));

        assert_eq!(spinner.clear_junk(), junk);
        assert!(spinner.get_junk().is_empty());
        assert!(spinner.run(Duration::from_secs(1), || Ok::<_, Failure>(())).is_ok());
    }

    #[test]
    fn test_interrupter_gives_no_result() {
        let spinner = spinner();
        let interrupter = spinner.interrupter();
        let reactor = spinner.reactor().clone();
        let err = spinner
            .run(Duration::from_secs(5), || {
                let trigger = interrupter.clone();
                reactor.call_later(Duration::from_millis(5), move || trigger.interrupt());
                Deferred::<()>::new()
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoResult));
        assert!(spinner.get_junk().is_empty());

        // The next run starts uninterrupted.
        assert_eq!(
            spinner.run(Duration::from_secs(1), || Ok::<_, Failure>(1)).unwrap(),
            1
        );
    }

    #[test]
    fn test_failure_result_is_not_unhandled() {
        let spinner = spinner();
        let (result, failures) = trap_unhandled_failures(|| {
            spinner.run(Duration::from_secs(1), || {
                Deferred::<()>::fail(Failure::assertion("handled by the spinner"))
            })
        });
        assert!(result.is_err());
        assert!(failures.is_empty());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unclean_run_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let spinner = spinner();
        let reactor = spinner.reactor().clone();
        tracing::subscriber::with_default(subscriber, || {
            spinner
                .run(Duration::from_secs(1), || {
                    reactor.call_soon(|| {});
                    Ok::<_, Failure>(())
                })
                .unwrap();
        });

        let logs = String::from_utf8_lossy(&captured.0.lock()).into_owned();
        assert!(logs.contains("reactor left unclean"), "{logs}");
        assert_eq!(spinner.clear_junk().len(), 1);
    }
}
