//! The phases that make up one test.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Details;
use crate::deferred::{Deferred, IntoDeferred};

type Thunk = Box<dyn FnOnce() -> Deferred<()> + Send>;

/// One step of a test: set up, body, a cleanup or tear down.
///
/// A phase may finish straight away, by returning a `Result`, or later, by
/// returning a [`Deferred`].
pub struct Phase {
    name: String,
    thunk: Thunk,
}

impl Phase {
    /// Wraps `f` as a phase called `name`.
    pub fn new<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        Self {
            name: name.into(),
            thunk: Box::new(move || f().into_deferred()),
        }
    }

    /// The phase's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the phase.
    pub fn start(self) -> Deferred<()> {
        (self.thunk)()
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Cleanups registered for a test, run last-registered first.
///
/// The handle can be cloned into phases so they can register cleanups while
/// they run, including from inside other cleanups.
#[derive(Clone, Default)]
pub struct Cleanups {
    stack: Arc<Mutex<Vec<Phase>>>,
}

impl Cleanups {
    /// Registers a cleanup.
    pub fn add<F, R>(&self, f: F)
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        self.stack.lock().push(Phase::new("cleanup", f));
    }

    /// Number of cleanups waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.lock().len()
    }

    /// Returns `true` if no cleanups are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn pop(&self) -> Option<Phase> {
        self.stack.lock().pop()
    }
}

impl fmt::Debug for Cleanups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanups")
            .field("pending", &self.len())
            .finish()
    }
}

/// Whether cleanups run before or after tear down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CleanupOrder {
    /// Cleanups first, then tear down.
    BeforeTearDown,
    /// Tear down first, then cleanups.
    #[default]
    AfterTearDown,
}

/// Everything needed to run one test.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::deferred::Failure;
/// use testkit_reactor::runtest::TestPhases;
///
/// let test = TestPhases::new("test_example")
///     .set_up(|| Ok::<(), Failure>(()))
///     .body(|| Err(Failure::assertion("1 != 2")))
///     .tear_down(|| Ok(()));
///
/// let cleanups = test.cleanups();
/// cleanups.add(|| Ok(()));
/// assert_eq!(test.id(), "test_example");
/// ```
#[derive(Debug)]
pub struct TestPhases {
    pub(crate) id: String,
    pub(crate) set_up: Option<Phase>,
    pub(crate) body: Option<Phase>,
    pub(crate) tear_down: Option<Phase>,
    pub(crate) cleanups: Cleanups,
    pub(crate) cleanup_order: CleanupOrder,
    pub(crate) details: Details,
}

impl TestPhases {
    /// A test with no phases.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            set_up: None,
            body: None,
            tear_down: None,
            cleanups: Cleanups::default(),
            cleanup_order: CleanupOrder::default(),
            details: Details::new(),
        }
    }

    /// The test's identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sets the set-up phase.
    #[must_use]
    pub fn set_up<F, R>(mut self, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        self.set_up = Some(Phase::new("set_up", f));
        self
    }

    /// Sets the test body.
    #[must_use]
    pub fn body<F, R>(mut self, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        self.body = Some(Phase::new("body", f));
        self
    }

    /// Sets the tear-down phase.
    #[must_use]
    pub fn tear_down<F, R>(mut self, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        self.tear_down = Some(Phase::new("tear_down", f));
        self
    }

    /// Registers a cleanup up front.
    #[must_use]
    pub fn cleanup<F, R>(self, f: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoDeferred<()>,
    {
        self.cleanups.add(f);
        self
    }

    /// A handle for registering cleanups from inside phases.
    #[must_use]
    pub fn cleanups(&self) -> Cleanups {
        self.cleanups.clone()
    }

    /// Chooses whether cleanups run before or after tear down.
    #[must_use]
    pub fn cleanup_order(mut self, order: CleanupOrder) -> Self {
        self.cleanup_order = order;
        self
    }

    /// Adds a detail that is reported with the outcome.
    #[must_use]
    pub fn detail(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.details.insert(name, content);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{extract_result, Failure};

    #[test]
    fn test_phase_wraps_result() {
        let phase = Phase::new("body", || Err(Failure::assertion("no")));
        assert_eq!(phase.name(), "body");
        assert!(extract_result(&phase.start()).is_err());
    }

    #[test]
    fn test_cleanups_pop_last_first() {
        let cleanups = Cleanups::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            cleanups.add(move || {
                log.lock().push(i);
                Ok(())
            });
        }
        while let Some(phase) = cleanups.pop() {
            let _ = phase.start();
        }
        assert_eq!(*log.lock(), vec![2, 1, 0]);
        assert!(cleanups.is_empty());
    }

    #[test]
    fn test_builder_sets_phases() {
        let test = TestPhases::new("t")
            .set_up(|| Ok(()))
            .body(Deferred::new)
            .cleanup(|| Ok(()))
            .cleanup_order(CleanupOrder::BeforeTearDown)
            .detail("note", "hello");
        assert!(test.set_up.is_some());
        assert!(test.body.is_some());
        assert!(test.tear_down.is_none());
        assert_eq!(test.cleanups().len(), 1);
        assert_eq!(test.cleanup_order, CleanupOrder::BeforeTearDown);
        assert_eq!(test.details.get("note"), Some("hello"));
    }
}
