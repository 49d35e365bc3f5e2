//! A single-threaded cooperative event loop.
//!
//! The [`Reactor`] owns everything that can keep a computation alive between
//! iterations: delayed calls, calls queued for the next iteration, spawned
//! tasks, watched I/O sources and worker threads. It runs on whichever thread
//! calls [`Reactor::run`] and stops when asked to.
//!
//! Handles are cheap to clone and may be used from any thread; callbacks only
//! ever run on the loop thread.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use testkit_reactor::reactor::Reactor;
//!
//! let reactor = Reactor::new();
//! let stopper = reactor.clone();
//! reactor.call_later(Duration::from_millis(5), move || stopper.stop());
//! reactor.run().unwrap();
//! assert!(reactor.delayed_calls().is_empty());
//! ```

mod selectable;
mod sleep;
mod task;
mod thread;
mod timer;

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub use selectable::{Port, Selectable};
pub use sleep::Sleep;
pub use task::TaskInfo;
pub use timer::DelayedCall;

use self::selectable::Registered;
use self::task::{CatchUnwind, Task, TaskWaker};
use self::thread::Worker;
use self::timer::{Callback, TimerEntry, TimerQueue};
use crate::deferred::{report_unhandled, Deferred, Failure, UnhandledFailure};
use crate::error::Result;
use crate::spinner::ReentryGuard;

/// Unique identifier for anything the reactor holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A snapshot of one thing the reactor holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    /// The handle's identifier.
    pub id: HandleId,
    /// Human-readable description.
    pub description: String,
}

impl fmt::Display for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.description, self.id)
    }
}

/// Configuration for a [`Reactor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Longest the loop sleeps between iterations.
    pub poll_interval: Duration,
    /// How long [`Reactor::stop_threads`] waits for worker threads to finish.
    pub thread_join_grace: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            thread_join_grace: Duration::from_secs(1),
        }
    }
}

impl ReactorConfig {
    /// Create a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the thread join grace period.
    #[must_use]
    pub fn with_thread_join_grace(mut self, grace: Duration) -> Self {
        self.thread_join_grace = grace;
        self
    }
}

struct PendingCall {
    id: HandleId,
    label: String,
    callback: Callback,
}

impl PendingCall {
    fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            description: self.label.clone(),
        }
    }
}

#[derive(Default)]
struct LoopState {
    running: bool,
    stop_requested: bool,
    calls: VecDeque<PendingCall>,
    startup: Vec<PendingCall>,
    timers: TimerQueue,
    tasks: HashMap<HandleId, Task>,
    ready: VecDeque<HandleId>,
    selectables: Vec<Registered>,
    /// Selectables taken out of `selectables` while they are polled.
    polling: HashSet<HandleId>,
    /// Selectables removed while they were being polled.
    removed: HashSet<HandleId>,
    workers: Vec<Worker>,
}

pub(crate) struct ReactorInner {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    guard: ReentryGuard,
    config: ReactorConfig,
}

impl ReactorInner {
    pub(crate) fn schedule_task(&self, id: HandleId) {
        {
            let mut state = self.state.lock();
            if !state.ready.contains(&id) {
                state.ready.push_back(id);
            }
        }
        self.wakeup.notify_all();
    }
}

/// The event loop.
///
/// `Reactor` is a handle: clones share the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Creates a reactor with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ReactorConfig::default())
    }

    /// Creates a reactor with the given configuration.
    #[must_use]
    pub fn with_config(config: ReactorConfig) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                state: Mutex::new(LoopState::default()),
                wakeup: Condvar::new(),
                guard: ReentryGuard::new(),
                config,
            }),
        }
    }

    /// The reactor's configuration.
    #[must_use]
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    /// Returns `true` while the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Runs the loop until [`stop`](Reactor::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reentry`](crate::Error::Reentry) if the loop is already
    /// running.
    pub fn run(&self) -> Result<()> {
        self.run_until(|| {}, || false)
    }

    /// Runs the loop, calling `on_start` once it is up, until it is stopped or
    /// `interrupted` returns `true`.
    pub(crate) fn run_until<S, I>(&self, on_start: S, interrupted: I) -> Result<()>
    where
        S: FnOnce(),
        I: Fn() -> bool,
    {
        self.inner.guard.call(|| {
            let startup = {
                let mut state = self.inner.state.lock();
                state.running = true;
                state.stop_requested = false;
                std::mem::take(&mut state.startup)
            };
            let _running = Running(&self.inner);
            tracing::debug!("reactor started");

            for call in startup {
                invoke(&call.label, call.callback);
            }
            on_start();
            while !interrupted() && self.iterate() {}

            tracing::debug!("reactor stopped");
            Ok(())
        })
    }

    /// Asks the loop to stop after the current iteration.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                tracing::debug!("stop requested while the reactor is not running");
                return;
            }
            state.stop_requested = true;
        }
        self.inner.wakeup.notify_all();
    }

    /// Wakes the loop if it is waiting, without queueing anything.
    pub(crate) fn wake(&self) {
        self.inner.wakeup.notify_all();
    }

    /// Runs one iteration. Returns `false` once a stop has been requested.
    fn iterate(&self) -> bool {
        let calls = {
            let mut state = self.inner.state.lock();
            if state.stop_requested {
                return false;
            }
            std::mem::take(&mut state.calls)
        };
        for call in calls {
            invoke(&call.label, call.callback);
        }

        let due = self.inner.state.lock().timers.pop_due(Instant::now());
        for entry in due {
            if entry.shared.mark_fired() {
                invoke(&entry.shared.label, entry.callback);
            }
        }

        self.poll_tasks();
        self.poll_selectables();
        self.reap_workers();

        let mut state = self.inner.state.lock();
        if state.stop_requested {
            return false;
        }
        if !state.calls.is_empty() || !state.ready.is_empty() {
            return true;
        }
        let mut wait = self.inner.config.poll_interval;
        if let Some(deadline) = state.timers.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        if !wait.is_zero() {
            self.inner.wakeup.wait_for(&mut state, wait);
        }
        !state.stop_requested
    }

    fn poll_tasks(&self) {
        let batch: Vec<HandleId> = self.inner.state.lock().ready.drain(..).collect();
        for id in batch {
            let Some(mut task) = self.inner.state.lock().tasks.remove(&id) else {
                continue;
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                reactor: Arc::downgrade(&self.inner),
                id,
            }));
            let mut cx = Context::from_waker(&waker);
            match catch_unwind(AssertUnwindSafe(|| task.poll(&mut cx))) {
                Ok(poll) if poll.is_pending() => {
                    self.inner.state.lock().tasks.insert(id, task);
                }
                Ok(_) => {}
                Err(payload) => report_panic(&task.info.handle_info().description, payload),
            }
        }
    }

    fn poll_selectables(&self) {
        let mut batch = {
            let mut state = self.inner.state.lock();
            if state.selectables.is_empty() {
                return;
            }
            let batch = std::mem::take(&mut state.selectables);
            state.polling = batch.iter().map(|r| r.id).collect();
            batch
        };

        let mut failed = HashSet::new();
        for registered in &mut batch {
            let description = registered.selectable.description();
            match catch_unwind(AssertUnwindSafe(|| registered.selectable.poll_ready())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(selectable = %description, error = %e, "removing failed selectable");
                    failed.insert(registered.id);
                }
                Err(payload) => {
                    failed.insert(registered.id);
                    report_panic(&description, payload);
                }
            }
        }

        let dropped = {
            let mut state = self.inner.state.lock();
            let removed = std::mem::take(&mut state.removed);
            state.polling.clear();
            let (keep, dropped): (Vec<_>, Vec<_>) = batch
                .into_iter()
                .partition(|r| !removed.contains(&r.id) && !failed.contains(&r.id));
            let added = std::mem::replace(&mut state.selectables, keep);
            state.selectables.extend(added);
            dropped
        };
        drop(dropped);
    }

    fn reap_workers(&self) {
        let workers = {
            let mut state = self.inner.state.lock();
            if !state.workers.iter().any(Worker::is_finished) {
                return;
            }
            std::mem::take(&mut state.workers)
        };
        let running = thread::reap_finished(workers);
        let mut state = self.inner.state.lock();
        let added = std::mem::replace(&mut state.workers, running);
        state.workers.extend(added);
    }

    /// Schedules `f` to run after `delay`.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> DelayedCall
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_at(timer::deadline_after(delay), f)
    }

    /// Schedules `f` to run at `deadline`.
    pub fn call_at<F>(&self, deadline: Instant, f: F) -> DelayedCall
    where
        F: FnOnce() + Send + 'static,
    {
        let id = HandleId::next();
        let label = format!("delayed call to {}", std::any::type_name::<F>());
        let shared = TimerEntry::new_shared(id, deadline, label);
        self.inner
            .state
            .lock()
            .timers
            .push(Arc::clone(&shared), Box::new(f));
        self.inner.wakeup.notify_all();
        DelayedCall {
            shared,
            reactor: Arc::downgrade(&self.inner),
        }
    }

    /// Queues `f` for the next iteration.
    pub fn call_soon<F>(&self, f: F) -> HandleId
    where
        F: FnOnce() + Send + 'static,
    {
        let call = pending_call(f);
        let id = call.id;
        self.inner.state.lock().calls.push_back(call);
        self.inner.wakeup.notify_all();
        id
    }

    /// Queues `f` for the next iteration from another thread.
    ///
    /// The loop wakes up immediately if it is waiting.
    pub fn call_from_thread<F>(&self, f: F) -> HandleId
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_soon(f)
    }

    /// Runs `f` when the loop starts, or on the next iteration if it is
    /// already running.
    pub fn call_when_running<F>(&self, f: F) -> HandleId
    where
        F: FnOnce() + Send + 'static,
    {
        let call = pending_call(f);
        let id = call.id;
        {
            let mut state = self.inner.state.lock();
            if state.running {
                state.calls.push_back(call);
            } else {
                state.startup.push(call);
            }
        }
        self.inner.wakeup.notify_all();
        id
    }

    /// Spawns a future on the loop. The returned deferred fires with its output.
    ///
    /// A panic inside the future fails the deferred.
    pub fn spawn<F, T>(&self, future: F) -> Deferred<T>
    where
        F: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.spawn_inner(None, future)
    }

    /// Spawns a named future on the loop.
    pub fn spawn_named<F, T>(&self, name: impl Into<String>, future: F) -> Deferred<T>
    where
        F: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.spawn_inner(Some(name.into()), future)
    }

    fn spawn_inner<F, T>(&self, name: Option<String>, future: F) -> Deferred<T>
    where
        F: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let id = HandleId::next();
        let deferred = Deferred::new();
        let target = deferred.clone();
        let future = CatchUnwind::new(future);
        let wrapped = async move {
            let outcome = future.await;
            // Only this task fires `target`.
            let _ = target.resolve(outcome);
        };
        {
            let mut state = self.inner.state.lock();
            state.tasks.insert(id, Task::new(id, name, Box::pin(wrapped)));
            state.ready.push_back(id);
        }
        self.inner.wakeup.notify_all();
        deferred
    }

    /// Returns a future that completes after `duration`.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), duration)
    }

    /// Starts watching a selectable.
    pub fn add_selectable<S>(&self, selectable: S) -> HandleId
    where
        S: Selectable + 'static,
    {
        let id = HandleId::next();
        self.inner.state.lock().selectables.push(Registered {
            id,
            selectable: Box::new(selectable),
        });
        self.inner.wakeup.notify_all();
        id
    }

    /// Stops watching a selectable. Returns `false` if it was not registered.
    pub fn remove_selectable(&self, id: HandleId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            if let Some(pos) = state.selectables.iter().position(|r| r.id == id) {
                Some(state.selectables.remove(pos))
            } else if state.polling.contains(&id) {
                return state.removed.insert(id);
            } else {
                None
            }
        };
        removed.is_some()
    }

    /// Stops watching every selectable and returns what was removed.
    pub fn remove_all(&self) -> Vec<HandleInfo> {
        let removed = {
            let mut state = self.inner.state.lock();
            let polling: Vec<_> = state.polling.iter().copied().collect();
            state.removed.extend(polling);
            std::mem::take(&mut state.selectables)
        };
        removed.iter().map(Registered::info).collect()
    }

    /// Listens for TCP connections on `addr`. `on_accept` runs on the loop
    /// thread for every accepted connection.
    ///
    /// # Errors
    ///
    /// Returns any error from binding the socket.
    pub fn listen_tcp<A, F>(&self, addr: A, on_accept: F) -> io::Result<Port>
    where
        A: ToSocketAddrs,
        F: FnMut(TcpStream, SocketAddr) + Send + 'static,
    {
        selectable::listen_tcp(self, addr, on_accept)
    }

    /// Runs `f` on a new worker thread owned by the reactor.
    ///
    /// # Errors
    ///
    /// Returns any error from spawning the thread.
    pub fn call_in_thread<F>(&self, f: F) -> io::Result<HandleId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = HandleId::next();
        let name = format!("reactor-worker-{}", id.as_u64());
        let handle = std::thread::Builder::new().name(name.clone()).spawn(f)?;
        self.inner
            .state
            .lock()
            .workers
            .push(Worker { id, name, handle });
        Ok(id)
    }

    /// Delayed calls that have not fired or been cancelled, earliest first.
    #[must_use]
    pub fn delayed_calls(&self) -> Vec<DelayedCall> {
        self.inner
            .state
            .lock()
            .timers
            .active()
            .into_iter()
            .map(|shared| DelayedCall {
                shared,
                reactor: Arc::downgrade(&self.inner),
            })
            .collect()
    }

    /// Calls queued for the next iteration or for startup.
    #[must_use]
    pub fn pending_calls(&self) -> Vec<HandleInfo> {
        let state = self.inner.state.lock();
        state
            .startup
            .iter()
            .chain(state.calls.iter())
            .map(PendingCall::info)
            .collect()
    }

    /// Drops every queued call without running it and returns what was dropped.
    pub fn discard_pending_calls(&self) -> Vec<HandleInfo> {
        let calls: Vec<PendingCall> = {
            let mut state = self.inner.state.lock();
            let startup = std::mem::take(&mut state.startup);
            startup.into_iter().chain(state.calls.drain(..)).collect()
        };
        calls.iter().map(PendingCall::info).collect()
    }

    /// Tasks that have not completed.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<_> = self
            .inner
            .state
            .lock()
            .tasks
            .values()
            .map(|t| t.info.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Drops every task that has not completed and returns what was dropped.
    ///
    /// The deferreds of aborted tasks never fire.
    pub fn abort_tasks(&self) -> Vec<HandleInfo> {
        let tasks: Vec<Task> = {
            let mut state = self.inner.state.lock();
            state.ready.clear();
            state.tasks.drain().map(|(_, task)| task).collect()
        };
        let mut infos: Vec<_> = tasks.iter().map(|t| t.info.handle_info()).collect();
        infos.sort_by_key(|info| info.id);
        // Futures are dropped here, outside the lock.
        drop(tasks);
        infos
    }

    /// Selectables being watched.
    #[must_use]
    pub fn selectables(&self) -> Vec<HandleInfo> {
        self.inner
            .state
            .lock()
            .selectables
            .iter()
            .map(Registered::info)
            .collect()
    }

    /// Worker threads that have not been joined.
    #[must_use]
    pub fn threads(&self) -> Vec<HandleInfo> {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .map(Worker::info)
            .collect()
    }

    /// Waits up to the configured grace period for worker threads to finish.
    ///
    /// Threads that finish are joined. Threads still running are detached and
    /// returned.
    pub fn stop_threads(&self) -> Vec<HandleInfo> {
        let workers = std::mem::take(&mut self.inner.state.lock().workers);
        if workers.is_empty() {
            return Vec::new();
        }
        thread::stop_workers(workers, self.inner.config.thread_join_grace)
            .iter()
            .map(Worker::info)
            .collect()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Reactor")
            .field("running", &state.running)
            .field("timers", &state.timers.len())
            .field("calls", &state.calls.len())
            .field("tasks", &state.tasks.len())
            .field("selectables", &state.selectables.len())
            .field("threads", &state.workers.len())
            .finish()
    }
}

/// Clears the running flag when the loop exits, however it exits.
struct Running<'a>(&'a ReactorInner);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.running = false;
        state.stop_requested = false;
    }
}

fn pending_call<F>(f: F) -> PendingCall
where
    F: FnOnce() + Send + 'static,
{
    PendingCall {
        id: HandleId::next(),
        label: format!("call to {}", std::any::type_name::<F>()),
        callback: Box::new(f),
    }
}

/// Runs a loop callback. A panic is logged and reported as an unhandled failure.
fn invoke(label: &str, callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        report_panic(label, payload);
    }
}

fn report_panic(label: &str, payload: Box<dyn Any + Send>) {
    let failure = Failure::from_panic(payload);
    tracing::error!(call = label, %failure, "reactor callback panicked");
    report_unhandled(UnhandledFailure {
        failure,
        origin: label.to_string(),
    });
}
