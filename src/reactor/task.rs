//! Futures driven by the reactor.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake};

use pin_project::pin_project;

use super::{HandleId, HandleInfo, ReactorInner};
use crate::deferred::Failure;

/// Type-erased boxed future.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Information about a spawned task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    /// The task's identifier.
    pub id: HandleId,
    /// Optional name for debugging.
    pub name: Option<String>,
    /// Number of times the task has been polled.
    pub poll_count: usize,
}

impl TaskInfo {
    pub(crate) fn handle_info(&self) -> HandleInfo {
        let description = match &self.name {
            Some(name) => format!("task {name:?} (polled {} times)", self.poll_count),
            None => format!("task (polled {} times)", self.poll_count),
        };
        HandleInfo {
            id: self.id,
            description,
        }
    }
}

/// Internal task representation.
pub(crate) struct Task {
    pub(crate) future: BoxFuture,
    pub(crate) info: TaskInfo,
}

impl Task {
    pub(crate) fn new(id: HandleId, name: Option<String>, future: BoxFuture) -> Self {
        Self {
            future,
            info: TaskInfo {
                id,
                name,
                poll_count: 0,
            },
        }
    }

    /// Polls the task once.
    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.info.poll_count += 1;
        self.future.as_mut().poll(cx)
    }
}

/// Waker that puts its task back on the reactor's ready queue.
pub(crate) struct TaskWaker {
    pub(crate) reactor: Weak<ReactorInner>,
    pub(crate) id: HandleId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // A waker that outlives its reactor has nothing to wake.
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.schedule_task(self.id);
        }
    }
}

/// Turns a panic inside the wrapped future into a [`Failure`].
#[pin_project]
pub(crate) struct CatchUnwind<F> {
    #[pin]
    future: F,
}

impl<F> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self { future }
    }
}

impl<F, T> Future for CatchUnwind<F>
where
    F: Future<Output = Result<T, Failure>>,
{
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match catch_unwind(AssertUnwindSafe(|| this.future.poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => Poll::Ready(Err(Failure::from_panic(payload))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::Panicked;

    #[test]
    fn test_handle_info_names_task() {
        let info = TaskInfo {
            id: HandleId::next(),
            name: Some("fetch".to_string()),
            poll_count: 2,
        };
        assert_eq!(
            info.handle_info().description,
            "task \"fetch\" (polled 2 times)"
        );
    }

    #[test]
    fn test_poll_counts() {
        let mut task = Task::new(HandleId::next(), None, Box::pin(async {}));
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(task.poll(&mut cx).is_ready());
        assert_eq!(task.info.poll_count, 1);
    }

    #[test]
    fn test_catch_unwind_converts_panic() {
        let future = CatchUnwind::new(async {
            if true {
                panic!("inside task");
            }
            Ok::<(), Failure>(())
        });
        let failure = futures::executor::block_on(future).unwrap_err();
        assert_eq!(
            failure.downcast_ref::<Panicked>().unwrap().message,
            "inside task"
        );
    }

    #[test]
    fn test_catch_unwind_passes_output_through() {
        let future = CatchUnwind::new(async { Ok::<_, Failure>(5) });
        assert_eq!(futures::executor::block_on(future).unwrap(), 5);
    }
}
