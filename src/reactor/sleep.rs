//! Sleeping inside reactor tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::timer::deadline_after;
use super::{DelayedCall, Reactor};

/// A future that completes once its deadline passes.
///
/// Created by [`Reactor::sleep`]. The wake-up is a delayed call on the
/// reactor, so a sleep that is still pending when the run ends shows up as
/// leftover state. Dropping the sleep cancels that call.
#[derive(Debug)]
pub struct Sleep {
    reactor: Reactor,
    deadline: Instant,
    timer: Option<DelayedCall>,
    waker: Arc<Mutex<Option<Waker>>>,
}

impl Sleep {
    pub(crate) fn new(reactor: Reactor, duration: Duration) -> Self {
        Self {
            reactor,
            deadline: deadline_after(duration),
            timer: None,
            waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns the deadline for this sleep.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns `true` if this sleep has completed.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_elapsed() {
            if let Some(timer) = self.timer.take() {
                timer.cancel();
            }
            return Poll::Ready(());
        }

        *self.waker.lock() = Some(cx.waker().clone());
        if self.timer.is_none() {
            let slot = Arc::clone(&self.waker);
            let deadline = self.deadline;
            let timer = self.reactor.call_at(deadline, move || {
                if let Some(waker) = slot.lock().take() {
                    waker.wake();
                }
            });
            self.timer = Some(timer);
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
