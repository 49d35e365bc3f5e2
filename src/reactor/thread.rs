//! Worker threads started on behalf of the reactor.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::timer::deadline_after;
use super::{HandleId, HandleInfo};
use crate::deferred::{report_unhandled, Failure, UnhandledFailure};

pub(crate) struct Worker {
    pub(crate) id: HandleId,
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<()>,
}

impl Worker {
    pub(crate) fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            description: format!("thread {:?}", self.name),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Joins a finished worker. A panic in the worker is reported as an
    /// unhandled failure.
    pub(crate) fn join(self) {
        if let Err(payload) = self.handle.join() {
            let failure = Failure::from_panic(payload);
            tracing::error!(thread = %self.name, %failure, "worker thread panicked");
            report_unhandled(UnhandledFailure {
                failure,
                origin: format!("thread {:?}", self.name),
            });
        }
    }
}

/// Joins every worker that finishes within `grace` and returns the rest.
pub(crate) fn stop_workers(workers: Vec<Worker>, grace: Duration) -> Vec<Worker> {
    let deadline = deadline_after(grace);
    while Instant::now() < deadline && !workers.iter().all(Worker::is_finished) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut still_running = Vec::new();
    for worker in workers {
        if worker.is_finished() {
            worker.join();
        } else {
            tracing::warn!(thread = %worker.name, "worker thread still running");
            still_running.push(worker);
        }
    }
    still_running
}

/// Joins the workers that have already finished and returns the rest.
pub(crate) fn reap_finished(workers: Vec<Worker>) -> Vec<Worker> {
    let (finished, running): (Vec<_>, Vec<_>) =
        workers.into_iter().partition(Worker::is_finished);
    for worker in finished {
        worker.join();
    }
    running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::trap_unhandled_failures;

    fn spawn(work: impl FnOnce() + Send + 'static) -> Worker {
        let id = HandleId::next();
        Worker {
            id,
            name: format!("worker-{id}"),
            handle: std::thread::spawn(work),
        }
    }

    #[test]
    fn test_finished_workers_are_joined() {
        let workers = vec![spawn(|| {}), spawn(|| {})];
        let left = stop_workers(workers, Duration::from_secs(5));
        assert!(left.is_empty());
    }

    #[test]
    fn test_running_workers_are_returned() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker = spawn(move || {
            let _ = rx.recv();
        });
        let id = worker.id;
        let left = stop_workers(vec![worker], Duration::from_millis(10));
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, id);

        drop(tx);
        assert!(stop_workers(left, Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_panicking_worker_is_reported() {
        let (left, failures) = trap_unhandled_failures(|| {
            stop_workers(vec![spawn(|| panic!("worker died"))], Duration::from_secs(5))
        });
        assert!(left.is_empty());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].failure.message().contains("worker died"));
    }
}
