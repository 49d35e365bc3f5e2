//! Delayed calls and the timer queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::{HandleId, HandleInfo, ReactorInner};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Stand-in deadline for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// The instant `delay` from now. Delays past what `Instant` can hold are
/// clamped to a deadline that never comes in practice.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// State shared between a [`DelayedCall`] handle and its queue entry.
#[derive(Debug)]
pub(crate) struct TimerShared {
    pub(crate) id: HandleId,
    pub(crate) deadline: Instant,
    pub(crate) label: String,
    state: AtomicU8,
}

impl TimerShared {
    /// Moves the timer from pending to fired. Returns `false` if it was cancelled.
    pub(crate) fn mark_fired(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_cancelled(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// Handle to a call scheduled with [`Reactor::call_later`](super::Reactor::call_later).
///
/// # Example
///
/// ```rust
/// use testkit_reactor::reactor::Reactor;
/// use std::time::Duration;
///
/// let reactor = Reactor::new();
/// let call = reactor.call_later(Duration::from_secs(10), || {});
/// assert!(call.is_active());
///
/// call.cancel();
/// assert!(!call.is_active());
/// assert!(reactor.delayed_calls().is_empty());
/// ```
#[derive(Clone)]
pub struct DelayedCall {
    pub(crate) shared: Arc<TimerShared>,
    pub(crate) reactor: Weak<ReactorInner>,
}

impl DelayedCall {
    /// The call's identifier.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// When the call is due.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.shared.deadline
    }

    /// Returns `true` until the call fires or is cancelled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_pending()
    }

    /// Cancels the call. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        if !self.shared.mark_cancelled() {
            return false;
        }
        // Drop the callback now rather than when the deadline passes.
        let removed = self
            .reactor
            .upgrade()
            .map(|reactor| reactor.state.lock().timers.remove(self.shared.id));
        drop(removed);
        true
    }

    /// Describes the call for junk reports.
    #[must_use]
    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.shared.id,
            description: self.shared.label.clone(),
        }
    }
}

impl fmt::Debug for DelayedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedCall")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A scheduled call in the timer queue.
pub(crate) struct TimerEntry {
    pub(crate) shared: Arc<TimerShared>,
    pub(crate) callback: Callback,
    /// Insertion order, so calls with equal deadlines fire in scheduling order.
    seq: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.shared.deadline == other.shared.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse order for min-heap behavior (earliest deadline first)
        other
            .shared
            .deadline
            .cmp(&self.shared.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending calls keyed by deadline.
#[derive(Default)]
pub(crate) struct TimerQueue {
    pending: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, shared: Arc<TimerShared>, callback: Callback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(TimerEntry {
            shared,
            callback,
            seq,
        });
    }

    /// Pops every entry due at `now`, earliest first. Cancelled entries are skipped.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(entry) = self.pending.peek() {
            if entry.shared.deadline > now {
                break;
            }
            if let Some(entry) = self.pending.pop() {
                if entry.shared.is_pending() {
                    due.push(entry);
                }
            }
        }
        due
    }

    /// The earliest deadline among pending entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.peek().map(|entry| entry.shared.deadline)
    }

    /// Removes an entry, returning its callback so the caller can drop it
    /// outside any lock.
    pub(crate) fn remove(&mut self, id: HandleId) -> Option<Callback> {
        let mut removed = None;
        let entries = std::mem::take(&mut self.pending).into_vec();
        for entry in entries {
            if entry.shared.id == id && removed.is_none() {
                removed = Some(entry.callback);
            } else {
                self.pending.push(entry);
            }
        }
        removed
    }

    /// Handles for every call that is still pending.
    pub(crate) fn active(&self) -> Vec<Arc<TimerShared>> {
        let mut active: Vec<_> = self
            .pending
            .iter()
            .filter(|entry| entry.shared.is_pending())
            .map(|entry| (entry.seq, Arc::clone(&entry.shared)))
            .collect();
        active.sort_by_key(|(seq, shared)| (shared.deadline, *seq));
        active.into_iter().map(|(_, shared)| shared).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

impl TimerEntry {
    pub(crate) fn new_shared(id: HandleId, deadline: Instant, label: String) -> Arc<TimerShared> {
        Arc::new(TimerShared {
            id,
            deadline,
            label,
            state: AtomicU8::new(PENDING),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shared(deadline: Instant) -> Arc<TimerShared> {
        TimerEntry::new_shared(HandleId::next(), deadline, "test".to_string())
    }

    #[test]
    fn test_queue_orders_by_deadline() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        queue.push(shared(now + Duration::from_secs(10)), Box::new(|| {}));
        queue.push(shared(now + Duration::from_secs(5)), Box::new(|| {}));
        queue.push(shared(now + Duration::from_secs(15)), Box::new(|| {}));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_due() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        queue.push(shared(now), Box::new(|| {}));
        queue.push(shared(now + Duration::from_secs(1)), Box::new(|| {}));
        queue.push(shared(now + Duration::from_secs(60)), Box::new(|| {}));

        let due = queue.pop_due(now + Duration::from_secs(1));
        assert_eq!(due.len(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_keep_scheduling_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        let first = shared(now);
        let second = shared(now);
        queue.push(Arc::clone(&first), Box::new(|| {}));
        queue.push(Arc::clone(&second), Box::new(|| {}));

        let due = queue.pop_due(now);
        assert_eq!(due[0].shared.id, first.id);
        assert_eq!(due[1].shared.id, second.id);
    }

    #[test]
    fn test_cancelled_entries_are_skipped() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        let cancelled = shared(now);
        assert!(cancelled.mark_cancelled());
        queue.push(cancelled, Box::new(|| {}));

        assert!(queue.pop_due(now).is_empty());
        assert!(queue.active().is_empty());
    }

    #[test]
    fn test_remove() {
        let now = Instant::now();
        let mut queue = TimerQueue::default();
        let keep = shared(now);
        let gone = shared(now);
        queue.push(Arc::clone(&keep), Box::new(|| {}));
        queue.push(Arc::clone(&gone), Box::new(|| {}));

        assert!(queue.remove(gone.id).is_some());
        assert!(queue.remove(gone.id).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.active()[0].id, keep.id);
    }

    #[test]
    fn test_deadline_after_clamps_huge_delays() {
        let before = Instant::now();
        assert!(deadline_after(Duration::MAX) >= before + FAR_FUTURE);
        let near = deadline_after(Duration::from_millis(5));
        assert!(near >= before + Duration::from_millis(5));
        assert!(near < before + FAR_FUTURE);
    }

    #[test]
    fn test_fire_once() {
        let entry = shared(Instant::now());
        assert!(entry.mark_fired());
        assert!(!entry.mark_fired());
        assert!(!entry.mark_cancelled());
    }
}
