//! Timer heap shared by the main loop (C1) and the destination worker's
//! reconnect/batch/flush/throttle timers (C4).
//!
//! One min-heap ordered by deadline, with lazy cancellation: cancelling a
//! timer just marks its id so a later pop skips it, rather than
//! rebalancing the heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub type TimerId = u64;
pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    callbacks: HashMap<TimerId, TimerCallback>,
    cancelled: HashSet<TimerId>,
}

/// A min-heap of pending timers, safe to schedule/cancel from any thread.
/// Firing (`pop_due`) is expected to be driven from a single thread (the
/// main loop).
pub struct TimerHeap {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
                cancelled: HashSet::new(),
            }),
        }
    }

    /// Schedule `callback` to run at `deadline`. Returns an id that can
    /// be passed to `cancel`.
    pub fn schedule_at(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(Reverse((deadline, id)));
        inner.callbacks.insert(id, callback);
        id
    }

    pub fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Best-effort cancellation. Returns `true` if the timer hadn't
    /// already fired.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.callbacks.remove(&id).is_some() {
            inner.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Pop and return the callbacks for every timer whose deadline is
    /// `<= now`, in deadline order. Meant to be called from the main
    /// loop thread once per wake.
    pub fn pop_due(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = inner.heap.peek() {
            if deadline > now {
                break;
            }
            inner.heap.pop();
            if inner.cancelled.remove(&id) {
                continue;
            }
            if let Some(cb) = inner.callbacks.remove(&id) {
                due.push(cb);
            }
        }
        due
    }

    /// Earliest deadline across all non-cancelled timers, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner
            .heap
            .iter()
            .filter(|Reverse((_, id))| !inner.cancelled.contains(id))
            .map(|Reverse((deadline, _))| *deadline)
            .min()
    }

    pub fn time_until_next(&self) -> Option<Duration> {
        self.next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().callbacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let heap = TimerHeap::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        let o1 = order.clone();
        heap.schedule_at(now + Duration::from_millis(20), Box::new(move || o1.lock().unwrap().push(2)));
        let o2 = order.clone();
        heap.schedule_at(now + Duration::from_millis(10), Box::new(move || o2.lock().unwrap().push(1)));

        let due = heap.pop_due(now + Duration::from_millis(30));
        assert_eq!(due.len(), 2);
        for cb in due {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let heap = TimerHeap::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let id = heap.schedule_after(Duration::from_millis(5), Box::new(move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        assert!(heap.cancel(id));
        let due = heap.pop_due(Instant::now() + Duration::from_millis(10));
        assert!(due.is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn not_yet_due_timers_are_left_alone() {
        let heap = TimerHeap::new();
        heap.schedule_after(Duration::from_secs(10), Box::new(|| {}));
        assert!(heap.pop_due(Instant::now()).is_empty());
        assert_eq!(heap.len(), 1);
    }
}
