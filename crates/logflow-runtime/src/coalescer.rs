//! Deferred-timer coalescer (§4.5 / C5).
//!
//! `BatchedTimer` lets any thread call `postpone(delay)` at an arbitrary
//! rate; only a real change to the resulting deadline causes a
//! `call_on_main` round-trip and a reschedule of the underlying
//! [`TimerHeap`] entry, which happens on the main loop thread. A
//! lock-protected target time, a `call_on_main`-posted "apply" step, and
//! explicit second-granularity normalization of the target mean bursts
//! of `postpone` calls in the same second collapse into a single timer
//! update instead of one per call.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::mainloop::MainLoopHandle;
use crate::timer::TimerId;

struct State {
    /// The deadline the underlying timer should (eventually) be set to.
    /// `None` means "no timer wanted" (cancelled).
    target: Option<Instant>,
    /// The `TimerHeap` id of the currently-registered underlying timer,
    /// if `apply_update` has run since the last change.
    active_timer: Option<TimerId>,
    /// Whether an `apply_update` call is already queued on the main
    /// loop; used to avoid posting a second one while one is in flight.
    update_pending: bool,
}

struct Inner {
    state: Mutex<State>,
    handle: MainLoopHandle,
    handler: Box<dyn Fn() + Send + Sync>,
}

/// A main-loop-owned timer whose deadline can be updated from any thread
/// with at most one reschedule per actual change (§4.5).
#[derive(Clone)]
pub struct BatchedTimer {
    inner: Arc<Inner>,
}

impl BatchedTimer {
    pub fn new(handle: MainLoopHandle, handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    target: None,
                    active_timer: None,
                    update_pending: false,
                }),
                handle,
                handler: Box::new(handler),
            }),
        }
    }

    /// Request the handler fire `delay` from now. Safe to call from any
    /// thread, any number of times; the underlying timer is only
    /// actually touched when the resulting deadline changes.
    pub fn postpone(&self, delay: Duration) {
        let target = normalize_to_second(Instant::now() + delay);
        let mut state = self.inner.state.lock().unwrap();
        if state.target == Some(target) {
            // Same second as whatever's already pending: explicit
            // nsec=0 normalization made this collapse cheaply.
            return;
        }
        state.target = Some(target);
        self.schedule_apply(state);
    }

    /// Cancel any pending fire (§4.5 `cancel`). A no-op if nothing is
    /// scheduled.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.target.is_none() {
            return;
        }
        state.target = None;
        self.schedule_apply(state);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().unwrap().target.is_some()
    }

    fn schedule_apply(&self, mut state: std::sync::MutexGuard<'_, State>) {
        let already_pending = state.update_pending;
        state.update_pending = true;
        drop(state);
        if already_pending {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.handle.call_on_main(move || apply_update(inner), false);
    }
}

/// Runs on the main loop thread: cancels the currently-registered
/// underlying timer (if any) and, if a target is still wanted,
/// registers a fresh one.
fn apply_update(inner: Arc<Inner>) {
    let (old_timer, new_target) = {
        let mut state = inner.state.lock().unwrap();
        state.update_pending = false;
        (state.active_timer.take(), state.target)
    };
    if let Some(id) = old_timer {
        inner.handle.cancel_timer(id);
    }
    let Some(target) = new_target else {
        return;
    };
    let fire_inner = Arc::clone(&inner);
    let id = inner.handle.schedule_at(target, Box::new(move || fire(fire_inner)));
    inner.state.lock().unwrap().active_timer = Some(id);
}

fn fire(inner: Arc<Inner>) {
    {
        let mut state = inner.state.lock().unwrap();
        // The handler is about to run for this deadline; clear it so a
        // `postpone` called from inside the handler schedules cleanly
        // rather than being mistaken for "already pending at this time".
        state.active_timer = None;
        state.target = None;
    }
    (inner.handler)();
}

/// Round `t` up to the next whole second past a process-lifetime
/// reference instant. `Instant` has no stable wall-clock representation
/// to truncate directly, so the reference anchors an arbitrary "epoch"
/// for this process; the rounding only needs to be consistent within a
/// single `BatchedTimer`'s lifetime, which it is since the anchor is
/// shared process-wide.
fn normalize_to_second(t: Instant) -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    let elapsed = t.saturating_duration_since(epoch);
    let secs = elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0);
    epoch + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn wait_for(predicate: impl Fn() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while !predicate() {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn fires_once_after_postpone() {
        let main_loop = crate::mainloop::MainLoop::new().unwrap();
        let handle = main_loop.handle();
        let runner = std::thread::spawn(move || main_loop.run());

        let fire_count = Arc::new(AtomicUsize::new(0));
        let fc = fire_count.clone();
        let timer = BatchedTimer::new(handle.clone(), move || {
            fc.fetch_add(1, Ordering::SeqCst);
        });

        timer.postpone(Duration::from_millis(20));
        assert!(wait_for(|| fire_count.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));

        handle.request_stop();
        runner.join().unwrap();
    }

    #[test]
    fn repeated_postpone_within_the_same_second_collapses() {
        // Using a shared "calls to call_on_main" counter would require
        // instrumenting MainLoopHandle; instead we assert the externally
        // observable property (P8): the handler fires exactly once even
        // though postpone is called many times before expiry.
        let main_loop = crate::mainloop::MainLoop::new().unwrap();
        let handle = main_loop.handle();
        let runner = std::thread::spawn(move || main_loop.run());

        let fire_count = Arc::new(AtomicUsize::new(0));
        let fc = fire_count.clone();
        let timer = BatchedTimer::new(handle.clone(), move || {
            fc.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..20 {
            timer.postpone(Duration::from_millis(30));
        }
        assert!(wait_for(|| fire_count.load(Ordering::SeqCst) == 1, Duration::from_secs(2)));
        assert_eq!(fire_count.load(Ordering::SeqCst), 1);

        handle.request_stop();
        runner.join().unwrap();
    }

    #[test]
    fn cancel_prevents_fire() {
        let main_loop = crate::mainloop::MainLoop::new().unwrap();
        let handle = main_loop.handle();
        let runner = std::thread::spawn(move || main_loop.run());

        let fired = Arc::new(StdMutex::new(false));
        let fired2 = fired.clone();
        let timer = BatchedTimer::new(handle.clone(), move || {
            *fired2.lock().unwrap() = true;
        });

        timer.postpone(Duration::from_millis(50));
        timer.cancel();
        assert!(!timer.is_pending());

        std::thread::sleep(Duration::from_millis(150));
        assert!(!*fired.lock().unwrap());

        handle.request_stop();
        runner.join().unwrap();
    }
}
