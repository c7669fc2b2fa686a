//! Worker pool and thread registry (§4.2 / C2): a bounded OS thread
//! pool (`handles`/`shutdown`/`join`, thread-local current-index), a
//! 64-bit bitmap thread-index allocator (`logflow_core::ThreadIdAllocator`),
//! per-thread end-of-batch callbacks, and a quiesce barrier used by
//! reload/shutdown to wait for every in-flight batch to drain before
//! touching shared state.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread::{self, JoinHandle};

use logflow_core::{ThreadIdAllocator, MAX_THREADS};

thread_local! {
    static CURRENT_WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The index of the worker thread currently executing, if this is one
/// (§4.2). `None` on the main thread or any thread not spawned by a
/// `WorkerPool`.
pub fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER_INDEX.with(|cell| cell.get())
}

type BatchCallback = Box<dyn FnMut() + Send>;
type SyncCallAction = Box<dyn FnOnce() + Send>;

/// A bounded pool of OS worker threads (§4.2), hard-capped at
/// [`logflow_core::MAX_THREADS`] by the thread-id allocator.
pub struct WorkerPool {
    ids: ThreadIdAllocator,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
    jobs_running: AtomicI64,
    /// Held shared by every worker thread while processing a batch, and
    /// exclusively by `quiesce` to wait out all in-flight batches before
    /// running a barrier action.
    quiesce_lock: RwLock<()>,
    batch_callbacks: Mutex<HashMap<usize, Vec<BatchCallback>>>,
    sync_call_actions: Mutex<VecDeque<SyncCallAction>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            ids: ThreadIdAllocator::new(),
            handles: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            jobs_running: AtomicI64::new(0),
            quiesce_lock: RwLock::new(()),
            batch_callbacks: Mutex::new(HashMap::new()),
            sync_call_actions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_threads(&self) -> usize {
        MAX_THREADS
    }

    pub fn active_workers(&self) -> u32 {
        self.ids.allocated_count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Request all worker threads to exit at the next batch boundary
    /// (§4.2 `request_all_workers_to_exit`).
    pub fn request_all_workers_to_exit(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Spawn one worker thread running `body`, which is handed its
    /// freshly allocated worker index and a `&WorkerPool` to poll
    /// `is_shutdown()` against. Returns `None` if the pool is already at
    /// `MAX_THREADS`.
    pub fn spawn<F>(self: &std::sync::Arc<Self>, name: impl Into<String>, body: F) -> Option<usize>
    where
        F: FnOnce(usize, std::sync::Arc<WorkerPool>) + Send + 'static,
    {
        let index = self.ids.allocate()?;
        let pool = std::sync::Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                CURRENT_WORKER_INDEX.with(|cell| cell.set(Some(index)));
                body(index, std::sync::Arc::clone(&pool));
                pool.batch_callbacks.lock().unwrap().remove(&index);
                pool.ids.release(index);
            })
            .expect("failed to spawn logflow worker thread");
        self.handles.lock().unwrap().push(handle);
        Some(index)
    }

    pub fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Mark the start of one unit of work on the current thread (§4.2
    /// `main_loop_worker_job_start`). Must be paired with `job_complete`.
    /// Takes the quiesce lock's read side, so a concurrent `quiesce`
    /// call will block until this (and all other in-flight jobs) call
    /// `job_complete`.
    pub fn job_start(&self) -> JobGuard<'_> {
        let guard = self.quiesce_lock.read().unwrap();
        self.jobs_running.fetch_add(1, Ordering::AcqRel);
        JobGuard { pool: self, _guard: guard }
    }

    pub fn jobs_running(&self) -> i64 {
        self.jobs_running.load(Ordering::Acquire)
    }

    /// Register a callback to run once, the next time the current
    /// thread's batch ends (§4.2 `main_loop_worker_register_batch_callback`).
    /// Used by `logflow-queue` to schedule `Queue::flush_input` without
    /// the queue crate depending on this one.
    pub fn register_batch_callback(&self, callback: impl FnMut() + Send + 'static) {
        let Some(index) = current_worker_index() else {
            return;
        };
        self.batch_callbacks
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .push(Box::new(callback));
    }

    /// Run and clear every batch callback registered by the current
    /// thread. Called by the worker loop once per batch, after the
    /// batch's jobs have all completed.
    pub fn invoke_batch_callbacks(&self) {
        let Some(index) = current_worker_index() else {
            return;
        };
        let callbacks = self.batch_callbacks.lock().unwrap().remove(&index);
        if let Some(mut callbacks) = callbacks {
            for cb in callbacks.iter_mut() {
                cb();
            }
        }
    }

    /// Defer `action` to run the next time the pool quiesces (§4.2
    /// `sync_call`). Used for state changes (e.g. applying a reload)
    /// that must not race with in-flight batches but don't need their
    /// own dedicated barrier call.
    pub fn register_sync_call_action(&self, action: impl FnOnce() + Send + 'static) {
        self.sync_call_actions.lock().unwrap().push_back(Box::new(action));
    }

    /// Block until every in-flight job has called `job_complete`, run
    /// every pending sync-call action, then run `apply` while still
    /// holding the barrier, then release it (§4.2 `quiesce`).
    ///
    /// No new job can start while this runs: `job_start` blocks on the
    /// same lock.
    pub fn quiesce<R>(&self, apply: impl FnOnce() -> R) -> R {
        let _barrier = self.quiesce_lock.write().unwrap();
        let mut actions = self.sync_call_actions.lock().unwrap();
        let pending: Vec<_> = actions.drain(..).collect();
        drop(actions);
        for action in pending {
            action();
        }
        apply()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct JobGuard<'a> {
    pool: &'a WorkerPool,
    _guard: std::sync::RwLockReadGuard<'a, ()>,
}

impl<'a> Drop for JobGuard<'a> {
    fn drop(&mut self) {
        self.pool.jobs_running.fetch_sub(1, Ordering::AcqRel);
    }
}
