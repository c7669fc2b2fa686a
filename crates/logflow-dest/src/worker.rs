//! The destination worker (§4.4 / C4): connects, batches, flushes, and
//! retries against a [`Transport`], one dedicated OS thread per driver
//! instance, each running its own `logflow_runtime::MainLoop` reactor
//! that alternates between draining work and re-arming itself rather
//! than spinning.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use logflow_core::{Message, MetricsSink, PersistStore, Transport, TransportResult};
use logflow_queue::Queue;
use logflow_runtime::{MainLoop, MainLoopHandle, TimerId};

use crate::state::DestState;

/// Static configuration for one destination worker (§6.5
/// `ConfigProvider` scalars, scoped to a single driver instance).
#[derive(Debug, Clone)]
pub struct DestWorkerConfig {
    pub driver_name: String,
    pub worker_index: usize,
    pub batch_lines: usize,
    pub batch_timeout: Duration,
    pub t_reopen: Duration,
    pub max_retries: u32,
    pub max_retries_on_error: u32,
}

impl DestWorkerConfig {
    /// Per-worker persist key for the queue/backlog (§9 supplemented
    /// feature 1, `_format_queue_persist_name`): worker 0 uses the bare
    /// driver name so a single-worker driver's persisted state survives
    /// a config change that adds workers later.
    pub fn queue_persist_key(&self) -> String {
        if self.worker_index == 0 {
            format!("{}.queue", self.driver_name)
        } else {
            format!("{}.{}.queue", self.driver_name, self.worker_index)
        }
    }

    pub fn seqnum_persist_key(&self) -> String {
        format!("{}.seqnum", self.driver_name)
    }
}

struct WorkerCtx {
    config: DestWorkerConfig,
    queue: Arc<Queue>,
    transport: Arc<dyn Transport>,
    metrics: Option<Arc<dyn MetricsSink>>,
    persist: Option<Arc<dyn PersistStore>>,
    handle: MainLoopHandle,

    state: Mutex<DestState>,
    /// Count of items accepted by the transport (`Queued` /
    /// `ExplicitAckManagement`) or inserted-and-pending since the last
    /// ack/rewind decision. Mirrors exactly the queue's own backlog
    /// length for this worker, since every popped item either joins
    /// this count or is resolved immediately.
    batch_size: AtomicUsize,
    batch_first_insert: Mutex<Option<Instant>>,
    retries: AtomicU32,
    retries_on_error: AtomicU32,
    seqnum: AtomicU64,

    quit: AtomicBool,
    pending_timer: Mutex<Option<TimerId>>,
}

impl WorkerCtx {
    fn report_processed(&self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(m) = &self.metrics {
            m.incr_processed(&self.config.driver_name, n);
        }
    }

    fn report_dropped(&self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(m) = &self.metrics {
            m.incr_dropped(&self.config.driver_name, n);
        }
    }

    fn report_suspended(&self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(m) = &self.metrics {
            m.incr_suspended(&self.config.driver_name, n);
        }
    }

    fn clear_batch_deadline(&self) {
        *self.batch_first_insert.lock().unwrap() = None;
    }

    /// Bump the shared sequence number used by drivers that stamp
    /// `${SEQNUM}` onto outgoing messages (§9 supplemented feature 1).
    fn bump_seqnum(&self, msg: &Message) {
        let _ = msg;
        self.seqnum.fetch_add(1, Ordering::AcqRel);
    }
}

/// Why `perform_inserts`/`perform_flush` stopped, and what `do_work`
/// should do about it.
enum LoopExit {
    Shutdown,
    BatchFull,
    /// The queue (and any buffered batch) is drained for now.
    Drained,
    Throttled(Duration),
    /// A connection-level failure: disconnect and back off `t_reopen`.
    Suspend,
    /// A `RETRY`-coded failure below the retry cap: rewind already
    /// happened, try again immediately without disconnecting.
    RetryImmediate,
}

/// A bounded pool of one: the state machine and reactor for a single
/// destination driver instance (§4.4).
pub struct DestWorker {
    ctx: Arc<WorkerCtx>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DestWorker {
    /// Spawn the worker thread and block until it has reached its
    /// reactor loop (§9 supplemented feature 4: startup synchronization
    /// latch, mirroring `_wait_for_startup_finished`).
    pub fn spawn(
        config: DestWorkerConfig,
        queue: Arc<Queue>,
        transport: Arc<dyn Transport>,
        metrics: Option<Arc<dyn MetricsSink>>,
        persist: Option<Arc<dyn PersistStore>>,
    ) -> std::io::Result<Self> {
        let main_loop = MainLoop::new()?;
        let handle = main_loop.handle();

        let initial_seqnum = persist
            .as_ref()
            .and_then(|p| p.load(&config.seqnum_persist_key()).ok().flatten())
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0);

        let ctx = Arc::new(WorkerCtx {
            config,
            queue,
            transport,
            metrics,
            persist,
            handle,
            state: Mutex::new(DestState::Disconnected),
            batch_size: AtomicUsize::new(0),
            batch_first_insert: Mutex::new(None),
            retries: AtomicU32::new(0),
            retries_on_error: AtomicU32::new(0),
            seqnum: AtomicU64::new(initial_seqnum),
            quit: AtomicBool::new(false),
            pending_timer: Mutex::new(None),
        });

        let started = Arc::new((Mutex::new(None::<bool>), Condvar::new()));
        let started_in_thread = Arc::clone(&started);
        let ctx_in_thread = Arc::clone(&ctx);
        let thread_name = format!(
            "logflow-dest-{}-{}",
            ctx.config.driver_name, ctx.config.worker_index
        );

        let join_handle = thread::Builder::new().name(thread_name).spawn(move || {
            let (lock, cvar) = &*started_in_thread;
            *lock.lock().unwrap() = Some(true);
            cvar.notify_all();

            rearm_immediate(&ctx_in_thread);
            main_loop.run();
        })?;

        let (lock, cvar) = &*started;
        let mut ready = lock.lock().unwrap();
        while ready.is_none() {
            ready = cvar.wait(ready).unwrap();
        }

        Ok(Self {
            ctx,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn state(&self) -> DestState {
        *self.ctx.state.lock().unwrap()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.ctx.queue
    }

    /// Request a graceful shutdown (§4.4 shutdown row): the worker
    /// finishes whatever it's doing, forces a flush, rewinds any unsent
    /// backlog, persists the sequence number, disconnects, and exits its
    /// reactor. Call `join` afterward to wait for the thread to exit.
    pub fn shutdown(&self) {
        self.ctx.quit.store(true, Ordering::Release);
        if let Some(id) = self.ctx.pending_timer.lock().unwrap().take() {
            self.ctx.handle.cancel_timer(id);
        }
        let ctx = Arc::clone(&self.ctx);
        self.ctx.handle.call_on_main(move || do_work(ctx), false);
    }

    pub fn join(&self) {
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Force a disconnect/reconnect cycle regardless of current state
    /// (the control surface's `reopen` command). A no-op race with an
    /// in-flight `shutdown` is harmless: `do_work` checks `quit` first.
    pub fn request_reopen(&self) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx.handle.call_on_main(
            move || {
                ctx.transport.disconnect();
                *ctx.state.lock().unwrap() = DestState::Disconnected;
                do_work(ctx);
            },
            false,
        );
    }
}

fn rearm_after(ctx: &Arc<WorkerCtx>, delay: Duration) {
    let ctx2 = Arc::clone(ctx);
    let id = ctx.handle.schedule_after(delay, Box::new(move || do_work(ctx2)));
    *ctx.pending_timer.lock().unwrap() = Some(id);
}

fn rearm_immediate(ctx: &Arc<WorkerCtx>) {
    rearm_after(ctx, Duration::ZERO);
}

fn suspend(ctx: &Arc<WorkerCtx>, delay: Duration) {
    *ctx.state.lock().unwrap() = DestState::Suspended;
    tracing::warn!(
        driver = %ctx.config.driver_name,
        worker_index = ctx.config.worker_index,
        reopen_in_ms = delay.as_millis() as u64,
        "destination suspended, will retry connect"
    );
    let ctx2 = Arc::clone(ctx);
    let id = ctx.handle.schedule_after(
        delay,
        Box::new(move || {
            *ctx2.state.lock().unwrap() = DestState::Disconnected;
            do_work(ctx2);
        }),
    );
    *ctx.pending_timer.lock().unwrap() = Some(id);
}

/// The worker's main step function (§4.4 `do_work`). Re-arms itself
/// (via a zero-delay or deadline timer on its own reactor) rather than
/// looping in place, so the reactor can observe shutdown between steps.
fn do_work(ctx: Arc<WorkerCtx>) {
    if ctx.quit.load(Ordering::Acquire) {
        final_shutdown(&ctx);
        return;
    }

    let connected = matches!(
        *ctx.state.lock().unwrap(),
        DestState::Connected | DestState::Batching | DestState::Flushing
    );
    if !connected {
        match ctx.transport.connect() {
            Ok(()) => {
                *ctx.state.lock().unwrap() = DestState::Connected;
            }
            Err(_) => {
                suspend(&ctx, ctx.config.t_reopen);
                return;
            }
        }
    }

    if !ctx.queue.is_empty() {
        match perform_inserts(&ctx) {
            LoopExit::Shutdown => {
                final_shutdown(&ctx);
                return;
            }
            LoopExit::Suspend => {
                ctx.transport.disconnect();
                suspend(&ctx, ctx.config.t_reopen);
                return;
            }
            LoopExit::RetryImmediate => {
                rearm_immediate(&ctx);
                return;
            }
            LoopExit::Throttled(wait) => {
                rearm_after(&ctx, wait);
                return;
            }
            LoopExit::BatchFull => {
                finish_with_flush(&ctx);
                return;
            }
            LoopExit::Drained => {
                // Fall through: a buffered-but-unflushed batch (if any)
                // still needs a timeout check below.
            }
        }
    }

    if ctx.batch_size.load(Ordering::Acquire) > 0 {
        *ctx.state.lock().unwrap() = DestState::Batching;
        let elapsed = ctx
            .batch_first_insert
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= ctx.config.batch_timeout {
            finish_with_flush(&ctx);
        } else {
            rearm_after(&ctx, ctx.config.batch_timeout - elapsed);
        }
        return;
    }

    let wakeup_ctx = Arc::clone(&ctx);
    let (has_items, throttle_wait) = ctx.queue.check_items_throttled(move || {
        let ctx2 = Arc::clone(&wakeup_ctx);
        wakeup_ctx.handle.call_on_main(move || do_work(ctx2), false);
    });
    if has_items {
        rearm_immediate(&ctx);
    } else if throttle_wait > Duration::ZERO {
        rearm_after(&ctx, throttle_wait);
    }
    // Otherwise the worker parks: `check_items_throttled` installed the
    // wakeup above, and the next push will re-arm this worker.
}

fn finish_with_flush(ctx: &Arc<WorkerCtx>) {
    match perform_flush(ctx) {
        LoopExit::Suspend => {
            ctx.transport.disconnect();
            suspend(ctx, ctx.config.t_reopen);
        }
        LoopExit::RetryImmediate => rearm_immediate(ctx),
        _ => {
            *ctx.state.lock().unwrap() = DestState::Connected;
            rearm_immediate(ctx);
        }
    }
}

/// Pop items off the queue and insert them one at a time until the
/// batch is full, the transport signals a stop condition, the queue is
/// drained, or shutdown is observed (§4.4 `do_work` step 2).
fn perform_inserts(ctx: &Arc<WorkerCtx>) -> LoopExit {
    loop {
        if ctx.quit.load(Ordering::Acquire) {
            return LoopExit::Shutdown;
        }
        if ctx.batch_size.load(Ordering::Acquire) >= ctx.config.batch_lines {
            return LoopExit::BatchFull;
        }

        match ctx.queue.pop_head_throttled() {
            Ok((node, _path_options)) => {
                ctx.bump_seqnum(&node.message);
                let result = ctx.transport.insert(&node.message);
                tracing::trace!(
                    driver = %ctx.config.driver_name,
                    worker_index = ctx.config.worker_index,
                    ?result,
                    "transport insert"
                );
                match apply_insert_result(ctx, result) {
                    Some(exit) => return exit,
                    None => continue,
                }
            }
            Err(wait) if wait == Duration::ZERO => return LoopExit::Drained,
            Err(wait) => return LoopExit::Throttled(wait),
        }
    }
}

/// Resolve a batch of `pending` already-popped items against one
/// terminal `TransportResult` (everything but `Queued`/
/// `ExplicitAckManagement`, which don't resolve anything and are
/// handled by the two callers before reaching here) — shared by the
/// per-insert and per-flush paths, which differ only in how `pending`
/// is computed (§4.4 failure table, §6.2 per-insert/per-flush result
/// codes).
fn resolve_batch(ctx: &Arc<WorkerCtx>, pending: u64, result: TransportResult) -> Option<LoopExit> {
    match result {
        TransportResult::Success => {
            ctx.queue.ack_backlog(pending as usize);
            ctx.retries_on_error.store(0, Ordering::Release);
            ctx.retries.store(0, Ordering::Release);
            ctx.clear_batch_deadline();
            ctx.report_processed(pending);
            None
        }
        TransportResult::Drop => {
            ctx.queue.ack_backlog(pending as usize);
            ctx.clear_batch_deadline();
            ctx.report_dropped(pending);
            Some(LoopExit::Suspend)
        }
        TransportResult::Error => {
            let retries = ctx.retries_on_error.fetch_add(1, Ordering::AcqRel) + 1;
            ctx.clear_batch_deadline();
            if retries > ctx.config.max_retries_on_error {
                ctx.queue.ack_backlog(pending as usize);
                ctx.report_dropped(pending);
                ctx.retries_on_error.store(0, Ordering::Release);
            } else {
                ctx.queue.rewind_backlog(pending as usize);
                ctx.report_suspended(pending);
            }
            Some(LoopExit::Suspend)
        }
        TransportResult::NotConnected => {
            ctx.clear_batch_deadline();
            ctx.retries.store(0, Ordering::Release);
            ctx.queue.rewind_backlog(pending as usize);
            ctx.report_suspended(pending);
            Some(LoopExit::Suspend)
        }
        TransportResult::Retry => {
            let retries = ctx.retries.fetch_add(1, Ordering::AcqRel) + 1;
            ctx.clear_batch_deadline();
            ctx.queue.rewind_backlog(pending as usize);
            ctx.report_suspended(pending);
            if retries > ctx.config.max_retries {
                ctx.retries.store(0, Ordering::Release);
                Some(LoopExit::Suspend)
            } else {
                Some(LoopExit::RetryImmediate)
            }
        }
        TransportResult::Queued | TransportResult::ExplicitAckManagement => {
            unreachable!("callers resolve Queued/ExplicitAckManagement before calling resolve_batch")
        }
    }
}

/// Apply one `insert` result. Returns `None` to keep looping, or
/// `Some(exit)` when the caller should stop (§6.2 per-insert result
/// codes, §4.4 failure table).
fn apply_insert_result(ctx: &Arc<WorkerCtx>, result: TransportResult) -> Option<LoopExit> {
    match result {
        TransportResult::Queued | TransportResult::ExplicitAckManagement => {
            // The transport is buffering this item internally (and, for
            // `ExplicitAckManagement`, owns its ack/rewind itself); the
            // worker still counts it toward the batch-size threshold so
            // it stops over-buffering.
            if ctx.batch_size.fetch_add(1, Ordering::AcqRel) == 0 {
                *ctx.batch_first_insert.lock().unwrap() = Some(Instant::now());
            }
            None
        }
        other => {
            // `+1`: this item itself, on top of whatever was already
            // buffered from earlier `Queued` results in the same batch.
            let pending = ctx.batch_size.swap(0, Ordering::AcqRel) as u64 + 1;
            resolve_batch(ctx, pending, other)
        }
    }
}

/// Apply a `flush` result against the whole currently-buffered batch.
/// Unlike `apply_insert_result`, no new item is being inserted here, so
/// `pending` is exactly the buffered count with no `+1`.
fn apply_flush_result(ctx: &Arc<WorkerCtx>, result: TransportResult) -> Option<LoopExit> {
    match result {
        TransportResult::Queued | TransportResult::ExplicitAckManagement => None,
        other => {
            let pending = ctx.batch_size.swap(0, Ordering::AcqRel) as u64;
            resolve_batch(ctx, pending, other)
        }
    }
}

/// Force a flush of whatever is currently buffered (§4.4 "flush phase").
fn perform_flush(ctx: &Arc<WorkerCtx>) -> LoopExit {
    let pending = ctx.batch_size.load(Ordering::Acquire);
    if pending == 0 {
        return LoopExit::Drained;
    }
    *ctx.state.lock().unwrap() = DestState::Flushing;
    let result = ctx.transport.flush();
    tracing::debug!(
        driver = %ctx.config.driver_name,
        worker_index = ctx.config.worker_index,
        batch_size = pending,
        ?result,
        "transport flush"
    );
    match apply_flush_result(ctx, result) {
        Some(exit) => exit,
        None => LoopExit::Drained,
    }
}

/// Final shutdown path (§4.4 shutdown row, §7 `Shutdown`): force a
/// flush ignoring the quit flag, rewind whatever remains unacked back
/// onto `output` for the next run, persist the sequence number, and
/// disconnect.
fn final_shutdown(ctx: &Arc<WorkerCtx>) {
    tracing::info!(
        driver = %ctx.config.driver_name,
        worker_index = ctx.config.worker_index,
        "destination worker shutting down"
    );
    if ctx.batch_size.load(Ordering::Acquire) > 0 {
        perform_flush(ctx);
    }
    ctx.queue.rewind_backlog_all();

    if let Some(persist) = &ctx.persist {
        let seqnum = ctx.seqnum.load(Ordering::Acquire);
        let _ = persist.store(&ctx.config.seqnum_persist_key(), &seqnum.to_le_bytes());
        let _ = persist.store(
            &ctx.config.queue_persist_key(),
            &(ctx.queue.len() as u64).to_le_bytes(),
        );
    }

    ctx.transport.disconnect();
    *ctx.state.lock().unwrap() = DestState::Disconnected;
    ctx.handle.request_stop();
}
