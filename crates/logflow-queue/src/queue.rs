//! The three-stage message queue (§4.3 / C3).
//!
//! Items flow `input[thread] -> wait -> output -> backlog`:
//!
//! - `input[thread]` is a per-producer-thread list. Only the owning
//!   thread ever touches its own slot, so the lock guarding it is never
//!   contended in practice; it exists to satisfy `Sync`, not to
//!   serialize access.
//! - `wait` is the one genuinely shared, lock-protected list. Producer
//!   threads splice their whole `input` slot into it in one locked
//!   operation (`flush_input`) instead of taking the lock per message.
//! - `output` is touched only by the single consumer thread
//!   (`pop_head`/`push_head`), refilled from `wait` by a splice whenever
//!   it runs dry.
//! - `backlog` holds items that have been popped but not yet acked, so a
//!   destination worker can `rewind_backlog`/`rewind_backlog_all` them
//!   back onto `output` after a failed delivery attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logflow_core::{AckStatus, MetricsSink, PathOptions, SpinLock, MAX_THREADS};

use crate::node::QueueNode;
use crate::throttle::Throttle;

type NotifyFn = Box<dyn Fn() + Send>;

struct InputSlot {
    items: SpinLock<VecDeque<QueueNode>>,
    registered: SpinLock<bool>,
}

impl InputSlot {
    fn new() -> Self {
        Self {
            items: SpinLock::new(VecDeque::new()),
            registered: SpinLock::new(false),
        }
    }
}

/// Outcome of a `push_tail` call, telling the caller (the worker pool's
/// end-of-batch machinery) whether it needs to arrange for
/// `flush_input` to run later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted; no action needed from the caller.
    Accepted,
    /// Accepted, and this was the first item on a previously-empty input
    /// slot: the caller should register an end-of-batch callback that
    /// calls `flush_input(thread_id)` exactly once.
    AcceptedFirstInBatch,
    /// The message was dropped because the queue (and its overflow
    /// allowance) is full.
    Dropped,
}

pub struct QueueStats {
    pub queued_messages: u64,
    pub dropped_messages: u64,
    pub memory_usage: u64,
}

/// A three-stage FIFO queue (§4.3).
pub struct Queue {
    persist_name: String,
    capacity: u32,
    use_backlog: bool,

    inputs: Box<[InputSlot]>,

    wait: SpinLock<VecDeque<QueueNode>>,
    wait_len: AtomicU64,

    output: SpinLock<VecDeque<QueueNode>>,
    output_len: AtomicU64,

    backlog: SpinLock<VecDeque<QueueNode>>,
    backlog_len: AtomicU64,

    queued_messages: AtomicU64,
    dropped_messages: AtomicU64,
    memory_usage: AtomicU64,

    metrics: Option<Arc<dyn MetricsSink>>,

    /// One-shot "queue became non-empty" wakeup, installed by
    /// `check_items` and fired (and cleared) the next time a push makes
    /// the queue non-empty (§4.3 `check_items`/`notify`).
    notify: SpinLock<Option<NotifyFn>>,
    throttle: Throttle,
}

impl Queue {
    pub fn new(capacity: u32, persist_name: impl Into<String>) -> Self {
        Self::with_metrics(capacity, persist_name, None)
    }

    pub fn with_metrics(
        capacity: u32,
        persist_name: impl Into<String>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        let inputs = (0..MAX_THREADS).map(|_| InputSlot::new()).collect();
        Self {
            persist_name: persist_name.into(),
            capacity,
            use_backlog: false,
            inputs,
            wait: SpinLock::new(VecDeque::new()),
            wait_len: AtomicU64::new(0),
            output: SpinLock::new(VecDeque::new()),
            output_len: AtomicU64::new(0),
            backlog: SpinLock::new(VecDeque::new()),
            backlog_len: AtomicU64::new(0),
            queued_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            memory_usage: AtomicU64::new(0),
            metrics,
            notify: SpinLock::new(None),
            throttle: Throttle::new(0),
        }
    }

    /// Install a token-bucket rate limit applied at `pop_head` (§4.3
    /// throttle). `0` (the default) means unthrottled.
    pub fn with_throttle(self, limit_per_sec: u64) -> Self {
        Self {
            throttle: Throttle::new(limit_per_sec),
            ..self
        }
    }

    fn fire_notify(&self) {
        let notify = self.notify.lock().take();
        if let Some(notify) = notify {
            notify();
        }
    }

    /// Enable backlog bookkeeping: `pop_head` will hold a copy of each
    /// popped item until `ack_backlog`/`rewind_backlog*` resolves it.
    /// Destination queues want this; plain forwarding queues don't.
    pub fn with_backlog(mut self, use_backlog: bool) -> Self {
        self.use_backlog = use_backlog;
        self
    }

    pub fn persist_name(&self) -> &str {
        &self.persist_name
    }

    /// `wait_len + output_len`, racy by construction (§4.3 `get_length`):
    /// the two atomics aren't read under a single lock, so a concurrent
    /// `flush_input`/`pop_head` can interleave. Acceptable because the
    /// only consumer is overflow accounting, which already tolerates a
    /// bounded amount of slop.
    pub fn len(&self) -> u64 {
        self.wait_len.load(Ordering::Acquire) + self.output_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backlog_len(&self) -> u64 {
        self.backlog_len.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued_messages: self.queued_messages.load(Ordering::Acquire),
            dropped_messages: self.dropped_messages.load(Ordering::Acquire),
            memory_usage: self.memory_usage.load(Ordering::Acquire),
        }
    }

    fn add_memory(&self, delta: i64) {
        if delta >= 0 {
            self.memory_usage.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.memory_usage.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_memory_usage(&self.persist_name, self.memory_usage.load(Ordering::Acquire));
        }
    }

    fn report_queue_length(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_length(&self.persist_name, self.len());
        }
    }

    /// Is there any message anywhere in the queue, including an input
    /// slot that hasn't been flushed yet (§4.3 `is_empty_racy`)?
    pub fn is_empty_racy(&self) -> bool {
        if self.len() > 0 {
            return false;
        }
        self.inputs.iter().any(|slot| *slot.registered.lock())
    }

    /// Whether the queue has anything worth preserving across a reload
    /// (§4.3 `keep_on_reload`): outstanding queued items, or items still
    /// awaiting ack in the backlog.
    pub fn keep_on_reload(&self) -> bool {
        self.len() > 0 || self.backlog_len() > 0
    }

    /// Fast-path push from a registered producer thread's own slot.
    /// Never takes the `wait` lock; the caller is responsible for
    /// arranging `flush_input` to run once per batch (see
    /// `PushOutcome::AcceptedFirstInBatch`).
    pub fn push_tail_fast(&self, thread_id: usize, node: QueueNode) -> PushOutcome {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.inputs[thread_id];
        let mut registered = slot.registered.lock();
        let first = !*registered;
        if first {
            *registered = true;
        }
        drop(registered);
        slot.items.lock().push_back(node);
        if first {
            PushOutcome::AcceptedFirstInBatch
        } else {
            PushOutcome::Accepted
        }
    }

    /// Slow-path push used by threads with no registered index (or by
    /// internal callers pushing directly): takes the `wait` lock
    /// immediately rather than going through a per-thread slot.
    pub fn push_tail_slow(&self, node: QueueNode) -> PushOutcome {
        let mut wait = self.wait.lock();
        // A flow-controlled push is never dropped on overflow (§4.3
        // invariant 3); capacity is a soft bound for it, backpressure is
        // the source's problem, not the queue's.
        if self.len() >= self.capacity as u64 && !node.flow_control_requested {
            drop(wait);
            self.drop_node(node);
            return PushOutcome::Dropped;
        }
        let size = node.message.size_bytes() as i64;
        wait.push_back(node);
        self.wait_len.fetch_add(1, Ordering::AcqRel);
        drop(wait);
        self.queued_messages.fetch_add(1, Ordering::AcqRel);
        self.add_memory(size);
        self.report_queue_length();
        self.fire_notify();
        PushOutcome::Accepted
    }

    /// Move a producer thread's per-thread input slot into the shared
    /// `wait` list (§4.3 `log_queue_fifo_move_input_unlocked`), dropping
    /// the oldest excess *non-flow-controlled* items if the slot's
    /// contents would push the queue over `capacity` — flow-controlled
    /// messages are never dropped (§4.3 invariant 3), so they ride along
    /// past `capacity` while the scan looks for droppable neighbors.
    ///
    /// Called once per batch, from the thread that owns `thread_id`
    /// (e.g. as an end-of-batch callback), never concurrently with
    /// itself for the same `thread_id`.
    pub fn flush_input(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.inputs[thread_id];
        let mut items = slot.items.lock();
        if items.is_empty() {
            *slot.registered.lock() = false;
            return;
        }

        let queue_len = self.len();
        let slot_len = items.len() as u64;
        if queue_len + slot_len > self.capacity as u64 {
            let allowed = self.capacity as i64 - queue_len as i64;
            let excess = (slot_len as i64 - allowed.max(0)).max(0) as usize;
            let mut dropped = 0usize;
            let mut scanned = 0usize;
            while dropped < excess && scanned < items.len() {
                if items[scanned].flow_control_requested {
                    scanned += 1;
                    continue;
                }
                let node = items.remove(scanned).expect("scanned index in bounds");
                self.drop_node(node);
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(
                    queue = %self.persist_name,
                    queue_len,
                    capacity = self.capacity,
                    dropped,
                    "destination queue full, dropping messages"
                );
            }
        }

        let moved = items.len() as u64;
        let size: i64 = items.iter().map(|n| n.message.size_bytes() as i64).sum();
        let mut wait = self.wait.lock();
        wait.append(&mut items);
        drop(wait);
        self.wait_len.fetch_add(moved, Ordering::AcqRel);
        self.queued_messages.fetch_add(moved, Ordering::AcqRel);
        self.add_memory(size);
        self.report_queue_length();
        self.fire_notify();

        *slot.registered.lock() = false;
    }

    /// Drop one overflow node. Callers must only pass nodes with
    /// `flow_control_requested == false` (§4.3 invariant 3).
    fn drop_node(&self, node: QueueNode) {
        debug_assert!(!node.flow_control_requested, "flow-controlled messages must never be dropped");
        self.dropped_messages.fetch_add(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.incr_dropped(&self.persist_name, 1);
        }
        if node.ack_needed {
            node.message.ack(AckStatus::Processed);
        }
    }

    /// Put an item back in front of the queue, bypassing capacity checks
    /// (§4.3 `push_head`). Only ever called by the consumer thread, when
    /// it started processing an item but couldn't finish delivering it.
    pub fn push_head(&self, node: QueueNode) {
        let size = node.message.size_bytes() as i64;
        self.output.lock().push_front(node);
        self.output_len.fetch_add(1, Ordering::AcqRel);
        self.queued_messages.fetch_add(1, Ordering::AcqRel);
        self.add_memory(size);
        self.report_queue_length();
    }

    /// Pop the next item (§4.3 `pop_head`). Refills `output` from `wait`
    /// if `output` is empty. Returns `None` if the queue is genuinely
    /// drained (items may still be sitting unflushed in a producer's
    /// input slot; this does not see those), or if the throttle has no
    /// token available (see `pop_head_throttled` for the retry-after
    /// duration in that case).
    pub fn pop_head(&self) -> Option<(QueueNode, PathOptions)> {
        self.pop_head_throttled().ok()
    }

    /// Like `pop_head`, but distinguishes "genuinely empty" from
    /// "throttled": `Err(wait)` means a token should become available
    /// after `wait`, and the head item was left in place.
    pub fn pop_head_throttled(&self) -> Result<(QueueNode, PathOptions), Duration> {
        if self.output_len.load(Ordering::Acquire) == 0 {
            let mut wait = self.wait.lock();
            if !wait.is_empty() {
                let mut output = self.output.lock();
                output.append(&mut wait);
                let moved = self.wait_len.swap(0, Ordering::AcqRel);
                self.output_len.fetch_add(moved, Ordering::AcqRel);
            }
        }

        if self.output_len.load(Ordering::Acquire) == 0 {
            return Err(Duration::ZERO);
        }

        if self.throttle.try_take(1) == 0 {
            return Err(self.throttle.time_until_token());
        }

        let mut output = self.output.lock();
        let Some(node) = output.pop_front() else {
            return Err(Duration::ZERO);
        };
        drop(output);
        self.output_len.fetch_sub(1, Ordering::AcqRel);
        self.queued_messages.fetch_sub(1, Ordering::AcqRel);
        self.add_memory(-(node.message.size_bytes() as i64));
        self.report_queue_length();

        let path_options = node.path_options();
        if self.use_backlog {
            self.backlog.lock().push_back(QueueNode {
                message: node.message.clone(),
                ack_needed: node.ack_needed,
                flow_control_requested: node.flow_control_requested,
            });
            self.backlog_len.fetch_add(1, Ordering::AcqRel);
        }
        Ok((node, path_options))
    }

    /// Ack the oldest `rewind_count` items in the backlog as delivered
    /// (§4.3 `ack_backlog`). Called once a destination driver confirms
    /// successful delivery.
    pub fn ack_backlog(&self, rewind_count: usize) {
        let mut backlog = self.backlog.lock();
        for _ in 0..rewind_count {
            let Some(node) = backlog.pop_front() else {
                break;
            };
            self.backlog_len.fetch_sub(1, Ordering::AcqRel);
            if node.ack_needed {
                node.message.ack(AckStatus::Processed);
            }
        }
        self.fire_notify();
    }

    /// Move the entire backlog back onto the head of `output` (§4.3
    /// `rewind_backlog_all`), preserving delivery order. Used when a
    /// destination driver disconnects with items still in flight: they
    /// need to be retried from the front of `output` once reconnected.
    pub fn rewind_backlog_all(&self) {
        let mut backlog = self.backlog.lock();
        if backlog.is_empty() {
            return;
        }
        let moved = backlog.len() as u64;
        let size: i64 = backlog.iter().map(|n| n.message.size_bytes() as i64).sum();
        let mut output = self.output.lock();
        // Prepend in original order: backlog is oldest-first, so drain
        // from the back and push_front to land the oldest item closest
        // to the head.
        for node in backlog.drain(..).rev() {
            output.push_front(node);
        }
        self.backlog_len.fetch_sub(moved, Ordering::AcqRel);
        self.output_len.fetch_add(moved, Ordering::AcqRel);
        self.queued_messages.fetch_add(moved, Ordering::AcqRel);
        drop(output);
        drop(backlog);
        self.add_memory(size);
        self.report_queue_length();
        self.fire_notify();
    }

    /// Move the most-recently-popped `rewind_count` backlog items back
    /// to the front of `output`, preserving their relative order (§4.3
    /// `rewind_backlog`). Used for a partial batch failure, where only
    /// the tail of a batch needs retrying.
    pub fn rewind_backlog(&self, rewind_count: usize) {
        let mut backlog = self.backlog.lock();
        let mut output = self.output.lock();
        let rewind_count = rewind_count.min(backlog.len());
        for _ in 0..rewind_count {
            let Some(node) = backlog.pop_back() else {
                break;
            };
            self.backlog_len.fetch_sub(1, Ordering::AcqRel);
            self.queued_messages.fetch_add(1, Ordering::AcqRel);
            self.add_memory(node.message.size_bytes() as i64);
            output.push_front(node);
            self.output_len.fetch_add(1, Ordering::AcqRel);
        }
        drop(output);
        drop(backlog);
        self.report_queue_length();
        self.fire_notify();
    }

    /// Ask whether work is available without blocking (§4.3
    /// `check_items`). If the queue is non-empty, returns `true`
    /// immediately (and clears any previously-installed wakeup). If
    /// empty, installs `on_nonempty` as a one-shot wakeup fired by the
    /// next push that makes the queue non-empty, and returns `false`
    /// along with how long to wait before retrying: zero if nothing is
    /// queued at all, or the throttle's `time_until_token` if the queue
    /// has items but the throttle is currently out of tokens.
    pub fn check_items(&self, on_nonempty: impl Fn() + Send + 'static) -> (bool, Duration) {
        if self.len() > 0 {
            *self.notify.lock() = None;
            return (true, Duration::ZERO);
        }
        *self.notify.lock() = Some(Box::new(on_nonempty));
        (false, Duration::ZERO)
    }

    /// Like `check_items`, but when the queue is empty *because the
    /// throttle is blocking progress on an otherwise non-empty output*,
    /// reports that wait instead of installing a wakeup — the caller
    /// should re-arm a timer for the returned duration rather than wait
    /// for a push notification that may not come soon.
    pub fn check_items_throttled(&self, on_nonempty: impl Fn() + Send + 'static) -> (bool, Duration) {
        if self.output_len.load(Ordering::Acquire) > 0 || !self.wait.lock().is_empty() {
            let wait = self.throttle.time_until_token();
            if wait > Duration::ZERO {
                return (false, wait);
            }
            *self.notify.lock() = None;
            return (true, Duration::ZERO);
        }
        self.check_items(on_nonempty)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        for slot in self.inputs.iter() {
            let mut items = slot.items.lock();
            for node in items.drain(..) {
                if node.ack_needed {
                    node.message.ack(AckStatus::Aborted);
                }
            }
        }
        for list in [&self.wait, &self.output, &self.backlog] {
            let mut list = list.lock();
            for node in list.drain(..) {
                if node.ack_needed {
                    node.message.ack(AckStatus::Aborted);
                }
            }
        }
    }
}
