//! External-collaborator traits (§6).
//!
//! These are the seams the rest of the workspace is built around:
//! `Transport` is what a destination driver implements to actually move
//! bytes; `MetricsSink` and `ConfigProvider` are what the runtime reports
//! to and reads from; `PersistStore` is where sequence numbers and other
//! small bits of durable state round-trip across a reload or restart.

use std::time::Duration;

use logflow_error::Result;

use crate::message::Message;

/// Result of a single `insert` or `flush` call against a destination
/// driver (§6.2). Distinct from `LogFlowError` because several of these
/// (`Queued`, `ExplicitAckManagement`) aren't failures at all — they tell
/// the destination worker how to treat the in-flight message, not that
/// something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportResult {
    /// The item was fully accepted; ack immediately.
    Success,
    /// The item was accepted into the driver's own internal buffer; the
    /// driver will ack it later, out of band (see `ExplicitAckManagement`).
    Queued,
    /// The item is permanently unsendable (e.g. malformed for this
    /// driver) and should be dropped without retry.
    Drop,
    /// Transient failure; the destination worker should retry after
    /// backoff without dropping the item.
    Error,
    /// The driver has no live connection; the destination worker should
    /// transition to reconnecting and retry once connected.
    NotConnected,
    /// Like `Error`, but the driver is asking for immediate retry rather
    /// than going through the normal backoff schedule.
    Retry,
    /// The driver will call back into the destination worker's ack
    /// handle itself, asynchronously, rather than being acked by the
    /// return value of `insert`/`flush`. Used by drivers with their own
    /// batching/pipelining (e.g. a network client with in-flight
    /// requests).
    ExplicitAckManagement,
}

/// What a destination driver implements (§6.2).
///
/// `connect`/`disconnect`/`insert`/`flush` are all expected to be
/// non-blocking or bounded-blocking; the destination worker's state
/// machine is built around polling these rather than dedicating a thread
/// to each.
pub trait Transport: Send + Sync {
    /// Human-readable driver name, used in error messages and metrics
    /// labels (e.g. "file", "network/tcp").
    fn name(&self) -> &str;

    /// Establish (or re-establish) the underlying connection. Called from
    /// `Disconnected` state; success moves the worker to `Connected`.
    fn connect(&self) -> std::result::Result<(), TransportResult>;

    fn disconnect(&self);

    /// Submit one message. May buffer internally rather than write
    /// through immediately — see `TransportResult::Queued`.
    fn insert(&self, message: &Message) -> TransportResult;

    /// Force any buffered messages out. Called on batch timeout or
    /// explicit flush request.
    fn flush(&self) -> TransportResult;

    /// Suggested reconnect backoff after a failed `connect`. The
    /// destination worker may apply its own jitter/cap on top.
    fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// Where the destination worker reports counters (§6.3).
///
/// All methods take `&self` and are expected to be cheap and
/// lock-free (see `AtomicMetricsSink` in the facade crate) since they're
/// called from hot paths.
pub trait MetricsSink: Send + Sync {
    fn incr_processed(&self, driver: &str, n: u64);
    fn incr_dropped(&self, driver: &str, n: u64);
    fn incr_suspended(&self, driver: &str, n: u64);
    fn set_queue_length(&self, queue: &str, len: u64);
    fn set_memory_usage(&self, queue: &str, bytes: u64);
}

/// Durable storage for sequence numbers and other small per-worker state
/// that must survive a reload (§6.4, §3 persisted-state layout).
///
/// Implementations are expected to be synchronous and infrequently
/// called (on startup, on graceful shutdown, and on `keep_on_reload`
/// handoff), not a hot path.
pub trait PersistStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn store(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// When (if ever) a synthetic `MARK` message (§3 `Tag::MARK`) should be
/// emitted to show a destination is alive during otherwise-quiet periods
/// (§6.5 `mark_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// Emit on a fixed wall-clock interval regardless of traffic.
    Global,
    /// Emit only after a destination has been idle (no successful push)
    /// for the mark interval.
    DstIdle,
    /// Like `DstIdle`, scoped to a host rather than a destination; this
    /// core has no host dimension, so it is treated identically to
    /// `DstIdle`.
    HostIdle,
    /// Like `Global`, but the synthesized message also carries
    /// `Tag::INTERNAL` so it is distinguishable from a host-originated
    /// periodic mark.
    Internal,
    /// Alias for `Global` kept for source compatibility with
    /// configuration that names the behavior "periodical".
    Periodical,
    /// No marks are generated.
    None,
}

/// Read-only view of configuration the runtime needs at startup and
/// across a reload (§6.5).
pub trait ConfigProvider: Send + Sync {
    fn worker_count(&self) -> usize;
    fn queue_capacity(&self) -> u32;
    fn batch_size(&self) -> usize;
    fn batch_timeout(&self) -> Duration;
    fn flush_timeout(&self) -> Duration;
    fn throttle_limit(&self) -> Option<u64>;
    /// Reconnect backoff after a transport failure (`t_reopen_sec`).
    fn reopen_timeout(&self) -> Duration;
    fn max_retries(&self) -> u32;
    fn max_retries_on_error(&self) -> u32;
    /// Whether popped-but-unacked items are tracked in a backlog for
    /// rewind (§4.3 `use_backlog`). `false` only makes sense for
    /// destinations that never fail and never need replay.
    fn use_backlog(&self) -> bool;
    /// How (if at all) this destination should generate `MARK` messages
    /// during idle periods (§6.5 `mark_mode`).
    fn mark_mode(&self) -> MarkMode;
    /// Interval between marks, interpreted per `mark_mode` (either a
    /// fixed period or an idle threshold).
    fn mark_interval(&self) -> Duration;
}
