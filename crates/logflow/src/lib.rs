//! logflow — the message-flow core of a high-throughput log collector
//! and router: a producer/consumer queue with ack/rewind durability, a
//! threaded destination worker that batches/retries/reconnects against
//! an opaque transport, and the cooperative scheduler that ties the two
//! together.
//!
//! ```text
//!   Source ──push──▶ Queue ──pop──▶ DestWorker ──post──▶ Transport
//!                     ▲                    │
//!                     └──ack/rewind────────┘
//! ```
//!
//! This crate is the facade: it re-exports the building blocks from
//! `logflow-core`/`logflow-queue`/`logflow-runtime`/`logflow-dest` and
//! adds the one thing none of them owns alone — `Pipeline`, which wires
//! a queue, its destination workers, and the top-level reactor (signals
//! + control socket) into a single handle with one `shutdown()`.
//!
//! Configuration parsing, wire protocols, plugin discovery, and metrics
//! backends are explicitly out of scope; `StaticConfig` and
//! `AtomicMetricsSink` exist only so the core is drivable from tests and
//! demos without inventing either.

pub mod config;
pub mod control;
pub mod mark;
pub mod metrics;
pub mod persist;
pub mod pipeline;

pub use config::StaticConfig;
pub use control::{ControlCommand, ControlHandler, ControlSocket};
pub use mark::MarkGenerator;
pub use metrics::AtomicMetricsSink;
pub use persist::{FilePersistStore, InMemoryPersistStore};
pub use pipeline::{Pipeline, Producer};

// Re-export the building blocks so a downstream crate can depend on
// `logflow` alone for the common path.
pub use logflow_core::{
    AckGroup, AckStatus, ConfigProvider, MarkMode, Message, MetricsSink, PathOptions, PersistStore,
    Tag, Transport, TransportResult,
};
pub use logflow_dest::{DestState, DestWorker, DestWorkerConfig};
pub use logflow_error::{ErrorKind, LogFlowError, Result};
pub use logflow_queue::{PushOutcome, Queue, QueueNode, QueueStats, Throttle};
pub use logflow_runtime::{
    current_worker_index, BatchedTimer, FdSource, JobGuard, MainLoop, MainLoopHandle,
    ShutdownPhase, WorkerPool,
};

/// Install a `tracing-subscriber` formatter reading `RUST_LOG` (or
/// defaulting to `info`), matching the `env-filter` feature already in
/// the workspace's dependency table. Idempotent: a second call is a
/// harmless no-op (the global subscriber can only be set once).
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
