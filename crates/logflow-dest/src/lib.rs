//! Destination worker state machine (C4): one OS thread per driver
//! instance, connecting, batching, flushing, and retrying against a
//! `Transport` implementation pulled off a `logflow_queue::Queue`.

pub mod state;
pub mod worker;

pub use state::DestState;
pub use worker::{DestWorker, DestWorkerConfig};
