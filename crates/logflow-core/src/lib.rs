//! Shared data model, external-collaborator traits, and low-level
//! primitives used across the logflow workspace.

pub mod message;
pub mod spinlock;
pub mod threadid;
pub mod traits;

pub use message::{AckGroup, AckStatus, Message, PathOptions, Tag, TimestampKind};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use threadid::{ThreadIdAllocator, MAX_THREADS};
pub use traits::{ConfigProvider, MarkMode, MetricsSink, PersistStore, Transport, TransportResult};
