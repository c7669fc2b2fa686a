//! In-memory `ConfigProvider` (§6.5). No file grammar or loader — that's
//! explicitly out of scope — but the core still needs a way to be
//! handed scalars from tests and demos, so this is the one
//! implementation the facade ships.

use std::time::Duration;

use logflow_core::{ConfigProvider, MarkMode};

/// Plain-struct configuration, the in-memory stand-in for whatever a
/// real deployment's config grammar would parse into.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub worker_count: usize,
    pub queue_capacity: u32,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Upper bound on how long a single `flush()` call is allowed to
    /// take; not enforced by the worker state machine itself (no
    /// transport call is cancelled mid-flight), but surfaced for a
    /// transport that wants to self-enforce a deadline.
    pub flush_timeout: Duration,
    pub reopen_timeout: Duration,
    pub max_retries: u32,
    pub max_retries_on_error: u32,
    pub throttle_limit: Option<u64>,
    pub use_backlog: bool,
    pub mark_mode: MarkMode,
    pub mark_interval: Duration,
}

impl Default for StaticConfig {
    /// Defaults picked to be usable as-is in a demo: one worker, a
    /// generous queue, small batches flushed quickly, unthrottled.
    fn default() -> Self {
        Self {
            worker_count: 1,
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(500),
            flush_timeout: Duration::from_secs(5),
            reopen_timeout: Duration::from_secs(10),
            max_retries: 3,
            max_retries_on_error: 3,
            throttle_limit: None,
            use_backlog: true,
            mark_mode: MarkMode::None,
            mark_interval: Duration::from_secs(1200),
        }
    }
}

impl ConfigProvider for StaticConfig {
    fn worker_count(&self) -> usize {
        self.worker_count
    }
    fn queue_capacity(&self) -> u32 {
        self.queue_capacity
    }
    fn batch_size(&self) -> usize {
        self.batch_size
    }
    fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }
    fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }
    fn throttle_limit(&self) -> Option<u64> {
        self.throttle_limit
    }
    fn reopen_timeout(&self) -> Duration {
        self.reopen_timeout
    }
    fn max_retries(&self) -> u32 {
        self.max_retries
    }
    fn max_retries_on_error(&self) -> u32 {
        self.max_retries_on_error
    }
    fn use_backlog(&self) -> bool {
        self.use_backlog
    }
    fn mark_mode(&self) -> MarkMode {
        self.mark_mode
    }
    fn mark_interval(&self) -> Duration {
        self.mark_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_internally_consistent() {
        let cfg = StaticConfig::default();
        assert_eq!(cfg.worker_count(), 1);
        assert!(cfg.use_backlog());
        assert!(cfg.flush_timeout() > cfg.batch_timeout());
    }
}
