//! Atomic-counter `MetricsSink` (§6.3, §7 user-visible counters). No
//! specific metrics backend is in scope: a small table of `AtomicU64`
//! counters keyed by label, plain enough to read back in a test or
//! render as a `stats-dump` line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use logflow_core::MetricsSink;

#[derive(Debug, Default)]
struct DriverCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
    suspended: AtomicU64,
}

#[derive(Debug, Default)]
struct QueueGauges {
    length: AtomicU64,
    memory_usage: AtomicU64,
}

/// Lock-free-on-the-hot-path counters, one row per driver name plus one
/// per queue name, created lazily on first use.
#[derive(Default)]
pub struct AtomicMetricsSink {
    drivers: Mutex<HashMap<String, DriverCounters>>,
    queues: Mutex<HashMap<String, QueueGauges>>,
}

impl AtomicMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self, driver: &str) -> u64 {
        self.with_driver(driver, |c| c.processed.load(Ordering::Relaxed))
    }

    pub fn dropped(&self, driver: &str) -> u64 {
        self.with_driver(driver, |c| c.dropped.load(Ordering::Relaxed))
    }

    pub fn suspended(&self, driver: &str) -> u64 {
        self.with_driver(driver, |c| c.suspended.load(Ordering::Relaxed))
    }

    pub fn queue_length(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.length.load(Ordering::Relaxed))
    }

    pub fn memory_usage(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.memory_usage.load(Ordering::Relaxed))
    }

    /// Render every known counter as `name value` lines, sorted for
    /// stable output (§6 CLI `stats-dump`).
    pub fn render_stats_dump(&self) -> String {
        let mut lines = Vec::new();
        for (driver, counters) in self.drivers.lock().unwrap().iter() {
            lines.push(format!("{driver}.processed {}", counters.processed.load(Ordering::Relaxed)));
            lines.push(format!("{driver}.dropped {}", counters.dropped.load(Ordering::Relaxed)));
            lines.push(format!("{driver}.suspended {}", counters.suspended.load(Ordering::Relaxed)));
        }
        for (queue, gauges) in self.queues.lock().unwrap().iter() {
            lines.push(format!("{queue}.queue_length {}", gauges.length.load(Ordering::Relaxed)));
            lines.push(format!("{queue}.memory_usage {}", gauges.memory_usage.load(Ordering::Relaxed)));
        }
        lines.sort();
        lines.join("\n")
    }

    fn with_driver<R>(&self, driver: &str, f: impl FnOnce(&DriverCounters) -> R) -> R {
        let mut drivers = self.drivers.lock().unwrap();
        f(drivers.entry(driver.to_string()).or_default())
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&QueueGauges) -> R) -> R {
        let mut queues = self.queues.lock().unwrap();
        f(queues.entry(queue.to_string()).or_default())
    }
}

impl MetricsSink for AtomicMetricsSink {
    fn incr_processed(&self, driver: &str, n: u64) {
        self.with_driver(driver, |c| c.processed.fetch_add(n, Ordering::Relaxed));
    }
    fn incr_dropped(&self, driver: &str, n: u64) {
        self.with_driver(driver, |c| c.dropped.fetch_add(n, Ordering::Relaxed));
    }
    fn incr_suspended(&self, driver: &str, n: u64) {
        self.with_driver(driver, |c| c.suspended.fetch_add(n, Ordering::Relaxed));
    }
    fn set_queue_length(&self, queue: &str, len: u64) {
        self.with_queue(queue, |q| q.length.store(len, Ordering::Relaxed));
    }
    fn set_memory_usage(&self, queue: &str, bytes: u64) {
        self.with_queue(queue, |q| q.memory_usage.store(bytes, Ordering::Relaxed));
    }
}
