//! Throttle demo (scenario S6): a token-bucket `throttle_limit` caps how
//! fast the destination worker can pop from the queue, independent of
//! how fast the in-memory destination itself could accept messages.

use std::sync::Arc;
use std::time::Instant;

use logflow::{
    AtomicMetricsSink, Message, PathOptions, Pipeline, StaticConfig, Tag, Transport,
    TransportResult,
};

struct InstantAccept;

impl Transport for InstantAccept {
    fn name(&self) -> &str {
        "instant-accept"
    }

    fn connect(&self) -> Result<(), TransportResult> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn insert(&self, _message: &Message) -> TransportResult {
        TransportResult::Success
    }

    fn flush(&self) -> TransportResult {
        TransportResult::Success
    }
}

fn main() -> std::io::Result<()> {
    logflow::init_logging();

    let rate: u64 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(100);
    let total: u64 = std::env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(500);

    println!("=== logflow throttle: {rate} msgs/sec cap, {total} messages ===");

    let mut config = StaticConfig::default();
    config.batch_size = 1;
    config.batch_timeout = std::time::Duration::ZERO;
    config.throttle_limit = Some(rate);
    config.queue_capacity = (total as u32).max(1_000);

    let metrics = Arc::new(AtomicMetricsSink::new());
    let pipeline = Pipeline::new(
        "throttle",
        &config,
        |_worker_index| Arc::new(InstantAccept) as Arc<dyn Transport>,
        metrics.clone(),
        None,
    )?;

    let path_options = PathOptions {
        ack_needed: false,
        flow_control_requested: true,
    };
    for i in 0..total {
        pipeline.push(Message::new(format!("m{i}").into_bytes(), Tag::empty(), 6), path_options);
    }

    let start = Instant::now();
    let deadline = start + std::time::Duration::from_secs(60);
    while metrics.processed("throttle") < total && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    let elapsed = start.elapsed();
    pipeline.shutdown();

    println!(
        "drained {} of {total} messages in {elapsed:?} ({:.1} msgs/sec observed, dropped={})",
        metrics.processed("throttle"),
        metrics.processed("throttle") as f64 / elapsed.as_secs_f64(),
        metrics.dropped("throttle"),
    );
    Ok(())
}
