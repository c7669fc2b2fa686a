//! Stress demo: many producer threads pushing into a single
//! [`Pipeline`] draining into one destination, measuring end-to-end
//! throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use logflow::{
    AtomicMetricsSink, Message, PathOptions, Pipeline, StaticConfig, Tag, Transport,
    TransportResult,
};

struct CountingSink {
    accepted: AtomicU64,
}

impl Transport for CountingSink {
    fn name(&self) -> &str {
        "counting-sink"
    }

    fn connect(&self) -> Result<(), TransportResult> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn insert(&self, _message: &Message) -> TransportResult {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        TransportResult::Success
    }

    fn flush(&self) -> TransportResult {
        TransportResult::Success
    }
}

fn main() -> std::io::Result<()> {
    logflow::init_logging();

    let producer_threads: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);
    let messages_per_thread: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let total = (producer_threads * messages_per_thread) as u64;

    println!(
        "=== logflow stress: {producer_threads} producers x {messages_per_thread} messages ==="
    );

    let sink = Arc::new(CountingSink {
        accepted: AtomicU64::new(0),
    });
    let mut config = StaticConfig::default();
    config.worker_count = 1;
    config.queue_capacity = 1_000_000;
    config.batch_size = 256;

    let metrics = Arc::new(AtomicMetricsSink::new());
    let sink_for_pipeline = sink.clone();
    let pipeline = Pipeline::new(
        "stress",
        &config,
        move |_worker_index| sink_for_pipeline.clone() as Arc<dyn Transport>,
        metrics.clone(),
        None,
    )?;

    // Each producer gets its own worker-pool thread index, so its pushes
    // go through the lock-free `push_tail_fast` path (§4.3) instead of
    // the always-locked `Pipeline::push`.
    let start = Instant::now();
    for producer in 0..producer_threads {
        pipeline
            .spawn_producer(format!("stress-producer-{producer}"), move |handle| {
                let path_options = PathOptions {
                    ack_needed: false,
                    flow_control_requested: true,
                };
                for i in 0..messages_per_thread {
                    let body = format!("p{producer}-m{i}");
                    handle.push(Message::new(body.into_bytes(), Tag::empty(), 6), path_options);
                    if i % 256 == 255 {
                        handle.end_batch();
                    }
                }
                handle.end_batch();
            })
            .expect("producer slot available");
    }
    pipeline.worker_pool().join_all();
    let push_time = start.elapsed();

    println!("pushed {total} messages in {push_time:?}");

    let deadline = Instant::now() + std::time::Duration::from_secs(30);
    while metrics.processed("stress") < total && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    let drain_time = start.elapsed();

    pipeline.shutdown();

    println!("processed {} of {total} in {drain_time:?}", metrics.processed("stress"));
    println!(
        "throughput: {:.0} msgs/sec",
        metrics.processed("stress") as f64 / drain_time.as_secs_f64()
    );
    Ok(())
}
