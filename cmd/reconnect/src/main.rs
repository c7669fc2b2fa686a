//! Reconnect demo (scenario S3): a transport that reports
//! `NotConnected` for its first few inserts, then recovers. The batch
//! that hit `NotConnected` should rewind once and every message should
//! eventually land with nothing dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use logflow::{
    AtomicMetricsSink, Message, PathOptions, Pipeline, StaticConfig, Tag, Transport,
    TransportResult,
};

struct FlappingTransport {
    inserts_seen: AtomicU32,
    flaps_remaining: u32,
}

impl Transport for FlappingTransport {
    fn name(&self) -> &str {
        "flapping"
    }

    fn connect(&self) -> Result<(), TransportResult> {
        println!("[flapping] connect()");
        Ok(())
    }

    fn disconnect(&self) {
        println!("[flapping] disconnect()");
    }

    fn insert(&self, _message: &Message) -> TransportResult {
        let n = self.inserts_seen.fetch_add(1, Ordering::SeqCst);
        if n < self.flaps_remaining {
            println!("[flapping] insert #{n}: reporting NotConnected");
            TransportResult::NotConnected
        } else {
            TransportResult::Success
        }
    }

    fn flush(&self) -> TransportResult {
        TransportResult::Success
    }
}

fn main() -> std::io::Result<()> {
    logflow::init_logging();

    let total: u32 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(10);
    let flaps: u32 = std::env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(1);

    println!("=== logflow reconnect: {total} messages, first {flaps} insert(s) flap ===");

    let transport = Arc::new(FlappingTransport {
        inserts_seen: AtomicU32::new(0),
        flaps_remaining: flaps,
    });

    let mut config = StaticConfig::default();
    config.reopen_timeout = std::time::Duration::from_millis(100);
    config.max_retries_on_error = 5;

    let metrics = Arc::new(AtomicMetricsSink::new());
    let transport_for_pipeline = transport.clone();
    let pipeline = Pipeline::new(
        "reconnect",
        &config,
        move |_worker_index| transport_for_pipeline.clone() as Arc<dyn Transport>,
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
    let deadline = start + std::time::Duration::from_secs(20);
    while metrics.processed("reconnect") < u64::from(total) && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    pipeline.shutdown();

    println!(
        "processed={} dropped={} in {:?}",
        metrics.processed("reconnect"),
        metrics.dropped("reconnect"),
        start.elapsed()
    );
    Ok(())
}
