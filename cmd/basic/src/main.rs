//! Basic logflow example.
//!
//! One "source" thread pushes a handful of messages through a
//! [`Pipeline`] into an in-memory destination that just prints what it
//! receives, then the pipeline is shut down cleanly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use logflow::{
    AtomicMetricsSink, Message, PathOptions, Pipeline, StaticConfig, Tag, Transport,
    TransportResult,
};

struct PrintingSink {
    received: AtomicUsize,
}

impl Transport for PrintingSink {
    fn name(&self) -> &str {
        "printing-sink"
    }

    fn connect(&self) -> Result<(), TransportResult> {
        println!("[printing-sink] connected");
        Ok(())
    }

    fn disconnect(&self) {
        println!("[printing-sink] disconnected");
    }

    fn insert(&self, message: &Message) -> TransportResult {
        let n = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "[printing-sink] #{n}: {}",
            String::from_utf8_lossy(message.body())
        );
        TransportResult::Success
    }

    fn flush(&self) -> TransportResult {
        TransportResult::Success
    }
}

fn main() -> std::io::Result<()> {
    logflow::init_logging();

    let sink = Arc::new(PrintingSink {
        received: AtomicUsize::new(0),
    });
    let config = StaticConfig::default();
    let metrics = Arc::new(AtomicMetricsSink::new());

    let sink_for_pipeline = sink.clone();
    let pipeline = Pipeline::new(
        "basic",
        &config,
        move |_worker_index| sink_for_pipeline.clone() as Arc<dyn Transport>,
        metrics.clone(),
        None,
    )?;

    let path_options = PathOptions {
        ack_needed: true,
        flow_control_requested: true,
    };
    for i in 0..5 {
        let body = format!("hello from the source, message {i}");
        pipeline.push(Message::new(body.into_bytes(), Tag::empty(), 6), path_options);
    }

    // Give the destination worker a moment to drain before tearing down.
    std::thread::sleep(std::time::Duration::from_millis(200));
    pipeline.shutdown();

    println!("\nprocessed={} dropped={}", metrics.processed("basic"), metrics.dropped("basic"));
    Ok(())
}
