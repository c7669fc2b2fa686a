use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use logflow_core::{Message, PathOptions, Tag, Transport, TransportResult};
use logflow_dest::{DestWorker, DestWorkerConfig};
use logflow_queue::{Queue, QueueNode};

struct SinkTransport;

impl Transport for SinkTransport {
    fn name(&self) -> &str {
        "sink"
    }
    fn connect(&self) -> std::result::Result<(), TransportResult> {
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

fn bench_drain_throughput(c: &mut Criterion) {
    c.bench_function("dest_worker_drain_1000", |b| {
        b.iter(|| {
            let queue = Arc::new(Queue::new(4096, "bench").with_backlog(true));
            let worker = DestWorker::spawn(
                DestWorkerConfig {
                    driver_name: "bench".into(),
                    worker_index: 0,
                    batch_lines: 32,
                    batch_timeout: Duration::from_millis(20),
                    t_reopen: Duration::from_millis(50),
                    max_retries: 3,
                    max_retries_on_error: 3,
                },
                Arc::clone(&queue),
                Arc::new(SinkTransport),
                None,
                None,
            )
            .unwrap();

            for i in 0..1000 {
                queue.push_tail_slow(QueueNode::new(
                    Message::new(format!("line {i}").into_bytes(), Tag::empty(), 6),
                    PathOptions::default(),
                ));
            }
            while !queue.is_empty() {
                std::thread::sleep(Duration::from_micros(100));
            }

            worker.shutdown();
            worker.join();
        });
    });
}

criterion_group!(benches, bench_drain_throughput);
criterion_main!(benches);
