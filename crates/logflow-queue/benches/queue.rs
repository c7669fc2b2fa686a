use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logflow_core::{Message, PathOptions, Tag};
use logflow_queue::{Queue, QueueNode};

fn bench_push_pop(c: &mut Criterion) {
    c.bench_function("queue_fast_path_push_flush_pop", |b| {
        let q = Queue::new(4096, "bench");
        b.iter(|| {
            for _ in 0..64 {
                q.push_tail_fast(
                    0,
                    QueueNode::new(
                        Message::new(b"payload".to_vec(), Tag::empty(), 6),
                        PathOptions::default(),
                    ),
                );
            }
            q.flush_input(0);
            while let Some(item) = q.pop_head() {
                black_box(item);
            }
        });
    });

    c.bench_function("queue_slow_path_push_pop", |b| {
        let q = Queue::new(4096, "bench-slow");
        b.iter(|| {
            for _ in 0..64 {
                q.push_tail_slow(QueueNode::new(
                    Message::new(b"payload".to_vec(), Tag::empty(), 6),
                    PathOptions::default(),
                ));
            }
            while let Some(item) = q.pop_head() {
                black_box(item);
            }
        });
    });
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
