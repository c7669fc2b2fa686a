use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logflow_core::{Message, Tag};

fn bench_clone_and_ack(c: &mut Criterion) {
    c.bench_function("message_clone", |b| {
        let msg = Message::new(b"the quick brown fox".to_vec(), Tag::LOCAL, 6);
        b.iter(|| black_box(msg.clone()));
    });

    c.bench_function("message_set_value_uncontended", |b| {
        let msg = Message::new(b"payload".to_vec(), Tag::empty(), 6);
        b.iter(|| msg.set_value("host", black_box(b"localhost".to_vec())));
    });

    c.bench_function("message_size_bytes", |b| {
        let msg = Message::new(b"payload".to_vec(), Tag::empty(), 6);
        msg.set_value("host", b"localhost".to_vec());
        msg.set_value("program", b"logflow".to_vec());
        b.iter(|| black_box(msg.size_bytes()));
    });
}

criterion_group!(benches, bench_clone_and_ack);
criterion_main!(benches);
