//! Throughput benchmarks for the data path building blocks.
//!
//! Measures control frame encoding and parsing, descriptor queue round
//! trips and slab allocation.
//!
//! Run with:
//! ```bash
//! cargo bench --bench throughput
//! ```

#![allow(clippy::expect_used)]

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use shmux::protocol::{Event, PROTOCOL_VERSION, RestartEvent, parse_frame};
use shmux::queue::{Direction, QueueFile};
use shmux::{BufferDescriptor, BufferManager, SessionConfig};
use tempfile::TempDir;

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    let close = Event::StreamClose {
        stream_id: 7,
        watermark: 1024,
    };
    group.bench_function("encode_stream_close", |b| {
        b.iter(|| black_box(close.encode(black_box(PROTOCOL_VERSION))));
    });

    for size in [64usize, 4096, 64 * 1024] {
        let frame = Event::FallbackData {
            stream_id: 3,
            watermark: 0,
            data: vec![0xA5; size].into(),
        }
        .encode(PROTOCOL_VERSION)
        .expect("encode fallback frame");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("parse_fallback", size), &frame, |b, frame| {
            b.iter(|| {
                let mut buf = BytesMut::from(&frame[..]);
                black_box(parse_frame(&mut buf).expect("parse fallback frame"))
            });
        });
    }

    let restart = Event::HotRestart(RestartEvent { epoch: 42 })
        .encode(PROTOCOL_VERSION)
        .expect("encode restart frame");
    group.bench_function("parse_hot_restart", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&restart[..]);
            black_box(parse_frame(&mut buf).expect("parse restart frame"))
        });
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let dir = TempDir::new().expect("Failed to create benchmark directory");
    let file = QueueFile::create(&dir.path().join("bench_queue"), 1024)
        .expect("Failed to create benchmark queue");
    let mut producer = file.producer(Direction::ClientToServer);
    let mut consumer = file.consumer(Direction::ClientToServer);
    let descriptor = BufferDescriptor {
        segment_id: 0,
        offset: 4096,
        length: 512,
    };

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_dequeue", |b| {
        b.iter(|| {
            assert!(producer.try_enqueue(black_box(1), black_box(descriptor)));
            black_box(consumer.try_dequeue().expect("dequeue"))
        });
    });

    group.bench_function("batch_of_64", |b| {
        b.iter(|| {
            for id in 0..64 {
                assert!(producer.try_enqueue(id, descriptor));
            }
            while let Some(element) = consumer.try_dequeue().expect("dequeue") {
                black_box(element);
            }
        });
    });
    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let dir = TempDir::new().expect("Failed to create benchmark directory");
    let layout = SessionConfig::new(dir.path())
        .with_segment_size(4 * 1024 * 1024)
        .segment_layout()
        .expect("Failed to build segment layout");
    let manager = BufferManager::create(&dir.path().join("bench"), layout)
        .expect("Failed to create buffer manager");

    let mut group = c.benchmark_group("allocation");
    for size in [1024usize, 16 * 1024, 64 * 1024] {
        let payload = vec![0x5A; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("allocate_fill_free", size), &payload, |b, payload| {
            b.iter(|| {
                let mut buf = manager.allocate(payload.len()).expect("allocate");
                buf.fill(payload);
                black_box(buf.as_slice().len())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_queue, bench_allocation);
criterion_main!(benches);
