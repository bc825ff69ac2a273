//! Latency benchmarks for roomcast.
//!
//! These benchmarks focus on measuring end-to-end latency through the
//! engine: persist, publish, topic callback, fan-out and receive.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roomcast_bench::{chat_record, local_engine};
use roomcast_core::Identity;
use roomcast_protocol::codec;
use std::time::Instant;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");

    let record = chat_record("general", 256);

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&record)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark send-to-receive latency through the local transport.
fn bench_send_to_viewer(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_to_viewer");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    for viewers in [1usize, 10] {
        group.bench_function(format!("{viewers}_viewers"), |b| {
            b.iter_custom(|iters| {
                runtime.block_on(async {
                    let engine = local_engine(1024);
                    let alice = Identity::new("alice");
                    let mut streams = Vec::with_capacity(viewers);
                    for i in 0..viewers {
                        let viewer = Identity::new(format!("viewer-{i}"));
                        streams.push(engine.open_stream(&viewer, "general").await.unwrap());
                    }

                    let start = Instant::now();
                    for _ in 0..iters {
                        engine.send_message(&alice, "general", "ping").await.unwrap();
                        for stream in &mut streams {
                            black_box(stream.next().await);
                        }
                    }
                    let elapsed = start.elapsed();

                    for stream in streams {
                        stream.close().await;
                    }
                    elapsed
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_codec_roundtrip, bench_send_to_viewer);
criterion_main!(benches);
