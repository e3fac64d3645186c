//! # Command Queue Benchmark
//!
//! Measures the cost of the submission paths:
//! - local queue append + flush + playback (no threads)
//! - accessor batch submission to a live core thread
//! - blocking round trip for a single return command
//!
//! Run with: `cargo bench --package tandem_core`

// Benchmarks don't need docs
#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tandem_core::{CommandQueue, CoreThread, CoreThreadConfig};

fn core() -> CoreThread {
    CoreThread::spawn(CoreThreadConfig {
        thread_name: "bench-core".to_string(),
        ..CoreThreadConfig::default()
    })
    .unwrap()
}

/// Benchmark: append N commands to a local queue, then flush.
fn bench_queue_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_append_flush");

    for count in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut queue = CommandQueue::new();
                for i in 0..count {
                    queue.queue(move |_| {
                        black_box(i);
                    });
                }
                black_box(queue.flush().len())
            });
        });
    }

    group.finish();
}

/// Benchmark: submit a batch of N commands through the thread accessor and
/// block until it ran.
fn bench_accessor_submit(c: &mut Criterion) {
    let mut core = core();
    let handle = core.handle().clone();
    let accessor = handle.accessor();
    let counter = Arc::new(AtomicU64::new(0));

    let mut group = c.benchmark_group("accessor_submit_blocking");
    for count in [1, 64, 1_024] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                for _ in 0..count {
                    let counter = Arc::clone(&counter);
                    accessor.queue_command(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                accessor.submit_to_core_thread(true).unwrap();
            });
        });
    }
    group.finish();

    drop(accessor);
    core.shutdown().unwrap();
}

/// Benchmark: one blocking return command (sim → core → sim).
fn bench_blocking_round_trip(c: &mut Criterion) {
    let mut core = core();
    let handle = core.handle().clone();

    c.bench_function("blocking_return_round_trip", |b| {
        b.iter(|| {
            let op = handle.queue_return_command(|_| 21_u64 * 2, true).unwrap();
            black_box(*op.wait().unwrap())
        });
    });

    core.shutdown().unwrap();
}

/// Benchmark: frame allocator store from inside a command.
fn bench_frame_store(c: &mut Criterion) {
    let mut core = core();
    let handle = core.handle().clone();

    c.bench_function("frame_store_1k_u64", |b| {
        b.iter(|| {
            handle.update().unwrap();
            handle
                .queue_command(
                    |token| {
                        let frames = token.frame_alloc();
                        for i in 0..1_000_u64 {
                            black_box(frames.store(&i).unwrap());
                        }
                    },
                    true,
                )
                .unwrap();
        });
    });

    core.shutdown().unwrap();
}

criterion_group!(
    benches,
    bench_queue_append,
    bench_accessor_submit,
    bench_blocking_round_trip,
    bench_frame_store,
);

criterion_main!(benches);
