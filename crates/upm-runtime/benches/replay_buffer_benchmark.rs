//! Benchmarks for the replay buffer.
//!
//! Measures:
//! 1. In-order ingestion followed by a single release
//! 2. Shuffled ingestion with 10% duplicates
//! 3. Release cost when the buffer is fragmented by gaps
//!
//! Run with: cargo bench -p upm-runtime --bench replay_buffer_benchmark

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use upm_runtime::{ReplayBuffer, ReplayConfig};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn config(capacity: usize) -> ReplayConfig {
    ReplayConfig {
        capacity,
        ..ReplayConfig::default()
    }
}

/// Deterministic permutation without pulling in a RNG crate.
fn scrambled(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        order.swap(i, (state % (i as u64 + 1)) as usize);
    }
    order
}

fn bench_in_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_in_order");
    for &n in &[100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut buffer = ReplayBuffer::new("bench".into(), config(n));
                for i in 0..n {
                    let ws = base() + ChronoDuration::minutes(i as i64);
                    buffer.add_at(format!("b{}", i).into(), ws, i, ws);
                }
                black_box(buffer.release().len())
            })
        });
    }
    group.finish();
}

fn bench_shuffled_with_duplicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_shuffled_duplicates");
    for &n in &[1_000usize, 10_000] {
        let mut arrivals = scrambled(n);
        arrivals.extend((0..n / 10).map(|i| i * 7 % n));
        group.throughput(Throughput::Elements(arrivals.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &arrivals, |b, arrivals| {
            b.iter(|| {
                let mut buffer = ReplayBuffer::new("bench".into(), config(n));
                for &i in arrivals {
                    let ws = base() + ChronoDuration::minutes(i as i64);
                    buffer.add_at(format!("b{}", i).into(), ws, i, ws);
                }
                black_box(buffer.release().len())
            })
        });
    }
    group.finish();
}

fn bench_fragmented_release(c: &mut Criterion) {
    // A gap every 50 windows, so each release drains one run
    let n = 5_000usize;
    c.bench_function("replay_fragmented_release", |b| {
        b.iter(|| {
            let mut buffer = ReplayBuffer::new("bench".into(), config(n));
            for i in 0..n {
                let minutes = i as i64 + (i / 50) as i64 * 10;
                let ws = base() + ChronoDuration::minutes(minutes);
                buffer.add_at(format!("b{}", i).into(), ws, i, ws);
            }
            let mut releases = 0;
            while !buffer.release().is_empty() {
                releases += 1;
            }
            black_box(releases)
        })
    });
}

criterion_group!(
    benches,
    bench_in_order,
    bench_shuffled_with_duplicates,
    bench_fragmented_release
);
criterion_main!(benches);
