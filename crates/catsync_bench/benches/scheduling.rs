//! Batch formation and rate limiter benchmarks.

use catsync_bench::queued_changes;
use catsync_core::Priority;
use catsync_engine::{BatchScheduler, PriorityLanes, RateLimitConfig, RateLimiter};
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use std::time::Duration;

const AGING: Duration = Duration::from_secs(300);

fn bench_form_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("form_batches");

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let scheduler = BatchScheduler::new(50, AGING);
                    for (n, change) in queued_changes(count).into_iter().enumerate() {
                        scheduler.enqueue(Priority::ALL[n % Priority::ALL.len()], change);
                    }
                    scheduler
                },
                |scheduler| black_box(scheduler.form_batches()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_lanes(c: &mut Criterion) {
    c.bench_function("priority_lanes/push_pop_1000", |b| {
        let lanes = PriorityLanes::new(AGING);
        b.iter(|| {
            for n in 0..1_000u32 {
                lanes.push(Priority::ALL[n as usize % Priority::ALL.len()], n);
            }
            while let Some(item) = lanes.pop() {
                black_box(item);
            }
        });
    });
}

fn bench_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitConfig::new(u32::MAX, 1e9));
    c.bench_function("rate_limiter/try_acquire", |b| {
        b.iter(|| black_box(limiter.try_acquire()));
    });
}

criterion_group!(benches, bench_form_batches, bench_lanes, bench_limiter);
criterion_main!(benches);
