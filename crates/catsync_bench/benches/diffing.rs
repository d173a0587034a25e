//! Field diffing, scoring and snapshot encoding benchmarks.

use catsync_bench::{edited, product_fields};
use catsync_core::{diff_fields, fields_digest, ConflictRules, Entity, EntityId};
use catsync_engine::confidence_score;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_fields");

    for extra in [0usize, 16, 128] {
        let current = product_fields(extra);
        let candidate = edited(&current, 0.25);
        group.throughput(Throughput::Elements(current.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(current.len()), &extra, |b, _| {
            b.iter(|| black_box(diff_fields(black_box(&current), black_box(&candidate))));
        });
    }

    // Identical candidate: the no-op path every re-import takes.
    let current = product_fields(16);
    group.bench_function("noop", |b| {
        b.iter(|| black_box(diff_fields(black_box(&current), black_box(&current))));
    });

    group.finish();
}

fn bench_confidence(c: &mut Criterion) {
    let rules = ConflictRules::default();
    let current = product_fields(32);
    let diff = diff_fields(&current, &edited(&current, 0.5));

    c.bench_function("confidence_score", |b| {
        b.iter(|| black_box(confidence_score(black_box(&diff), &rules, false)));
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for extra in [0usize, 64] {
        let entity = Entity::new(EntityId::new(), product_fields(extra)).with_version(3);
        let snapshot = entity.snapshot();
        group.bench_with_input(BenchmarkId::new("encode", extra), &snapshot, |b, s| {
            b.iter(|| black_box(s.encode().unwrap()));
        });
        group.bench_with_input(
            BenchmarkId::new("digest", extra),
            &entity.fields,
            |b, fields| {
                b.iter(|| black_box(fields_digest(fields).unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_diff, bench_confidence, bench_snapshot);
criterion_main!(benches);
