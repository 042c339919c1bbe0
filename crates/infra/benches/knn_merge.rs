use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use pressroom_infra::ann::{Hit, days_in_range, merge_hits};

/// Deterministic per-shard results; distances spread over `[0, 1)`.
fn shards(count: usize, hits_per_shard: usize) -> Vec<Vec<Hit>> {
    (0..count)
        .map(|shard| {
            (0..hits_per_shard)
                .map(|i| {
                    let id = (shard * hits_per_shard + i) as i64;
                    let distance = ((id * 7919) % 1000) as f32 / 1000.0;
                    Hit { id, distance }
                })
                .collect()
        })
        .collect()
}

fn bench_merge_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_hits");

    for shard_count in [1usize, 3, 7, 30].iter() {
        let hits_per_shard = 1000;
        let input = shards(*shard_count, hits_per_shard);
        group.throughput(Throughput::Elements((*shard_count * hits_per_shard) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            &input,
            |b, input| {
                b.iter(|| merge_hits(black_box(input.clone()), black_box(0.5)));
            },
        );
    }

    group.finish();
}

fn bench_days_in_range(c: &mut Criterion) {
    let from = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
    let to = chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default();

    c.bench_function("days_in_range_one_year", |b| {
        b.iter(|| days_in_range(black_box(from), black_box(to)));
    });
}

criterion_group!(benches, bench_merge_hits, bench_days_in_range);
criterion_main!(benches);
