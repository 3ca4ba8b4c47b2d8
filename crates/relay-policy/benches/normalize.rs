//! Destination normalization benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relay_policy::{normalize, reverse_labels};

fn normalize_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for dest in [
        "example.com",
        "sub.example.com:443",
        "203.0.113.9:8080",
        "[2001:db8::1]:443",
        "bücher.example",
        "localhost:80",
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(dest), dest, |b, dest| {
            b.iter(|| normalize(black_box(dest)))
        });
    }

    group.finish();
}

fn reverse_labels_benchmark(c: &mut Criterion) {
    c.bench_function("reverse_labels", |b| {
        b.iter(|| reverse_labels(black_box("a.b.c.d.example.co.uk")))
    });
}

criterion_group!(benches, normalize_benchmark, reverse_labels_benchmark);
criterion_main!(benches);
