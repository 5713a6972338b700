//! Distance kernel benchmarks
//!
//! Run with: cargo bench --bench simd

use atlas_core::simd::{cosine_similarity, dot_product, l2_distance_squared};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

fn random_vector(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn bench_kernel(c: &mut Criterion, name: &str, kernel: fn(&[f32], &[f32]) -> f32) {
    let mut group = c.benchmark_group(name);

    for dim in [64, 128, 256, 512] {
        group.throughput(Throughput::Elements(dim as u64));

        let a = random_vector(dim);
        let b = random_vector(dim);

        group.bench_function(format!("dim_{}", dim), |bencher| {
            bencher.iter(|| kernel(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

fn bench_dot_product(c: &mut Criterion) {
    bench_kernel(c, "dot_product", dot_product);
}

fn bench_l2_distance(c: &mut Criterion) {
    bench_kernel(c, "l2_distance_squared", l2_distance_squared);
}

fn bench_cosine(c: &mut Criterion) {
    bench_kernel(c, "cosine_similarity", cosine_similarity);
}

criterion_group!(benches, bench_dot_product, bench_l2_distance, bench_cosine);
criterion_main!(benches);
