//! Projection and search benchmarks
//!
//! Run with: cargo bench --bench search

use std::sync::Arc;
use std::time::Duration;

use atlas_core::{project, LandmarkSet, VectorProjector};
use atlas_db::engine::{Atlas, EngineConfig, SearchRequest};
use atlas_db::{NamespaceId, TenantId};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 64;
const NS: NamespaceId = NamespaceId(1);
const TENANT: TenantId = TenantId(1);

/// Vectors on a random 4-dimensional subspace plus a little isotropic noise.
fn corpus(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let basis: Vec<Vec<f32>> = (0..4)
        .map(|_| (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect())
        .collect();
    (0..n)
        .map(|_| {
            let weights: Vec<f32> = (0..4).map(|_| rng.gen_range(-10.0..10.0)).collect();
            (0..DIM)
                .map(|d| {
                    let signal: f32 = basis.iter().zip(&weights).map(|(b, w)| b[d] * w).sum();
                    signal + (rng.gen::<f32>() - 0.5) * 0.01
                })
                .collect()
        })
        .collect()
}

fn landmarks(samples: &[Vec<f32>]) -> LandmarkSet {
    VectorProjector::default()
        .fit(NS, 1, samples, 4)
        .expect("fit landmarks")
}

fn bench_project(c: &mut Criterion) {
    let vectors = corpus(2_000, 7);
    let set = landmarks(&vectors[..500]);
    let mut i = 0usize;
    c.bench_function("project_dim_64", |b| {
        b.iter(|| {
            i = (i + 1) % vectors.len();
            black_box(project(black_box(&vectors[i]), &set).expect("project"))
        })
    });
}

fn build_engine(n: usize, dir: &std::path::Path) -> (Arc<Atlas>, Vec<Vec<f32>>) {
    let mut config = EngineConfig::from_data_dir(dir.to_path_buf());
    config.search.metric = atlas_db::Metric::Euclidean;
    config.search.min_candidates = 200;
    let atlas = Atlas::open(config).expect("open engine");
    let vectors = corpus(n, 42);
    atlas
        .bootstrap_namespace(NS, &vectors[..1_000.min(n)], 4)
        .expect("bootstrap");
    for (i, v) in vectors.iter().enumerate() {
        let atom = atlas
            .ingest_atom(format!("bench-{i}").as_bytes(), "vector", TENANT)
            .expect("ingest")
            .atom_id;
        atlas.attach_embedding(atom, NS, v).expect("attach");
    }
    atlas.rebuild_index(NS).expect("rebuild");
    (atlas, vectors)
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    for n in [10_000usize, 50_000] {
        let dir = tempfile::tempdir().expect("tempdir");
        let (atlas, vectors) = build_engine(n, dir.path());
        let queries = corpus(256, 1_234);

        group.bench_with_input(BenchmarkId::new("hybrid_k10", n), &n, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % queries.len();
                let req = SearchRequest::new(NS, queries[i].clone(), 10, TENANT);
                black_box(atlas.search(&req).expect("search").hits.len())
            })
        });
        group.bench_with_input(BenchmarkId::new("exact_k10", n), &n, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                i = (i + 1) % queries.len();
                let req = SearchRequest::new(NS, queries[i].clone(), 10, TENANT);
                black_box(atlas.search_exact(&req).expect("search").len())
            })
        });
        drop(vectors);
    }

    group.finish();
}

criterion_group!(benches, bench_project, bench_search);
criterion_main!(benches);
