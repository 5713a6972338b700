#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use atlas_db::engine::{Atlas, EngineConfig, ManualClock};
use atlas_db::{AtomId, Metric, NamespaceId, TenantId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const NS: NamespaceId = NamespaceId(1);
pub const TENANT: TenantId = TenantId(7);

pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::from_data_dir(dir.to_path_buf());
    config.search.metric = Metric::Euclidean;
    config.query_threads = 2;
    config.background_threads = 1;
    config
}

pub fn open(dir: &Path) -> (Arc<Atlas>, Arc<ManualClock>) {
    open_with(test_config(dir))
}

/// Routes engine logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_with(config: EngineConfig) -> (Arc<Atlas>, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_000));
    let atlas = Atlas::with_clock(config, clock.clone()).unwrap();
    (atlas, clock)
}

/// Standard normal sample via Box-Muller.
pub fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Random linear map from a `latent`-dimensional space into `dim` dimensions.
pub struct Embedder {
    rows: Vec<Vec<f32>>,
}

impl Embedder {
    pub fn new(latent: usize, dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows = (0..dim)
            .map(|_| (0..latent).map(|_| gaussian(&mut rng)).collect())
            .collect();
        Self { rows }
    }

    pub fn embed(&self, point: &[f32]) -> Vec<f32> {
        self.rows
            .iter()
            .map(|row| row.iter().zip(point).map(|(a, b)| a * b).sum())
            .collect()
    }
}

/// Vectors in `dim` dimensions lying on a 3-dimensional linear subspace.
pub fn low_rank_corpus(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let embedder = Embedder::new(3, dim, seed);
    let mut rng = StdRng::seed_from_u64(seed ^ 0xC0FFEE);
    (0..n)
        .map(|_| {
            let latent: Vec<f32> = (0..3).map(|_| rng.gen_range(-10.0..10.0)).collect();
            embedder.embed(&latent)
        })
        .collect()
}

/// Full-rank vectors with independent Gaussian components whose spread
/// decays geometrically across dimensions.
pub fn full_rank_corpus(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            (0..dim)
                .map(|j| 10.0 * 0.6f32.powi(j as i32) * gaussian(&mut rng))
                .collect()
        })
        .collect()
}

/// Two unit-variance Gaussian clusters whose centers are 100 apart.
pub fn two_clusters(per_cluster: usize, dim: usize, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<Vec<f32>>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let center_a = vec![0.0f32; dim];
    let mut center_b = vec![0.0f32; dim];
    center_b[0] = 100.0;
    let mut vectors = Vec::with_capacity(per_cluster * 2);
    for center in [&center_a, &center_b] {
        for _ in 0..per_cluster {
            vectors.push(center.iter().map(|c| c + gaussian(&mut rng)).collect());
        }
    }
    (center_a, center_b, vectors)
}

/// Ingests one atom per vector and attaches the vector in `NS`.
pub fn load(atlas: &Atlas, vectors: &[Vec<f32>], tenant: TenantId) -> Vec<AtomId> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let atom = atlas
                .ingest_atom(format!("doc-{}-{}", tenant.0, i).as_bytes(), "text", tenant)
                .unwrap()
                .atom_id;
            atlas.attach_embedding(atom, NS, v).unwrap();
            atom
        })
        .collect()
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Spearman rank correlation, ties broken by position.
pub fn spearman(a: &[f32], b: &[f32]) -> f64 {
    fn ranks(values: &[f32]) -> Vec<f64> {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
        let mut ranks = vec![0.0; values.len()];
        for (rank, idx) in order.into_iter().enumerate() {
            ranks[idx] = rank as f64;
        }
        ranks
    }
    let (ra, rb) = (ranks(a), ranks(b));
    let n = ra.len() as f64;
    let mean = (n - 1.0) / 2.0;
    let cov: f64 = ra.iter().zip(&rb).map(|(x, y)| (x - mean) * (y - mean)).sum();
    let var: f64 = ra.iter().map(|x| (x - mean) * (x - mean)).sum();
    cov / var
}
