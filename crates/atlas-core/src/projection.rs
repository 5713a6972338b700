//! Deterministic dimensionality reduction against a landmark set
//!
//! # Fit
//!
//! Farthest-point sampling over a representative sample:
//!
//! 1. Seeded first anchor (`StdRng::seed_from_u64(config.seed)`)
//! 2. Repeatedly add the sample farthest from every chosen anchor
//!    (ties resolve to the lowest sample index)
//! 3. Solve the landmark system and derive the coordinate frame from the
//!    projected sample, widened by `frame_margin`
//!
//! Identical input order and seed always produce the same `LandmarkSet`.
//!
//! # Project
//!
//! Distances to every landmark are accumulated in `f64` in a fixed order, so
//! the same `(vector, LandmarkSet)` always yields bit-identical coordinates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atom::NamespaceId;
use crate::geometry::Coord;
use crate::landmark::{LandmarkSet, SolverParams};
use crate::simd::squared_distance_f64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Projection unstable: {0}")]
    ProjectionUnstable(String),

    #[error("Insufficient samples: {count} < {minimum}")]
    InsufficientSamples { count: usize, minimum: usize },

    #[error("Degenerate landmark set: {0}")]
    DegenerateLandmarks(String),

    #[error("Malformed landmark record: {0}")]
    MalformedRecord(String),

    #[error("Axis count {axes} outside supported range {min}..={max}")]
    InvalidAxisCount { axes: usize, min: usize, max: usize },
}

/// Configuration for landmark fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Seed for the first farthest-point anchor.
    pub seed: u64,
    /// Anchors beyond the `axes + 1` minimum, for robustness to noise.
    pub extra_anchors: usize,
    /// Fraction of the projected sample extent added to each side of the frame.
    pub frame_margin: f32,
    pub solver: SolverParams,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            seed: 0x5EED_1A4D,
            extra_anchors: 5,
            frame_margin: 0.25,
            solver: SolverParams::default(),
        }
    }
}

/// Fits landmark sets and projects vectors through them.
#[derive(Debug, Clone, Default)]
pub struct VectorProjector {
    pub config: ProjectorConfig,
}

impl VectorProjector {
    pub fn new(config: ProjectorConfig) -> Self {
        Self { config }
    }

    /// Selects well-separated anchors from `samples` and builds a landmark set.
    pub fn fit(
        &self,
        namespace: NamespaceId,
        version: u32,
        samples: &[Vec<f32>],
        axes: usize,
    ) -> Result<LandmarkSet, ProjectionError> {
        let minimum = axes + 1;
        if samples.len() < minimum {
            return Err(ProjectionError::InsufficientSamples {
                count: samples.len(),
                minimum,
            });
        }
        let dim = samples[0].len();
        for s in samples {
            if s.len() != dim {
                return Err(ProjectionError::DimensionMismatch {
                    expected: dim,
                    actual: s.len(),
                });
            }
        }

        let wanted = (axes + 1 + self.config.extra_anchors).min(samples.len());
        let anchors = farthest_point_sample(samples, wanted, self.config.seed);
        if anchors.len() < minimum {
            return Err(ProjectionError::InsufficientSamples {
                count: anchors.len(),
                minimum,
            });
        }
        tracing::debug!(
            "fit {} v{}: {} anchors from {} samples",
            namespace,
            version,
            anchors.len(),
            samples.len()
        );

        let landmarks = anchors.iter().map(|&i| samples[i].clone()).collect();
        let set = LandmarkSet::solve(namespace, version, axes, landmarks, self.config.solver)?;

        let projected: Vec<Coord> = samples
            .par_iter()
            .map(|s| self.project(s, &set))
            .collect::<Result<_, _>>()?;
        let mut frame = *set.frame();
        for c in &projected {
            frame.extend(c);
        }
        let frame = frame.expanded(self.config.frame_margin, 1e-3);
        Ok(set.with_frame(frame))
    }

    /// Places `vector` in the landmark set's target space.
    pub fn project(&self, vector: &[f32], set: &LandmarkSet) -> Result<Coord, ProjectionError> {
        project(vector, set)
    }
}

/// Free-function form of [`VectorProjector::project`]; projection has no
/// configuration of its own beyond the landmark set.
pub fn project(vector: &[f32], set: &LandmarkSet) -> Result<Coord, ProjectionError> {
    if vector.len() != set.source_dim() {
        return Err(ProjectionError::DimensionMismatch {
            expected: set.source_dim(),
            actual: vector.len(),
        });
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(ProjectionError::ProjectionUnstable(format!(
            "input component {} is not finite",
            pos
        )));
    }
    let coord = set.solve_point(vector)?;
    if !coord.is_finite() {
        return Err(ProjectionError::ProjectionUnstable(format!(
            "non-finite coordinate {:?} under {} v{}",
            coord.as_slice(),
            set.namespace(),
            set.version()
        )));
    }
    Ok(coord)
}

/// Indices of up to `count` mutually distant samples.
fn farthest_point_sample(samples: &[Vec<f32>], count: usize, seed: u64) -> Vec<usize> {
    let n = samples.len();
    if n == 0 || count == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let first = rng.gen_range(0..n);

    let mut chosen = vec![first];
    let mut min_dists: Vec<f64> = samples
        .par_iter()
        .map(|s| squared_distance_f64(s, &samples[first]))
        .collect();

    while chosen.len() < count {
        let (best, best_dist) = min_dists
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |acc, (i, d)| {
                if d > acc.1 {
                    (i, d)
                } else {
                    acc
                }
            });
        if best_dist <= 0.0 || !best_dist.is_finite() {
            break;
        }
        chosen.push(best);
        let anchor = &samples[best];
        min_dists
            .par_iter_mut()
            .zip(samples.par_iter())
            .for_each(|(d, s)| {
                let nd = squared_distance_f64(s, anchor);
                if nd < *d {
                    *d = nd;
                }
            });
    }
    chosen
}
