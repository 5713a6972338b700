//! Versioned landmark sets and the multilateration solver
//!
//! A `LandmarkSet` is immutable once built. It holds `K` reference vectors in
//! the source space and a precomputed least-squares solver that places any
//! point in `axes`-dimensional space from its distances to those landmarks
//! (landmark MDS):
//!
//! ```text
//! Δ   = squared distances between landmarks            (K × K)
//! B   = -½ · J Δ J        J = I - 11ᵀ/K                (double centering)
//! B   = Σ λᵢ vᵢ vᵢᵀ                                     (top `axes` eigenpairs)
//! Pᵢ  = vᵢ · √λᵢ / (λᵢ + ε)                             (regularized pseudo-inverse row)
//! x   = -½ · P (δ - δ̄)                                  (δ: squared distances of the point)
//! ```
//!
//! Replacing the landmarks of a namespace always produces a new version;
//! records projected under the old version are migrated explicitly.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atom::NamespaceId;
use crate::geometry::{Aabb, Coord, MAX_AXES, MIN_AXES};
use crate::linalg::{symmetric_eigen, SquareMatrix};
use crate::projection::ProjectionError;
use crate::simd::squared_distance_f64;

/// Numerical parameters of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverParams {
    /// Added to each eigenvalue before inversion.
    pub regularization: f64,
    /// Smallest admissible `λ_axes / λ_1`; below it the system is near-singular.
    pub degeneracy_ratio: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            regularization: 1e-9,
            degeneracy_ratio: 1e-10,
        }
    }
}

/// Persisted form of a landmark set; the solver is re-derived on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkSetRecord {
    pub namespace: NamespaceId,
    pub version: u32,
    pub axes: usize,
    pub source_dim: usize,
    pub landmarks: Vec<Vec<f32>>,
    pub frame_min: Vec<f32>,
    pub frame_max: Vec<f32>,
    pub params: SolverParams,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct LandmarkSet {
    namespace: NamespaceId,
    version: u32,
    axes: usize,
    source_dim: usize,
    landmarks: Vec<Vec<f32>>,
    params: SolverParams,
    /// Row-major `axes × K`.
    projection: Vec<f64>,
    /// Row means of Δ.
    mean_sq: Vec<f64>,
    eigenvalues: Vec<f64>,
    frame: Aabb,
    fingerprint: String,
}

impl LandmarkSet {
    /// Builds the solver for `landmarks`. The frame defaults to the bounding
    /// box of the landmarks' own coordinates; [`VectorProjector::fit`] widens
    /// it to cover the fit sample.
    ///
    /// [`VectorProjector::fit`]: crate::projection::VectorProjector::fit
    pub fn solve(
        namespace: NamespaceId,
        version: u32,
        axes: usize,
        landmarks: Vec<Vec<f32>>,
        params: SolverParams,
    ) -> Result<Self, ProjectionError> {
        if !(MIN_AXES..=MAX_AXES).contains(&axes) {
            return Err(ProjectionError::InvalidAxisCount {
                axes,
                min: MIN_AXES,
                max: MAX_AXES,
            });
        }
        let k = landmarks.len();
        if k < axes + 1 {
            return Err(ProjectionError::InsufficientSamples {
                count: k,
                minimum: axes + 1,
            });
        }
        let source_dim = landmarks[0].len();
        if source_dim == 0 {
            return Err(ProjectionError::DegenerateLandmarks(
                "landmarks have zero dimensions".to_string(),
            ));
        }
        for l in &landmarks {
            if l.len() != source_dim {
                return Err(ProjectionError::DimensionMismatch {
                    expected: source_dim,
                    actual: l.len(),
                });
            }
            if l.iter().any(|v| !v.is_finite()) {
                return Err(ProjectionError::DegenerateLandmarks(
                    "landmark contains a non-finite component".to_string(),
                ));
            }
        }

        let mut delta = SquareMatrix::zeros(k);
        for i in 0..k {
            for j in (i + 1)..k {
                let d = squared_distance_f64(&landmarks[i], &landmarks[j]);
                if d == 0.0 {
                    return Err(ProjectionError::DegenerateLandmarks(format!(
                        "landmarks {} and {} coincide",
                        i, j
                    )));
                }
                delta.set(i, j, d);
                delta.set(j, i, d);
            }
        }

        let mean_sq: Vec<f64> = (0..k)
            .map(|i| (0..k).map(|j| delta.get(i, j)).sum::<f64>() / k as f64)
            .collect();
        let grand_mean = mean_sq.iter().sum::<f64>() / k as f64;

        let mut b = SquareMatrix::zeros(k);
        for i in 0..k {
            for j in 0..k {
                let centered = delta.get(i, j) - mean_sq[i] - mean_sq[j] + grand_mean;
                b.set(i, j, -0.5 * centered);
            }
        }

        let eig = symmetric_eigen(&b);
        let top = eig.values[0];
        if !(top.is_finite() && top > 0.0) {
            return Err(ProjectionError::DegenerateLandmarks(
                "landmark configuration has no spread".to_string(),
            ));
        }
        let weakest = eig.values[axes - 1];
        if !(weakest > top * params.degeneracy_ratio) {
            return Err(ProjectionError::DegenerateLandmarks(format!(
                "landmarks span fewer than {} axes (λ{}/λ1 = {:.3e})",
                axes,
                axes,
                weakest / top
            )));
        }

        let mut projection = vec![0.0f64; axes * k];
        for axis in 0..axes {
            let lambda = eig.values[axis];
            let scale = lambda.sqrt() / (lambda + params.regularization);
            for j in 0..k {
                projection[axis * k + j] = eig.vectors[axis][j] * scale;
            }
        }

        let fingerprint = fingerprint(namespace, version, axes, &landmarks);
        let mut set = Self {
            namespace,
            version,
            axes,
            source_dim,
            landmarks,
            params,
            projection,
            mean_sq,
            eigenvalues: eig.values[..axes].to_vec(),
            frame: Aabb::empty(axes),
            fingerprint,
        };

        let mut frame = Aabb::empty(axes);
        for l in &set.landmarks {
            frame.extend(&set.solve_point(l)?);
        }
        set.frame = frame.expanded(0.0, 1e-6);
        Ok(set)
    }

    pub fn from_record(record: LandmarkSetRecord) -> Result<Self, ProjectionError> {
        let frame = Aabb::from_bounds(&record.frame_min, &record.frame_max).ok_or_else(|| {
            ProjectionError::MalformedRecord("persisted frame is malformed".to_string())
        })?;
        if frame.axes() != record.axes {
            return Err(ProjectionError::MalformedRecord(format!(
                "frame has {} axes but {} v{} declares {}",
                frame.axes(),
                record.namespace,
                record.version,
                record.axes
            )));
        }
        let set = Self::solve(
            record.namespace,
            record.version,
            record.axes,
            record.landmarks,
            record.params,
        )?
        .with_frame(frame);
        if set.source_dim != record.source_dim {
            return Err(ProjectionError::MalformedRecord(format!(
                "landmarks have dimension {} but {} v{} declares {}",
                set.source_dim, record.namespace, record.version, record.source_dim
            )));
        }
        if set.fingerprint != record.fingerprint {
            return Err(ProjectionError::DegenerateLandmarks(format!(
                "fingerprint mismatch for {} v{}",
                record.namespace, record.version
            )));
        }
        Ok(set)
    }

    pub fn to_record(&self) -> LandmarkSetRecord {
        LandmarkSetRecord {
            namespace: self.namespace,
            version: self.version,
            axes: self.axes,
            source_dim: self.source_dim,
            landmarks: self.landmarks.clone(),
            frame_min: self.frame.min[..self.axes].to_vec(),
            frame_max: self.frame.max[..self.axes].to_vec(),
            params: self.params,
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub(crate) fn with_frame(mut self, frame: Aabb) -> Self {
        self.frame = frame;
        self
    }

    /// Solves the multilateration system for one vector. Does not validate
    /// finiteness of the output; see [`VectorProjector::project`].
    ///
    /// [`VectorProjector::project`]: crate::projection::VectorProjector::project
    pub(crate) fn solve_point(&self, vector: &[f32]) -> Result<Coord, ProjectionError> {
        if vector.len() != self.source_dim {
            return Err(ProjectionError::DimensionMismatch {
                expected: self.source_dim,
                actual: vector.len(),
            });
        }
        let k = self.landmarks.len();
        let mut centered = Vec::with_capacity(k);
        for (j, l) in self.landmarks.iter().enumerate() {
            centered.push(squared_distance_f64(vector, l) - self.mean_sq[j]);
        }

        let mut values = [0.0f32; MAX_AXES];
        for (axis, slot) in values.iter_mut().enumerate().take(self.axes) {
            let row = &self.projection[axis * k..(axis + 1) * k];
            let mut acc = 0.0f64;
            for j in 0..k {
                acc += row[j] * centered[j];
            }
            *slot = (-0.5 * acc) as f32;
        }
        Ok(Coord::from_array(self.axes, values))
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn axes(&self) -> usize {
        self.axes
    }

    pub fn source_dim(&self) -> usize {
        self.source_dim
    }

    pub fn landmarks(&self) -> &[Vec<f32>] {
        &self.landmarks
    }

    pub fn frame(&self) -> &Aabb {
        &self.frame
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// SHA-256 over namespace, version, axes and landmark bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint(namespace: NamespaceId, version: u32, axes: usize, landmarks: &[Vec<f32>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.0.to_le_bytes());
    hasher.update(version.to_le_bytes());
    hasher.update((axes as u32).to_le_bytes());
    for l in landmarks {
        for v in l {
            hasher.update(v.to_le_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simplex() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ]
    }

    #[test]
    fn test_landmarks_reproduce_their_distances() {
        let set = LandmarkSet::solve(NamespaceId(1), 1, 4, simplex(), SolverParams::default())
            .unwrap();
        let coords: Vec<Coord> = set
            .landmarks()
            .iter()
            .map(|l| set.solve_point(l).unwrap())
            .collect();
        for i in 0..coords.len() {
            for j in 0..coords.len() {
                let original = squared_distance_f64(&set.landmarks()[i], &set.landmarks()[j]);
                let projected = coords[i].distance_squared(&coords[j]) as f64;
                assert!((original - projected).abs() < 1e-4, "{i},{j}");
            }
        }
    }

    #[test]
    fn test_rejects_coincident_landmarks() {
        let mut lm = simplex();
        lm[2] = lm[1].clone();
        let err = LandmarkSet::solve(NamespaceId(1), 1, 3, lm, SolverParams::default()).unwrap_err();
        assert!(matches!(err, ProjectionError::DegenerateLandmarks(_)));
    }

    #[test]
    fn test_rejects_collinear_landmarks_for_three_axes() {
        let lm = vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![2.0, 0.0],
            vec![3.0, 0.0],
        ];
        let err = LandmarkSet::solve(NamespaceId(1), 1, 3, lm, SolverParams::default()).unwrap_err();
        assert!(matches!(err, ProjectionError::DegenerateLandmarks(_)));
    }

    #[test]
    fn test_rejects_too_few_landmarks() {
        let err = LandmarkSet::solve(
            NamespaceId(1),
            1,
            3,
            simplex()[..3].to_vec(),
            SolverParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ProjectionError::InsufficientSamples { .. }));
    }

    #[test]
    fn test_record_roundtrip_preserves_solver() {
        let set = LandmarkSet::solve(NamespaceId(3), 2, 3, simplex(), SolverParams::default())
            .unwrap();
        let restored = LandmarkSet::from_record(set.to_record()).unwrap();
        let v = [0.2f32, 0.4, -0.1, 0.9];
        let a = set.solve_point(&v).unwrap();
        let b = restored.solve_point(&v).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert_eq!(set.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn test_record_with_mismatched_frame_axes_is_rejected() {
        let set = LandmarkSet::solve(NamespaceId(3), 2, 3, simplex(), SolverParams::default())
            .unwrap();
        let mut record = set.to_record();
        record.frame_min.push(-1.0);
        record.frame_max.push(1.0);
        let err = LandmarkSet::from_record(record).unwrap_err();
        assert!(matches!(err, ProjectionError::MalformedRecord(_)), "{err}");

        let mut record = set.to_record();
        record.source_dim += 1;
        let err = LandmarkSet::from_record(record).unwrap_err();
        assert!(matches!(err, ProjectionError::MalformedRecord(_)), "{err}");
    }

    #[test]
    fn test_fingerprint_changes_with_version() {
        let a = LandmarkSet::solve(NamespaceId(3), 1, 3, simplex(), SolverParams::default()).unwrap();
        let b = LandmarkSet::solve(NamespaceId(3), 2, 3, simplex(), SolverParams::default()).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
