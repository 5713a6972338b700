//! Small dense linear algebra for the landmark solver
//!
//! Matrices here are at most a few dozen rows (one per landmark), so a
//! cyclic Jacobi sweep is both fast enough and fully deterministic.

/// Row-major square matrix of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct SquareMatrix {
    pub n: usize,
    pub data: Vec<f64>,
}

impl SquareMatrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.n + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.n + col] = value;
    }
}

/// Eigen decomposition of a symmetric matrix, sorted by descending eigenvalue.
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    pub values: Vec<f64>,
    /// `vectors[k]` is the unit eigenvector for `values[k]`.
    pub vectors: Vec<Vec<f64>>,
}

const MAX_SWEEPS: usize = 100;

/// Cyclic Jacobi eigenvalue algorithm.
pub fn symmetric_eigen(matrix: &SquareMatrix) -> SymmetricEigen {
    let n = matrix.n;
    let mut a = matrix.clone();
    let mut v = SquareMatrix::zeros(n);
    for i in 0..n {
        v.set(i, i, 1.0);
    }

    let scale: f64 = a.data.iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);

    for _sweep in 0..MAX_SWEEPS {
        let mut off = 0.0f64;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a.get(p, q) * a.get(p, q);
            }
        }
        if off.sqrt() <= 1e-15 * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a.get(p, q);
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let app = a.get(p, p);
                let aqq = a.get(q, q);
                let theta = (aqq - app) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a.get(k, p);
                    let akq = a.get(k, q);
                    a.set(k, p, c * akp - s * akq);
                    a.set(k, q, s * akp + c * akq);
                }
                for k in 0..n {
                    let apk = a.get(p, k);
                    let aqk = a.get(q, k);
                    a.set(p, k, c * apk - s * aqk);
                    a.set(q, k, s * apk + c * aqk);
                }
                for k in 0..n {
                    let vkp = v.get(k, p);
                    let vkq = v.get(k, q);
                    v.set(k, p, c * vkp - s * vkq);
                    v.set(k, q, s * vkp + c * vkq);
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a.get(j, j).total_cmp(&a.get(i, i)).then(i.cmp(&j)));

    let values = order.iter().map(|&i| a.get(i, i)).collect();
    let vectors = order
        .iter()
        .map(|&col| {
            let mut vec: Vec<f64> = (0..n).map(|row| v.get(row, col)).collect();
            // Sign convention: largest-magnitude component positive.
            let pivot = vec
                .iter()
                .copied()
                .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
            if pivot < 0.0 {
                for x in &mut vec {
                    *x = -*x;
                }
            }
            vec
        })
        .collect();

    SymmetricEigen { values, vectors }
}
